//! Child processes
//!
//! [`Proc`] is a builder and handle in one: configure the command type,
//! environment, working directory, credentials and stdio plumbing, then
//! `exec` it and drive it with `wait`. Pipes requested through `io_set` are
//! created at exec time; the parent ends are wrapped as [`File`]s on first
//! access and share the process's pool, so they stay usable for as long as
//! the process object lives. The [`KillPolicy`] chosen with `kill` decides
//! what happens to a still-running child when the handle is dropped.

use crate::fd::Timeout;
use crate::file::File;
use crate::pipe;
use crate::pool::Pool;
use crate::status::{Status, StatusCode};
use log::{debug, warn};
use nix::sys::signal::{Signal, kill as send_signal};
use nix::unistd::Pid;
use std::ffi::OsStr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the program name and environment are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    /// Run through the shell with a clean environment.
    Shellcmd,
    /// Run through the shell, inheriting the caller's environment.
    ShellcmdEnv,
    /// Invoke the program directly with a clean environment.
    Program,
    /// Invoke the program directly, inheriting the caller's environment.
    ProgramEnv,
    /// Search `PATH` for the program, inheriting the caller's environment.
    ProgramEnvPath,
}

impl CmdType {
    pub fn parse(name: &str) -> Result<CmdType, Status> {
        match name {
            "shellcmd" => Ok(CmdType::Shellcmd),
            "shellcmd/env" => Ok(CmdType::ShellcmdEnv),
            "program" => Ok(CmdType::Program),
            "program/env" => Ok(CmdType::ProgramEnv),
            "program/env/path" => Ok(CmdType::ProgramEnvPath),
            other => Err(Status::invalid(format!("unknown command type '{other}'"))),
        }
    }

    /// Whether the child inherits the caller's environment, making any
    /// `env_set` irrelevant.
    fn inherits_env(self) -> bool {
        matches!(
            self,
            CmdType::ShellcmdEnv | CmdType::ProgramEnv | CmdType::ProgramEnvPath
        )
    }

    fn uses_shell(self) -> bool {
        matches!(self, CmdType::Shellcmd | CmdType::ShellcmdEnv)
    }
}

/// Pipe blocking arrangement for one stdio slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// No pipe; the child inherits the parent's descriptor.
    #[default]
    None,
    /// Both ends block.
    FullBlock,
    /// Neither end blocks.
    FullNonblock,
    /// Only the parent end blocks.
    ParentBlock,
    /// Only the child end blocks.
    ChildBlock,
}

impl IoMode {
    pub fn parse(name: &str) -> Result<IoMode, Status> {
        match name {
            "none" => Ok(IoMode::None),
            "full-block" => Ok(IoMode::FullBlock),
            "full-nonblock" => Ok(IoMode::FullNonblock),
            "parent-block" => Ok(IoMode::ParentBlock),
            "child-block" => Ok(IoMode::ChildBlock),
            other => Err(Status::invalid(format!("unknown io mode '{other}'"))),
        }
    }

    fn parent_blocks(self) -> bool {
        matches!(self, IoMode::FullBlock | IoMode::ParentBlock)
    }

    fn child_blocks(self) -> bool {
        matches!(self, IoMode::FullBlock | IoMode::ChildBlock)
    }
}

/// What to do with a still-running child when the handle is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillPolicy {
    /// Leave it running.
    #[default]
    Never,
    /// SIGKILL immediately.
    Always,
    /// SIGTERM, grace period, then SIGKILL.
    Timeout,
    /// Wait for it to exit on its own.
    Wait,
    /// SIGTERM once and wait.
    Once,
}

impl KillPolicy {
    pub fn parse(name: &str) -> Result<KillPolicy, Status> {
        match name {
            "never" => Ok(KillPolicy::Never),
            "always" => Ok(KillPolicy::Always),
            "timeout" => Ok(KillPolicy::Timeout),
            "wait" => Ok(KillPolicy::Wait),
            "once" => Ok(KillPolicy::Once),
            other => Err(Status::invalid(format!("unknown kill policy '{other}'"))),
        }
    }
}

/// Grace period between SIGTERM and SIGKILL for [`KillPolicy::Timeout`].
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Why a child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitWhy {
    Exit,
    Signal,
    SignalCore,
}

impl WaitWhy {
    pub fn name(self) -> &'static str {
        match self {
            WaitWhy::Exit => "exit",
            WaitWhy::Signal => "signal",
            WaitWhy::SignalCore => "signal/core",
        }
    }
}

const STDIN_SLOT: usize = 0;
const STDOUT_SLOT: usize = 1;
const STDERR_SLOT: usize = 2;

enum ProcState {
    /// Not yet executed.
    Configured,
    /// Spawned through [`Command`].
    Spawned(Child),
    /// Attached to a forked child.
    Forked(Pid),
    /// Reaped.
    Done,
}

/// A child process builder and handle.
pub struct Proc {
    pool: Arc<Pool>,
    program: String,
    cmdtype: CmdType,
    argv0: Option<String>,
    env: Option<Vec<(String, String)>>,
    dir: Option<PathBuf>,
    detach: bool,
    error_check: bool,
    addrspace: bool,
    user: Option<String>,
    group: Option<String>,
    io_modes: [IoMode; 3],
    child_overrides: [Option<File>; 3],
    parent_overrides: [Option<File>; 3],
    parent_fds: [Option<OwnedFd>; 3],
    stdio: [Option<File>; 3],
    state: ProcState,
    kill_policy: KillPolicy,
    result: Option<(WaitWhy, i32)>,
}

impl Proc {
    /// Start building a child running `program`.
    pub fn new(program: impl Into<String>) -> Proc {
        Proc {
            pool: Pool::new(),
            program: program.into(),
            cmdtype: CmdType::ProgramEnvPath,
            argv0: None,
            env: None,
            dir: None,
            detach: false,
            error_check: false,
            addrspace: false,
            user: None,
            group: None,
            io_modes: [IoMode::None; 3],
            child_overrides: [None, None, None],
            parent_overrides: [None, None, None],
            parent_fds: [None, None, None],
            stdio: [None, None, None],
            state: ProcState::Configured,
            kill_policy: KillPolicy::Never,
            result: None,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn cmdtype_set(&mut self, cmdtype: CmdType) {
        self.cmdtype = cmdtype;
    }

    /// Override `argv[0]`, which otherwise defaults to the program name.
    pub fn argv0_set(&mut self, argv0: impl Into<String>) {
        self.argv0 = Some(argv0.into());
    }

    /// Request a separate address space. Meaningless on platforms where
    /// children always get one; kept for configuration portability.
    pub fn addrspace_set(&mut self, separate: bool) {
        self.addrspace = separate;
    }

    pub fn user_set(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    pub fn group_set(&mut self, group: impl Into<String>) {
        self.group = Some(group.into());
    }

    /// Environment for the child. Ignored by command types that inherit the
    /// caller's environment.
    pub fn env_set(&mut self, env: impl IntoIterator<Item = (String, String)>) {
        self.env = Some(env.into_iter().collect());
    }

    pub fn dir_set(&mut self, dir: impl Into<PathBuf>) {
        self.dir = Some(dir.into());
    }

    /// Detach from the controlling terminal (new session).
    pub fn detach_set(&mut self, detach: bool) {
        self.detach = detach;
    }

    /// Report exec failures eagerly instead of letting the child die with
    /// status 255.
    pub fn error_check_set(&mut self, check: bool) {
        self.error_check = check;
    }

    /// Request pipes for stdin/stdout/stderr.
    pub fn io_set(&mut self, stdin: IoMode, stdout: IoMode, stderr: IoMode) {
        self.io_modes = [stdin, stdout, stderr];
    }

    /// Use `child_end` as the child's stdin; optionally name the parent end
    /// that feeds it.
    pub fn in_set(&mut self, child_end: File, parent_end: Option<File>) {
        self.child_overrides[STDIN_SLOT] = Some(child_end);
        self.parent_overrides[STDIN_SLOT] = parent_end;
    }

    pub fn out_set(&mut self, child_end: File, parent_end: Option<File>) {
        self.child_overrides[STDOUT_SLOT] = Some(child_end);
        self.parent_overrides[STDOUT_SLOT] = parent_end;
    }

    pub fn err_set(&mut self, child_end: File, parent_end: Option<File>) {
        self.child_overrides[STDERR_SLOT] = Some(child_end);
        self.parent_overrides[STDERR_SLOT] = parent_end;
    }

    /// How to treat a still-running child when this handle is dropped.
    pub fn kill(&mut self, policy: KillPolicy) {
        self.kill_policy = policy;
    }

    /// The child's pid, once started.
    pub fn pid(&self) -> Option<i32> {
        match &self.state {
            ProcState::Spawned(child) => Some(child.id() as i32),
            ProcState::Forked(pid) => Some(pid.as_raw()),
            _ => None,
        }
    }

    /// Launch the child with the given arguments.
    pub fn exec<S: AsRef<OsStr>>(&mut self, args: &[S]) -> Result<(), Status> {
        if !matches!(self.state, ProcState::Configured) {
            return Err(Status::invalid("process was already executed"));
        }
        let mut cmd = if self.cmdtype.uses_shell() {
            let mut line = self.program.clone();
            for arg in args {
                line.push(' ');
                line.push_str(&arg.as_ref().to_string_lossy());
            }
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(line);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(args);
            cmd
        };
        if !self.cmdtype.inherits_env() {
            cmd.env_clear();
            if let Some(env) = &self.env {
                cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }
        }
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        self.apply_unix_settings(&mut cmd)?;
        self.attach_stdio(&mut cmd)?;
        let child = cmd.spawn().map_err(|err| {
            if self.error_check {
                warn!("failed to execute {}: {err}", self.program);
            }
            Status::from(err)
        })?;
        // The child ends now live inside the child; drop our copies.
        self.child_overrides = [None, None, None];
        debug!("started {} as pid {}", self.program, child.id());
        self.state = ProcState::Spawned(child);
        Ok(())
    }

    fn apply_unix_settings(&self, cmd: &mut Command) -> Result<(), Status> {
        use std::os::unix::process::CommandExt;
        if let Some(argv0) = &self.argv0 {
            cmd.arg0(argv0);
        }
        if let Some(user) = &self.user {
            let user = nix::unistd::User::from_name(user)?
                .ok_or_else(|| Status::new(StatusCode::Noent, format!("no such user '{user}'")))?;
            cmd.uid(user.uid.as_raw());
        }
        if let Some(group) = &self.group {
            let group = nix::unistd::Group::from_name(group)?.ok_or_else(|| {
                Status::new(StatusCode::Noent, format!("no such group '{group}'"))
            })?;
            cmd.gid(group.gid.as_raw());
        }
        if self.detach {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        Ok(())
    }

    fn attach_stdio(&mut self, cmd: &mut Command) -> Result<(), Status> {
        for slot in [STDIN_SLOT, STDOUT_SLOT, STDERR_SLOT] {
            let stdio = if let Some(file) = &self.child_overrides[slot] {
                let fd = file.handle().get()?;
                let dup = unsafe { libc::dup(fd) };
                if dup < 0 {
                    return Err(Status::from_errno(nix::errno::Errno::last()));
                }
                if let Some(parent) = self.parent_overrides[slot].take() {
                    self.stdio[slot] = Some(parent);
                }
                Stdio::from(unsafe { OwnedFd::from_raw_fd(dup) })
            } else {
                match self.io_modes[slot] {
                    IoMode::None => Stdio::inherit(),
                    mode => {
                        // stdin flows parent -> child; the other slots flow
                        // child -> parent.
                        let (rx, tx) = pipe::raw_pair()?;
                        let (child_end, parent_end) = if slot == STDIN_SLOT {
                            (rx, tx)
                        } else {
                            (tx, rx)
                        };
                        pipe::set_nonblocking(&child_end, !mode.child_blocks())?;
                        pipe::set_nonblocking(&parent_end, !mode.parent_blocks())?;
                        self.parent_fds[slot] = Some(parent_end);
                        Stdio::from(child_end)
                    }
                }
            };
            match slot {
                STDIN_SLOT => cmd.stdin(stdio),
                STDOUT_SLOT => cmd.stdout(stdio),
                _ => cmd.stderr(stdio),
            };
        }
        Ok(())
    }

    fn stdio_get(&mut self, slot: usize, name: &str) -> Result<File, Status> {
        if let Some(file) = &self.stdio[slot] {
            return Ok(file.clone());
        }
        let fd = self.parent_fds[slot].take().ok_or_else(|| {
            Status::invalid(format!("no pipe was attached to the child's {name}"))
        })?;
        let blocking = self.io_modes[slot].parent_blocks();
        let file = File::from_owned_fd(
            fd,
            "pipe",
            PathBuf::from(format!("<child:{name}>")),
            Arc::clone(&self.pool),
            false,
        );
        if !blocking {
            file.timeout_set(Timeout::Immediate);
        }
        self.stdio[slot] = Some(file.clone());
        Ok(file)
    }

    /// The parent end of the child's stdin, wrapped on first access.
    pub fn in_get(&mut self) -> Result<File, Status> {
        self.stdio_get(STDIN_SLOT, "stdin")
    }

    pub fn out_get(&mut self) -> Result<File, Status> {
        self.stdio_get(STDOUT_SLOT, "stdout")
    }

    pub fn err_get(&mut self) -> Result<File, Status> {
        self.stdio_get(STDERR_SLOT, "stderr")
    }

    /// Wait for the child. `Ok(None)` means "still running" on a
    /// non-blocking wait; repeated waits return the saved result.
    pub fn wait(&mut self, blocking: bool) -> Result<Option<(WaitWhy, i32)>, Status> {
        if let Some(result) = self.result {
            return Ok(Some(result));
        }
        let result = match &mut self.state {
            ProcState::Configured => {
                return Err(Status::invalid("process was never executed"));
            }
            ProcState::Done => return Ok(self.result),
            ProcState::Spawned(child) => {
                if blocking {
                    map_exit_status(child.wait()?)
                } else {
                    match child.try_wait()? {
                        Some(status) => map_exit_status(status),
                        None => return Ok(None),
                    }
                }
            }
            ProcState::Forked(pid) => {
                use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
                let flags = if blocking {
                    None
                } else {
                    Some(WaitPidFlag::WNOHANG)
                };
                match waitpid(*pid, flags)? {
                    WaitStatus::Exited(_, code) => (WaitWhy::Exit, code),
                    WaitStatus::Signaled(_, sig, core) => {
                        let why = if core { WaitWhy::SignalCore } else { WaitWhy::Signal };
                        (why, sig as i32)
                    }
                    _ => return Ok(None),
                }
            }
        };
        self.state = ProcState::Done;
        self.result = Some(result);
        Ok(Some(result))
    }

    fn signal(&self, signal: Signal) -> Result<(), Status> {
        match self.pid() {
            Some(pid) => {
                send_signal(Pid::from_raw(pid), signal)?;
                Ok(())
            }
            None => Err(Status::new(
                StatusCode::ProcUnknown,
                "process is not running",
            )),
        }
    }

    fn apply_kill_policy(&mut self) {
        if self.result.is_some() || matches!(self.state, ProcState::Configured | ProcState::Done) {
            return;
        }
        match self.kill_policy {
            KillPolicy::Never => {}
            KillPolicy::Always => {
                let _ = self.signal(Signal::SIGKILL);
                let _ = self.wait(true);
            }
            KillPolicy::Once => {
                let _ = self.signal(Signal::SIGTERM);
                let _ = self.wait(true);
            }
            KillPolicy::Wait => {
                let _ = self.wait(true);
            }
            KillPolicy::Timeout => {
                let _ = self.signal(Signal::SIGTERM);
                let deadline = Instant::now() + KILL_GRACE;
                loop {
                    match self.wait(false) {
                        Ok(Some(_)) | Err(_) => return,
                        Ok(None) => {}
                    }
                    if Instant::now() >= deadline {
                        let _ = self.signal(Signal::SIGKILL);
                        let _ = self.wait(true);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        // Pipe wrappers go first so the child sees EOF, then the kill
        // policy, then the pool via the remaining Arc drops.
        for file in self.stdio.iter().flatten() {
            let _ = file.close();
        }
        self.apply_kill_policy();
    }
}

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proc")
            .field("program", &self.program)
            .field("cmdtype", &self.cmdtype)
            .field("pid", &self.pid())
            .finish()
    }
}

/// Result of [`fork`].
#[derive(Debug)]
pub enum Forked {
    /// In the parent; the handle waits on the child.
    Parent(Proc),
    /// In the child.
    Child,
}

/// Fork the current process.
#[cfg(unix)]
pub fn fork() -> Result<Forked, Status> {
    // SAFETY: the child only returns into caller code, as with fork(2)
    // generally; the caller owns the usual post-fork restrictions.
    match unsafe { nix::unistd::fork() }? {
        nix::unistd::ForkResult::Parent { child } => {
            let mut proc = Proc::new("<forked>");
            proc.state = ProcState::Forked(child);
            Ok(Forked::Parent(proc))
        }
        nix::unistd::ForkResult::Child => Ok(Forked::Child),
    }
}

fn map_exit_status(status: std::process::ExitStatus) -> (WaitWhy, i32) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        return (WaitWhy::Exit, code);
    }
    let signal = status.signal().unwrap_or(0);
    let why = if status.core_dumped() {
        WaitWhy::SignalCore
    } else {
        WaitWhy::Signal
    };
    (why, signal)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn true_exits_zero() {
        let mut proc = Proc::new("true");
        proc.exec::<&str>(&[]).unwrap();
        let (why, code) = proc.wait(true).unwrap().unwrap();
        assert_eq!(why, WaitWhy::Exit);
        assert_eq!(code, 0);
    }

    #[test]
    fn shell_command_sees_arguments() {
        let mut proc = Proc::new("exit");
        proc.cmdtype_set(CmdType::Shellcmd);
        proc.exec(&["3"]).unwrap();
        let (why, code) = proc.wait(true).unwrap().unwrap();
        assert_eq!(why, WaitWhy::Exit);
        assert_eq!(code, 3);
    }

    #[test]
    fn stdout_pipe_captures_output() {
        let mut proc = Proc::new("echo");
        proc.io_set(IoMode::None, IoMode::FullBlock, IoMode::None);
        proc.exec(&["-n", "payload"]).unwrap();
        let out = proc.out_get().unwrap();
        assert_eq!(out.read_all().unwrap(), b"payload");
        let same = proc.out_get().unwrap();
        assert!(out.same_as(&same));
        proc.wait(true).unwrap();
    }

    #[test]
    fn stdin_pipe_feeds_the_child() {
        let mut proc = Proc::new("cat");
        proc.io_set(IoMode::FullBlock, IoMode::FullBlock, IoMode::None);
        proc.exec::<&str>(&[]).unwrap();
        let stdin = proc.in_get().unwrap();
        stdin.write(&[b"round trip\n"]).unwrap();
        stdin.flush().unwrap();
        stdin.close().unwrap();
        let out = proc.out_get().unwrap();
        assert_eq!(out.read_all().unwrap(), b"round trip\n");
        proc.wait(true).unwrap();
    }

    #[test]
    fn clean_command_type_uses_only_env_set() {
        let mut proc = Proc::new("/bin/sh");
        proc.cmdtype_set(CmdType::Program);
        proc.env_set([("PROBE_VALUE".to_string(), "set".to_string())]);
        proc.io_set(IoMode::None, IoMode::FullBlock, IoMode::None);
        proc.exec(&["-c", "echo -n \"$PROBE_VALUE:$HOME\""]).unwrap();
        let out = proc.out_get().unwrap();
        assert_eq!(out.read_all().unwrap(), b"set:");
        proc.wait(true).unwrap();
    }

    #[test]
    fn nonblocking_wait_reports_running() {
        let mut proc = Proc::new("sleep");
        proc.kill(KillPolicy::Always);
        proc.exec(&["5"]).unwrap();
        assert_eq!(proc.wait(false).unwrap(), None);
    }

    #[test]
    fn signalled_child_reports_why() {
        let mut proc = Proc::new("sleep");
        proc.exec(&["30"]).unwrap();
        proc.signal(Signal::SIGKILL).unwrap();
        let (why, code) = proc.wait(true).unwrap().unwrap();
        assert_eq!(why, WaitWhy::Signal);
        assert_eq!(code, libc::SIGKILL);
    }
}
