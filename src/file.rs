//! Buffered files
//!
//! A [`File`] couples a descriptor with the buffered I/O layer and a cleanup
//! pool. Clones share one underlying handle: closing through any clone
//! closes them all, and later operations fail with "attempt to use a closed
//! file". The same type wraps pipe ends and process stdio, which add a
//! transfer [`Timeout`] but are otherwise ordinary unseekable files.

use crate::bufio::{BufStream, NATIVE_CRLF, ReadFormat, ReadOut, Whence};
use crate::fd::{FdStream, Timeout};
use crate::handle::RawHandle;
use crate::perms::Perms;
use crate::pool::{Pool, scratch};
use crate::stat::{StatField, StatRecord};
use crate::status::Status;
use log::debug;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parsed open mode: `r|w|a|r+|w+|a+` with an optional `b` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    pub binary: bool,
}

impl OpenMode {
    pub fn parse(spec: &str) -> Result<OpenMode, Status> {
        let mut mode = OpenMode::default();
        let mut rest = spec.chars();
        match rest.next() {
            Some('r') | None => mode.read = true,
            Some('w') => {
                mode.write = true;
                mode.create = true;
                mode.truncate = true;
            }
            Some('a') => {
                mode.write = true;
                mode.create = true;
                mode.append = true;
            }
            Some(c) => return Err(Status::invalid(format!("bad open mode '{c}'"))),
        }
        for c in rest {
            match c {
                '+' => {
                    mode.read = true;
                    mode.write = true;
                }
                'b' => mode.binary = true,
                c => return Err(Status::invalid(format!("bad open mode flag '{c}'"))),
            }
        }
        Ok(mode)
    }

    fn text_mode(self) -> bool {
        !self.binary && NATIVE_CRLF
    }
}

/// Advisory lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub(crate) struct FileCore {
    pool: Arc<Pool>,
    handle: Arc<RawHandle>,
    path: PathBuf,
    io: Mutex<BufStream<FdStream>>,
}

impl Drop for FileCore {
    fn drop(&mut self) {
        if let Err(err) = self.io.get_mut().flush_pending() {
            if !self.handle.is_closed() {
                debug!("discarding buffered output for {:?}: {}", self.path, err);
            }
        }
    }
}

/// A buffered file, pipe end or stdio stream.
#[derive(Clone)]
pub struct File {
    core: Arc<FileCore>,
}

impl File {
    /// Open `path` with a mode string such as `"r"`, `"w+"` or `"ab"`.
    pub fn open(path: impl AsRef<Path>, mode_spec: &str) -> Result<File, Status> {
        let path = path.as_ref();
        let mode = OpenMode::parse(mode_spec)?;
        let file = OpenOptions::new()
            .read(mode.read)
            .write(mode.write)
            .create(mode.create)
            .truncate(mode.truncate)
            .append(mode.append)
            .open(path)?;
        let fd: OwnedFd = file.into();
        Ok(File::from_owned_fd(
            fd,
            "file",
            path.to_path_buf(),
            Pool::new(),
            mode.text_mode(),
        ))
    }

    /// Wrap a descriptor we own. Used by open, pipes and process stdio.
    pub(crate) fn from_owned_fd(
        fd: OwnedFd,
        kind: &'static str,
        path: PathBuf,
        pool: Arc<Pool>,
        text_mode: bool,
    ) -> File {
        let handle = Arc::new(RawHandle::owned(fd, kind));
        File::assemble(handle, path, pool, text_mode)
    }

    /// Wrap a descriptor owned by the process environment (stdin and
    /// friends); close never releases it.
    fn from_borrowed_fd(fd: RawFd, name: &str) -> File {
        let handle = Arc::new(RawHandle::borrowed(fd, "file"));
        File::assemble(handle, PathBuf::from(name), Pool::new(), false)
    }

    fn assemble(
        handle: Arc<RawHandle>,
        path: PathBuf,
        pool: Arc<Pool>,
        text_mode: bool,
    ) -> File {
        let io = BufStream::new(FdStream::new(Arc::clone(&handle)), text_mode);
        File {
            core: Arc::new(FileCore {
                pool,
                handle,
                path,
                io: Mutex::new(io),
            }),
        }
    }

    /// The calling process's standard input as an unowned file.
    pub fn stdin() -> File {
        File::from_borrowed_fd(libc::STDIN_FILENO, "<stdin>")
    }

    pub fn stdout() -> File {
        File::from_borrowed_fd(libc::STDOUT_FILENO, "<stdout>")
    }

    pub fn stderr() -> File {
        File::from_borrowed_fd(libc::STDERR_FILENO, "<stderr>")
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.core.pool
    }

    pub(crate) fn handle(&self) -> &Arc<RawHandle> {
        &self.core.handle
    }

    pub fn is_closed(&self) -> bool {
        self.core.handle.is_closed()
    }

    /// Two wrappers are the same file when they share one handle.
    pub fn same_as(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.core.handle, &other.core.handle)
    }

    /// Turn this wrapper into a raw core pointer carrying its reference.
    /// Used by the tuple codec to move handles between threads.
    pub(crate) fn into_raw(self) -> *const FileCore {
        Arc::into_raw(self.core)
    }

    /// Rebuild a wrapper from a pointer produced by [`File::into_raw`].
    ///
    /// # Safety
    ///
    /// `core` must come from `into_raw` and be consumed exactly once.
    pub(crate) unsafe fn from_raw(core: *const FileCore) -> File {
        File {
            core: unsafe { Arc::from_raw(core) },
        }
    }

    /// Read one value per format specifier.
    pub fn read(&self, formats: &[ReadFormat]) -> Result<Vec<ReadOut>, Status> {
        let mut io = self.core.io.lock();
        formats.iter().map(|f| io.read_format(*f)).collect()
    }

    pub fn read_line(&self) -> Result<Option<Vec<u8>>, Status> {
        self.core.io.lock().read_line()
    }

    pub fn read_all(&self) -> Result<Vec<u8>, Status> {
        self.core.io.lock().read_all()
    }

    pub fn read_count(&self, count: usize) -> Result<Option<Vec<u8>>, Status> {
        self.core.io.lock().read_count(count)
    }

    pub fn read_number(&self) -> Result<Option<f64>, Status> {
        self.core.io.lock().read_number()
    }

    /// Append every part to the write buffer.
    pub fn write<T: AsRef<[u8]>>(&self, parts: &[T]) -> Result<(), Status> {
        let mut io = self.core.io.lock();
        for part in parts {
            io.write(part.as_ref())?;
        }
        Ok(())
    }

    /// Iterate lines until end of stream.
    pub fn lines(&self) -> Lines {
        Lines { file: self.clone() }
    }

    pub fn seek(&self, whence: Whence, offset: i64) -> Result<u64, Status> {
        self.core.io.lock().seek(whence, offset)
    }

    pub fn flush(&self) -> Result<(), Status> {
        self.core.io.lock().flush()
    }

    /// Flush and release the descriptor. Safe to call more than once; only
    /// the first close does work.
    pub fn close(&self) -> Result<(), Status> {
        if self.core.handle.is_closed() {
            return Ok(());
        }
        let flushed = self.core.io.lock().flush_pending();
        let closed = self.core.handle.close();
        flushed.and(closed)
    }

    /// Acquire an advisory lock, blocking unless `nonblocking`.
    pub fn lock(&self, mode: LockMode, nonblocking: bool) -> Result<(), Status> {
        let fd = self.core.handle.get()?;
        let mut op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if nonblocking {
            op |= libc::LOCK_NB;
        }
        flock(fd, op)
    }

    pub fn unlock(&self) -> Result<(), Status> {
        let fd = self.core.handle.get()?;
        flock(fd, libc::LOCK_UN)
    }

    /// Stat the open descriptor. Buffered output is flushed first so sizes
    /// are current.
    pub fn stat(&self) -> Result<StatRecord, Status> {
        let mut io = self.core.io.lock();
        io.flush_pending()?;
        let fd = self.core.handle.get()?;
        StatRecord::for_fd(fd, &self.core.path)
    }

    /// Transfer timeout, meaningful for pipe ends.
    pub fn timeout_get(&self) -> Timeout {
        self.core.io.lock().backend().timeout()
    }

    pub fn timeout_set(&self, timeout: Timeout) {
        self.core.io.lock().backend_mut().set_timeout(timeout);
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.core.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Line iterator returned by [`File::lines`]. Ends at end of stream; a read
/// failure ends the iteration after yielding the error.
#[derive(Debug)]
pub struct Lines {
    file: File,
}

impl Iterator for Lines {
    type Item = Result<Vec<u8>, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.file.read_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

fn flock(fd: RawFd, op: libc::c_int) -> Result<(), Status> {
    loop {
        let rc = unsafe { libc::flock(fd, op) };
        if rc == 0 {
            return Ok(());
        }
        let errno = nix::errno::Errno::last();
        if errno != nix::errno::Errno::EINTR {
            return Err(Status::from_errno(errno));
        }
    }
}

/// Copy `from` over `to`, optionally forcing the destination's permission
/// bits.
pub fn copy(from: &Path, to: &Path, perms: Option<Perms>) -> Result<(), Status> {
    scratch::with(|_| {
        std::fs::copy(from, to)?;
        if let Some(perms) = perms {
            perms_set(to, perms)?;
        }
        Ok(())
    })
}

/// Append the contents of `from` to `to`, creating it when absent.
pub fn append_to(from: &Path, to: &Path) -> Result<(), Status> {
    scratch::with(|_| {
        let src = File::open(from, "rb")?;
        let dst = File::open(to, "ab")?;
        loop {
            match src.read_count(64 * 1024)? {
                Some(chunk) => dst.write(&[chunk])?,
                None => break,
            }
        }
        dst.flush()
    })
}

pub fn rename(from: &Path, to: &Path) -> Result<(), Status> {
    scratch::with(|_| Ok(std::fs::rename(from, to)?))
}

pub fn remove(path: &Path) -> Result<(), Status> {
    scratch::with(|_| Ok(std::fs::remove_file(path)?))
}

/// Create a hard link. Only exposed where the filesystem supports links.
#[cfg(unix)]
pub fn link(from: &Path, to: &Path) -> Result<(), Status> {
    scratch::with(|_| Ok(std::fs::hard_link(from, to)?))
}

/// Set the modification time, keeping the current access time.
pub fn mtime_set(path: &Path, mtime: f64) -> Result<(), Status> {
    scratch::with(|_| {
        let record = crate::stat::stat(path, &[])?;
        let atime = match record.project(&[StatField::ATime]).pop() {
            Some(crate::stat::FieldValue::Num(t)) => t,
            _ => mtime,
        };
        let times = [to_timeval(atime), to_timeval(mtime)];
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Status::invalid("path contains a NUL byte"))?;
        let rc = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
        if rc != 0 {
            return Err(Status::from_errno(nix::errno::Errno::last()));
        }
        Ok(())
    })
}

/// Set permission bits.
pub fn perms_set(path: &Path, perms: Perms) -> Result<(), Status> {
    scratch::with(|_| {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(perms.mode());
        Ok(std::fs::set_permissions(path, permissions)?)
    })
}

fn to_timeval(secs: f64) -> libc::timeval {
    libc::timeval {
        tv_sec: secs as libc::time_t,
        tv_usec: ((secs.fract() * 1e6) as libc::suseconds_t).max(0),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_mode_parsing() {
        let r = OpenMode::parse("r").unwrap();
        assert!(r.read && !r.write);
        let w = OpenMode::parse("w").unwrap();
        assert!(w.write && w.create && w.truncate && !w.read);
        let a_plus = OpenMode::parse("a+b").unwrap();
        assert!(a_plus.read && a_plus.write && a_plus.append && a_plus.binary);
        assert!(OpenMode::parse("q").is_err());
        assert!(OpenMode::parse("rz").is_err());
    }

    #[test]
    fn closed_file_operations_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();
        let file = File::open(&path, "r").unwrap();
        file.close().unwrap();
        file.close().unwrap();
        let err = file.read_all().unwrap_err();
        assert!(err.message().contains("closed file"));
        let err = file.seek(Whence::Set, 0).unwrap_err();
        assert!(err.message().contains("closed file"));
    }

    #[test]
    fn clones_share_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();
        let file = File::open(&path, "r").unwrap();
        let alias = file.clone();
        assert!(file.same_as(&alias));
        alias.close().unwrap();
        assert!(file.is_closed());
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = File::open(&path, "w+").unwrap();
        file.write(&[&b"one\n"[..], &b"two\n"[..]]).unwrap();
        file.seek(Whence::Set, 0).unwrap();
        assert_eq!(file.read_line().unwrap().unwrap(), b"one");
        assert_eq!(file.read_line().unwrap().unwrap(), b"two");
        assert_eq!(file.read_line().unwrap(), None);
    }

    #[test]
    fn stat_sees_unflushed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = File::open(&path, "w").unwrap();
        file.write(&[b"12345678"]).unwrap();
        let record = file.stat().unwrap();
        let values = record.project(&[StatField::Size]);
        assert_eq!(values[0], crate::stat::FieldValue::Num(8.0));
    }
}
