//! Anonymous pipes and named FIFOs
//!
//! Both ends of an anonymous pipe are ordinary [`File`]s with a transfer
//! timeout; a named pipe is a filesystem node opened later with
//! [`File::open`].

use crate::file::File;
use crate::perms::Perms;
use crate::pool::{Pool, scratch};
use crate::status::Status;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

/// Create an anonymous pipe, returning `(read_end, write_end)`.
pub fn create() -> Result<(File, File), Status> {
    let (rx, tx) = raw_pair()?;
    let read_end = File::from_owned_fd(
        rx,
        "pipe",
        PathBuf::from("<pipe:read>"),
        Pool::new(),
        false,
    );
    let write_end = File::from_owned_fd(
        tx,
        "pipe",
        PathBuf::from("<pipe:write>"),
        Pool::new(),
        false,
    );
    Ok((read_end, write_end))
}

/// Create a named FIFO at `path`. Readers and writers open it like a file.
pub fn create_named(path: &Path, perms: Option<Perms>) -> Result<(), Status> {
    scratch::with(|_| {
        let mode = perms.map(|p| p.mode()).unwrap_or(0o666);
        nix::unistd::mkfifo(
            path,
            nix::sys::stat::Mode::from_bits_truncate(mode as libc::mode_t),
        )?;
        Ok(())
    })
}

pub(crate) fn raw_pair() -> Result<(OwnedFd, OwnedFd), Status> {
    Ok(nix::unistd::pipe()?)
}

/// Switch a descriptor between blocking and non-blocking mode.
pub(crate) fn set_nonblocking(fd: &OwnedFd, nonblocking: bool) -> Result<(), Status> {
    use std::os::fd::AsRawFd;
    let fd = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Status::from_errno(nix::errno::Errno::last()));
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if rc < 0 {
        return Err(Status::from_errno(nix::errno::Errno::last()));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fd::Timeout;

    #[test]
    fn pipe_round_trip() {
        let (rx, tx) = create().unwrap();
        tx.write(&[b"ping\n"]).unwrap();
        tx.flush().unwrap();
        assert_eq!(rx.read_line().unwrap().unwrap(), b"ping");
    }

    #[test]
    fn read_end_reports_eof_after_writer_closes() {
        let (rx, tx) = create().unwrap();
        tx.write(&[b"tail"]).unwrap();
        tx.close().unwrap();
        assert_eq!(rx.read_all().unwrap(), b"tail");
        assert_eq!(rx.read_line().unwrap(), None);
    }

    #[test]
    fn timeout_applies_to_empty_pipe() {
        let (rx, _tx) = create().unwrap();
        rx.timeout_set(Timeout::Micros(1000));
        let err = rx.read_line().unwrap_err();
        assert!(err.is_timeup());
    }

    #[test]
    fn named_pipe_is_a_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        create_named(&path, None).unwrap();
        let record = crate::stat::stat(&path, &[]).unwrap();
        assert_eq!(record.file_type(), crate::stat::FileType::Pipe);
    }
}
