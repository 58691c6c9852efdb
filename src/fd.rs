//! File-descriptor backend for the buffered I/O layer
//!
//! [`FdStream`] implements [`RawStream`] over any descriptor held in a
//! [`RawHandle`]: regular files, pipe ends and sockets all go through it.
//! Pipes and sockets additionally honor a per-object [`Timeout`] applied by
//! polling for readiness before each transfer.

use crate::bufio::{RawStream, Whence};
use crate::handle::RawHandle;
use crate::status::Status;
use nix::errno::Errno;
use std::os::fd::RawFd;
use std::sync::Arc;

/// How long a transfer may wait for the descriptor to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until ready.
    Forever,
    /// Fail with `EAGAIN` when not immediately ready.
    Immediate,
    /// Wait up to this many microseconds, then fail with `TIMEUP`.
    Micros(u64),
}

impl Timeout {
    fn poll_millis(self) -> Option<libc::c_int> {
        match self {
            Timeout::Forever => None,
            Timeout::Immediate => Some(0),
            Timeout::Micros(us) => Some(us.div_ceil(1000).min(libc::c_int::MAX as u64) as _),
        }
    }

    fn expired(self) -> Status {
        match self {
            Timeout::Immediate => Status::again(),
            _ => Status::timeup(),
        }
    }
}

/// Wait for `events` on `fd`. `None` blocks forever. Returns whether the
/// descriptor became ready within the timeout.
pub(crate) fn poll_fd(
    fd: RawFd,
    events: libc::c_short,
    timeout_ms: Option<libc::c_int>,
) -> Result<bool, Status> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms.unwrap_or(-1)) };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(Status::from_errno(errno));
        }
        return Ok(rc > 0);
    }
}

/// Byte-stream backend over a shared descriptor.
#[derive(Debug)]
pub struct FdStream {
    handle: Arc<RawHandle>,
    timeout: Timeout,
}

impl FdStream {
    pub fn new(handle: Arc<RawHandle>) -> FdStream {
        FdStream {
            handle,
            timeout: Timeout::Forever,
        }
    }

    pub fn handle(&self) -> &Arc<RawHandle> {
        &self.handle
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    fn wait_ready(&self, fd: RawFd, events: libc::c_short) -> Result<(), Status> {
        if let Some(ms) = self.timeout.poll_millis() {
            if !poll_fd(fd, events, Some(ms))? {
                return Err(self.timeout.expired());
            }
        }
        Ok(())
    }
}

impl RawStream for FdStream {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, Status> {
        let fd = self.handle.get()?;
        self.wait_ready(fd, libc::POLLIN)?;
        loop {
            let rc = unsafe { libc::read(fd, dst.as_mut_ptr().cast(), dst.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(Status::from_errno(errno));
            }
        }
    }

    fn write(&mut self, src: &[u8]) -> Result<usize, Status> {
        let fd = self.handle.get()?;
        self.wait_ready(fd, libc::POLLOUT)?;
        loop {
            let rc = unsafe { libc::write(fd, src.as_ptr().cast(), src.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(Status::from_errno(errno));
            }
        }
    }

    fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64, Status> {
        let fd = self.handle.get()?;
        let whence = match whence {
            Whence::Set => libc::SEEK_SET,
            Whence::Cur => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        };
        let pos = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
        if pos < 0 {
            return Err(Status::from_errno(Errno::last()));
        }
        Ok(pos as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bufio::BufStream;
    use std::os::fd::{FromRawFd, OwnedFd};

    fn os_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn buffered_round_trip_over_a_pipe() {
        let (rx, tx) = os_pipe();
        let mut writer = BufStream::new(
            FdStream::new(Arc::new(RawHandle::owned(tx, "pipe"))),
            false,
        );
        let mut reader = BufStream::new(
            FdStream::new(Arc::new(RawHandle::owned(rx, "pipe"))),
            false,
        );
        writer.write(b"alpha\nbeta\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(reader.read_line().unwrap().unwrap(), b"alpha");
        assert_eq!(reader.read_line().unwrap().unwrap(), b"beta");
    }

    #[test]
    fn immediate_timeout_reports_eagain() {
        let (rx, _tx) = os_pipe();
        let mut stream = FdStream::new(Arc::new(RawHandle::owned(rx, "pipe")));
        stream.set_timeout(Timeout::Immediate);
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(err.is_again());
    }

    #[test]
    fn micro_timeout_reports_timeup() {
        let (rx, _tx) = os_pipe();
        let mut stream = FdStream::new(Arc::new(RawHandle::owned(rx, "pipe")));
        stream.set_timeout(Timeout::Micros(1000));
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).unwrap_err();
        assert!(err.is_timeup());
    }

    #[test]
    fn pipes_are_not_seekable() {
        let (rx, _tx) = os_pipe();
        let mut stream = FdStream::new(Arc::new(RawHandle::owned(rx, "pipe")));
        assert!(stream.seek(Whence::Cur, 0).is_err());
    }
}
