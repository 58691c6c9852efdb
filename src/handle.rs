//! Native handle ownership
//!
//! Every OS-backed object in this crate stores its descriptor in a
//! [`RawHandle`]. The handle distinguishes *owned* descriptors, closed
//! exactly once on release, from *borrowed* ones (stdin and friends) that are
//! never closed by us. `close()` is idempotent, and any use after close fails
//! with a message naming the object kind, so a script holding a stale
//! reference gets "attempt to use a closed file" rather than EBADF roulette.
//!
//! Sharing one OS handle across several wrappers is plain `Arc<RawHandle>`:
//! the wrappers have independent identity, the descriptor has one lifetime.

use crate::status::Status;
use log::warn;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Marker for an fd that is not currently held.
const FD_CLOSED: RawFd = -1;

/// A file descriptor with explicit close-once semantics.
#[derive(Debug)]
pub struct RawHandle {
    fd: AtomicI32,
    /// Borrowed descriptors are never closed on release.
    borrowed: bool,
    closed: AtomicBool,
    kind: &'static str,
}

impl RawHandle {
    /// Take ownership of `fd`; it is closed on the last release.
    pub fn owned(fd: OwnedFd, kind: &'static str) -> RawHandle {
        RawHandle {
            fd: AtomicI32::new(fd.into_raw_fd()),
            borrowed: false,
            closed: AtomicBool::new(false),
            kind,
        }
    }

    /// Wrap a descriptor owned by someone else, e.g. `stdin`. Close only
    /// forgets the fd.
    pub fn borrowed(fd: RawFd, kind: &'static str) -> RawHandle {
        RawHandle {
            fd: AtomicI32::new(fd),
            borrowed: true,
            closed: AtomicBool::new(false),
            kind,
        }
    }

    /// The descriptor, or the "closed" failure for this object kind.
    pub fn get(&self) -> Result<RawFd, Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed(self.kind));
        }
        Ok(self.fd.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Release the descriptor. The first call closes owned descriptors; every
    /// later call is a no-op returning success.
    pub fn close(&self) -> Result<(), Status> {
        let already = self.closed.swap(true, Ordering::AcqRel);
        if already {
            return Ok(());
        }
        let fd = self.fd.swap(FD_CLOSED, Ordering::AcqRel);
        if !self.borrowed && fd >= 0 {
            let rc = unsafe { libc::close(fd) };
            if rc != 0 {
                let errno = nix::errno::Errno::last();
                warn!("closing {} fd {} failed: {}", self.kind, fd, errno.desc());
                return Err(Status::from_errno(errno));
            }
        }
        Ok(())
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl AsRawFd for RawHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::FromRawFd;

    fn devnull() -> OwnedFd {
        let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) };
        assert!(fd >= 0);
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    #[test]
    fn double_close_is_success() {
        let handle = RawHandle::owned(devnull(), "file");
        assert!(handle.close().is_ok());
        assert!(handle.close().is_ok());
    }

    #[test]
    fn use_after_close_names_the_kind() {
        let handle = RawHandle::owned(devnull(), "socket");
        handle.close().unwrap();
        let err = handle.get().unwrap_err();
        assert!(err.message().contains("closed socket"));
    }

    #[test]
    fn borrowed_fd_survives_close() {
        let owned = devnull();
        let raw = owned.as_raw_fd();
        let handle = RawHandle::borrowed(raw, "file");
        handle.close().unwrap();
        // The underlying descriptor is still open; reading must not EBADF.
        let mut buf = [0u8; 1];
        let rc = unsafe { libc::read(raw, buf.as_mut_ptr().cast(), 1) };
        assert_eq!(rc, 0);
    }
}
