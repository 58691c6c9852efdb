//! Shared memory segments
//!
//! A segment is a file-like object over a mapped region: reads and writes go
//! through the buffered I/O layer, but the buffers are fixed views aliasing
//! the mapping itself, so nothing is copied in and nothing can grow. Named
//! segments are backed by a file; anonymous ones by an anonymous mapping.
//! The read and write cursors are independent; relative seeks resolve
//! against whichever cursor the most recent operation moved.

use crate::buffer::Buffer;
use crate::bufio::{BufStream, NullStream, ReadFormat, ReadOut};
use crate::pool::{Pool, scratch};
use crate::status::Status;
use log::debug;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

/// Seek origin for [`Shm::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmWhence {
    Set,
    Cur,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastOp {
    Read,
    Write,
}

struct ShmInner {
    map: *mut u8,
    map_len: usize,
    size: usize,
    io: BufStream<NullStream>,
    last_op: LastOp,
    detached: bool,
}

struct ShmCore {
    pool: Arc<Pool>,
    name: Option<CString>,
    inner: Mutex<ShmInner>,
}

// SAFETY: the raw mapping pointer is only dereferenced under the inner
// mutex, and stays valid until detach flips `detached`, after which every
// access fails before touching it.
unsafe impl Send for ShmCore {}
unsafe impl Sync for ShmCore {}

/// A shared memory segment with file-like buffered access.
#[derive(Clone)]
pub struct Shm {
    core: Arc<ShmCore>,
}

fn round_to_pages(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

fn map_fd(fd: Option<&OwnedFd>, len: usize) -> Result<*mut u8, Status> {
    let (flags, fd) = match fd {
        Some(fd) => (libc::MAP_SHARED, fd.as_raw_fd()),
        None => (libc::MAP_SHARED | libc::MAP_ANON, -1),
    };
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Status::from_errno(Errno::last()));
    }
    Ok(addr.cast())
}

fn path_cstring(path: &Path) -> Result<CString, Status> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Status::invalid("path contains a NUL byte"))
}

impl Shm {
    /// Create a segment of at least `size` bytes. With a filename the
    /// segment is backed by that file and can be attached from other
    /// processes; without one the mapping is anonymous.
    pub fn create(filename: Option<&Path>, size: usize) -> Result<Shm, Status> {
        if size == 0 {
            return Err(Status::invalid("segment size must be positive"));
        }
        let map_len = round_to_pages(size);
        let (name, map) = match filename {
            None => (None, map_fd(None, map_len)?),
            Some(path) => {
                let c_name = path_cstring(path)?;
                let fd = unsafe {
                    libc::open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        0o600 as libc::c_uint,
                    )
                };
                if fd < 0 {
                    return Err(Status::from_errno(Errno::last()));
                }
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                if unsafe { libc::ftruncate(fd.as_raw_fd(), map_len as libc::off_t) } != 0 {
                    return Err(Status::from_errno(Errno::last()));
                }
                (Some(c_name), map_fd(Some(&fd), map_len)?)
            }
        };
        debug!("mapped {map_len} byte segment for a request of {size}");
        Ok(Shm::assemble(name, map, map_len, size))
    }

    /// Attach to an existing named segment.
    pub fn attach(filename: &Path) -> Result<Shm, Status> {
        let c_name = path_cstring(filename)?;
        let fd = unsafe { libc::open(c_name.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(Status::from_errno(Errno::last()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let record = crate::stat::StatRecord::for_fd(fd.as_raw_fd(), filename)?;
        let size = match record.project(&[crate::stat::StatField::Size]).pop() {
            Some(crate::stat::FieldValue::Num(n)) => n as usize,
            _ => 0,
        };
        if size == 0 {
            return Err(Status::invalid("segment file is empty"));
        }
        let map = map_fd(Some(&fd), size)?;
        Ok(Shm::assemble(Some(c_name), map, size, size))
    }

    /// Remove a segment's name. Existing attachments stay valid.
    pub fn remove(filename: &Path) -> Result<(), Status> {
        scratch::with(|_| {
            let c_name = path_cstring(filename)?;
            if unsafe { libc::unlink(c_name.as_ptr()) } != 0 {
                return Err(Status::from_errno(Errno::last()));
            }
            Ok(())
        })
    }

    fn assemble(name: Option<CString>, map: *mut u8, map_len: usize, size: usize) -> Shm {
        // SAFETY: both buffers alias the mapping, which outlives them; the
        // inner mutex serializes all access.
        let mut rd = unsafe { Buffer::foreign(map, size) };
        rd.set_limit(size);
        let wr = unsafe { Buffer::foreign(map, size) };
        let mut io = BufStream::with_buffers(NullStream, false, rd, wr);
        io.set_eof(true);
        Shm {
            core: Arc::new(ShmCore {
                pool: Pool::new(),
                name,
                inner: Mutex::new(ShmInner {
                    map,
                    map_len,
                    size,
                    io,
                    last_op: LastOp::Read,
                    detached: false,
                }),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.core.pool
    }

    pub fn size(&self) -> usize {
        self.core.inner.lock().size
    }

    fn guard(inner: &ShmInner) -> Result<(), Status> {
        if inner.detached {
            return Err(Status::closed("shared memory segment"));
        }
        Ok(())
    }

    /// Read one value per format specifier, from the read cursor.
    pub fn read(&self, formats: &[ReadFormat]) -> Result<Vec<ReadOut>, Status> {
        let mut inner = self.core.inner.lock();
        Shm::guard(&inner)?;
        inner.last_op = LastOp::Read;
        let io = &mut inner.io;
        formats.iter().map(|f| io.read_format(*f)).collect()
    }

    pub fn read_line(&self) -> Result<Option<Vec<u8>>, Status> {
        let mut inner = self.core.inner.lock();
        Shm::guard(&inner)?;
        inner.last_op = LastOp::Read;
        inner.io.read_line()
    }

    pub fn read_all(&self) -> Result<Vec<u8>, Status> {
        let mut inner = self.core.inner.lock();
        Shm::guard(&inner)?;
        inner.last_op = LastOp::Read;
        inner.io.read_all()
    }

    pub fn read_count(&self, count: usize) -> Result<Option<Vec<u8>>, Status> {
        let mut inner = self.core.inner.lock();
        Shm::guard(&inner)?;
        inner.last_op = LastOp::Read;
        inner.io.read_count(count)
    }

    /// Write every part at the write cursor. Fails with `ENOSPC` once the
    /// region is full.
    pub fn write<T: AsRef<[u8]>>(&self, parts: &[T]) -> Result<(), Status> {
        let mut inner = self.core.inner.lock();
        Shm::guard(&inner)?;
        inner.last_op = LastOp::Write;
        for part in parts {
            inner.io.write(part.as_ref())?;
        }
        Ok(())
    }

    /// Move the cursor. `Cur` is relative to the cursor of the most recent
    /// operation; the target must satisfy `0 <= target < size`. Both cursors
    /// land on the target.
    pub fn seek(&self, whence: ShmWhence, offset: i64) -> Result<u64, Status> {
        let mut inner = self.core.inner.lock();
        Shm::guard(&inner)?;
        let base = match whence {
            ShmWhence::Set => 0,
            ShmWhence::Cur => match inner.last_op {
                LastOp::Read => inner.io.rd_mut().index() as i64,
                LastOp::Write => inner.io.wr_mut().limit() as i64,
            },
            ShmWhence::End => inner.size as i64,
        };
        let target = base + offset;
        if target < 0 || target >= inner.size as i64 {
            return Err(Status::invalid(format!(
                "seek offset {target} outside segment of {} bytes",
                inner.size
            )));
        }
        let target = target as usize;
        let size = inner.size;
        let rd = inner.io.rd_mut();
        rd.reset();
        rd.set_limit(size);
        rd.set_index(target);
        let wr = inner.io.wr_mut();
        wr.reset();
        wr.set_limit(target);
        Ok(target as u64)
    }

    /// Unmap the segment. The wrapper survives but every further operation
    /// fails; other attachments are unaffected.
    pub fn detach(&self) -> Result<(), Status> {
        let mut inner = self.core.inner.lock();
        if inner.detached {
            return Ok(());
        }
        inner.detached = true;
        let rc = unsafe { libc::munmap(inner.map.cast(), inner.map_len) };
        if rc != 0 {
            return Err(Status::from_errno(Errno::last()));
        }
        Ok(())
    }

    /// Detach and, for named segments, remove the name.
    pub fn destroy(&self) -> Result<(), Status> {
        self.detach()?;
        if let Some(name) = &self.core.name {
            if unsafe { libc::unlink(name.as_ptr()) } != 0 {
                let errno = Errno::last();
                if errno != Errno::ENOENT {
                    return Err(Status::from_errno(errno));
                }
            }
        }
        Ok(())
    }
}

impl Drop for ShmCore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.detached {
            inner.detached = true;
            unsafe { libc::munmap(inner.map.cast(), inner.map_len) };
        }
    }
}

impl std::fmt::Debug for Shm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("Shm")
            .field("size", &inner.size)
            .field("named", &self.core.name.is_some())
            .field("detached", &inner.detached)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn write_read_cycle_through_cursors() {
        let shm = Shm::create(None, 256).unwrap();
        shm.write(&[b"first line\nsecond"]).unwrap();
        assert_eq!(shm.read_line().unwrap().unwrap(), b"first line");
        shm.seek(ShmWhence::Set, 0).unwrap();
        assert_eq!(shm.read_line().unwrap().unwrap(), b"first line");
    }

    #[test]
    fn read_all_returns_to_region_end() {
        let shm = Shm::create(None, 16).unwrap();
        shm.write(&[b"abc"]).unwrap();
        let rest = shm.read_all().unwrap();
        assert_eq!(rest.len(), 16);
        assert_eq!(&rest[..3], b"abc");
        // The cursor is parked at the limit now.
        assert_eq!(shm.read_count(4).unwrap(), None);
    }

    #[test]
    fn writes_past_the_end_report_enospc() {
        let shm = Shm::create(None, 8).unwrap();
        shm.write(&[b"12345678"]).unwrap();
        let err = shm.write(&[b"x"]).unwrap_err();
        assert_eq!(err.code(), StatusCode::Nospc);
    }

    #[test]
    fn relative_seek_follows_last_operation() {
        let shm = Shm::create(None, 64).unwrap();
        shm.write(&[b"0123456789"]).unwrap();
        // Last op was a write at cursor 10; step the cursor back two.
        shm.seek(ShmWhence::Cur, -2).unwrap();
        shm.write(&[b"XY"]).unwrap();
        shm.seek(ShmWhence::Set, 0).unwrap();
        assert_eq!(shm.read_count(10).unwrap().unwrap(), b"01234567XY");
    }

    #[test]
    fn seek_bounds_are_enforced() {
        let shm = Shm::create(None, 32).unwrap();
        assert!(shm.seek(ShmWhence::Set, 32).is_err());
        assert!(shm.seek(ShmWhence::Set, -1).is_err());
        assert!(shm.seek(ShmWhence::End, -1).is_ok());
    }

    #[test]
    fn named_segment_attach_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment");
        let shm = Shm::create(Some(&path), 128).unwrap();
        shm.write(&[b"shared payload\n"]).unwrap();
        let other = Shm::attach(&path).unwrap();
        assert_eq!(other.read_line().unwrap().unwrap(), b"shared payload");
        Shm::remove(&path).unwrap();
        // Surviving attachments keep working after the name is gone.
        shm.seek(ShmWhence::Set, 0).unwrap();
        assert_eq!(shm.read_line().unwrap().unwrap(), b"shared payload");
        shm.destroy().unwrap();
        other.detach().unwrap();
        let err = other.read_all().unwrap_err();
        assert!(err.message().contains("closed shared memory"));
    }
}
