//! Socket readiness multiplexing
//!
//! A [`Pollset`] is a fixed-capacity set of sockets watched for readability
//! and writability. Registration pins the socket: the set holds a clone, so
//! the descriptor stays alive until `remove` or the set is dropped, however
//! the embedding runtime manages its own references. Re-adding a registered
//! socket merges the new interest into the old with a flag union; the
//! socket is never momentarily unregistered, and the union makes repeated
//! adds idempotent.
//!
//! `poll` reports the sockets that were ready at some instant during the
//! call; as with any readiness interface, the state may have changed by the
//! time the caller acts on it.

use crate::socket::Socket;
use crate::status::{Status, StatusCode};
use bitflags::bitflags;
use nix::errno::Errno;
use parking_lot::Mutex;
use smallvec::SmallVec;

bitflags! {
    /// Readiness interest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const INPUT = 1;
        const OUTPUT = 2;
    }
}

impl Interest {
    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Interest::INPUT) {
            events |= libc::POLLIN;
        }
        if self.contains(Interest::OUTPUT) {
            events |= libc::POLLOUT;
        }
        events
    }
}

struct Slot {
    socket: Socket,
    interest: Interest,
}

/// A fixed-capacity readiness set over sockets.
pub struct Pollset {
    capacity: usize,
    slots: Mutex<Vec<Slot>>,
}

impl Pollset {
    pub fn new(capacity: usize) -> Result<Pollset, Status> {
        if capacity == 0 {
            return Err(Status::invalid("pollset capacity must be at least 1"));
        }
        Ok(Pollset {
            capacity,
            slots: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Register `socket`, or merge `interest` into its existing
    /// registration.
    pub fn add(&self, socket: &Socket, interest: Interest) -> Result<(), Status> {
        if interest.is_empty() {
            return Err(Status::invalid("at least one interest flag is required"));
        }
        socket.raw_fd()?;
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.socket.token() == socket.token()) {
            slot.interest |= interest;
            return Ok(());
        }
        if slots.len() == self.capacity {
            return Err(Status::new(StatusCode::Nomem, "pollset is full"));
        }
        slots.push(Slot {
            socket: socket.clone(),
            interest,
        });
        Ok(())
    }

    /// Drop `socket` from the set, releasing the pin.
    pub fn remove(&self, socket: &Socket) -> Result<(), Status> {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.socket.token() != socket.token());
        if slots.len() == before {
            return Err(Status::new(
                StatusCode::Noent,
                "socket is not in the pollset",
            ));
        }
        Ok(())
    }

    /// Wait until at least one registered socket is ready or the timeout
    /// expires (negative = forever). Returns the readable and writable
    /// sockets; `TIMEUP` when nothing became ready in time.
    pub fn poll(&self, timeout_usec: i64) -> Result<(Vec<Socket>, Vec<Socket>), Status> {
        let slots = self.slots.lock();
        let mut fds: SmallVec<[libc::pollfd; 16]> = SmallVec::with_capacity(slots.len());
        for slot in slots.iter() {
            fds.push(libc::pollfd {
                fd: slot.socket.raw_fd()?,
                events: slot.interest.events(),
                revents: 0,
            });
        }
        let timeout_ms: libc::c_int = if timeout_usec < 0 {
            -1
        } else {
            (timeout_usec as u64)
                .div_ceil(1000)
                .min(libc::c_int::MAX as u64) as libc::c_int
        };
        let ready = loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc >= 0 {
                break rc;
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(Status::from_errno(errno));
            }
        };
        if ready == 0 {
            return Err(Status::timeup());
        }
        let mut readable = Vec::new();
        let mut writable = Vec::new();
        for (slot, pfd) in slots.iter().zip(fds.iter()) {
            if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                readable.push(slot.socket.clone());
            }
            if pfd.revents & libc::POLLOUT != 0 {
                writable.push(slot.socket.clone());
            }
        }
        Ok((readable, writable))
    }

    /// Release every registration. Dropping the set does the same.
    pub fn destroy(&self) {
        self.slots.lock().clear();
    }
}

impl std::fmt::Debug for Pollset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pollset")
            .field("capacity", &self.capacity)
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::{Backlog, Family, Protocol, Which};

    fn connected_pair() -> (Socket, Socket) {
        let server = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
        server.bind("127.0.0.1", 0).unwrap();
        server.listen(Backlog::Max).unwrap();
        let (_, port) = server.addr_get(Which::Local).unwrap();
        let client = Socket::create(Protocol::Tcp, Family::Inet).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let accepted = server.accept().unwrap();
        (client, accepted)
    }

    #[test]
    fn writable_before_readable() {
        let (client, accepted) = connected_pair();
        let set = Pollset::new(4).unwrap();
        set.add(&accepted, Interest::INPUT).unwrap();
        set.add(&client, Interest::OUTPUT).unwrap();
        let (readable, writable) = set.poll(1_000_000).unwrap();
        assert!(readable.is_empty());
        assert_eq!(writable.len(), 1);
        assert!(writable[0].token() == client.token());

        client.write(&[b"wake\n"]).unwrap();
        let (readable, _) = set.poll(1_000_000).unwrap();
        assert_eq!(readable.len(), 1);
        assert!(readable[0].token() == accepted.token());
    }

    #[test]
    fn duplicate_add_merges_flags() {
        let (client, _accepted) = connected_pair();
        let set = Pollset::new(2).unwrap();
        set.add(&client, Interest::OUTPUT).unwrap();
        set.add(&client, Interest::OUTPUT).unwrap();
        set.add(&client, Interest::INPUT).unwrap();
        assert_eq!(set.len(), 1);
        let (_, writable) = set.poll(1_000_000).unwrap();
        assert_eq!(writable.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let (client, accepted) = connected_pair();
        let set = Pollset::new(1).unwrap();
        set.add(&client, Interest::OUTPUT).unwrap();
        let err = set.add(&accepted, Interest::INPUT).unwrap_err();
        assert_eq!(err.code(), StatusCode::Nomem);
    }

    #[test]
    fn remove_releases_the_slot() {
        let (client, accepted) = connected_pair();
        let set = Pollset::new(1).unwrap();
        set.add(&client, Interest::OUTPUT).unwrap();
        set.remove(&client).unwrap();
        assert!(set.remove(&client).is_err());
        set.add(&accepted, Interest::INPUT).unwrap();
    }

    #[test]
    fn empty_poll_times_out() {
        let set = Pollset::new(1).unwrap();
        let err = set.poll(10_000).unwrap_err();
        assert!(err.is_timeup());
    }
}
