//! Bounded blocking queues
//!
//! A [`Queue`] moves packed [`Tuple`]s between threads in FIFO order.
//! `push` and `pop` block while the queue is full or empty; the `try_`
//! variants report `EAGAIN` instead. `interrupt` releases every currently
//! blocked waiter with `EINTR` once; `terminate` is permanent and makes
//! every subsequent operation, including push, report `EOF`: a queue that
//! can never again be drained behaves exactly like one that has ended.

use crate::pool::Pool;
use crate::status::{Status, StatusCode};
use crate::tuple::Tuple;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

struct State {
    items: VecDeque<Tuple>,
    capacity: usize,
    /// Bumped by `interrupt`; waiters that observe a bump give up.
    interrupt_gen: u64,
    terminated: bool,
}

pub(crate) struct QueueCore {
    pool: Arc<Pool>,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// A bounded FIFO of packed tuples shared between threads.
#[derive(Clone)]
pub struct Queue {
    core: Arc<QueueCore>,
}

impl Queue {
    /// Create a queue holding at most `capacity` tuples.
    pub fn new(capacity: usize) -> Result<Queue, Status> {
        if capacity == 0 {
            return Err(Status::invalid("queue capacity must be at least 1"));
        }
        Ok(Queue {
            core: Arc::new(QueueCore {
                pool: Pool::new(),
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    capacity,
                    interrupt_gen: 0,
                    terminated: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.core.pool
    }

    pub fn same_as(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Pack `values` and enqueue, blocking while the queue is full.
    pub fn push(&self, values: &[Value]) -> Result<(), Status> {
        self.push_tuple(Tuple::pack(values), true)
    }

    /// Non-blocking push; `EAGAIN` when full.
    pub fn try_push(&self, values: &[Value]) -> Result<(), Status> {
        self.push_tuple(Tuple::pack(values), false)
    }

    fn push_tuple(&self, tuple: Tuple, blocking: bool) -> Result<(), Status> {
        let mut state = self.core.state.lock();
        loop {
            if state.terminated {
                return Err(terminated());
            }
            if state.items.len() < state.capacity {
                state.items.push_back(tuple);
                self.core.not_empty.notify_one();
                return Ok(());
            }
            if !blocking {
                return Err(Status::again());
            }
            let prev_gen = state.interrupt_gen;
            self.core.not_full.wait(&mut state);
            if state.interrupt_gen != prev_gen {
                return Err(Status::interrupted());
            }
        }
    }

    /// Dequeue and unpack the oldest tuple, blocking while the queue is
    /// empty.
    pub fn pop(&self) -> Result<Vec<Value>, Status> {
        self.pop_tuple(true)?.unpack()
    }

    /// Non-blocking pop; `EAGAIN` when empty.
    pub fn try_pop(&self) -> Result<Vec<Value>, Status> {
        self.pop_tuple(false)?.unpack()
    }

    fn pop_tuple(&self, blocking: bool) -> Result<Tuple, Status> {
        let mut state = self.core.state.lock();
        loop {
            if state.terminated {
                return Err(terminated());
            }
            if let Some(tuple) = state.items.pop_front() {
                self.core.not_full.notify_one();
                return Ok(tuple);
            }
            if !blocking {
                return Err(Status::again());
            }
            let prev_gen = state.interrupt_gen;
            self.core.not_empty.wait(&mut state);
            if state.interrupt_gen != prev_gen {
                return Err(Status::interrupted());
            }
        }
    }

    /// Release every currently blocked waiter with `EINTR`.
    pub fn interrupt(&self) {
        let mut state = self.core.state.lock();
        state.interrupt_gen += 1;
        self.core.not_empty.notify_all();
        self.core.not_full.notify_all();
    }

    /// Shut the queue down permanently. Every waiter and every later
    /// operation reports `EOF`.
    pub fn terminate(&self) {
        let mut state = self.core.state.lock();
        state.terminated = true;
        self.core.not_empty.notify_all();
        self.core.not_full.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.core.state.lock().terminated
    }

    /// Turn this wrapper into a raw core pointer carrying its reference.
    pub(crate) fn into_raw(self) -> *const QueueCore {
        Arc::into_raw(self.core)
    }

    /// Rebuild a wrapper from a pointer produced by [`Queue::into_raw`].
    ///
    /// # Safety
    ///
    /// `core` must come from `into_raw` and be consumed exactly once.
    pub(crate) unsafe fn from_raw(core: *const QueueCore) -> Queue {
        Queue {
            core: unsafe { Arc::from_raw(core) },
        }
    }
}

fn terminated() -> Status {
    Status::new(StatusCode::Eof, "queue is terminated")
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Queue")
            .field("len", &state.items.len())
            .field("capacity", &state.capacity)
            .field("terminated", &state.terminated)
            .finish()
    }
}
