//! Cleanup pools
//!
//! A [`Pool`] is a lifetime domain: resources register cleanup actions with
//! the pool that owns them, and the pool runs every action exactly once, in
//! reverse registration order, when it is destroyed. Objects that must share
//! a lifetime (a process and the pipe files wrapped around its stdio, for
//! example) hold clones of the same `Arc<Pool>`; the pool is destroyed when
//! the last holder drops it.
//!
//! Each thread additionally owns a *scratch* pool for transient allocations
//! made by stateless calls. It is cleared on every entry via
//! [`scratch::with`], so nothing registered there may escape the call.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Cleanup = Box<dyn FnOnce() + Send>;

/// A reference counted cleanup arena.
pub struct Pool {
    cleanups: Mutex<Vec<Cleanup>>,
    destroyed: AtomicBool,
}

impl Pool {
    /// Create a fresh pool with a single holder.
    pub fn new() -> Arc<Pool> {
        Arc::new(Pool {
            cleanups: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Create a child pool destroyed no later than `self`.
    pub fn child(self: &Arc<Self>) -> Arc<Pool> {
        let child = Pool::new();
        let held = Arc::clone(&child);
        self.cleanup_register(move || held.clear());
        child
    }

    /// Register an action to run when the pool is destroyed or cleared.
    /// Actions run in reverse registration order.
    pub fn cleanup_register(&self, action: impl FnOnce() + Send + 'static) {
        if self.destroyed.load(Ordering::Acquire) {
            // Late registration on a dying pool: run immediately rather than
            // leak the action.
            action();
            return;
        }
        self.cleanups.lock().push(Box::new(action));
    }

    /// Run and drop all registered cleanups. The pool remains usable.
    pub fn clear(&self) {
        let actions: Vec<Cleanup> = {
            let mut guard = self.cleanups.lock();
            guard.drain(..).collect()
        };
        for action in actions.into_iter().rev() {
            action();
        }
    }

    fn destroy(&self) {
        let already = self.destroyed.swap(true, Ordering::AcqRel);
        if !already {
            self.clear();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pending_cleanups", &self.cleanups.lock().len())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

pub mod scratch {
    //! Per-thread scratch pool.

    use super::Pool;
    use std::cell::RefCell;
    use std::sync::Arc;

    thread_local! {
        static SCRATCH: RefCell<Option<Arc<Pool>>> = const { RefCell::new(None) };
    }

    /// Run `f` with this thread's scratch pool. The pool is cleared before
    /// `f` runs, so nothing registered by a previous call survives.
    pub fn with<R>(f: impl FnOnce(&Arc<Pool>) -> R) -> R {
        SCRATCH.with(|slot| {
            let pool = slot
                .borrow_mut()
                .get_or_insert_with(Pool::new)
                .clone();
            pool.clear();
            f(&pool)
        })
    }
}
