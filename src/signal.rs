//! Script-level signal handling
//!
//! Handlers never run inside the OS signal frame. The installed OS handler
//! is a trampoline that only flips an atomic pending flag; the embedding
//! runtime calls [`run_pending`] at its safe points (for a bytecode
//! interpreter, between instructions) and the user handlers run there, at
//! the cost of one safe-point of latency. Long-jumping out of a signal
//! frame is the only alternative, and there is no race-free way to do it.

use crate::status::Status;
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Highest signal number tracked by the pending table.
const MAX_SIGNAL: usize = 64;

static PENDING: [AtomicBool; MAX_SIGNAL] = [const { AtomicBool::new(false) }; MAX_SIGNAL];
static ANY_PENDING: AtomicBool = AtomicBool::new(false);

type HandlerFn = Arc<dyn Fn() + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<i32, HandlerFn>> {
    static REGISTRY: OnceLock<Mutex<HashMap<i32, HandlerFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The OS-level handler: async-signal-safe by construction, it only touches
/// atomics.
extern "C" fn trampoline(signo: libc::c_int) {
    if (signo as usize) < MAX_SIGNAL {
        PENDING[signo as usize].store(true, Ordering::Relaxed);
        ANY_PENDING.store(true, Ordering::Release);
    }
}

/// Resolve a signal name, with or without the `SIG` prefix.
pub fn lookup(name: &str) -> Result<Signal, Status> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::iterator()
        .find(|signal| signal.as_str() == full)
        .ok_or_else(|| Status::invalid(format!("unknown signal '{name}'")))
}

/// Install a handler for the named signal, replacing any previous one. The
/// handler runs at the next [`run_pending`] call after delivery.
pub fn install(name: &str, handler: impl Fn() + Send + Sync + 'static) -> Result<(), Status> {
    let signal = lookup(name)?;
    let action = SigAction::new(
        SigHandler::Handler(trampoline),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the trampoline only stores to atomics, which is
    // async-signal-safe.
    unsafe { sigaction(signal, &action) }?;
    registry().lock().insert(signal as i32, Arc::new(handler));
    Ok(())
}

/// Remove the handler for the named signal and restore default disposition.
pub fn clear(name: &str) -> Result<(), Status> {
    let signal = lookup(name)?;
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: restoring the default disposition.
    unsafe { sigaction(signal, &action) }?;
    registry().lock().remove(&(signal as i32));
    PENDING[signal as usize].store(false, Ordering::Relaxed);
    Ok(())
}

/// Run handlers for every signal delivered since the last call. This is the
/// safe point; call it where interrupting user code is acceptable. Returns
/// the number of handlers run.
pub fn run_pending() -> usize {
    if !ANY_PENDING.swap(false, Ordering::AcqRel) {
        return 0;
    }
    let mut run = 0;
    for signo in 1..MAX_SIGNAL {
        if PENDING[signo].swap(false, Ordering::Relaxed) {
            let handler = registry().lock().get(&(signo as i32)).cloned();
            if let Some(handler) = handler {
                handler();
                run += 1;
            }
        }
    }
    run
}

/// Raise the named signal in the current process.
pub fn raise(name: &str) -> Result<(), Status> {
    let signal = lookup(name)?;
    nix::sys::signal::raise(signal)?;
    Ok(())
}

/// Add the named signal to the process signal mask.
pub fn block(name: &str) -> Result<(), Status> {
    mask(name, SigmaskHow::SIG_BLOCK)
}

/// Remove the named signal from the process signal mask.
pub fn unblock(name: &str) -> Result<(), Status> {
    mask(name, SigmaskHow::SIG_UNBLOCK)
}

fn mask(name: &str, how: SigmaskHow) -> Result<(), Status> {
    let signal = lookup(name)?;
    let mut set = SigSet::empty();
    set.add(signal);
    sigprocmask(how, Some(&set), None)?;
    Ok(())
}

/// Every signal this platform supports, as `(name, number)` pairs.
pub fn names() -> Vec<(&'static str, i32)> {
    Signal::iterator()
        .map(|signal| (signal.as_str(), signal as i32))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn lookup_accepts_both_spellings() {
        assert_eq!(lookup("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(lookup("term").unwrap(), Signal::SIGTERM);
        assert!(lookup("NOTASIGNAL").is_err());
    }

    #[test]
    fn names_cover_the_usual_suspects() {
        let names = names();
        for expected in ["SIGINT", "SIGTERM", "SIGUSR1"] {
            assert!(names.iter().any(|(name, _)| *name == expected));
        }
    }

    #[test]
    fn handler_runs_at_the_safe_point_not_in_the_frame() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        install("SIGUSR1", || {
            HITS.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        raise("SIGUSR1").unwrap();
        // Delivery only set the flag; nothing ran yet.
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
        assert_eq!(run_pending(), 1);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        // No re-run without a new delivery.
        assert_eq!(run_pending(), 0);
        clear("SIGUSR1").unwrap();
    }
}
