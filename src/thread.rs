//! Worker threads
//!
//! [`create`] spawns an OS thread whose arguments travel through the tuple
//! codec, exactly as they would through a [`Queue`](crate::queue::Queue):
//! handles are transferred by reference count and unpacked on the far side.
//! The spawned body runs with its own scratch pool, like any other thread.

use crate::status::Status;
use crate::tuple::Tuple;
use crate::value::Value;
use log::debug;
use std::thread::JoinHandle;
use std::time::Duration;

/// A running worker thread.
#[derive(Debug)]
pub struct Thread {
    handle: JoinHandle<Result<(), Status>>,
}

/// Spawn a thread running `body` with `args` carried across via the tuple
/// codec.
pub fn create<F>(body: F, args: &[Value]) -> Result<Thread, Status>
where
    F: FnOnce(Vec<Value>) -> Result<(), Status> + Send + 'static,
{
    let tuple = Tuple::pack(args);
    let handle = std::thread::Builder::new()
        .name("portos-worker".to_string())
        .spawn(move || {
            let args = tuple.unpack()?;
            body(args)
        })?;
    Ok(Thread { handle })
}

impl Thread {
    /// Wait for the body to finish and return its status.
    pub fn join(self) -> Result<(), Status> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => {
                debug!("worker thread panicked: {panic:?}");
                Err(Status::invalid("worker thread panicked"))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Sleep for `usec` microseconds.
pub fn sleep(usec: u64) {
    std::thread::sleep(Duration::from_micros(usec));
}

/// Yield the rest of the current timeslice.
pub fn yield_now() {
    std::thread::yield_now();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arguments_arrive_unpacked() {
        let thread = create(
            |args| {
                assert_eq!(args.len(), 2);
                assert_eq!(args[0], Value::Number(3.0));
                assert_eq!(args[1], Value::from("hi"));
                Ok(())
            },
            &[Value::Number(3.0), Value::from("hi")],
        )
        .unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn body_failures_surface_at_join() {
        let thread = create(|_| Err(Status::invalid("deliberate")), &[]).unwrap();
        let err = thread.join().unwrap_err();
        assert_eq!(err.message(), "deliberate");
    }

    #[test]
    fn queue_handle_crosses_thread_boundary() {
        let queue = crate::queue::Queue::new(2).unwrap();
        let thread = create(
            |mut args| {
                let Some(Value::Handle(crate::value::Handle::Queue(queue))) = args.pop() else {
                    return Err(Status::invalid("expected a queue"));
                };
                queue.push(&[Value::from("from worker")])
            },
            &[Value::from(queue.clone())],
        )
        .unwrap();
        assert_eq!(queue.pop().unwrap(), vec![Value::from("from worker")]);
        thread.join().unwrap();
    }
}
