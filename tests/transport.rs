use portos::value::Handle;
use portos::{File, Queue, Value};
use std::thread as os_thread;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn blocked_push_released_by_terminate_from_another_thread() {
    let queue = Queue::new(1).unwrap();
    queue.push(&[Value::Number(1.0)]).unwrap();

    let pusher = {
        let queue = queue.clone();
        os_thread::spawn(move || queue.push(&[Value::Number(2.0)]))
    };
    os_thread::sleep(Duration::from_millis(100));
    queue.terminate();
    let err = pusher.join().unwrap().unwrap_err();
    assert_eq!(err.name(), "EOF");
}

#[test]
fn file_handle_transfers_through_a_queue() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.txt");
    std::fs::write(&path, b"carried contents").unwrap();

    let queue = Queue::new(1).unwrap();
    let sender = {
        let queue = queue.clone();
        let path = path.clone();
        os_thread::spawn(move || {
            let file = File::open(&path, "r").unwrap();
            queue.push(&[Value::from(file)]).unwrap();
            // The sender's reference is gone; the queue keeps the file
            // alive in transit.
        })
    };
    sender.join().unwrap();

    let mut values = queue.pop().unwrap();
    let Some(Value::Handle(Handle::File(file))) = values.pop() else {
        panic!("expected a file handle");
    };
    assert_eq!(file.read_all().unwrap(), b"carried contents");
    file.close().unwrap();
    file.close().unwrap();
    let err = file.read_all().unwrap_err();
    assert!(err.message().contains("closed file"));
}

#[test]
fn worker_threads_pass_results_back() {
    let results = Queue::new(8).unwrap();
    let mut workers = Vec::new();
    for i in 0..4 {
        let worker = portos::thread::create(
            move |mut args| {
                let Some(Value::Handle(Handle::Queue(results))) = args.pop() else {
                    return Err(portos::Status::invalid("expected the results queue"));
                };
                results.push(&[Value::Number(i as f64 * 10.0)])
            },
            &[Value::from(results.clone())],
        )
        .unwrap();
        workers.push(worker);
    }
    let mut seen = Vec::new();
    for _ in 0..4 {
        match queue_pop_number(&results) {
            Some(n) => seen.push(n as i64),
            None => panic!("worker produced no number"),
        }
    }
    for worker in workers {
        worker.join().unwrap();
    }
    seen.sort();
    assert_eq!(seen, vec![0, 10, 20, 30]);
}

fn queue_pop_number(queue: &Queue) -> Option<f64> {
    match queue.pop().unwrap().pop() {
        Some(Value::Number(n)) => Some(n),
        _ => None,
    }
}

#[test]
fn interrupt_releases_waiters_across_threads() {
    let queue = Queue::new(1).unwrap();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            os_thread::spawn(move || queue.pop())
        })
        .collect();
    os_thread::sleep(Duration::from_millis(100));
    queue.interrupt();
    for waiter in waiters {
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.name(), "EINTR");
    }
}
