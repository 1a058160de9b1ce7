//! Exit-hook flush guarantee, isolated in its own test binary.
//!
//! This test drives the process-wide exit registry, so it must not share a
//! process with other tests that register hooks.

use aqueduct::{Queue, QueueError, run_exit_hooks};

#[test]
fn exit_hooks_flush_unclosed_queues() {
    let queue: Queue<u32> = Queue::new(10).unwrap();
    queue.put(1).unwrap();
    queue.put(2).unwrap();
    queue.put(3).unwrap();

    // The queue was never closed; the exit hooks append the shutdown marker
    // and the feeder drains the buffer before closing the write end.
    run_exit_hooks();

    assert_eq!(queue.get().unwrap(), 1);
    assert_eq!(queue.get().unwrap(), 2);
    assert_eq!(queue.get().unwrap(), 3);

    // The feeder closed the only write end, so the stream now reports
    // disconnection rather than blocking forever.
    assert!(matches!(queue.get(), Err(QueueError::Transport(_))));
}
