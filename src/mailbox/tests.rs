use super::*;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Barrier};

fn processor(batch_count: usize, worker_count: usize) -> MailboxProcessor {
    MailboxProcessor::new(MailboxOptions {
        batch_count,
        worker_count,
    })
}

async fn wait_for(rx: oneshot::Receiver<()>) {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("timed out")
        .expect("sender dropped");
}

#[tokio::test]
async fn test_same_key_runs_in_submission_order() {
    let processor = processor(3, 8);
    processor.start().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let mut rng = rand::rng();

    for i in 0..50 {
        let order = Arc::clone(&order);
        let delay = Duration::from_millis(rng.random_range(0..3));
        processor.process("A", async move {
            tokio::time::sleep(delay).await;
            order.lock().unwrap().push(i);
        });
    }
    processor.process("A", async move {
        let _ = done_tx.send(());
    });

    wait_for(done_rx).await;
    assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_one_task_per_key_at_a_time() {
    let processor = processor(2, 8);
    processor.start().await.unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = oneshot::channel();

    for _ in 0..20 {
        let running = Arc::clone(&running);
        let max_seen = Arc::clone(&max_seen);
        processor.process("A", async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }
    processor.process("A", async move {
        let _ = done_tx.send(());
    });

    wait_for(done_rx).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_different_keys_run_concurrently() {
    let processor = processor(10, 4);
    processor.start().await.unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let (a_tx, a_rx) = oneshot::channel();
    let (b_tx, b_rx) = oneshot::channel();

    // Each task waits for the other; this only completes if both run at once.
    let barrier_a = Arc::clone(&barrier);
    processor.process("A", async move {
        barrier_a.wait().await;
        let _ = a_tx.send(());
    });
    let barrier_b = Arc::clone(&barrier);
    processor.process("B", async move {
        barrier_b.wait().await;
        let _ = b_tx.send(());
    });

    wait_for(a_rx).await;
    wait_for(b_rx).await;
}

#[tokio::test]
async fn test_worker_count_bounds_concurrency() {
    let processor = processor(10, 1);
    processor.start().await.unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let remaining = Arc::new(AtomicUsize::new(6));
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    for key in ["A", "B", "C", "D", "E", "F"] {
        let running = Arc::clone(&running);
        let max_seen = Arc::clone(&max_seen);
        let remaining = Arc::clone(&remaining);
        let done_tx = Arc::clone(&done_tx);
        processor.process(key, async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        });
    }

    wait_for(done_rx).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_task_does_not_block_mailbox() {
    let processor = processor(10, 2);
    processor.start().await.unwrap();

    let (done_tx, done_rx) = oneshot::channel();
    processor.process("A", async {
        panic!("handler blew up");
    });
    processor.process("A", async move {
        let _ = done_tx.send(());
    });

    wait_for(done_rx).await;
}

#[tokio::test]
async fn test_stop_keeps_queued_tasks_until_restart() {
    let processor = processor(10, 2);
    assert_eq!(processor.status(), WorkerStatus::NotStarted);

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = Arc::clone(&ran);
        processor.process("A", async move {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(processor.pending(), 3);

    processor.start().await.unwrap();
    assert_eq!(processor.status(), WorkerStatus::Running);
    let (done_tx, done_rx) = oneshot::channel();
    processor.process("A", async move {
        let _ = done_tx.send(());
    });
    wait_for(done_rx).await;
    assert_eq!(ran.load(Ordering::SeqCst), 3);

    processor.stop().await.unwrap();
    assert_eq!(processor.status(), WorkerStatus::Stopped);

    let ran_after_stop = Arc::clone(&ran);
    processor.process("B", async move {
        ran_after_stop.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(processor.pending(), 1);

    processor.start().await.unwrap();
    let (done_tx, done_rx) = oneshot::channel();
    processor.process("B", async move {
        let _ = done_tx.send(());
    });
    wait_for(done_rx).await;
    assert_eq!(ran.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_task() {
    let processor = processor(10, 2);
    processor.start().await.unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = oneshot::channel();
    let flag = Arc::clone(&finished);
    processor.process("A", async move {
        let _ = started_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.fetch_add(1, Ordering::SeqCst);
    });

    wait_for(started_rx).await;
    processor.stop().await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let processor = processor(10, 2);
    processor.start().await.unwrap();

    assert!(matches!(
        processor.start().await,
        Err(MailboxError::AlreadyRunning)
    ));
}

#[tokio::test]
async fn test_purge_drops_queued_tasks() {
    let processor = processor(10, 2);
    let ran = Arc::new(AtomicUsize::new(0));

    for key in ["A", "B"] {
        let ran = Arc::clone(&ran);
        processor.process(key, async move {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(processor.mailbox_count(), 2);

    assert_eq!(processor.purge(), 2);
    assert_eq!(processor.pending(), 0);
    assert_eq!(processor.mailbox_count(), 0);

    processor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_mailboxes_are_removed() {
    let processor = processor(10, 2);
    processor.start().await.unwrap();

    let (done_tx, done_rx) = oneshot::channel();
    processor.process("A", async move {
        let _ = done_tx.send(());
    });
    wait_for(done_rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(processor.mailbox_count(), 0);
}
