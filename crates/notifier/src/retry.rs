//! Retry scheduling — exponential backoff with jitter and a single timer.
//!
//! Tasks awaiting retry sit in a min-heap keyed by due time. One scheduler
//! task sleeps until the earliest deadline (or until a new task arrives) and
//! requeues everything that has come due. No per-task sleeping, no busy
//! polling.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

use herald_common::types::DeliveryTask;

/// Backoff delay before attempt number `attempt` (1-based), exponential in
/// the attempt count, capped, with full jitter.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let ceiling = exp.min(cap);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let jittered = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(jittered)
}

struct Scheduled {
    due: Instant,
    seq: u64,
    task: DeliveryTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of tasks waiting for their `next_retry_at` deadline.
pub struct RetryScheduler {
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Park a task until `due`.
    pub fn schedule(&self, task: DeliveryTask, due: Instant) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(Reverse(Scheduled { due, seq, task }));
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap
            .lock()
            .ok()
            .and_then(|heap| heap.peek().map(|Reverse(s)| s.due))
    }

    /// Pop every task whose deadline has passed.
    pub fn take_due(&self, now: Instant) -> Vec<DeliveryTask> {
        let Ok(mut heap) = self.heap.lock() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(s)| s.due <= now) {
            if let Some(Reverse(s)) = heap.pop() {
                due.push(s.task);
            }
        }
        due
    }

    /// Scheduler loop: requeues due tasks through `requeue` until the
    /// shutdown signal flips.
    pub async fn run<F>(&self, requeue: F, mut shutdown: tokio::sync::watch::Receiver<bool>)
    where
        F: Fn(DeliveryTask),
    {
        loop {
            let sleep_target = self.next_due();
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.notify.notified() => {}
                _ = async {
                    match sleep_target {
                        Some(due) => tokio::time::sleep_until(due).await,
                        // Nothing scheduled; wait for a notify instead.
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    for task in self.take_due(Instant::now()) {
                        tracing::debug!(
                            event_id = %task.event_id,
                            device_id = %task.device_id,
                            attempt = task.attempt_count,
                            "Retry due, requeueing task"
                        );
                        requeue(task);
                    }
                }
            }
        }
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}
