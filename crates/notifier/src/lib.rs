//! Delivery worker pool.
//!
//! Consumes delivery tasks from per-priority queues and pushes them to the
//! external transport with bounded concurrency, exponential-backoff retry,
//! dead-lettering and synchronous cancellation on device unregister.
//! Critical tasks are never queued behind normal ones.

pub mod dead_letter;
pub mod retry;
pub mod table;
pub mod transport;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use retry::{RetryScheduler, backoff_delay};
pub use table::TaskTable;
pub use transport::{LoggingTransport, MockTransport, PushTransport, SendOutcome, WebhookTransport};

use herald_common::config::AppConfig;
use herald_common::types::{DeliveryTask, Platform, Priority};
use herald_registry::DeviceRegistry;

/// Verdict of a consistency check against the membership version source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The task still matches the latest committed version.
    Fresh,
    /// A newer version was committed; the task must not be sent as-is.
    Stale { current: u64 },
}

/// Version check run immediately before every send. Implemented by the
/// engine's consistency gate.
pub trait SendGate: Send + Sync {
    fn check_send(&self, task: &DeliveryTask) -> GateDecision;
}

/// Gate that never finds staleness. For tests and deployments without a
/// membership feed.
pub struct OpenGate;

impl SendGate for OpenGate {
    fn check_send(&self, _task: &DeliveryTask) -> GateDecision {
        GateDecision::Fresh
    }
}

/// Knobs for the worker pool, derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_retry_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub per_platform_concurrency: usize,
    pub worker_count: usize,
    pub worker_batch_size: usize,
}

impl DeliveryConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            retry_backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
            retry_backoff_cap: Duration::from_millis(config.retry_backoff_cap_ms),
            per_platform_concurrency: config.per_platform_concurrency.max(1),
            worker_count: config.worker_count.max(1),
            worker_batch_size: config.worker_batch_size.max(1),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Per-priority senders into the worker pool.
pub(crate) struct Queues {
    critical: mpsc::UnboundedSender<DeliveryTask>,
    important: mpsc::UnboundedSender<DeliveryTask>,
    normal: mpsc::UnboundedSender<DeliveryTask>,
}

impl Queues {
    pub(crate) fn send(&self, task: DeliveryTask) {
        let sender = match task.priority {
            Priority::Critical => &self.critical,
            Priority::Important => &self.important,
            Priority::Normal => &self.normal,
        };
        if sender.send(task).is_err() {
            tracing::warn!("Delivery queue closed, dropping task");
        }
    }
}

pub(crate) struct Receivers {
    pub(crate) critical: mpsc::UnboundedReceiver<DeliveryTask>,
    pub(crate) important: mpsc::UnboundedReceiver<DeliveryTask>,
    pub(crate) normal: mpsc::UnboundedReceiver<DeliveryTask>,
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn PushTransport>,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) gate: Arc<dyn SendGate>,
    pub(crate) table: Arc<TaskTable>,
    pub(crate) retry: Arc<RetryScheduler>,
    pub(crate) dead_letters: Arc<DeadLetterStore>,
    pub(crate) queues: Queues,
    pub(crate) global_permits: Arc<Semaphore>,
    pub(crate) platform_permits: HashMap<Platform, Arc<Semaphore>>,
    pub(crate) config: DeliveryConfig,
    pub(crate) acked: AtomicU64,
}

impl Inner {
    pub(crate) fn platform_permit(&self, platform: Platform) -> Arc<Semaphore> {
        // The map is total over Platform::ALL by construction.
        self.platform_permits
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)))
    }
}

/// The delivery worker pool service.
pub struct DeliveryService {
    inner: Arc<Inner>,
    receivers: Mutex<Option<Receivers>>,
    shutdown_tx: watch::Sender<bool>,
}

impl DeliveryService {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        registry: Arc<DeviceRegistry>,
        gate: Arc<dyn SendGate>,
        dead_letters: Arc<DeadLetterStore>,
        config: DeliveryConfig,
    ) -> Self {
        let (critical_tx, critical_rx) = mpsc::unbounded_channel();
        let (important_tx, important_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();

        let platform_permits = Platform::ALL
            .into_iter()
            .map(|p| (p, Arc::new(Semaphore::new(config.per_platform_concurrency))))
            .collect();

        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            transport,
            registry,
            gate,
            table: Arc::new(TaskTable::new()),
            retry: Arc::new(RetryScheduler::new()),
            dead_letters,
            queues: Queues {
                critical: critical_tx,
                important: important_tx,
                normal: normal_tx,
            },
            global_permits: Arc::new(Semaphore::new(config.worker_count)),
            platform_permits,
            config,
            acked: AtomicU64::new(0),
        });

        Self {
            inner,
            receivers: Mutex::new(Some(Receivers {
                critical: critical_rx,
                important: important_rx,
                normal: normal_rx,
            })),
            shutdown_tx,
        }
    }

    /// The pending/cancellation bookkeeping, for wiring to the registry's
    /// unregister hooks.
    pub fn task_table(&self) -> Arc<TaskTable> {
        self.inner.table.clone()
    }

    /// Queue one task for delivery. Ownership of the task transfers to the
    /// pool; a given task is acted on by at most one worker at a time.
    pub fn enqueue(&self, task: DeliveryTask) {
        self.inner.table.track(&task);
        self.inner.queues.send(task);
    }

    pub fn enqueue_all(&self, tasks: Vec<DeliveryTask>) {
        for task in tasks {
            self.enqueue(task);
        }
    }

    /// Spawn the dispatcher and retry-scheduler loops. Call once.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let Some(receivers) = self.receivers.lock().ok().and_then(|mut r| r.take()) else {
            tracing::warn!("DeliveryService::start called twice, ignoring");
            return Vec::new();
        };

        let mut handles = Vec::new();

        let inner = self.inner.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            worker::dispatch_loop(inner, receivers, shutdown_rx).await;
        }));

        let inner = self.inner.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let retry = inner.retry.clone();
            retry
                .run(|task| inner.queues.send(task), shutdown_rx)
                .await;
        }));

        handles
    }

    /// Stop pulling new tasks. In-flight sends run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Successfully delivered task count.
    pub fn acked_count(&self) -> u64 {
        self.inner.acked.load(Ordering::Relaxed)
    }

    /// Tasks currently parked awaiting retry.
    pub fn retry_backlog(&self) -> usize {
        self.inner.retry.len()
    }
}
