//! Worker pool internals: the priority dispatch loop and the per-task
//! delivery lifecycle.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use herald_common::types::{DeliveryTask, EventType, TaskState};

use crate::retry::backoff_delay;
use crate::transport::SendOutcome;
use crate::{GateDecision, Inner, Receivers};

/// Pulls tasks off the per-priority queues, critical first, and spawns one
/// bounded send per task. The biased select means a ready critical task is
/// always claimed before any important or normal one.
pub(crate) async fn dispatch_loop(
    inner: Arc<Inner>,
    mut rx: Receivers,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Delivery dispatcher shutting down");
                    break;
                }
            }
            Some(task) = rx.critical.recv() => claim_batch(&inner, task, &mut rx.critical),
            Some(task) = rx.important.recv() => claim_batch(&inner, task, &mut rx.important),
            Some(task) = rx.normal.recv() => claim_batch(&inner, task, &mut rx.normal),
            else => break,
        }
    }
}

/// Claim up to `worker_batch_size` tasks from one queue per wakeup.
fn claim_batch(
    inner: &Arc<Inner>,
    first: DeliveryTask,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<DeliveryTask>,
) {
    spawn_delivery(inner.clone(), first);
    for _ in 1..inner.config.worker_batch_size {
        match rx.try_recv() {
            Ok(task) => spawn_delivery(inner.clone(), task),
            Err(_) => break,
        }
    }
}

fn spawn_delivery(inner: Arc<Inner>, task: DeliveryTask) {
    tokio::spawn(async move {
        let Ok(_global) = inner.global_permits.clone().acquire_owned().await else {
            return;
        };
        let Ok(_platform) = inner.platform_permit(task.platform).acquire_owned().await else {
            return;
        };
        deliver(&inner, task).await;
    });
}

/// One task's delivery lifecycle: cancellation check, send-time consistency
/// re-check, transport send, outcome handling.
pub(crate) async fn deliver(inner: &Arc<Inner>, mut task: DeliveryTask) {
    let key = task.idempotency_key.clone();

    if inner.table.take_cancelled(&key) {
        task.transition(TaskState::Expired);
        inner.dead_letters.record(&task, "device unregistered");
        return;
    }

    if !inner.table.begin_send(&key) {
        tracing::debug!(
            event_id = %task.event_id,
            device_id = %task.device_id,
            "Duplicate in-flight send suppressed"
        );
        return;
    }

    // Re-read the membership version immediately before send. A stale task
    // is discarded and replaced by a fresh one against the current version.
    if let GateDecision::Stale { current } = inner.gate.check_send(&task) {
        inner.table.end_send(&key);
        tracing::info!(
            event_id = %task.event_id,
            device_id = %task.device_id,
            built_against = task.membership_version.unwrap_or(0),
            current,
            "Discarding stale capability task, rebuilding against current version"
        );
        inner.queues.send(rebuild_against(task, current));
        return;
    }

    task.transition(TaskState::Sent);
    let outcome = inner.transport.send(&task).await;
    task.attempt_count += 1;
    inner.table.end_send(&key);

    match outcome {
        SendOutcome::Ack => {
            task.transition(TaskState::Acked);
            inner.acked.fetch_add(1, Ordering::Relaxed);
            if task.event_type == EventType::MembershipChanged
                && let Some(version) = task.membership_version
                && let Err(e) =
                    inner
                        .registry
                        .confirm_capability(&task.user_id, &task.device_id, version)
            {
                tracing::warn!(
                    device_id = %task.device_id,
                    error = %e,
                    "Failed to confirm capability version after ack"
                );
            }
            inner.table.finish(&task);
            tracing::debug!(
                event_id = %task.event_id,
                device_id = %task.device_id,
                transport = inner.transport.name(),
                attempts = task.attempt_count,
                "Task delivered"
            );
        }
        SendOutcome::Transient(reason) => {
            if task.attempt_count >= inner.config.max_retry_attempts {
                task.transition(TaskState::Failed);
                inner.dead_letters.record(&task, &reason);
                inner.table.finish(&task);
            } else {
                let delay = backoff_delay(
                    inner.config.retry_backoff_base,
                    inner.config.retry_backoff_cap,
                    task.attempt_count,
                );
                tracing::warn!(
                    event_id = %task.event_id,
                    device_id = %task.device_id,
                    attempt = task.attempt_count,
                    retry_in_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient delivery failure, backing off"
                );
                task.transition(TaskState::Pending);
                task.next_retry_at = Utc::now()
                    .checked_add_signed(
                        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
                    );
                inner.retry.schedule(task, Instant::now() + delay);
            }
        }
        SendOutcome::Permanent(reason) => {
            // Finish the bookkeeping first so the unregister hook does not
            // double-cancel this task.
            task.transition(TaskState::Expired);
            inner.table.finish(&task);
            inner.dead_letters.record(&task, &reason);
            if let Err(e) = inner.registry.unregister(&task.user_id, &task.device_id) {
                tracing::warn!(
                    device_id = %task.device_id,
                    error = %e,
                    "Failed to unregister device after permanent failure"
                );
            }
        }
    }
}

/// Same event, same idempotency key, fresh version: this is the task that
/// replaces one the gate found stale.
fn rebuild_against(mut task: DeliveryTask, current: u64) -> DeliveryTask {
    task.membership_version = Some(current);
    if let Some(payload) = task.payload.as_object_mut() {
        payload.insert("membership_version".to_string(), serde_json::json!(current));
    }
    task.attempt_count = 0;
    task.next_retry_at = None;
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;

    use tokio::sync::Semaphore;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use herald_common::types::{
        Device, NotificationEvent, Platform, Priority, RegisterDevice,
    };
    use herald_registry::DeviceRegistry;

    use crate::transport::MockTransport;
    use crate::{DeadLetterStore, DeliveryConfig, OpenGate, Queues, RetryScheduler, TaskTable};

    struct Harness {
        inner: Arc<Inner>,
        transport: Arc<MockTransport>,
        registry: Arc<DeviceRegistry>,
        critical_rx: mpsc::UnboundedReceiver<DeliveryTask>,
        _normal_rx: mpsc::UnboundedReceiver<DeliveryTask>,
    }

    fn make_harness(config: DeliveryConfig) -> Harness {
        make_harness_with_gate(config, Arc::new(OpenGate))
    }

    fn make_harness_with_gate(config: DeliveryConfig, gate: Arc<dyn crate::SendGate>) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let registry = Arc::new(DeviceRegistry::default());
        let (critical_tx, critical_rx) = mpsc::unbounded_channel();
        let (important_tx, _important_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();

        let platform_permits = Platform::ALL
            .into_iter()
            .map(|p| (p, Arc::new(Semaphore::new(4))))
            .collect::<HashMap<_, _>>();

        let inner = Arc::new(Inner {
            transport: transport.clone(),
            registry: registry.clone(),
            gate,
            table: Arc::new(TaskTable::new()),
            retry: Arc::new(RetryScheduler::new()),
            dead_letters: Arc::new(DeadLetterStore::new(100)),
            queues: Queues {
                critical: critical_tx,
                important: important_tx,
                normal: normal_tx,
            },
            global_permits: Arc::new(Semaphore::new(8)),
            platform_permits,
            config,
            acked: AtomicU64::new(0),
        });

        Harness {
            inner,
            transport,
            registry,
            critical_rx,
            _normal_rx: normal_rx,
        }
    }

    fn make_task(user_id: &str, device_id: &str) -> DeliveryTask {
        let event = NotificationEvent {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event_type: EventType::PlayProgress,
            payload: serde_json::json!({"show_id": "lassie", "position_seconds": 5}),
            occurred_at: Utc::now(),
            priority: Priority::Normal,
        };
        let device = Device {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            platform: Platform::Ios,
            push_token: "tok".to_string(),
            last_seen_at: Utc::now(),
            capability_version: 0,
        };
        DeliveryTask::new(&event, &device)
    }

    #[tokio::test]
    async fn test_ack_finishes_task() {
        let h = make_harness(DeliveryConfig::default());
        let task = make_task("manuel", "phone");
        h.inner.table.track(&task);

        deliver(&h.inner, task).await;

        assert_eq!(h.transport.sent_count(), 1);
        assert_eq!(h.inner.acked.load(Ordering::Relaxed), 1);
        assert!(h.inner.dead_letters.is_empty());
        assert_eq!(h.inner.table.pending_devices(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let h = make_harness(DeliveryConfig::default());
        let task = make_task("manuel", "phone");
        h.inner.table.track(&task);
        h.transport
            .script("phone", SendOutcome::Transient("throttled".to_string()));

        deliver(&h.inner, task).await;

        assert_eq!(h.inner.retry.len(), 1);
        assert!(h.inner.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_retry_cap_dead_letters_exactly_once() {
        let mut config = DeliveryConfig::default();
        config.max_retry_attempts = 3;
        let h = make_harness(config);

        let mut task = make_task("manuel", "phone");
        h.inner.table.track(&task);
        for _ in 0..3 {
            h.transport
                .script("phone", SendOutcome::Transient("throttled".to_string()));
        }

        // Attempts 1 and 2 park the task for retry; attempt 3 buries it.
        deliver(&h.inner, task).await;
        task = h.inner.retry.take_due(Instant::now() + h.inner.config.retry_backoff_cap)
            .pop()
            .unwrap();
        deliver(&h.inner, task).await;
        task = h.inner.retry.take_due(Instant::now() + h.inner.config.retry_backoff_cap)
            .pop()
            .unwrap();
        deliver(&h.inner, task).await;

        assert!(h.inner.retry.is_empty());
        let dead = h.inner.dead_letters.list();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].state, TaskState::Failed);
        assert_eq!(dead[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_unregisters_device() {
        let h = make_harness(DeliveryConfig::default());
        h.registry
            .register(RegisterDevice {
                device_id: "phone".to_string(),
                user_id: "manuel".to_string(),
                platform: Platform::Ios,
                push_token: "tok".to_string(),
            })
            .unwrap();

        let task = make_task("manuel", "phone");
        h.inner.table.track(&task);
        h.transport
            .script("phone", SendOutcome::Permanent("invalid token".to_string()));

        deliver(&h.inner, task).await;

        assert!(h.registry.devices_of("manuel").unwrap().is_empty());
        let dead = h.inner.dead_letters.list();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].state, TaskState::Expired);
        assert_eq!(h.inner.retry.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_never_sent() {
        let h = make_harness(DeliveryConfig::default());
        let task = make_task("manuel", "phone");
        h.inner.table.track(&task);
        // Simulates the unregister hook firing while the task is queued.
        use herald_registry::UnregisterHook;
        h.inner.table.on_unregister("manuel", "phone");

        deliver(&h.inner, task).await;

        assert_eq!(h.transport.sent_count(), 0);
        let dead = h.inner.dead_letters.list();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "device unregistered");
        assert_eq!(dead[0].state, TaskState::Expired);
    }

    #[tokio::test]
    async fn test_stale_task_rebuilt_not_sent() {
        struct AlwaysStale;
        impl crate::SendGate for AlwaysStale {
            fn check_send(&self, task: &DeliveryTask) -> GateDecision {
                match task.membership_version {
                    Some(v) if v < 9 => GateDecision::Stale { current: 9 },
                    _ => GateDecision::Fresh,
                }
            }
        }

        let h = make_harness_with_gate(DeliveryConfig::default(), Arc::new(AlwaysStale));

        let mut task = make_task("manuel", "phone");
        task.event_type = EventType::MembershipChanged;
        task.priority = Priority::Critical;
        task.membership_version = Some(3);
        task.payload = serde_json::json!({"membership_version": 3});
        h.inner.table.track(&task);

        deliver(&h.inner, task).await;

        // Nothing was sent; a rebuilt task landed on the critical queue.
        assert_eq!(h.transport.sent_count(), 0);
        let mut critical_rx = h.critical_rx;
        let rebuilt = critical_rx.try_recv().unwrap();
        assert_eq!(rebuilt.membership_version, Some(9));
        assert_eq!(rebuilt.payload["membership_version"], 9);
        assert_eq!(rebuilt.state, TaskState::Pending);
        assert_eq!(rebuilt.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_send_suppressed() {
        let h = make_harness(DeliveryConfig::default());
        let task = make_task("manuel", "phone");
        h.inner.table.track(&task);
        assert!(h.inner.table.begin_send(&task.idempotency_key));

        deliver(&h.inner, task).await;
        assert_eq!(h.transport.sent_count(), 0);
    }
}
