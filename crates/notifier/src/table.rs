//! Task table — tracks which deliveries are pending or in flight.
//!
//! Three concerns:
//! - pending-task bookkeeping per device, so an unregister can cancel
//!   everything queued for that device synchronously;
//! - a cancelled set consulted by workers before every send;
//! - the in-flight set enforcing at most one concurrent send per
//!   (event, device) pair.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use herald_common::types::DeliveryTask;
use herald_registry::UnregisterHook;

fn device_key(user_id: &str, device_id: &str) -> (String, String) {
    (user_id.to_string(), device_id.to_string())
}

#[derive(Default)]
pub struct TaskTable {
    /// (user_id, device_id) → idempotency keys of queued tasks.
    pending: Mutex<HashMap<(String, String), HashSet<String>>>,
    /// Idempotency keys invalidated by an unregister.
    cancelled: Mutex<HashSet<String>>,
    /// Idempotency keys with a send currently in progress.
    in_flight: Mutex<HashSet<String>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task as queued for delivery.
    pub fn track(&self, task: &DeliveryTask) {
        if let Ok(mut pending) = self.pending.lock() {
            pending
                .entry(device_key(&task.user_id, &task.device_id))
                .or_default()
                .insert(task.idempotency_key.clone());
        }
    }

    /// Drop a task from the pending bookkeeping (terminal state reached).
    pub fn finish(&self, task: &DeliveryTask) {
        if let Ok(mut pending) = self.pending.lock() {
            let key = device_key(&task.user_id, &task.device_id);
            if let Some(keys) = pending.get_mut(&key) {
                keys.remove(&task.idempotency_key);
                if keys.is_empty() {
                    pending.remove(&key);
                }
            }
        }
    }

    /// Whether the task was cancelled; consumes the cancellation mark.
    pub fn take_cancelled(&self, idempotency_key: &str) -> bool {
        self.cancelled
            .lock()
            .map(|mut cancelled| cancelled.remove(idempotency_key))
            .unwrap_or(false)
    }

    /// Claim the in-flight slot for a task. False means another send for the
    /// same (event, device) pair is already in progress.
    pub fn begin_send(&self, idempotency_key: &str) -> bool {
        self.in_flight
            .lock()
            .map(|mut in_flight| in_flight.insert(idempotency_key.to_string()))
            .unwrap_or(false)
    }

    pub fn end_send(&self, idempotency_key: &str) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(idempotency_key);
        }
    }

    /// Number of devices with queued work (for monitoring).
    pub fn pending_devices(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl UnregisterHook for TaskTable {
    /// Runs inside the registry's unregister call: every task still queued
    /// for the device is marked cancelled before unregister returns.
    fn on_unregister(&self, user_id: &str, device_id: &str) {
        let keys = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&device_key(user_id, device_id)));

        let Some(keys) = keys else {
            return;
        };

        let count = keys.len();
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.extend(keys);
        }
        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            cancelled = count,
            "Cancelled pending tasks for unregistered device"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use herald_common::types::{Device, EventType, NotificationEvent, Platform, Priority};

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

    #[test]
    fn test_unregister_cancels_pending_tasks() {
        let table = TaskTable::new();
        let t1 = make_task("manuel", "phone");
        let t2 = make_task("manuel", "phone");
        let other = make_task("manuel", "tv");
        table.track(&t1);
        table.track(&t2);
        table.track(&other);

        table.on_unregister("manuel", "phone");

        assert!(table.take_cancelled(&t1.idempotency_key));
        assert!(table.take_cancelled(&t2.idempotency_key));
        assert!(!table.take_cancelled(&other.idempotency_key));
    }

    #[test]
    fn test_take_cancelled_consumes_mark() {
        let table = TaskTable::new();
        let task = make_task("manuel", "phone");
        table.track(&task);
        table.on_unregister("manuel", "phone");

        assert!(table.take_cancelled(&task.idempotency_key));
        assert!(!table.take_cancelled(&task.idempotency_key));
    }

    #[test]
    fn test_finished_task_is_not_cancelled_later() {
        let table = TaskTable::new();
        let task = make_task("manuel", "phone");
        table.track(&task);
        table.finish(&task);

        table.on_unregister("manuel", "phone");
        assert!(!table.take_cancelled(&task.idempotency_key));
    }

    #[test]
    fn test_in_flight_slot_is_exclusive() {
        let table = TaskTable::new();
        assert!(table.begin_send("k1"));
        assert!(!table.begin_send("k1"));
        table.end_send("k1");
        assert!(table.begin_send("k1"));
    }
}
