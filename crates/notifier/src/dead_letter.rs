//! Dead-letter store for terminally failed delivery tasks.
//!
//! Tasks that exhaust their retry budget, hit an invalid push token or get
//! cancelled by an unregister end up here with a reason, for offline
//! inspection. The store is a bounded ring: once capacity is reached the
//! oldest entries are evicted.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use herald_common::types::{DeliveryTask, EventType, Priority, TaskState};

/// One buried task.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event_id: Uuid,
    pub device_id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub priority: Priority,
    pub state: TaskState,
    pub attempt_count: u32,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded in-memory graveyard.
pub struct DeadLetterStore {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, task: &DeliveryTask, reason: &str) {
        let entry = DeadLetter {
            event_id: task.event_id,
            device_id: task.device_id.clone(),
            user_id: task.user_id.clone(),
            event_type: task.event_type,
            priority: task.priority,
            state: task.state,
            attempt_count: task.attempt_count,
            reason: reason.to_string(),
            recorded_at: Utc::now(),
        };

        tracing::warn!(
            event_id = %entry.event_id,
            device_id = %entry.device_id,
            state = %entry.state,
            attempts = entry.attempt_count,
            reason = %entry.reason,
            "Task dead-lettered"
        );

        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of all retained entries, oldest first.
    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::{Device, NotificationEvent, Platform};

    fn make_task(device_id: &str) -> DeliveryTask {
        let event = NotificationEvent {
            id: Uuid::new_v4(),
            user_id: "manuel".to_string(),
            event_type: EventType::PlayProgress,
            payload: serde_json::json!({"show_id": "lassie", "position_seconds": 5}),
            occurred_at: Utc::now(),
            priority: Priority::Normal,
        };
        let device = Device {
            device_id: device_id.to_string(),
            user_id: "manuel".to_string(),
            platform: Platform::Ios,
            push_token: "tok".to_string(),
            last_seen_at: Utc::now(),
            capability_version: 0,
        };
        DeliveryTask::new(&event, &device)
    }

    #[test]
    fn test_record_and_list() {
        let store = DeadLetterStore::new(10);
        store.record(&make_task("d1"), "transport throttled");
        store.record(&make_task("d2"), "invalid token");

        let entries = store.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].device_id, "d1");
        assert_eq!(entries[1].reason, "invalid token");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = DeadLetterStore::new(2);
        store.record(&make_task("d1"), "r1");
        store.record(&make_task("d2"), "r2");
        store.record(&make_task("d3"), "r3");

        let entries = store.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].device_id, "d2");
        assert_eq!(entries[1].device_id, "d3");
    }
}
