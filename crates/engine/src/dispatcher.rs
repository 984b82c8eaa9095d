//! Fan-out dispatcher — expands one event into per-device delivery tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use herald_common::error::AppError;
use herald_common::types::{DeliveryTask, EventType, NotificationEvent};
use herald_notifier::GateDecision;
use herald_registry::DeviceRegistry;

use crate::gate::ConsistencyGate;

pub struct FanoutDispatcher {
    registry: Arc<DeviceRegistry>,
    gate: Arc<ConsistencyGate>,
    undeliverable: AtomicU64,
}

impl FanoutDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, gate: Arc<ConsistencyGate>) -> Self {
        Self {
            registry,
            gate,
            undeliverable: AtomicU64::new(0),
        }
    }

    /// Resolve the user's device set and build one task per device.
    ///
    /// A user with no registered devices is not an error: the event is
    /// recorded as undeliverable and the empty task list returned. Registry
    /// unavailability fails fast so the caller can apply its per-priority
    /// policy (buffer critical, shed normal).
    pub fn dispatch(&self, event: &NotificationEvent) -> Result<Vec<DeliveryTask>, AppError> {
        let devices = self.registry.devices_of(&event.user_id)?;

        if devices.is_empty() {
            self.undeliverable.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                event_id = %event.id,
                user_id = %event.user_id,
                event_type = %event.event_type,
                "Event undeliverable: user has no registered devices"
            );
            return Ok(Vec::new());
        }

        // Capability updates are built against the freshest committed
        // version; a stale event is replaced, not propagated.
        let event = match (event.event_type, event.membership_version()) {
            (EventType::MembershipChanged, Some(version)) => {
                match self.gate.check(&event.user_id, version) {
                    GateDecision::Stale { current } => {
                        tracing::info!(
                            event_id = %event.id,
                            user_id = %event.user_id,
                            built_against = version,
                            current,
                            "Membership event superseded before dispatch, rebuilding"
                        );
                        let mut fresh = event.clone();
                        if let Some(payload) = fresh.payload.as_object_mut() {
                            payload.insert(
                                "membership_version".to_string(),
                                serde_json::json!(current),
                            );
                        }
                        fresh
                    }
                    GateDecision::Fresh => event.clone(),
                }
            }
            _ => event.clone(),
        };

        let tasks = devices
            .iter()
            .map(|device| DeliveryTask::new(&event, device))
            .collect::<Vec<_>>();

        tracing::debug!(
            event_id = %event.id,
            user_id = %event.user_id,
            devices = tasks.len(),
            priority = %event.priority,
            "Event fanned out"
        );

        Ok(tasks)
    }

    /// Events that resolved to an empty device set.
    pub fn undeliverable_count(&self) -> u64 {
        self.undeliverable.load(Ordering::Relaxed)
    }
}
