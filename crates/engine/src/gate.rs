//! Consistency gate — keeps capability updates in version order.
//!
//! Re-reads the authoritative membership version before a MembershipChanged
//! task is built and again immediately before it is sent. A task built
//! against a version that has since been superseded is discarded and
//! replaced, never delivered: no device ever applies capabilities older
//! than the latest committed version.
//!
//! Playback authorization re-checks the same store at stream-start on its
//! own; notification latency is never the sole enforcement mechanism for
//! access control.

use std::sync::Arc;

use herald_common::types::{DeliveryTask, EventType};
use herald_notifier::{GateDecision, SendGate};
use herald_registry::MembershipStore;

pub struct ConsistencyGate {
    membership: Arc<MembershipStore>,
}

impl ConsistencyGate {
    pub fn new(membership: Arc<MembershipStore>) -> Self {
        Self { membership }
    }

    /// Compare a version a task (or event) was built against with the
    /// latest committed one.
    pub fn check(&self, user_id: &str, built_against: u64) -> GateDecision {
        let current = self.membership.get_version(user_id);
        if current > built_against {
            GateDecision::Stale { current }
        } else {
            GateDecision::Fresh
        }
    }
}

impl SendGate for ConsistencyGate {
    fn check_send(&self, task: &DeliveryTask) -> GateDecision {
        match (task.event_type, task.membership_version) {
            (EventType::MembershipChanged, Some(version)) => self.check(&task.user_id, version),
            // Only capability updates are version-gated.
            _ => GateDecision::Fresh,
        }
    }
}
