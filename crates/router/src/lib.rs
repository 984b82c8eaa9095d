//! Priority router — the ingress boundary of the pipeline.
//!
//! Validates raw events synchronously (malformed events are rejected here and
//! never enter the pipeline) and attaches the delivery priority from a static
//! classification table keyed on the closed event-type enum.

use herald_common::error::AppError;
use herald_common::types::{EventType, NotificationEvent, Priority, RawEvent};

/// Stateless validator/classifier applied to every ingress event.
pub struct EventRouter;

impl EventRouter {
    pub fn new() -> Self {
        Self
    }

    /// Static classification table.
    ///
    /// Critical events bypass coalescing and shedding entirely; important
    /// events may be batched but never dropped; normal events are coalesced
    /// and, under overload, shed.
    pub fn classify(event_type: EventType) -> Priority {
        match event_type {
            EventType::MembershipChanged => Priority::Critical,
            EventType::RecommendationsReady => Priority::Important,
            EventType::PlayProgress => Priority::Normal,
        }
    }

    /// Validate a raw ingress event and turn it into an immutable, classified
    /// [`NotificationEvent`].
    ///
    /// Returns a validation error for events with an empty user id or a
    /// payload missing the fields its type requires. No retry, no queuing.
    pub fn route(&self, raw: RawEvent) -> Result<NotificationEvent, AppError> {
        if raw.user_id.trim().is_empty() {
            return Err(AppError::Validation("user_id must not be empty".to_string()));
        }

        Self::validate_payload(raw.event_type, &raw.payload)?;

        let priority = Self::classify(raw.event_type);

        tracing::debug!(
            event_id = %raw.id,
            user_id = %raw.user_id,
            event_type = %raw.event_type,
            priority = %priority,
            "Event accepted at ingress"
        );

        Ok(NotificationEvent {
            id: raw.id,
            user_id: raw.user_id,
            event_type: raw.event_type,
            payload: raw.payload,
            occurred_at: raw.occurred_at,
            priority,
        })
    }

    /// Per-type payload requirements, checked at the boundary.
    fn validate_payload(event_type: EventType, payload: &serde_json::Value) -> Result<(), AppError> {
        match event_type {
            EventType::PlayProgress => {
                let show_id = payload.get("show_id").and_then(|v| v.as_str());
                if show_id.is_none_or(|s| s.is_empty()) {
                    return Err(AppError::Validation(
                        "play_progress payload requires a non-empty show_id".to_string(),
                    ));
                }
                if payload.get("position_seconds").and_then(|v| v.as_u64()).is_none() {
                    return Err(AppError::Validation(
                        "play_progress payload requires numeric position_seconds".to_string(),
                    ));
                }
            }
            EventType::MembershipChanged => {
                if payload.get("membership_version").and_then(|v| v.as_u64()).is_none() {
                    return Err(AppError::Validation(
                        "membership_changed payload requires integer membership_version"
                            .to_string(),
                    ));
                }
            }
            // The daily batch feed carries no required payload fields.
            EventType::RecommendationsReady => {}
        }
        Ok(())
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
