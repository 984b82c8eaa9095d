use std::hash::{DefaultHasher, Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain event classes delivered to user devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PlayProgress,
    MembershipChanged,
    RecommendationsReady,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::PlayProgress => write!(f, "play_progress"),
            EventType::MembershipChanged => write!(f, "membership_changed"),
            EventType::RecommendationsReady => write!(f, "recommendations_ready"),
        }
    }
}

/// Delivery priority classes. Declared in ascending order so that
/// `Critical > Important > Normal` holds under the derived ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Important,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::Important => write!(f, "important"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Device platforms served by the push transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Tv,
    Web,
}

impl Platform {
    /// All platforms, for building per-platform concurrency limits.
    pub const ALL: [Platform; 4] = [Platform::Ios, Platform::Android, Platform::Tv, Platform::Web];
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
            Platform::Tv => write!(f, "tv"),
            Platform::Web => write!(f, "web"),
        }
    }
}

/// Delivery task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Sent,
    Acked,
    Failed,
    Expired,
}

impl TaskState {
    /// Whether moving to `next` is a legal lifecycle transition.
    ///
    /// `Pending → {Sent → Acked | Failed} | Expired`; `Sent → Pending` is the
    /// retry requeue, `Sent → Expired` the invalid-token path discovered at
    /// send time. `Acked` and `Expired` are terminal.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Expired)
                | (Sent, Acked)
                | (Sent, Failed)
                | (Sent, Pending)
                | (Sent, Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Acked | TaskState::Failed | TaskState::Expired)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Sent => write!(f, "sent"),
            TaskState::Acked => write!(f, "acked"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Expired => write!(f, "expired"),
        }
    }
}

/// An event as it arrives at the ingress boundary, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Uuid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// A validated, classified domain event. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub priority: Priority,
}

impl NotificationEvent {
    /// The membership version a MembershipChanged event was emitted for.
    pub fn membership_version(&self) -> Option<u64> {
        self.payload.get("membership_version").and_then(|v| v.as_u64())
    }
}

/// A registered user device, owned by the device registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub push_token: String,
    pub last_seen_at: DateTime<Utc>,
    pub capability_version: u64,
}

/// Parameters for registering (or re-registering) a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDevice {
    pub device_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub push_token: String,
}

/// What a play-progress payload carries.
///
/// Players post one of these when playback starts, pauses, stops or seeks,
/// and once a minute while playing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayProgressPayload {
    pub show_id: String,
    pub position_seconds: u64,
    /// The device that reported the progress, when known.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub kind: PlayKind,
}

/// Why a play-progress event was posted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayKind {
    Started,
    Paused,
    Stopped,
    Seeked,
    #[default]
    Heartbeat,
}

/// One unit of delivery work: one event bound for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub event_id: Uuid,
    pub device_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub push_token: String,
    pub event_type: EventType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    /// For MembershipChanged: the version this task was built against.
    pub membership_version: Option<u64>,
    pub state: TaskState,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn new(event: &NotificationEvent, device: &Device) -> Self {
        Self {
            event_id: event.id,
            device_id: device.device_id.clone(),
            user_id: device.user_id.clone(),
            platform: device.platform,
            push_token: device.push_token.clone(),
            event_type: event.event_type,
            priority: event.priority,
            payload: event.payload.clone(),
            membership_version: event.membership_version(),
            state: TaskState::Pending,
            attempt_count: 0,
            next_retry_at: None,
            idempotency_key: idempotency_key(event.id, &device.device_id),
            created_at: Utc::now(),
        }
    }

    /// Apply a lifecycle transition, enforcing monotonicity.
    ///
    /// Returns false (and leaves the task untouched) for illegal moves, so a
    /// racing ack can never resurrect a task that already expired.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                event_id = %self.event_id,
                device_id = %self.device_id,
                from = %self.state,
                to = %next,
                "Ignoring illegal task state transition"
            );
            false
        }
    }
}

/// Stable key identifying one (event, device) delivery, so retried sends are
/// side-effect-free on the receiving device.
pub fn idempotency_key(event_id: Uuid, device_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    event_id.hash(&mut hasher);
    device_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
