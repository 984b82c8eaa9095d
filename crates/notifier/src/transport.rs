//! Push transport seam.
//!
//! External push services (APNs/FCM/web-push equivalents) sit behind the
//! [`PushTransport`] trait. The pipeline only sees the three-way outcome:
//! acked, transient failure (retry with backoff) or permanent failure
//! (device token dead, unregister).

use async_trait::async_trait;
use serde_json::json;

use herald_common::types::DeliveryTask;

/// Result of one send attempt against an external push service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport accepted the push for the device.
    Ack,
    /// Throttling, network blip — worth retrying with backoff.
    Transient(String),
    /// Invalid or expired push token — the device is gone, never retry.
    Permanent(String),
}

/// Trait all push transports implement.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, task: &DeliveryTask) -> SendOutcome;

    /// Human-readable name for this transport (e.g., "webhook").
    fn name(&self) -> &'static str;
}

/// HTTP webhook transport: posts each delivery to a configured endpoint.
///
/// Status mapping: 2xx → ack; 404/410 → permanent (endpoint says the token
/// is gone); everything else, including connection errors, → transient.
pub struct WebhookTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl PushTransport for WebhookTransport {
    async fn send(&self, task: &DeliveryTask) -> SendOutcome {
        let body = json!({
            "device_id": task.device_id,
            "platform": task.platform,
            "push_token": task.push_token,
            "event_type": task.event_type,
            "priority": task.priority,
            "idempotency_key": task.idempotency_key,
            "payload": task.payload,
        });

        match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    SendOutcome::Ack
                } else if status == reqwest::StatusCode::NOT_FOUND
                    || status == reqwest::StatusCode::GONE
                {
                    SendOutcome::Permanent(format!("push endpoint returned {}", status))
                } else {
                    SendOutcome::Transient(format!("push endpoint returned {}", status))
                }
            }
            Err(e) => SendOutcome::Transient(format!("request failed: {}", e)),
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Transport for local runs without a configured endpoint: logs and acks.
pub struct LoggingTransport;

#[async_trait]
impl PushTransport for LoggingTransport {
    async fn send(&self, task: &DeliveryTask) -> SendOutcome {
        tracing::info!(
            device_id = %task.device_id,
            platform = %task.platform,
            event_type = %task.event_type,
            idempotency_key = %task.idempotency_key,
            "Delivery (logging transport)"
        );
        SendOutcome::Ack
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Scripted transport for tests: per-device outcome queues, defaulting to
/// ack, with a record of every send in arrival order.
pub struct MockTransport {
    outcomes: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<SendOutcome>>>,
    sent: std::sync::Mutex<Vec<DeliveryTask>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            outcomes: std::sync::Mutex::new(std::collections::HashMap::new()),
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue an outcome for the next send to `device_id`.
    pub fn script(&self, device_id: &str, outcome: SendOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.entry(device_id.to_string()).or_default().push_back(outcome);
        }
    }

    /// Every task handed to the transport, in send order.
    pub fn sent(&self) -> Vec<DeliveryTask> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn send(&self, task: &DeliveryTask) -> SendOutcome {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(task.clone());
        }
        self.outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.get_mut(&task.device_id).and_then(|q| q.pop_front()))
            .unwrap_or(SendOutcome::Ack)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
