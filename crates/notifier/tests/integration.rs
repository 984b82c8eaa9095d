//! Integration tests for the delivery worker pool.
//!
//! Exercises the running service — queues, dispatcher, retry scheduler —
//! against a scripted mock transport with the tokio clock paused.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use herald_common::types::{
    Device, DeliveryTask, EventType, NotificationEvent, Platform, Priority, RegisterDevice,
    TaskState,
};
use herald_notifier::{
    DeadLetterStore, DeliveryConfig, DeliveryService, MockTransport, OpenGate, SendOutcome,
};
use herald_registry::DeviceRegistry;

// ============================================================
// Helpers
// ============================================================

struct Stack {
    service: Arc<DeliveryService>,
    transport: Arc<MockTransport>,
    registry: Arc<DeviceRegistry>,
    dead_letters: Arc<DeadLetterStore>,
}

fn build_stack(config: DeliveryConfig) -> Stack {
    let transport = Arc::new(MockTransport::new());
    let registry = Arc::new(DeviceRegistry::default());
    let dead_letters = Arc::new(DeadLetterStore::new(1000));
    let service = Arc::new(DeliveryService::new(
        transport.clone(),
        registry.clone(),
        Arc::new(OpenGate),
        dead_letters.clone(),
        config,
    ));
    registry.add_unregister_hook(service.task_table());
    Stack {
        service,
        transport,
        registry,
        dead_letters,
    }
}

fn make_task(user_id: &str, device_id: &str, priority: Priority) -> DeliveryTask {
    let event = NotificationEvent {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        event_type: match priority {
            Priority::Critical => EventType::MembershipChanged,
            Priority::Important => EventType::RecommendationsReady,
            Priority::Normal => EventType::PlayProgress,
        },
        payload: serde_json::json!({"show_id": "lassie", "position_seconds": 5}),
        occurred_at: Utc::now(),
        priority,
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

async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ============================================================
// Queue behavior
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_critical_claimed_before_normal() {
    let stack = build_stack(DeliveryConfig::default());

    // Both queued before the dispatcher starts; the biased select must
    // claim the critical task first.
    stack.service.enqueue(make_task("manuel", "d-normal", Priority::Normal));
    stack
        .service
        .enqueue(make_task("manuel", "d-critical", Priority::Critical));

    stack.service.start();
    settle(Duration::from_secs(1)).await;

    let sent = stack.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].device_id, "d-critical");
    assert_eq!(sent[1].device_id, "d-normal");
}

#[tokio::test(start_paused = true)]
async fn test_all_priorities_drain() {
    let stack = build_stack(DeliveryConfig::default());
    stack.service.start();

    for i in 0..5 {
        stack
            .service
            .enqueue(make_task("manuel", &format!("c{}", i), Priority::Critical));
        stack
            .service
            .enqueue(make_task("manuel", &format!("i{}", i), Priority::Important));
        stack
            .service
            .enqueue(make_task("manuel", &format!("n{}", i), Priority::Normal));
    }
    settle(Duration::from_secs(1)).await;

    assert_eq!(stack.transport.sent_count(), 15);
    assert_eq!(stack.service.acked_count(), 15);
}

// ============================================================
// Retry end to end
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_transient_then_delivered_through_scheduler() {
    let stack = build_stack(DeliveryConfig::default());
    stack
        .transport
        .script("phone", SendOutcome::Transient("throttled".to_string()));
    stack.service.start();

    stack.service.enqueue(make_task("manuel", "phone", Priority::Normal));
    settle(Duration::from_millis(10)).await;
    assert_eq!(stack.transport.sent_count(), 1);
    assert_eq!(stack.service.retry_backlog(), 1);

    // The backoff for attempt 1 is at most the base delay.
    settle(Duration::from_secs(2)).await;
    assert_eq!(stack.transport.sent_count(), 2);
    assert_eq!(stack.service.acked_count(), 1);
    assert_eq!(stack.service.retry_backlog(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_dead_letter_once() {
    let mut config = DeliveryConfig::default();
    config.max_retry_attempts = 2;
    let stack = build_stack(config);
    for _ in 0..2 {
        stack
            .transport
            .script("phone", SendOutcome::Transient("throttled".to_string()));
    }
    stack.service.start();

    stack.service.enqueue(make_task("manuel", "phone", Priority::Normal));
    settle(Duration::from_secs(120)).await;

    assert_eq!(stack.transport.sent_count(), 2);
    let dead = stack.dead_letters.list();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].state, TaskState::Failed);
    assert_eq!(stack.service.retry_backlog(), 0);
}

// ============================================================
// Registry coupling
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_removes_device_from_registry() {
    let stack = build_stack(DeliveryConfig::default());
    stack
        .registry
        .register(RegisterDevice {
            device_id: "phone".to_string(),
            user_id: "manuel".to_string(),
            platform: Platform::Ios,
            push_token: "tok".to_string(),
        })
        .unwrap();
    stack
        .transport
        .script("phone", SendOutcome::Permanent("invalid token".to_string()));
    stack.service.start();

    stack.service.enqueue(make_task("manuel", "phone", Priority::Normal));
    settle(Duration::from_secs(1)).await;

    assert!(stack.registry.devices_of("manuel").unwrap().is_empty());
    assert_eq!(stack.dead_letters.list()[0].state, TaskState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_cancels_before_workers_run() {
    let stack = build_stack(DeliveryConfig::default());
    stack
        .registry
        .register(RegisterDevice {
            device_id: "phone".to_string(),
            user_id: "manuel".to_string(),
            platform: Platform::Ios,
            push_token: "tok".to_string(),
        })
        .unwrap();

    // Queue two tasks, then unregister before starting the workers.
    stack.service.enqueue(make_task("manuel", "phone", Priority::Normal));
    stack.service.enqueue(make_task("manuel", "phone", Priority::Critical));
    stack.registry.unregister("manuel", "phone").unwrap();

    stack.service.start();
    settle(Duration::from_secs(1)).await;

    assert_eq!(stack.transport.sent_count(), 0);
    let dead = stack.dead_letters.list();
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|d| d.reason == "device unregistered"));
}

// ============================================================
// Shutdown
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_intake() {
    let stack = build_stack(DeliveryConfig::default());
    stack.service.start();

    stack.service.enqueue(make_task("manuel", "before", Priority::Normal));
    settle(Duration::from_millis(10)).await;
    assert_eq!(stack.transport.sent_count(), 1);

    stack.service.shutdown();
    settle(Duration::from_millis(10)).await;

    stack.service.enqueue(make_task("manuel", "after", Priority::Normal));
    settle(Duration::from_secs(1)).await;
    assert_eq!(stack.transport.sent_count(), 1);
}
