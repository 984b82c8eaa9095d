//! Pipeline — wires ingress, router, coalescer, gate, dispatcher and the
//! delivery pool together and owns the background loops.
//!
//! Data flow: ingress → router → (coalescer for normal-frequency traffic,
//! rate-limited drain for recommendation fan-out, immediate dispatch for
//! critical) → fan-out dispatcher → delivery queues. Ingress is
//! multi-producer over an unbounded channel; events are immutable once
//! constructed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::{EventType, NotificationEvent, Priority, RawEvent};
use herald_notifier::DeliveryService;
use herald_registry::DeviceRegistry;
use herald_router::EventRouter;

use crate::backpressure::{Admission, BackpressureController};
use crate::coalescer::Coalescer;
use crate::dispatcher::FanoutDispatcher;
use crate::gate::ConsistencyGate;

struct PipeCtx {
    coalescer: Coalescer,
    backpressure: BackpressureController,
    dispatcher: FanoutDispatcher,
    delivery: Arc<DeliveryService>,
    rec_tx: mpsc::UnboundedSender<NotificationEvent>,
    /// Critical events whose fan-out failed (registry unavailable), retried
    /// every tick instead of being dropped.
    critical_retry: Mutex<VecDeque<NotificationEvent>>,
    shed: AtomicU64,
}

struct Receivers {
    ingress: mpsc::UnboundedReceiver<NotificationEvent>,
    recommendations: mpsc::UnboundedReceiver<NotificationEvent>,
}

/// The assembled fan-out core.
pub struct Pipeline {
    router: EventRouter,
    ctx: Arc<PipeCtx>,
    ingress_tx: mpsc::UnboundedSender<NotificationEvent>,
    receivers: Mutex<Option<Receivers>>,
    shutdown_tx: watch::Sender<bool>,
    drain_per_second: u64,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        registry: Arc<DeviceRegistry>,
        gate: Arc<ConsistencyGate>,
        delivery: Arc<DeliveryService>,
    ) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (rec_tx, rec_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let ctx = Arc::new(PipeCtx {
            coalescer: Coalescer::new(config.coalescing_window_seconds),
            backpressure: BackpressureController::new(
                config.normal_events_per_second,
                config.critical_reserved_capacity_fraction,
            ),
            dispatcher: FanoutDispatcher::new(registry, gate),
            delivery,
            rec_tx,
            critical_retry: Mutex::new(VecDeque::new()),
            shed: AtomicU64::new(0),
        });

        Self {
            router: EventRouter::new(),
            ctx,
            ingress_tx,
            receivers: Mutex::new(Some(Receivers {
                ingress: ingress_rx,
                recommendations: rec_rx,
            })),
            shutdown_tx,
            drain_per_second: config.recommendation_drain_per_second.max(1),
        }
    }

    /// Validate a raw ingress event and feed it into the pipeline.
    /// Malformed events are rejected here and never queued.
    pub fn submit_raw(&self, raw: RawEvent) -> Result<NotificationEvent, AppError> {
        let event = self.router.route(raw)?;
        self.submit(event.clone())?;
        Ok(event)
    }

    /// Feed an already-classified event into the pipeline.
    pub fn submit(&self, event: NotificationEvent) -> Result<(), AppError> {
        self.ingress_tx
            .send(event)
            .map_err(|_| AppError::Internal("pipeline is shut down".to_string()))
    }

    /// Spawn the ingest, window-tick and recommendation-drain loops.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let Some(receivers) = self.receivers.lock().ok().and_then(|mut r| r.take()) else {
            tracing::warn!("Pipeline::start called twice, ignoring");
            return Vec::new();
        };

        let mut handles = Vec::new();

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(ingest_loop(ctx, receivers.ingress, shutdown)));

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(tick_loop(ctx, shutdown)));

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let rate = self.drain_per_second;
        handles.push(tokio::spawn(drain_loop(
            ctx,
            receivers.recommendations,
            rate,
            shutdown,
        )));

        handles
    }

    /// Stop intake. In-flight work drains on its own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Events that resolved to no devices.
    pub fn undeliverable_count(&self) -> u64 {
        self.ctx.dispatcher.undeliverable_count()
    }

    /// Normal emissions dropped under overload.
    pub fn shed_count(&self) -> u64 {
        self.ctx.shed.load(Ordering::Relaxed)
    }

    /// Open coalescing windows.
    pub fn open_windows(&self) -> usize {
        self.ctx.coalescer.open_windows()
    }
}

async fn ingest_loop(
    ctx: Arc<PipeCtx>,
    mut rx: mpsc::UnboundedReceiver<NotificationEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Pipeline ingest shutting down");
                    break;
                }
            }
            maybe = rx.recv() => match maybe {
                Some(event) => handle_event(&ctx, event),
                None => break,
            }
        }
    }
}

fn handle_event(ctx: &Arc<PipeCtx>, event: NotificationEvent) {
    match event.priority {
        Priority::Critical => {
            // Bookkeeping draw on the reserve; critical is always admitted.
            ctx.backpressure.admit(Priority::Critical);
            dispatch_critical(ctx, event);
        }
        Priority::Important => {
            if event.event_type == EventType::RecommendationsReady {
                // Fanned out as a rate-limited stream, never a single burst.
                if ctx.rec_tx.send(event).is_err() {
                    tracing::warn!("Recommendation drain queue closed");
                }
            } else {
                dispatch_important(ctx, event);
            }
        }
        Priority::Normal => {
            if event.event_type == EventType::PlayProgress {
                ctx.coalescer.offer(event);
            } else {
                match ctx.backpressure.admit(Priority::Normal) {
                    Admission::Admitted => dispatch_normal(ctx, event),
                    _ => {
                        ctx.shed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

fn dispatch_critical(ctx: &Arc<PipeCtx>, event: NotificationEvent) {
    match ctx.dispatcher.dispatch(&event) {
        Ok(tasks) => ctx.delivery.enqueue_all(tasks),
        Err(e) => {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "Critical fan-out failed, buffering for retry"
            );
            if let Ok(mut retry) = ctx.critical_retry.lock() {
                retry.push_back(event);
            }
        }
    }
}

fn dispatch_important(ctx: &Arc<PipeCtx>, event: NotificationEvent) {
    match ctx.dispatcher.dispatch(&event) {
        Ok(tasks) => ctx.delivery.enqueue_all(tasks),
        Err(e) => {
            // Important events are never dropped; requeue through the drain.
            tracing::warn!(event_id = %event.id, error = %e, "Important fan-out failed, requeueing");
            let _ = ctx.rec_tx.send(event);
        }
    }
}

fn dispatch_normal(ctx: &Arc<PipeCtx>, event: NotificationEvent) {
    match ctx.dispatcher.dispatch(&event) {
        Ok(tasks) => ctx.delivery.enqueue_all(tasks),
        Err(e) => {
            // Shedding policy: a normal event lost to an unavailable
            // registry is a superseded progress update.
            ctx.shed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_id = %event.id, error = %e, "Normal fan-out dropped");
        }
    }
}

/// One-second heartbeat: retry buffered critical events, then advance the
/// coalescing wheel and dispatch (or shed) the emissions that came due.
async fn tick_loop(ctx: Arc<PipeCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let buffered: Vec<NotificationEvent> = ctx
                    .critical_retry
                    .lock()
                    .map(|mut retry| retry.drain(..).collect())
                    .unwrap_or_default();
                for event in buffered {
                    dispatch_critical(&ctx, event);
                }

                for event in ctx.coalescer.advance() {
                    match ctx.backpressure.admit(Priority::Normal) {
                        Admission::Admitted => dispatch_normal(&ctx, event),
                        _ => {
                            // Skip the emission, keep the latest value for
                            // the next window.
                            ctx.shed.fetch_add(1, Ordering::Relaxed);
                            ctx.coalescer.offer(event);
                        }
                    }
                }
            }
        }
    }
}

/// Releases recommendation fan-out at a bounded steady rate.
async fn drain_loop(
    ctx: Arc<PipeCtx>,
    mut rx: mpsc::UnboundedReceiver<NotificationEvent>,
    per_second: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let budget = (per_second / 10).max(1);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                for _ in 0..budget {
                    match rx.try_recv() {
                        Ok(event) => dispatch_important(&ctx, event),
                        Err(_) => break,
                    }
                }
            }
        }
    }
}
