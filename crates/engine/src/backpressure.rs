//! Backpressure controller — per-priority admission over token buckets.
//!
//! Two buckets: a shared bucket sized to the sustained normal/important
//! rate, and a reserve carved out for critical traffic. Critical events are
//! never shed: they draw from the reserve first and borrow from the shared
//! bucket when the reserve is dry, and are admitted regardless when both
//! are empty. Important events are deferred rather than dropped. Normal
//! events are shed when the shared bucket is dry; the coalescer keeps the
//! latest value, so a shed emission only delays a superseded progress
//! update.
//!
//! Replenish arithmetic is pure and takes time explicitly, so behavior is
//! deterministic under test.

use std::sync::Mutex;
use std::time::Instant;

use herald_common::types::Priority;

/// Admission decision for one emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Keep the work queued and try again later. Never returned for normal
    /// traffic, which is shed instead.
    Deferred,
    /// Drop this emission; the latest value stays coalesced for the next
    /// window.
    Shed,
}

/// Tokens available after replenishing at `rate` tokens/sec for `elapsed`
/// seconds, capped at `capacity`.
fn replenished(tokens: f64, elapsed_secs: f64, rate: f64, capacity: f64) -> f64 {
    (tokens + elapsed_secs * rate).min(capacity)
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(capacity: f64, rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_update: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = replenished(self.tokens, elapsed, self.rate, self.capacity);
        self.last_update = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-priority admission controller.
pub struct BackpressureController {
    shared: Mutex<Bucket>,
    reserve: Mutex<Bucket>,
}

impl BackpressureController {
    /// `rate` is the sustained admission rate in events/sec;
    /// `critical_fraction` of it is reserved for critical traffic.
    pub fn new(rate: u64, critical_fraction: f64) -> Self {
        Self::new_at(rate, critical_fraction, Instant::now())
    }

    pub fn new_at(rate: u64, critical_fraction: f64, now: Instant) -> Self {
        let fraction = critical_fraction.clamp(0.0, 1.0);
        let reserve_rate = rate as f64 * fraction;
        let shared_rate = (rate as f64 - reserve_rate).max(1.0);
        Self {
            shared: Mutex::new(Bucket::new(shared_rate, shared_rate, now)),
            reserve: Mutex::new(Bucket::new(reserve_rate.max(1.0), reserve_rate.max(1.0), now)),
        }
    }

    pub fn admit(&self, priority: Priority) -> Admission {
        self.admit_at(priority, Instant::now())
    }

    pub fn admit_at(&self, priority: Priority, now: Instant) -> Admission {
        match priority {
            Priority::Critical => {
                let reserved = self
                    .reserve
                    .lock()
                    .map(|mut b| b.try_take(now))
                    .unwrap_or(false);
                if !reserved {
                    // Borrow from the shared bucket when possible; admit
                    // regardless — critical traffic is never shed.
                    let _ = self.shared.lock().map(|mut b| b.try_take(now));
                }
                Admission::Admitted
            }
            Priority::Important => {
                let admitted = self
                    .shared
                    .lock()
                    .map(|mut b| b.try_take(now))
                    .unwrap_or(true);
                if admitted {
                    Admission::Admitted
                } else {
                    Admission::Deferred
                }
            }
            Priority::Normal => {
                let admitted = self
                    .shared
                    .lock()
                    .map(|mut b| b.try_take(now))
                    .unwrap_or(true);
                if admitted {
                    Admission::Admitted
                } else {
                    Admission::Shed
                }
            }
        }
    }
}
