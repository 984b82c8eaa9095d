//! Coalescer — collapses play-progress bursts into one emission per window.
//!
//! Keyed by `(user_id, show_id)`: an episode rollover mid-window updates the
//! payload under the same key instead of opening a second window. Slots live
//! in a sharded arena driven by a timer wheel of one-second buckets — one
//! tick task serves millions of active keys, no per-key timers.
//!
//! The window timer is armed when a key first appears and is NOT reset by
//! later arrivals: emission cadence stays periodic regardless of arrival
//! rate, bounding output to one notification per key per window even under
//! event storms.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use herald_common::types::{EventType, NotificationEvent};

const DEFAULT_SHARDS: usize = 8;

/// Coalescing key: one window per user per show.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
    pub user_id: String,
    pub show_id: String,
}

impl CoalesceKey {
    /// Extract the key from a play-progress event. Other event classes are
    /// not coalesced.
    pub fn from_event(event: &NotificationEvent) -> Option<Self> {
        if event.event_type != EventType::PlayProgress {
            return None;
        }
        let show_id = event.payload.get("show_id").and_then(|v| v.as_str())?;
        Some(Self {
            user_id: event.user_id.clone(),
            show_id: show_id.to_string(),
        })
    }
}

struct Shard {
    /// Wheel position of each armed key.
    armed: HashMap<CoalesceKey, usize>,
    /// wheel[i] holds the latest event for every key due when the cursor
    /// reaches i.
    wheel: Vec<HashMap<CoalesceKey, NotificationEvent>>,
    cursor: usize,
}

impl Shard {
    fn new(window: usize) -> Self {
        Self {
            armed: HashMap::new(),
            // window + 1 buckets so a key armed right after a tick still
            // waits a full window.
            wheel: (0..window + 1).map(|_| HashMap::new()).collect(),
            cursor: 0,
        }
    }
}

/// Sharded coalescing-window arena.
pub struct Coalescer {
    window: usize,
    shards: Vec<Mutex<Shard>>,
}

impl Coalescer {
    pub fn new(window_seconds: u64) -> Self {
        Self::with_shards(window_seconds, DEFAULT_SHARDS)
    }

    pub fn with_shards(window_seconds: u64, shard_count: usize) -> Self {
        let window = window_seconds.max(1) as usize;
        Self {
            window,
            shards: (0..shard_count.max(1))
                .map(|_| Mutex::new(Shard::new(window)))
                .collect(),
        }
    }

    fn shard_for(&self, key: &CoalesceKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Offer a play-progress event to its window.
    ///
    /// If the key has an open window the event replaces the stored payload
    /// without touching the timer; otherwise a fresh window is armed.
    /// Returns false for events that carry no coalescing key.
    pub fn offer(&self, event: NotificationEvent) -> bool {
        let Some(key) = CoalesceKey::from_event(&event) else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Event offered to coalescer without a coalescing key, dropping"
            );
            return false;
        };

        let Ok(mut shard) = self.shard_for(&key).lock() else {
            return false;
        };

        match shard.armed.get(&key).copied() {
            Some(slot) => {
                // Window open: newest value wins, timer untouched.
                shard.wheel[slot].insert(key, event);
            }
            None => {
                let slot = (shard.cursor + self.window) % shard.wheel.len();
                shard.armed.insert(key.clone(), slot);
                shard.wheel[slot].insert(key, event);
            }
        }
        true
    }

    /// Advance every shard's wheel by one second and collect the events
    /// whose windows just closed.
    pub fn advance(&self) -> Vec<NotificationEvent> {
        let mut due = Vec::new();
        for shard in &self.shards {
            let Ok(mut shard) = shard.lock() else {
                continue;
            };
            shard.cursor = (shard.cursor + 1) % shard.wheel.len();
            let cursor = shard.cursor;
            let fired = std::mem::take(&mut shard.wheel[cursor]);
            for (key, event) in fired {
                shard.armed.remove(&key);
                due.push(event);
            }
        }
        due
    }

    /// Number of open windows (for monitoring).
    pub fn open_windows(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().map(|s| s.armed.len()).unwrap_or(0))
            .sum()
    }
}
