//! Membership version source.
//!
//! Authoritative per-user membership version, bumped by the billing
//! collaborator on every plan change or cancellation. Versions only move
//! forward; the consistency gate and the playback-authorization path both
//! read this store, so notification latency is never the sole enforcement
//! mechanism for access control.

use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory monotone version counter per user.
pub struct MembershipStore {
    versions: RwLock<HashMap<String, u64>>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(HashMap::new()),
        }
    }

    /// Latest committed membership version for a user. Users never seen by
    /// the billing feed are at version 0.
    pub fn get_version(&self, user_id: &str) -> u64 {
        self.versions
            .read()
            .map(|map| map.get(user_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Record a version change from the billing feed.
    ///
    /// Returns true when the version advanced. A bump below the current
    /// version is a late-arriving duplicate and is ignored.
    pub fn bump(&self, user_id: &str, version: u64) -> bool {
        let Ok(mut map) = self.versions.write() else {
            return false;
        };
        let current = map.entry(user_id.to_string()).or_insert(0);
        if version > *current {
            tracing::info!(user_id = %user_id, from = *current, to = version, "Membership version bumped");
            *current = version;
            true
        } else {
            tracing::debug!(
                user_id = %user_id,
                current = *current,
                stale = version,
                "Ignoring non-advancing membership version"
            );
            false
        }
    }
}

impl Default for MembershipStore {
    fn default() -> Self {
        Self::new()
    }
}
