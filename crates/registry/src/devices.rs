//! Device registry — authoritative user → devices mapping.
//!
//! Sharded by `user_id` hash so lock contention is bounded; every mutation
//! for a given user goes through that user's shard lock, which linearizes
//! registry state per user. Reads through the same lock see every prior
//! write (read-after-write within the registry's own timeline), so a
//! fan-out that runs after an unregister never resolves the removed device.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use chrono::Utc;

use herald_common::error::AppError;
use herald_common::types::{Device, RegisterDevice};

/// Default shard count when none is configured.
const DEFAULT_SHARDS: usize = 16;

type UserDevices = HashMap<String, HashMap<String, Device>>;

/// Invoked synchronously while an unregister is in progress, before the
/// unregister call returns. The delivery side hooks in here to cancel all
/// pending tasks for the device.
pub trait UnregisterHook: Send + Sync {
    fn on_unregister(&self, user_id: &str, device_id: &str);
}

/// Sharded in-memory device registry.
pub struct DeviceRegistry {
    shards: Vec<Mutex<UserDevices>>,
    hooks: RwLock<Vec<Arc<dyn UnregisterHook>>>,
}

impl DeviceRegistry {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook fired synchronously on every unregister.
    pub fn add_unregister_hook(&self, hook: Arc<dyn UnregisterHook>) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.push(hook);
        }
    }

    fn shard_for(&self, user_id: &str) -> &Mutex<UserDevices> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn lock_shard(&self, user_id: &str) -> Result<std::sync::MutexGuard<'_, UserDevices>, AppError> {
        self.shard_for(user_id)
            .lock()
            .map_err(|_| AppError::RegistryUnavailable("device shard lock poisoned".to_string()))
    }

    /// Register a device, or refresh it if the `device_id` is already known.
    ///
    /// Idempotent: repeated registration updates token, platform and
    /// `last_seen_at` while preserving the capability version.
    pub fn register(&self, params: RegisterDevice) -> Result<Device, AppError> {
        let mut shard = self.lock_shard(&params.user_id)?;
        let devices = shard.entry(params.user_id.clone()).or_default();

        let device = devices
            .entry(params.device_id.clone())
            .and_modify(|d| {
                d.push_token = params.push_token.clone();
                d.platform = params.platform;
                d.last_seen_at = Utc::now();
            })
            .or_insert_with(|| Device {
                device_id: params.device_id.clone(),
                user_id: params.user_id.clone(),
                platform: params.platform,
                push_token: params.push_token.clone(),
                last_seen_at: Utc::now(),
                capability_version: 0,
            })
            .clone();

        tracing::info!(
            user_id = %device.user_id,
            device_id = %device.device_id,
            platform = %device.platform,
            "Device registered"
        );

        Ok(device)
    }

    /// Refresh a device's liveness timestamp.
    pub fn heartbeat(&self, user_id: &str, device_id: &str) -> Result<(), AppError> {
        let mut shard = self.lock_shard(user_id)?;
        let device = shard
            .get_mut(user_id)
            .and_then(|devices| devices.get_mut(device_id))
            .ok_or_else(|| AppError::NotFound(format!("Device {} not found", device_id)))?;
        device.last_seen_at = Utc::now();
        Ok(())
    }

    /// Remove a device. In-flight work for the device is invalidated through
    /// the unregister hooks before this returns; a fan-out running after the
    /// return cannot resolve the device.
    ///
    /// Idempotent: unregistering an unknown device returns `Ok(false)`.
    pub fn unregister(&self, user_id: &str, device_id: &str) -> Result<bool, AppError> {
        let removed = {
            let mut shard = self.lock_shard(user_id)?;
            match shard.get_mut(user_id) {
                Some(devices) => {
                    let removed = devices.remove(device_id).is_some();
                    if devices.is_empty() {
                        shard.remove(user_id);
                    }
                    removed
                }
                None => false,
            }
        };

        if removed {
            // Hooks run outside the shard lock but before unregister returns,
            // so pending-task cancellation completes synchronously with the call.
            if let Ok(hooks) = self.hooks.read() {
                for hook in hooks.iter() {
                    hook.on_unregister(user_id, device_id);
                }
            }
            tracing::info!(user_id = %user_id, device_id = %device_id, "Device unregistered");
        }

        Ok(removed)
    }

    /// All devices currently registered for a user.
    pub fn devices_of(&self, user_id: &str) -> Result<Vec<Device>, AppError> {
        let shard = self.lock_shard(user_id)?;
        Ok(shard
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Raise the capability version of every device a user owns. Versions
    /// never move backwards.
    pub fn bump_capability(&self, user_id: &str, version: u64) -> Result<(), AppError> {
        let mut shard = self.lock_shard(user_id)?;
        if let Some(devices) = shard.get_mut(user_id) {
            for device in devices.values_mut() {
                if version > device.capability_version {
                    device.capability_version = version;
                }
            }
        }
        Ok(())
    }

    /// Record that one device received the capability update for `version`.
    ///
    /// Used by the delivery path on successful MembershipChanged sends, so a
    /// device's version reflects exactly the deliveries it acked. Monotone.
    pub fn confirm_capability(
        &self,
        user_id: &str,
        device_id: &str,
        version: u64,
    ) -> Result<(), AppError> {
        let mut shard = self.lock_shard(user_id)?;
        if let Some(device) = shard.get_mut(user_id).and_then(|d| d.get_mut(device_id)) {
            if version > device.capability_version {
                device.capability_version = version;
                tracing::debug!(
                    user_id = %user_id,
                    device_id = %device_id,
                    version,
                    "Capability version confirmed"
                );
            }
        }
        Ok(())
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use herald_common::types::Platform;

    fn make_params(user_id: &str, device_id: &str) -> RegisterDevice {
        RegisterDevice {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            platform: Platform::Ios,
            push_token: format!("tok-{}", device_id),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = DeviceRegistry::default();
        registry.register(make_params("manuel", "phone")).unwrap();
        registry.register(make_params("manuel", "tv")).unwrap();

        let devices = registry.devices_of("manuel").unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn test_register_is_idempotent_and_updates_token() {
        let registry = DeviceRegistry::default();
        registry.register(make_params("manuel", "phone")).unwrap();

        let mut again = make_params("manuel", "phone");
        again.push_token = "tok-rotated".to_string();
        again.platform = Platform::Tv;
        let device = registry.register(again).unwrap();

        assert_eq!(device.push_token, "tok-rotated");
        assert_eq!(device.platform, Platform::Tv);
        assert_eq!(registry.devices_of("manuel").unwrap().len(), 1);
    }

    #[test]
    fn test_unregister_reflected_in_devices_of() {
        let registry = DeviceRegistry::default();
        registry.register(make_params("manuel", "phone")).unwrap();
        registry.register(make_params("manuel", "tv")).unwrap();

        assert!(registry.unregister("manuel", "phone").unwrap());

        let devices = registry.devices_of("manuel").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "tv");
    }

    #[test]
    fn test_unregister_unknown_device_is_ok() {
        let registry = DeviceRegistry::default();
        assert!(!registry.unregister("manuel", "ghost").unwrap());
    }

    #[test]
    fn test_heartbeat_unknown_device_not_found() {
        let registry = DeviceRegistry::default();
        assert!(matches!(
            registry.heartbeat("manuel", "ghost"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_unregister_hook_fires_before_return() {
        struct CountingHook(AtomicUsize);
        impl UnregisterHook for CountingHook {
            fn on_unregister(&self, _user_id: &str, _device_id: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = DeviceRegistry::default();
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        registry.add_unregister_hook(hook.clone());

        registry.register(make_params("manuel", "phone")).unwrap();
        registry.unregister("manuel", "phone").unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // Unknown device: nothing removed, hook not fired.
        registry.unregister("manuel", "phone").unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bump_capability_is_monotone() {
        let registry = DeviceRegistry::default();
        registry.register(make_params("manuel", "phone")).unwrap();

        registry.bump_capability("manuel", 5).unwrap();
        registry.bump_capability("manuel", 3).unwrap();

        let devices = registry.devices_of("manuel").unwrap();
        assert_eq!(devices[0].capability_version, 5);
    }

    #[test]
    fn test_confirm_capability_targets_one_device() {
        let registry = DeviceRegistry::default();
        registry.register(make_params("manuel", "phone")).unwrap();
        registry.register(make_params("manuel", "tv")).unwrap();

        registry.confirm_capability("manuel", "phone", 4).unwrap();

        let devices = registry.devices_of("manuel").unwrap();
        let phone = devices.iter().find(|d| d.device_id == "phone").unwrap();
        let tv = devices.iter().find(|d| d.device_id == "tv").unwrap();
        assert_eq!(phone.capability_version, 4);
        assert_eq!(tv.capability_version, 0);
    }
}
