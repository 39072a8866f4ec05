//! Authoritative configuration store for devices and tags.
//!
//! The store is the single source of truth the registry and the polling
//! orchestrator derive their state from. It is safe for concurrent use:
//! the device and tag maps are keyed `DashMap`s (per-key atomic insert,
//! remove, and replace), and the snapshot write is serialized by a
//! dedicated lock so concurrent mutators cannot corrupt the file.
//!
//! # Persistence policy
//!
//! Persistence is part of the transaction. A mutation commits in memory,
//! then persists the full snapshot; if the persist fails, the in-memory
//! change is rolled back, no [`ConfigChange`] is emitted, and the caller
//! gets [`GatewayError::Persistence`]. Change events are therefore only
//! observed for durable commits.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::device::{
    normalize_id, ConfigChange, ConfigChangeKind, DeviceConfig, TagConfig,
};
use crate::core::error::{GatewayError, Result};
use crate::store::snapshot::{self, GatewaySnapshot};

/// Broadcast capacity for configuration change events.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Receiver half of the configuration change stream.
pub type ConfigChangeReceiver = broadcast::Receiver<ConfigChange>;

/// Thread-safe, hot-reloadable device/tag configuration store.
pub struct ConfigStore {
    /// Devices keyed by lowercase id.
    devices: DashMap<String, DeviceConfig>,

    /// Tags keyed by lowercase `(device_id, name)`.
    tags: DashMap<(String, String), TagConfig>,

    /// Serializes the snapshot-to-disk step across mutators.
    persist_lock: Mutex<()>,

    /// Snapshot file location.
    path: PathBuf,

    change_tx: broadcast::Sender<ConfigChange>,
}

impl ConfigStore {
    /// Open the store at `path`.
    ///
    /// Loads the persisted snapshot if one exists; otherwise seeds from
    /// `seed` and immediately persists it.
    pub fn open(path: impl Into<PathBuf>, seed: GatewaySnapshot) -> Result<Self> {
        let path = path.into();
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let store = Self {
            devices: DashMap::new(),
            tags: DashMap::new(),
            persist_lock: Mutex::new(()),
            path,
            change_tx,
        };

        let (initial, from_disk) = match snapshot::load(&store.path)? {
            Some(persisted) => {
                info!(path = %store.path.display(), "loaded persisted gateway configuration");
                (persisted, true)
            }
            None => {
                info!(path = %store.path.display(), "no persisted configuration, using seed");
                (seed, false)
            }
        };

        for device in initial.devices {
            store.devices.insert(device.key(), device);
        }
        for tag in initial.tags {
            store.tags.insert(tag.key(), tag);
        }

        if !from_disk {
            store.persist()?;
        }

        Ok(store)
    }

    /// Subscribe to committed configuration changes.
    pub fn subscribe(&self) -> ConfigChangeReceiver {
        self.change_tx.subscribe()
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Queries (defensive copies, never internal references)
    // ------------------------------------------------------------------

    /// All configured devices.
    pub fn list_devices(&self) -> Vec<DeviceConfig> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    /// Look up one device by case-insensitive id.
    pub fn get_device(&self, device_id: &str) -> Option<DeviceConfig> {
        self.devices
            .get(&normalize_id(device_id))
            .map(|e| e.value().clone())
    }

    /// All tags, or the tags of one device.
    pub fn list_tags(&self, device_id: Option<&str>) -> Vec<TagConfig> {
        match device_id {
            None => self.tags.iter().map(|e| e.value().clone()).collect(),
            Some(id) => {
                let key = normalize_id(id);
                self.tags
                    .iter()
                    .filter(|e| e.key().0 == key)
                    .map(|e| e.value().clone())
                    .collect()
            }
        }
    }

    /// Look up one tag by case-insensitive `(device, name)`.
    pub fn get_tag(&self, device_id: &str, tag_name: &str) -> Option<TagConfig> {
        self.tags
            .get(&(normalize_id(device_id), normalize_id(tag_name)))
            .map(|e| e.value().clone())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert or replace a device by id.
    pub fn upsert_device(&self, config: DeviceConfig) -> Result<()> {
        config.validate()?;

        let key = config.key();
        let previous = self.devices.insert(key.clone(), config.clone());

        if let Err(e) = self.persist() {
            // Not durably applied: roll the in-memory change back.
            match previous {
                Some(prev) => {
                    self.devices.insert(key, prev);
                }
                None => {
                    self.devices.remove(&key);
                }
            }
            return Err(e);
        }

        let kind = if previous.is_some() {
            ConfigChangeKind::DeviceUpdated
        } else {
            ConfigChangeKind::DeviceAdded
        };
        info!(device = %config.id, ?kind, "device config upserted");
        self.emit(ConfigChange::device(kind, config.id));
        Ok(())
    }

    /// Remove a device and all of its tags.
    ///
    /// Returns `false` if the device did not exist (not an error).
    pub fn remove_device(&self, device_id: &str) -> Result<bool> {
        let key = normalize_id(device_id);
        let Some((_, removed_device)) = self.devices.remove(&key) else {
            return Ok(false);
        };

        let tag_keys: Vec<_> = self
            .tags
            .iter()
            .filter(|e| e.key().0 == key)
            .map(|e| e.key().clone())
            .collect();
        let mut removed_tags = Vec::with_capacity(tag_keys.len());
        for tag_key in &tag_keys {
            if let Some((_, tag)) = self.tags.remove(tag_key) {
                removed_tags.push(tag);
            }
        }

        if let Err(e) = self.persist() {
            self.devices.insert(key, removed_device);
            for tag in removed_tags {
                self.tags.insert(tag.key(), tag);
            }
            return Err(e);
        }

        // Tag removals are observed before the device removal.
        for tag in &removed_tags {
            self.emit(ConfigChange::tag(
                ConfigChangeKind::TagRemoved,
                tag.device_id.clone(),
                tag.name.clone(),
            ));
        }
        info!(device = %removed_device.id, tags = removed_tags.len(), "device config removed");
        self.emit(ConfigChange::device(
            ConfigChangeKind::DeviceRemoved,
            removed_device.id,
        ));
        Ok(true)
    }

    /// Insert or replace a tag.
    ///
    /// Fails with [`GatewayError::NotFound`] if the owning device is not
    /// configured.
    pub fn upsert_tag(&self, config: TagConfig) -> Result<()> {
        config.validate()?;

        if self.get_device(&config.device_id).is_none() {
            return Err(GatewayError::not_found(format!(
                "device '{}' not found",
                config.device_id
            )));
        }

        let key = config.key();
        let previous = self.tags.insert(key.clone(), config.clone());

        if let Err(e) = self.persist() {
            match previous {
                Some(prev) => {
                    self.tags.insert(key, prev);
                }
                None => {
                    self.tags.remove(&key);
                }
            }
            return Err(e);
        }

        let kind = if previous.is_some() {
            ConfigChangeKind::TagUpdated
        } else {
            ConfigChangeKind::TagAdded
        };
        debug!(device = %config.device_id, tag = %config.name, ?kind, "tag config upserted");
        self.emit(ConfigChange::tag(kind, config.device_id, config.name));
        Ok(())
    }

    /// Remove a tag. Returns `false` if it did not exist.
    pub fn remove_tag(&self, device_id: &str, tag_name: &str) -> Result<bool> {
        let key = (normalize_id(device_id), normalize_id(tag_name));
        let Some((_, removed)) = self.tags.remove(&key) else {
            return Ok(false);
        };

        if let Err(e) = self.persist() {
            self.tags.insert(key, removed);
            return Err(e);
        }

        debug!(device = %removed.device_id, tag = %removed.name, "tag config removed");
        self.emit(ConfigChange::tag(
            ConfigChangeKind::TagRemoved,
            removed.device_id,
            removed.name,
        ));
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn emit(&self, change: ConfigChange) {
        // No receivers is fine; delivery is best-effort.
        let _ = self.change_tx.send(change);
    }

    fn persist(&self) -> Result<()> {
        // The lock also scopes snapshot assembly, so two mutators cannot
        // write interleaved views of the maps.
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|_| GatewayError::Internal("persist lock poisoned".into()))?;

        let mut devices = self.list_devices();
        let mut tags = self.list_tags(None);
        devices.sort_by(|a, b| a.key().cmp(&b.key()));
        tags.sort_by(|a, b| a.key().cmp(&b.key()));

        snapshot::save_atomic(&self.path, &GatewaySnapshot::new(devices, tags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::ProtocolConfig;
    use std::sync::Arc;

    fn tcp_device(id: &str, host: &str) -> DeviceConfig {
        DeviceConfig::new(
            id,
            ProtocolConfig::ModbusTcp {
                host: host.into(),
                port: 502,
                station: 1,
            },
        )
    }

    fn open_store(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(
            dir.path().join("gateway-config.json"),
            GatewaySnapshot::default(),
        )
        .unwrap()
    }

    fn drain(rx: &mut ConfigChangeReceiver) -> Vec<ConfigChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[test]
    fn test_upsert_device_round_trip_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut rx = store.subscribe();

        let device = tcp_device("M1", "10.0.0.1");
        store.upsert_device(device.clone()).unwrap();
        assert_eq!(store.get_device("m1"), Some(device.clone()));
        assert_eq!(store.get_device("M1"), Some(device.clone()));

        store.upsert_device(device.clone()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .map(|e| e.kind)
                .collect::<Vec<_>>(),
            vec![ConfigChangeKind::DeviceAdded, ConfigChangeKind::DeviceUpdated]
        );
        assert_eq!(events[0].device_id, "M1");
    }

    #[test]
    fn test_upsert_device_validation_rejected_before_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut rx = store.subscribe();

        let err = store
            .upsert_device(tcp_device("m1", "10.0.0.1").with_poll_interval_ms(0))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(store.get_device("m1").is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_upsert_tag_without_device_is_not_found_and_silent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut rx = store.subscribe();

        let err = store.upsert_tag(TagConfig::new("ghost", "t", "40001")).unwrap_err();
        assert!(err.is_not_found());
        assert!(drain(&mut rx).is_empty());
        assert!(store.list_tags(None).is_empty());
    }

    #[test]
    fn test_remove_device_cascades_tags_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();
        store.upsert_tag(TagConfig::new("m1", "t1", "40001")).unwrap();
        store.upsert_tag(TagConfig::new("m1", "t2", "40002")).unwrap();

        let mut rx = store.subscribe();
        assert!(store.remove_device("M1").unwrap());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events[..2]
            .iter()
            .all(|e| e.kind == ConfigChangeKind::TagRemoved));
        assert_eq!(events[2].kind, ConfigChangeKind::DeviceRemoved);

        assert!(store.get_device("m1").is_none());
        assert!(store.list_tags(Some("m1")).is_empty());
    }

    #[test]
    fn test_remove_device_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();

        assert!(store.remove_device("m1").unwrap());
        let mut rx = store.subscribe();
        assert!(!store.remove_device("m1").unwrap());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_tags_scoped_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();
        store.upsert_device(tcp_device("m2", "10.0.0.2")).unwrap();
        store.upsert_tag(TagConfig::new("m1", "t1", "40001")).unwrap();
        store.upsert_tag(TagConfig::new("m2", "t1", "40001")).unwrap();

        assert_eq!(store.list_tags(Some("m1")).len(), 1);
        assert_eq!(store.list_tags(None).len(), 2);
        assert!(store.get_tag("M2", "T1").is_some());

        assert!(store.remove_tag("m1", "t1").unwrap());
        assert!(!store.remove_tag("m1", "t1").unwrap());
        assert_eq!(store.list_tags(None).len(), 1);
    }

    #[test]
    fn test_concurrent_upserts_leave_one_of_the_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));

        let a = tcp_device("m1", "10.0.0.1");
        let b = tcp_device("m1", "10.0.0.2").with_poll_interval_ms(250);

        let handles: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .map(|cfg| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.upsert_device(cfg).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stored = store.get_device("m1").unwrap();
        assert!(stored == a || stored == b, "store holds a hybrid: {:?}", stored);
    }

    #[test]
    fn test_reopen_loads_persisted_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-config.json");

        {
            let store = ConfigStore::open(&path, GatewaySnapshot::default()).unwrap();
            store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();
            store.upsert_tag(TagConfig::new("m1", "t", "40001")).unwrap();
        }

        // Seed is ignored once a snapshot exists.
        let seed = GatewaySnapshot::new(vec![tcp_device("other", "10.9.9.9")], vec![]);
        let store = ConfigStore::open(&path, seed).unwrap();
        assert!(store.get_device("m1").is_some());
        assert!(store.get_device("other").is_none());
        assert_eq!(store.list_tags(Some("m1")).len(), 1);
    }

    #[test]
    fn test_seed_persisted_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-config.json");
        let seed = GatewaySnapshot::new(vec![tcp_device("m1", "10.0.0.1")], vec![]);

        let _store = ConfigStore::open(&path, seed).unwrap();
        assert!(path.exists());

        let reloaded = snapshot::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.devices.len(), 1);
    }
}
