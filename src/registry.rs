//! Device registry: one live driver per configured device.
//!
//! Drivers are built lazily on first use and replaced eagerly when device
//! configuration changes, so callers always see a driver matching the
//! current configuration. Replacement is a single map insert, so there is
//! no window where `get_client` observes a half-initialized driver.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::device::{normalize_id, ConfigChange, ConfigChangeKind};
use crate::core::error::{GatewayError, Result};
use crate::drivers::{DeviceDriver, DriverFactory};
use crate::store::ConfigStore;

/// Maps device identifiers to live driver instances.
pub struct DeviceRegistry {
    store: Arc<ConfigStore>,
    factory: Arc<dyn DriverFactory>,
    clients: DashMap<String, Arc<dyn DeviceDriver>>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<ConfigStore>, factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            store,
            factory,
            clients: DashMap::new(),
        }
    }

    /// Driver for a device, building one from configuration if needed.
    ///
    /// Fails with [`GatewayError::NotFound`] when the device is not
    /// configured, or with the factory's error when no driver can be built.
    pub fn get_client(&self, device_id: &str) -> Result<Arc<dyn DeviceDriver>> {
        let key = normalize_id(device_id);
        match self.clients.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let config = self.store.get_device(device_id).ok_or_else(|| {
                    GatewayError::not_found(format!("device '{}' not found", device_id))
                })?;
                let driver = self.factory.create(&config)?;
                entry.insert(Arc::clone(&driver));
                debug!(device = %config.id, "driver created");
                Ok(driver)
            }
        }
    }

    /// Number of live drivers (diagnostics).
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Apply one configuration change to the driver set.
    pub async fn handle_change(&self, change: &ConfigChange) {
        match change.kind {
            ConfigChangeKind::DeviceAdded | ConfigChangeKind::DeviceUpdated => {
                self.rebuild(&change.device_id).await;
            }
            ConfigChangeKind::DeviceRemoved => {
                self.discard(&change.device_id).await;
            }
            // Tag changes do not affect driver lifecycles.
            _ => {}
        }
    }

    /// Disconnect and drop every driver.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, driver)) = self.clients.remove(&key) {
                let _ = driver.disconnect().await;
            }
        }
    }

    /// Consume configuration changes until `shutdown` is cancelled.
    pub fn spawn_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut rx = registry.store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = rx.recv() => match change {
                        Ok(change) => registry.handle_change(&change).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "registry lagged behind config changes");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn rebuild(&self, device_id: &str) {
        let key = normalize_id(device_id);
        let Some(config) = self.store.get_device(device_id) else {
            // Raced with a removal; the DeviceRemoved event will clean up.
            return;
        };

        match self.factory.create(&config) {
            Ok(driver) => {
                let previous = self.clients.insert(key, driver);
                info!(device = %config.id, "driver replaced after config change");
                if let Some(old) = previous {
                    let _ = old.disconnect().await;
                }
            }
            Err(e) => {
                // Device stays unavailable; a stale driver for the previous
                // config must not linger.
                error!(device = %config.id, error = %e, "failed to build driver");
                if let Some((_, old)) = self.clients.remove(&key) {
                    let _ = old.disconnect().await;
                }
            }
        }
    }

    async fn discard(&self, device_id: &str) {
        if let Some((_, driver)) = self.clients.remove(&normalize_id(device_id)) {
            info!(device = %device_id, "driver discarded");
            let _ = driver.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::{DeviceConfig, ProtocolConfig};
    use crate::drivers::SimDriverFactory;
    use crate::store::GatewaySnapshot;

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

    fn setup(dir: &tempfile::TempDir) -> (Arc<ConfigStore>, Arc<SimDriverFactory>, Arc<DeviceRegistry>) {
        let store = Arc::new(
            ConfigStore::open(dir.path().join("cfg.json"), GatewaySnapshot::default()).unwrap(),
        );
        let factory = Arc::new(SimDriverFactory::new());
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn DriverFactory>,
        ));
        (store, factory, registry)
    }

    #[tokio::test]
    async fn test_get_client_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _factory, registry) = setup(&dir);
        assert!(registry.get_client("ghost").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_client_caches_driver() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _factory, registry) = setup(&dir);
        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();

        let a = registry.get_client("m1").unwrap();
        let b = registry.get_client("M1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_driver_and_disconnects_old() {
        let dir = tempfile::tempdir().unwrap();
        let (store, factory, registry) = setup(&dir);
        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();

        let _ = registry.get_client("m1").unwrap();
        let old = factory.driver("m1").unwrap();
        old.connect().await.unwrap();

        store.upsert_device(tcp_device("m1", "10.0.0.2")).unwrap();
        registry
            .handle_change(&ConfigChange::device(ConfigChangeKind::DeviceUpdated, "m1"))
            .await;

        let new = factory.driver("m1").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!old.is_connected());
    }

    #[tokio::test]
    async fn test_remove_discards_and_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (store, factory, registry) = setup(&dir);
        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();

        let _ = registry.get_client("m1").unwrap();
        factory.driver("m1").unwrap().connect().await.unwrap();

        store.remove_device("m1").unwrap();
        registry
            .handle_change(&ConfigChange::device(ConfigChangeKind::DeviceRemoved, "m1"))
            .await;

        assert_eq!(registry.client_count(), 0);
        assert!(!factory.driver("m1").unwrap().is_connected());
        assert!(registry.get_client("m1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_listener_applies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _factory, registry) = setup(&dir);

        let shutdown = CancellationToken::new();
        let task = registry.spawn_listener(shutdown.clone());

        store.upsert_device(tcp_device("m1", "10.0.0.1")).unwrap();
        // The listener builds the driver eagerly.
        for _ in 0..50 {
            if registry.client_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(registry.client_count(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
