//! Transport-agnostic gateway facade.
//!
//! Everything an RPC layer needs to expose the gateway (tag queries and
//! writes, value/status subscriptions, and runtime configuration
//! management) without binding to any wire transport. Query operations
//! degrade (quality `not_found`, failure messages) instead of erroring;
//! mutations return an [`OperationStatus`] pair.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

use crate::core::data::{DeviceStatus, TagValue};
use crate::core::device::{normalize_id, DeviceConfig, TagConfig};
use crate::registry::DeviceRegistry;
use crate::store::{ConfigStore, DeviceStatusReceiver, TagValueCache, TagValueReceiver};

/// Success flag plus human-readable message, as returned to API clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub success: bool,
    pub message: String,
}

impl OperationStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Live value stream for one `(device, tag)` pair.
///
/// The current cached value (if any) is delivered first, then every
/// subsequent change until the subscriber drops the stream. Delivery is
/// best-effort: a subscriber that lags far behind skips missed values and
/// resumes with the newest.
pub struct TagSubscription {
    device_key: String,
    tag_key: String,
    initial: Option<TagValue>,
    rx: TagValueReceiver,
}

impl TagSubscription {
    /// Next value, or `None` once the gateway shuts down.
    pub async fn next(&mut self) -> Option<TagValue> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => {
                    if normalize_id(&value.device_id) == self.device_key
                        && normalize_id(&value.tag_name) == self.tag_key
                    {
                        return Some(value);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Online/offline transition stream for one device, or for all devices.
pub struct StatusSubscription {
    device_key: Option<String>,
    rx: DeviceStatusReceiver,
}

impl StatusSubscription {
    /// Next transition, or `None` once the gateway shuts down.
    pub async fn next(&mut self) -> Option<DeviceStatus> {
        loop {
            match self.rx.recv().await {
                Ok(status) => match &self.device_key {
                    Some(key) if normalize_id(&status.device_id) != *key => continue,
                    _ => return Some(status),
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Facade over the cache, the configuration store, and the registry.
pub struct GatewayService {
    store: Arc<ConfigStore>,
    registry: Arc<DeviceRegistry>,
    cache: Arc<TagValueCache>,
}

impl GatewayService {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<DeviceRegistry>,
        cache: Arc<TagValueCache>,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Latest cached value; quality `not_found` when nothing is cached.
    pub fn read_tag(&self, device_id: &str, tag_name: &str) -> TagValue {
        self.cache
            .get(device_id, tag_name)
            .unwrap_or_else(|| TagValue::not_found(device_id, tag_name))
    }

    pub fn list_devices(&self) -> Vec<DeviceConfig> {
        self.store.list_devices()
    }

    pub fn list_tags(&self, device_id: Option<&str>) -> Vec<TagConfig> {
        self.store.list_tags(device_id)
    }

    pub fn device_status(&self, device_id: &str) -> Option<bool> {
        self.cache.get_device_status(device_id)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a value through the device driver and mirror it in the cache.
    pub async fn write_tag(&self, device_id: &str, tag_name: &str, value: f64) -> OperationStatus {
        let Some(tag) = self.store.get_tag(device_id, tag_name) else {
            return OperationStatus::failed(format!(
                "Tag '{}' not found for device '{}'",
                tag_name, device_id
            ));
        };

        let client = match self.registry.get_client(device_id) {
            Ok(client) => client,
            Err(e) => return OperationStatus::failed(e.to_string()),
        };

        match client.write(&tag.address, value, tag.data_type).await {
            Ok(()) => {
                // Reflect the write immediately; the next poll re-confirms.
                self.cache
                    .save(TagValue::good(&tag.device_id, &tag.name, value));
                OperationStatus::ok("Success")
            }
            Err(e) => {
                error!(device = %device_id, tag = %tag_name, error = %e, "tag write failed");
                OperationStatus::failed(e.to_string())
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to one tag's value stream; the current cached value (if
    /// any) is the first item delivered.
    pub fn subscribe_tag(&self, device_id: &str, tag_name: &str) -> TagSubscription {
        // Subscribe before snapshotting so no change between the two is lost.
        let rx = self.cache.subscribe_values();
        TagSubscription {
            device_key: normalize_id(device_id),
            tag_key: normalize_id(tag_name),
            initial: self.cache.get(device_id, tag_name),
            rx,
        }
    }

    /// Subscribe to status transitions of one device (`Some`) or all (`None`).
    pub fn subscribe_status(&self, device_id: Option<&str>) -> StatusSubscription {
        StatusSubscription {
            device_key: device_id.map(normalize_id),
            rx: self.cache.subscribe_status(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration management
    // ------------------------------------------------------------------

    pub fn upsert_device(&self, config: DeviceConfig) -> OperationStatus {
        let id = config.id.clone();
        match self.store.upsert_device(config) {
            Ok(()) => {
                info!(device = %id, "device saved");
                OperationStatus::ok("Device saved")
            }
            Err(e) => OperationStatus::failed(e.to_string()),
        }
    }

    pub fn remove_device(&self, device_id: &str) -> OperationStatus {
        if device_id.trim().is_empty() {
            return OperationStatus::failed("deviceId is required");
        }
        match self.store.remove_device(device_id) {
            Ok(true) => OperationStatus::ok("Device removed"),
            Ok(false) => OperationStatus::failed("Device not found"),
            Err(e) => OperationStatus::failed(e.to_string()),
        }
    }

    pub fn upsert_tag(&self, config: TagConfig) -> OperationStatus {
        match self.store.upsert_tag(config) {
            Ok(()) => OperationStatus::ok("Tag saved"),
            Err(e) => OperationStatus::failed(e.to_string()),
        }
    }

    pub fn remove_tag(&self, device_id: &str, tag_name: &str) -> OperationStatus {
        if device_id.trim().is_empty() || tag_name.trim().is_empty() {
            return OperationStatus::failed("deviceId and tagName are required");
        }
        match self.store.remove_tag(device_id, tag_name) {
            Ok(true) => OperationStatus::ok("Tag removed"),
            Ok(false) => OperationStatus::failed("Tag not found"),
            Err(e) => OperationStatus::failed(e.to_string()),
        }
    }
}
