//! Concurrent latest-value cache with change fan-out.
//!
//! One writer per device loop plus the write path of the gateway facade,
//! many concurrent readers. There is no global lock: values and statuses
//! live in keyed `DashMap`s, and notifications go through `broadcast`
//! channels so a slow subscriber lags and drops instead of blocking the
//! writer (best-effort, at-least-once delivery).

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::core::data::{DeviceStatus, TagValue};
use crate::core::device::normalize_id;

/// Broadcast capacity for value and status events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub type TagValueReceiver = broadcast::Receiver<TagValue>;
pub type DeviceStatusReceiver = broadcast::Receiver<DeviceStatus>;

/// Latest-value store keyed by `(device, tag)`, plus per-device
/// online/offline status.
pub struct TagValueCache {
    /// Values keyed by `"device:tag"` (lowercase).
    values: DashMap<String, TagValue>,

    /// Online flag keyed by lowercase device id.
    status: DashMap<String, bool>,

    value_tx: broadcast::Sender<TagValue>,
    status_tx: broadcast::Sender<DeviceStatus>,
}

impl TagValueCache {
    pub fn new() -> Self {
        let (value_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            values: DashMap::new(),
            status: DashMap::new(),
            value_tx,
            status_tx,
        }
    }

    fn make_key(device_id: &str, tag_name: &str) -> String {
        format!("{}:{}", normalize_id(device_id), normalize_id(tag_name))
    }

    /// Overwrite the stored value for `(device, tag)` and notify subscribers.
    pub fn save(&self, value: TagValue) {
        let key = Self::make_key(&value.device_id, &value.tag_name);
        self.values.insert(key, value.clone());
        let _ = self.value_tx.send(value);
    }

    /// Last stored value, or `None` if never written.
    pub fn get(&self, device_id: &str, tag_name: &str) -> Option<TagValue> {
        self.values
            .get(&Self::make_key(device_id, tag_name))
            .map(|e| e.value().clone())
    }

    /// All cached values for one device.
    pub fn get_by_device(&self, device_id: &str) -> Vec<TagValue> {
        let prefix = format!("{}:", normalize_id(device_id));
        self.values
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Record a device's online flag.
    ///
    /// Subscribers are only notified when the status actually flips (the
    /// first observation counts as a flip); polling loops re-confirm the
    /// same state every cycle and must not spam the stream.
    pub fn update_device_status(&self, device_id: &str, online: bool) {
        let previous = self.status.insert(normalize_id(device_id), online);
        if previous != Some(online) {
            let _ = self.status_tx.send(DeviceStatus::new(device_id, online));
        }
    }

    /// Last known online flag, or `None` if the device was never polled.
    pub fn get_device_status(&self, device_id: &str) -> Option<bool> {
        self.status.get(&normalize_id(device_id)).map(|e| *e.value())
    }

    /// Subscribe to every value change.
    pub fn subscribe_values(&self) -> TagValueReceiver {
        self.value_tx.subscribe()
    }

    /// Subscribe to every device status transition.
    pub fn subscribe_status(&self) -> DeviceStatusReceiver {
        self.status_tx.subscribe()
    }
}

impl Default for TagValueCache {
    fn default() -> Self {
        Self::new()
    }
}
