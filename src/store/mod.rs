//! Shared mutable state of the gateway.
//!
//! Two stores, both internally thread-safe and lock-free across devices:
//!
//! - [`ConfigStore`]: the authoritative device/tag configuration, persisted
//!   as an atomic JSON snapshot and fanned out as [`ConfigChange`] events.
//! - [`TagValueCache`]: the latest value per `(device, tag)` and the
//!   online/offline status per device, with broadcast fan-out.
//!
//! [`ConfigChange`]: crate::core::device::ConfigChange

mod cache;
mod config;
pub mod snapshot;

pub use cache::{DeviceStatusReceiver, TagValueCache, TagValueReceiver};
pub use config::{ConfigChangeReceiver, ConfigStore};
pub use snapshot::GatewaySnapshot;
