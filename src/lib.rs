//! # PLC Gateway (plcgw)
//!
//! A supervisory polling gateway for PLC fleets: hot-reloadable device and
//! tag configuration, per-device polling loops with failure-driven
//! reconnection, and a concurrent last-value cache with change fan-out.
//!
//! ## Architecture
//!
//! - **Config Store**: devices and tags, persisted atomically as JSON,
//!   every mutation broadcast as a change event
//! - **Device Registry**: one live driver per device, rebuilt on config
//!   changes
//! - **Polling Orchestrator**: one supervised loop per device, reconciled
//!   against configuration every few seconds and on every change event
//! - **Tag Value Cache**: concurrent last-known values plus online/offline
//!   state, fanned out over broadcast channels
//! - **Gateway Service**: the transport-agnostic facade an RPC layer would
//!   mount
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plcgw::prelude::*;
//!
//! let store = Arc::new(ConfigStore::open("gateway.json", GatewaySnapshot::default())?);
//! let factory = Arc::new(SimDriverFactory::new());
//! let registry = Arc::new(DeviceRegistry::new(store.clone(), factory));
//! let cache = Arc::new(TagValueCache::new());
//!
//! let polling = PollingOrchestrator::spawn(
//!     store.clone(), registry.clone(), cache.clone(), PollingOptions::default());
//!
//! store.upsert_device(DeviceConfig::new("plc1", ProtocolConfig::ModbusTcp {
//!     host: "192.168.1.100".into(), port: 502, station: 1,
//! }))?;
//! ```

pub mod core;
pub mod drivers;
pub mod gateway;
pub mod polling;
pub mod registry;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        data::{DeviceStatus, Quality, TagValue},
        device::{
            ConfigChange, ConfigChangeKind, DeviceConfig, ProtocolConfig, TagConfig, TagDataType,
        },
        error::{GatewayError, Result},
    };
    pub use crate::drivers::{DeviceDriver, DriverFactory, SimDriverFactory};
    pub use crate::gateway::{GatewayService, OperationStatus};
    pub use crate::polling::{PollingHandle, PollingOptions, PollingOrchestrator};
    pub use crate::registry::DeviceRegistry;
    pub use crate::store::{ConfigStore, GatewaySnapshot, TagValueCache};
}

// Re-export core types at crate root for convenience
pub use crate::core::data::{DeviceStatus, Quality, TagValue};
pub use crate::core::device::{DeviceConfig, ProtocolConfig, TagConfig, TagDataType};
pub use crate::core::error::{GatewayError, Result};
pub use crate::gateway::{GatewayService, OperationStatus};
pub use crate::polling::{PollingHandle, PollingOptions, PollingOrchestrator};
pub use crate::registry::DeviceRegistry;
pub use crate::store::{ConfigStore, GatewaySnapshot, TagValueCache};
