//! Device driver boundary.
//!
//! Wire-level protocol encode/decode lives outside this crate. The gateway
//! only sees the uniform [`DeviceDriver`] capability set (connect, read,
//! write, disconnect), one instance per configured device, built by an
//! installed [`DriverFactory`].
//!
//! # Contract
//!
//! - `connect` must be safe to call repeatedly after a disconnect; the
//!   polling loop reconnects after every backoff.
//! - `read` distinguishes a recoverable empty read (`Ok(None)`) from a
//!   driver fault (`Err`). Both cache the tag as quality `bad`; faults are
//!   additionally logged, and neither aborts the poll cycle.
//! - `write` down-casts the `f64` according to the data type hint before
//!   transmission.
//! - `disconnect` is idempotent.
//! - Methods take `&self`: the owning polling loop and out-of-band write
//!   requests may call into the driver concurrently.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::device::{DeviceConfig, TagDataType};
use crate::core::error::Result;

pub mod sim;

pub use sim::{SimDriver, SimDriverFactory};

/// Uniform capability set of a per-device protocol driver.
#[async_trait]
pub trait DeviceDriver: Send + Sync + std::fmt::Debug {
    /// Establish the underlying transport connection.
    async fn connect(&self) -> Result<()>;

    /// Read one address. `Ok(None)` means the read failed recoverably.
    async fn read(&self, address: &str, data_type: TagDataType) -> Result<Option<f64>>;

    /// Write one value, cast per `data_type` before transmission.
    async fn write(&self, address: &str, value: f64, data_type: TagDataType) -> Result<()>;

    /// Release the underlying transport. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}

/// Builds drivers from device configuration.
///
/// Construction configures the driver only; it must be fast and must not
/// touch the network (the polling loop performs the actual connect). A
/// factory that does not support a protocol variant returns
/// [`GatewayError::Unsupported`].
///
/// [`GatewayError::Unsupported`]: crate::core::error::GatewayError::Unsupported
pub trait DriverFactory: Send + Sync {
    fn create(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceDriver>>;
}
