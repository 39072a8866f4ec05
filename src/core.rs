//! Core abstractions for the gateway.
//!
//! This module provides the shared data model and error types used by the
//! stores, the device registry, and the polling orchestrator.

pub mod data;
pub mod device;
pub mod error;

pub use data::*;
pub use device::*;
pub use error::{GatewayError, Result};
