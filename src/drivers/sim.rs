//! Simulated field devices.
//!
//! `SimDriver` stands in for a real PLC: it keeps an in-process register
//! map, honors the connect/read/write/disconnect contract, and can be
//! driven into failure (refused connects, empty reads) to exercise the
//! supervisory loops without hardware. The demo binary and the test suite
//! run entirely on it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::core::device::{normalize_id, DeviceConfig, TagDataType};
use crate::core::error::{GatewayError, Result};
use crate::drivers::{DeviceDriver, DriverFactory};

/// In-process simulated device driver.
#[derive(Debug)]
pub struct SimDriver {
    device_id: String,
    protocol: &'static str,
    connected: AtomicBool,

    /// While false, reads return `Ok(None)` (recoverable failure).
    healthy: AtomicBool,

    /// Connect attempts to refuse before accepting again.
    fail_next_connects: AtomicU32,

    /// Reads to fail (as `Ok(None)`) before succeeding again.
    fail_next_reads: AtomicU32,

    registers: DashMap<String, f64>,

    read_count: AtomicU64,
    write_count: AtomicU64,
}

impl SimDriver {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            device_id: config.id.clone(),
            protocol: config.protocol.kind(),
            connected: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            fail_next_connects: AtomicU32::new(0),
            fail_next_reads: AtomicU32::new(0),
            registers: DashMap::new(),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }

    /// Preload a register value.
    pub fn set_register(&self, address: impl Into<String>, value: f64) {
        self.registers.insert(address.into(), value);
    }

    /// Toggle read health. While unhealthy, every read returns `Ok(None)`.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads with `Ok(None)`, then recover.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_next_reads.store(n, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Deterministic default for addresses never written to, so freshly
    /// configured tags produce stable non-zero data.
    fn synth_value(address: &str) -> f64 {
        (address.bytes().map(u64::from).sum::<u64>() % 100) as f64
    }

    fn cast(value: f64, data_type: TagDataType) -> f64 {
        match data_type {
            TagDataType::Int16 => value as i16 as f64,
            TagDataType::Int32 => value as i32 as f64,
            TagDataType::Float32 => value as f32 as f64,
            TagDataType::Float64 => value,
            TagDataType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for SimDriver {
    async fn connect(&self) -> Result<()> {
        let remaining = self.fail_next_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Connection(format!(
                "simulated connect refusal for '{}'",
                self.device_id
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(device = %self.device_id, protocol = self.protocol, "sim device connected");
        Ok(())
    }

    async fn read(&self, address: &str, data_type: TagDataType) -> Result<Option<f64>> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.read_count.fetch_add(1, Ordering::SeqCst);

        if !self.healthy.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let failing = self.fail_next_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.fail_next_reads.store(failing - 1, Ordering::SeqCst);
            return Ok(None);
        }

        let raw = self
            .registers
            .get(address)
            .map(|e| *e.value())
            .unwrap_or_else(|| Self::synth_value(address));
        Ok(Some(Self::cast(raw, data_type)))
    }

    async fn write(&self, address: &str, value: f64, data_type: TagDataType) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.registers
            .insert(address.to_string(), Self::cast(value, data_type));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing [`SimDriver`]s for every protocol variant.
///
/// Keeps a handle to the most recently created driver per device so that
/// harness code can reach into a running simulation (seed registers, force
/// failures).
#[derive(Default)]
pub struct SimDriverFactory {
    drivers: DashMap<String, Arc<SimDriver>>,
}

impl SimDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently created driver for a device, if any.
    pub fn driver(&self, device_id: &str) -> Option<Arc<SimDriver>> {
        self.drivers
            .get(&normalize_id(device_id))
            .map(|e| Arc::clone(e.value()))
    }
}

impl DriverFactory for SimDriverFactory {
    fn create(&self, config: &DeviceConfig) -> Result<Arc<dyn DeviceDriver>> {
        // Exhaustive over ProtocolConfig: the simulator backs every variant.
        let driver = Arc::new(SimDriver::new(config));
        self.drivers
            .insert(normalize_id(&config.id), Arc::clone(&driver));
        Ok(driver)
    }
}
