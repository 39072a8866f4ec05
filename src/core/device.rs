//! Device and tag configuration model.
//!
//! Device identity is case-insensitive: the stores normalize keys with
//! [`normalize_id`], while configuration values keep the caller's casing.
//!
//! The protocol parameters are a closed sum type ([`ProtocolConfig`]) so
//! that driver construction can match exhaustively instead of dispatching
//! on a type string, and each variant carries only the fields it needs.

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Lowercase-normalize a device id or tag name for map keys.
#[inline]
pub fn normalize_id(id: &str) -> String {
    id.to_ascii_lowercase()
}

/// Serial parity setting for Modbus RTU links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Protocol-specific connection parameters.
///
/// Tagged with `type` on the wire, so persisted snapshots carry the same
/// `"SiemensS7"` / `"ModbusTcp"` / `"ModbusRtu"` discriminators as the
/// device list clients submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolConfig {
    /// Siemens S7 over ISO-on-TCP.
    SiemensS7 {
        host: String,
        #[serde(default = "default_s7_port")]
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rack: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<u16>,
    },

    /// Modbus TCP.
    ModbusTcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default = "default_station")]
        station: u8,
    },

    /// Modbus RTU over a serial line.
    ModbusRtu {
        port_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baud_rate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_bits: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_bits: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parity: Option<Parity>,
        #[serde(default = "default_station")]
        station: u8,
    },
}

fn default_s7_port() -> u16 {
    102
}

fn default_modbus_port() -> u16 {
    502
}

fn default_station() -> u8 {
    1
}

impl ProtocolConfig {
    /// Protocol discriminator as a display string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SiemensS7 { .. } => "SiemensS7",
            Self::ModbusTcp { .. } => "ModbusTcp",
            Self::ModbusRtu { .. } => "ModbusRtu",
        }
    }

    /// Validate required transport fields.
    fn validate(&self) -> Result<()> {
        match self {
            Self::SiemensS7 { host, .. } | Self::ModbusTcp { host, .. } => {
                if host.trim().is_empty() {
                    return Err(GatewayError::invalid("host is required"));
                }
            }
            Self::ModbusRtu { port_name, .. } => {
                if port_name.trim().is_empty() {
                    return Err(GatewayError::invalid("port_name is required for ModbusRtu"));
                }
            }
        }
        Ok(())
    }

    /// Append the connection-relevant fields to a signature buffer.
    fn write_signature(&self, out: &mut String) {
        use std::fmt::Write;

        match self {
            Self::SiemensS7 { host, port, rack, slot } => {
                let _ = write!(
                    out,
                    "SiemensS7|{}|{}|{}|{}",
                    host,
                    port,
                    rack.map(|v| v.to_string()).unwrap_or_default(),
                    slot.map(|v| v.to_string()).unwrap_or_default(),
                );
            }
            Self::ModbusTcp { host, port, station } => {
                let _ = write!(out, "ModbusTcp|{}|{}|{}", host, port, station);
            }
            Self::ModbusRtu {
                port_name,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                station,
            } => {
                let _ = write!(
                    out,
                    "ModbusRtu|{}|{}|{}|{}|{:?}|{}",
                    port_name,
                    baud_rate.map(|v| v.to_string()).unwrap_or_default(),
                    data_bits.map(|v| v.to_string()).unwrap_or_default(),
                    stop_bits.map(|v| v.to_string()).unwrap_or_default(),
                    parity.unwrap_or_default(),
                    station,
                );
            }
        }
    }
}

/// A configured field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (case-insensitive).
    pub id: String,

    /// Protocol and transport parameters.
    #[serde(flatten)]
    pub protocol: ProtocolConfig,

    /// Poll interval in milliseconds. Must be > 0.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl DeviceConfig {
    /// Create a device config with the default poll interval.
    pub fn new(id: impl Into<String>, protocol: ProtocolConfig) -> Self {
        Self {
            id: id.into(),
            protocol,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Normalized map key for this device.
    pub fn key(&self) -> String {
        normalize_id(&self.id)
    }

    /// Deterministic fingerprint of every connection-relevant field.
    ///
    /// The polling orchestrator compares signatures to decide whether a
    /// running loop still matches the configuration; any change here forces
    /// a loop restart.
    pub fn signature(&self) -> String {
        let mut out = String::with_capacity(64);
        self.protocol.write_signature(&mut out);
        out.push('|');
        out.push_str(&self.poll_interval_ms.to_string());
        out
    }

    /// Validate identifier, poll interval, and transport fields.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::invalid("device id is required"));
        }
        if self.poll_interval_ms == 0 {
            return Err(GatewayError::invalid("poll_interval_ms must be > 0"));
        }
        self.protocol.validate()
    }
}

/// Data type hint for tag reads and writes.
///
/// Values cross the driver boundary as `f64`; the hint tells the driver how
/// to decode/encode the device-native representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagDataType {
    Int16,
    Int32,
    Float32,
    #[default]
    Float64,
    Bool,
}

/// A named, addressable data point on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    /// Owning device identifier (case-insensitive reference).
    pub device_id: String,

    /// Tag name, unique per device (case-insensitive).
    pub name: String,

    /// Device-native address string (e.g. `"DB1.DBD0"`, `"40001"`).
    pub address: String,

    /// Optional decode hint; defaults to `float64`.
    #[serde(default)]
    pub data_type: TagDataType,
}

impl TagConfig {
    pub fn new(
        device_id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            address: address.into(),
            data_type: TagDataType::default(),
        }
    }

    /// Set the data type hint.
    pub fn with_data_type(mut self, data_type: TagDataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Normalized `(device, tag)` map key.
    pub fn key(&self) -> (String, String) {
        (normalize_id(&self.device_id), normalize_id(&self.name))
    }

    /// Validate required fields (device existence is checked by the store).
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(GatewayError::invalid("device_id is required"));
        }
        if self.name.trim().is_empty() {
            return Err(GatewayError::invalid("tag name is required"));
        }
        if self.address.trim().is_empty() {
            return Err(GatewayError::invalid("tag address is required"));
        }
        Ok(())
    }
}

/// Kind of a committed configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangeKind {
    DeviceAdded,
    DeviceUpdated,
    DeviceRemoved,
    TagAdded,
    TagUpdated,
    TagRemoved,
}

impl ConfigChangeKind {
    /// Whether this change affects a device's connection lifecycle.
    #[inline]
    pub fn is_device_change(&self) -> bool {
        matches!(
            self,
            Self::DeviceAdded | Self::DeviceUpdated | Self::DeviceRemoved
        )
    }
}

/// Event emitted after a configuration mutation durably commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub kind: ConfigChangeKind,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
}

impl ConfigChange {
    pub fn device(kind: ConfigChangeKind, device_id: impl Into<String>) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            tag_name: None,
        }
    }

    pub fn tag(
        kind: ConfigChangeKind,
        device_id: impl Into<String>,
        tag_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            tag_name: Some(tag_name.into()),
        }
    }
}
