//! Runtime data model: cached tag values and device status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quality marker on a cached tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// The most recent read or write succeeded.
    Good,
    /// The most recent read failed or returned no data.
    Bad,
    /// No value has ever been cached for this tag.
    NotFound,
}

impl Quality {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest value for a `(device, tag)` pair.
///
/// Ephemeral: overwritten on every read, last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    pub device_id: String,
    pub tag_name: String,
    /// Absent on read failure.
    pub value: Option<f64>,
    /// UTC timestamp of the read or write that produced this value.
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
}

impl TagValue {
    /// A successfully read or written value, stamped now.
    pub fn good(device_id: impl Into<String>, tag_name: impl Into<String>, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            tag_name: tag_name.into(),
            value: Some(value),
            timestamp: Utc::now(),
            quality: Quality::Good,
        }
    }

    /// A failed read, stamped now.
    pub fn bad(device_id: impl Into<String>, tag_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            tag_name: tag_name.into(),
            value: None,
            timestamp: Utc::now(),
            quality: Quality::Bad,
        }
    }

    /// Placeholder for a tag that has never been cached.
    pub fn not_found(device_id: impl Into<String>, tag_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            tag_name: tag_name.into(),
            value: None,
            timestamp: Utc::now(),
            quality: Quality::NotFound,
        }
    }
}

/// Online/offline transition of a device, as fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub online: bool,
    pub timestamp: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn new(device_id: impl Into<String>, online: bool) -> Self {
        Self {
            device_id: device_id.into(),
            online,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_wire_format() {
        assert_eq!(serde_json::to_string(&Quality::Good).unwrap(), "\"good\"");
        assert_eq!(
            serde_json::to_string(&Quality::NotFound).unwrap(),
            "\"not_found\""
        );
        assert_eq!(Quality::Bad.as_str(), "bad");
    }

    #[test]
    fn test_tag_value_constructors() {
        let v = TagValue::good("m1", "t1", 42.0);
        assert_eq!(v.value, Some(42.0));
        assert_eq!(v.quality, Quality::Good);

        let v = TagValue::bad("m1", "t1");
        assert_eq!(v.value, None);
        assert_eq!(v.quality, Quality::Bad);
    }
}
