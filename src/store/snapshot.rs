//! Snapshot persistence for the configuration store.
//!
//! The full device and tag set is serialized to a single JSON file. Writes
//! go to a sibling temp file first and are moved over the target with an
//! atomic rename, so a crash mid-write never leaves a torn snapshot.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::device::{DeviceConfig, TagConfig};
use crate::core::error::{GatewayError, Result};

/// Complete persisted configuration state.
///
/// The same shape is used for the human-written TOML seed file and the
/// JSON snapshot on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

impl GatewaySnapshot {
    pub fn new(devices: Vec<DeviceConfig>, tags: Vec<TagConfig>) -> Self {
        Self { devices, tags }
    }

    /// Load a seed configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| GatewayError::Persistence(format!("read {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| GatewayError::Persistence(format!("parse {}: {}", path.display(), e)))
    }
}

/// Write the snapshot atomically: serialize, write temp file, rename.
pub fn save_atomic(path: &Path, snapshot: &GatewaySnapshot) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| {
                GatewayError::Persistence(format!("create {}: {}", dir.display(), e))
            })?;
        }
    }

    let json = serde_json::to_vec_pretty(snapshot)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)
        .map_err(|e| GatewayError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path).map_err(|e| {
        // Leave no temp file behind on a failed rename.
        let _ = fs::remove_file(&tmp);
        GatewayError::Persistence(format!("rename {}: {}", path.display(), e))
    })?;

    Ok(())
}

/// Load a previously persisted snapshot.
///
/// Returns `Ok(None)` if no snapshot file exists. An unreadable or invalid
/// file is logged and treated as absent, so a corrupt snapshot cannot keep
/// the gateway from starting with its seed configuration.
pub fn load(path: &Path) -> Result<Option<GatewaySnapshot>> {
    if !path.exists() {
        return Ok(None);
    }

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read persisted snapshot");
            return Ok(None);
        }
    };

    match serde_json::from_str::<GatewaySnapshot>(&text) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "persisted snapshot invalid, ignoring");
            Ok(None)
        }
    }
}
