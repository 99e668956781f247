//! Pump state persisted by the host between sessions.

use danalink_protocol::Generation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything needed to resume a bond with a pump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedPumpState {
    /// Advertised BLE name, also the first-level key.
    pub device_name: String,
    /// Transport-level identity of the peripheral.
    pub peripheral_id: Option<String>,
    pub generation: Option<Generation>,
    pub hardware_model: Option<u8>,
    pub protocol: Option<u8>,
    #[serde(with = "hex_bytes")]
    pub pairing_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub random_pairing_key: Vec<u8>,
    /// Rolling sync byte in stored (encrypted) form; 0 for a fresh bond.
    pub random_sync_key: u8,
    pub device_password: Option<u16>,
    pub easy_mode: Option<bool>,
    pub unit_ud: Option<bool>,
}

impl PersistedPumpState {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Self::default()
        }
    }

    /// Returns whether a pairing key has been stored.
    pub fn is_bonded(&self) -> bool {
        !self.pairing_key.is_empty()
    }

    /// Drops all pairing material, keeping the device identity.
    pub fn forget_bond(&mut self) {
        self.pairing_key.clear();
        self.random_pairing_key.clear();
        self.random_sync_key = 0;
    }

    pub fn from_json(json: &str) -> Result<Self, StateError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads state from `path`, returning `None` if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, StateError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(Self::from_json(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io(path.to_path_buf(), e)),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StateError> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| StateError::Io(path.to_path_buf(), e))
    }
}

/// State persistence error.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("invalid state JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes key bytes as lowercase hex strings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
