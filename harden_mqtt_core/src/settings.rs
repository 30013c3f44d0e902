//! Persistent key–value settings store.
//!
//! The rest of the crate depends on the [`SettingsStore`] contract only.
//! [`FileSettings`] is the stock implementation: a flat JSON object on
//! disk, rewritten atomically on every mutation. Devices keep their
//! identity, pairing state, and broker parameters here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::SecurityError;

/// Well-known keys. Everything under `API.` is application-defined.
pub const KEY_DEVICE_ID: &str = "Device.ID";
pub const KEY_SECRET_SCALAR: &str = "ed25519.p";
pub const KEY_PAIR_PUBLIC: &str = "Pair.Ed25519.Public";
pub const KEY_PAIR_ID: &str = "Pair.Id";
pub const KEY_MQTT_HOST: &str = "MQTT.Host";
pub const KEY_MQTT_PORT: &str = "MQTT.Port";
pub const KEY_MQTT_TLS: &str = "MQTT.Tls";
pub const KEY_MQTT_USER: &str = "MQTT.UserName";
pub const KEY_MQTT_PASSWORD: &str = "MQTT.Password";
pub const KEY_MQTT_TRUST_SERVER: &str = "MQTT.TrustServer";

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), SecurityError>;
    fn remove(&self, key: &str) -> Result<(), SecurityError>;
}

/// JSON-file-backed settings store.
pub struct FileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettings {
    /// Opens (or creates) the settings file at `path`.
    ///
    /// An unreadable or syntactically broken file is a fatal startup
    /// condition and surfaces as [`SecurityError::Store`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SecurityError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<BTreeMap<String, String>>(&bytes)
                .map_err(|e| SecurityError::Store(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(SecurityError::Store(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<(), SecurityError> {
        let serialized = serde_json::to_string_pretty(values)
            .map_err(|e| SecurityError::Store(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| SecurityError::Store(format!("{}: {e}", parent.display())))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized)
            .map_err(|e| SecurityError::Store(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| SecurityError::Store(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().expect("settings lock").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecurityError> {
        let mut values = self.values.lock().expect("settings lock");
        let previous = values.insert(key.to_string(), value.to_string());
        if previous.as_deref() == Some(value) {
            return Ok(());
        }
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<(), SecurityError> {
        let mut values = self.values.lock().expect("settings lock");
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.flush(&values)
    }
}

/// Volatile store for tests and throwaway demo actors.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().expect("settings lock").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecurityError> {
        self.values
            .lock()
            .expect("settings lock")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SecurityError> {
        self.values.lock().expect("settings lock").remove(key);
        Ok(())
    }
}
