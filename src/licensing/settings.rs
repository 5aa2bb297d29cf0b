//! Consumed collaborators: the generic settings store and the device model
//! provider, plus the install-date record kept through them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::licensing::config::INSTALL_DATE_KEY;
use crate::licensing::storage::write_atomic;
use crate::licensing::types::LicenseError;

/// Key-value settings owned by the surrounding application
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), LicenseError>;

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }
}

/// Settings kept in a single JSON object on disk
pub struct JsonFileSettings {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> BTreeMap<String, String> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "settings file unreadable");
            BTreeMap::new()
        })
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_map().remove(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LicenseError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map();
        map.insert(key.to_string(), value.to_string());
        let json = serde_json::to_vec_pretty(&map)
            .map_err(|e| LicenseError::Storage(format!("Failed to serialize settings: {}", e)))?;
        write_atomic(&self.path, &json)
    }
}

/// Volatile settings, for embedding and tests
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LicenseError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Anchor of the trial window, written once on first boot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallationRecord {
    pub install_date: DateTime<Utc>,
}

impl InstallationRecord {
    /// Read the install date, recording `now` if none was ever written.
    ///
    /// A stored value that does not parse is left untouched and the trial is
    /// anchored at the Unix epoch, so a damaged setting cannot restart it.
    pub fn load_or_init(settings: &dyn SettingsStore, now: DateTime<Utc>) -> Self {
        match settings.get(INSTALL_DATE_KEY) {
            Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(date) => Self {
                    install_date: date.with_timezone(&Utc),
                },
                Err(e) => {
                    warn!(value = %raw, error = %e, "install date unparsable, trial treated as expired");
                    Self {
                        install_date: DateTime::<Utc>::UNIX_EPOCH,
                    }
                }
            },
            None => {
                if let Err(e) = settings.set(INSTALL_DATE_KEY, &now.to_rfc3339()) {
                    warn!(error = %e, "failed to persist install date");
                }
                info!(install_date = %now, "installation recorded");
                Self { install_date: now }
            }
        }
    }
}

/// Descriptive model string of the appliance board
pub trait DeviceModelProvider: Send + Sync {
    fn device_model(&self) -> Option<String>;
}

/// Reads the board model from the device tree or DMI tables
pub struct SystemDeviceModel {
    paths: Vec<PathBuf>,
}

impl Default for SystemDeviceModel {
    fn default() -> Self {
        Self {
            paths: vec![
                PathBuf::from("/proc/device-tree/model"),
                PathBuf::from("/sys/class/dmi/id/product_name"),
            ],
        }
    }
}

impl DeviceModelProvider for SystemDeviceModel {
    fn device_model(&self) -> Option<String> {
        let from_files = self.paths.iter().find_map(|path| {
            let bytes = std::fs::read(path).ok()?;
            let model = String::from_utf8_lossy(&bytes)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string();
            (!model.is_empty()).then_some(model)
        });

        Some(from_files.unwrap_or_else(|| {
            format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
        }))
    }
}

/// Fixed model string
pub struct StaticDeviceModel(pub Option<String>);

impl DeviceModelProvider for StaticDeviceModel {
    fn device_model(&self) -> Option<String> {
        self.0.clone().filter(|m| !m.trim().is_empty())
    }
}
