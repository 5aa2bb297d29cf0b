use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::licensing::types::LicenseError;

/// License server URL
pub const LICENSE_SERVER_URL: &str = "https://license.vendo.network";

/// Trial configuration
pub const TRIAL_DAYS: i64 = 7;

/// Background task cadence
pub const POLL_INTERVAL_SECS: u64 = 30;
pub const POLL_BOOT_DELAY_SECS: u64 = 10;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 300;
pub const HEARTBEAT_JITTER_SECS: u64 = 60;
pub const LISTENER_RETRY_SECS: u64 = 10;
pub const REACTIVATION_SCHEDULE_SECS: [u64; 3] = [5, 15, 30];

/// Local file names inside the data directory
pub const LICENSE_FILE: &str = "license.json";
pub const PUBLIC_KEY_FILE: &str = "license-public.pem";
pub const SETTINGS_FILE: &str = "settings.json";
pub const ACTIVATION_AUDIT_FILE: &str = "activation-audit.log";
pub const VALIDATION_AUDIT_FILE: &str = "validation-audit.log";

/// Settings keys owned by the licensing module
pub const INSTALL_DATE_KEY: &str = "licensing.install_date";
pub const ACTIVATION_KEY_KEY: &str = "licensing.activation_key";

/// Environment overrides
pub const CONFIG_PATH_ENV: &str = "VENDO_ENTITLEMENT_CONFIG";
pub const SERVER_URL_ENV: &str = "VENDO_LICENSE_SERVER";
pub const API_KEY_ENV: &str = "VENDO_LICENSE_API_KEY";

/// Runtime configuration for the entitlement service
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EntitlementConfig {
    pub server_url: String,
    pub api_key: Option<String>,
    pub data_dir: PathBuf,
    pub license_file: String,
    pub public_key_file: PathBuf,
    pub trial_days: i64,
    pub poll_interval_secs: u64,
    pub poll_boot_delay_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_jitter_secs: u64,
    pub listener_retry_secs: u64,
    pub reactivation_schedule_secs: Vec<u64>,
    pub request_timeout_secs: u64,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            server_url: LICENSE_SERVER_URL.to_string(),
            api_key: None,
            public_key_file: data_dir.join(PUBLIC_KEY_FILE),
            data_dir,
            license_file: LICENSE_FILE.to_string(),
            trial_days: TRIAL_DAYS,
            poll_interval_secs: POLL_INTERVAL_SECS,
            poll_boot_delay_secs: POLL_BOOT_DELAY_SECS,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            heartbeat_jitter_secs: HEARTBEAT_JITTER_SECS,
            listener_retry_secs: LISTENER_RETRY_SECS,
            reactivation_schedule_secs: REACTIVATION_SCHEDULE_SECS.to_vec(),
            request_timeout_secs: 30,
        }
    }
}

impl EntitlementConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, LicenseError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    LicenseError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&contents).map_err(|e| {
                    LicenseError::Config(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
            _ => Self::default(),
        };

        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                config.server_url = url.trim().to_string();
            }
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.api_key = Some(key.trim().to_string());
            }
        }

        Ok(config)
    }

    /// Load using the path named by `VENDO_ENTITLEMENT_CONFIG`, if set
    pub fn from_env() -> Result<Self, LicenseError> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load(path.as_deref())
    }

    pub fn license_path(&self) -> PathBuf {
        self.data_dir.join(&self.license_file)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn activation_audit_path(&self) -> PathBuf {
        self.data_dir.join(ACTIVATION_AUDIT_FILE)
    }

    pub fn validation_audit_path(&self) -> PathBuf {
        self.data_dir.join(VALIDATION_AUDIT_FILE)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn poll_boot_delay(&self) -> Duration {
        Duration::from_secs(self.poll_boot_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_jitter(&self) -> Duration {
        Duration::from_secs(self.heartbeat_jitter_secs)
    }

    pub fn listener_retry(&self) -> Duration {
        Duration::from_secs(self.listener_retry_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(&self.server_url)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("vendo-entitlement"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/vendo-entitlement"))
}

/// API endpoints
#[derive(Clone, Debug)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn activate(&self) -> String {
        format!("{}/api/v1/activate", self.base)
    }

    pub fn validate(&self) -> String {
        format!("{}/api/v1/validate", self.base)
    }

    pub fn devices(&self) -> String {
        format!("{}/api/v1/devices", self.base)
    }

    pub fn activation_audit(&self) -> String {
        format!("{}/api/v1/audit/activations", self.base)
    }

    pub fn validation_audit(&self) -> String {
        format!("{}/api/v1/audit/validations", self.base)
    }

    pub fn license_feed(&self) -> String {
        format!("{}/api/v1/feed/licenses", self.base)
    }
}

/// Get current platform string
pub fn get_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    return "linux";

    #[cfg(target_os = "windows")]
    return "windows";

    #[cfg(target_os = "macos")]
    return "macos";

    #[cfg(target_os = "android")]
    return "android";

    #[cfg(not(any(
        target_os = "linux",
        target_os = "windows",
        target_os = "macos",
        target_os = "android"
    )))]
    return "unknown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_strip_trailing_slash() {
        let endpoints = Endpoints::new("https://example.test/");
        assert_eq!(endpoints.activate(), "https://example.test/api/v1/activate");
        assert_eq!(endpoints.license_feed(), "https://example.test/api/v1/feed/licenses");
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entitlement.json");
        std::fs::write(&path, r#"{ "trial_days": 10, "reactivation_schedule_secs": [1, 2] }"#)
            .unwrap();

        let config = EntitlementConfig::load(Some(&path)).unwrap();
        assert_eq!(config.trial_days, 10);
        assert_eq!(config.reactivation_schedule_secs, vec![1, 2]);
        assert_eq!(config.poll_interval_secs, POLL_INTERVAL_SECS);
        assert_eq!(config.license_file, LICENSE_FILE);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entitlement.json");
        std::fs::write(&path, "{ trial_days").unwrap();
        assert!(matches!(
            EntitlementConfig::load(Some(&path)),
            Err(LicenseError::Config(_))
        ));
    }
}
