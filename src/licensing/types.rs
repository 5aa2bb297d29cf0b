use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel identity used when no platform probe produced a plausible value.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Stable hardware fingerprint of this device
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Hash)]
#[serde(transparent)]
pub struct HardwareIdentity(String);

impl HardwareIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTITY.to_string())
    }

    /// An identity that can never be bound to a license
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty() || self.0 == UNKNOWN_IDENTITY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of license issued by the authority
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum LicenseType {
    Full,
    Trial,
    Developer,
    Restricted,
}

impl LicenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseType::Full => "FULL",
            LicenseType::Trial => "TRIAL",
            LicenseType::Developer => "DEVELOPER",
            LicenseType::Restricted => "RESTRICTED",
        }
    }
}

/// Typed view of the signed claim.
///
/// The authority signs the raw JSON value, so the record keeps that value
/// verbatim and this struct is only ever parsed out of it.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LicenseToken {
    pub owner_id: String,
    pub bound_identity: HardwareIdentity,
    pub license_type: LicenseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

impl LicenseToken {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, LicenseError> {
        serde_json::from_value(value.clone())
            .map_err(|e| LicenseError::InvalidResponse(format!("malformed license token: {}", e)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }

    /// Explicit per-feature flag carried by the token, if any
    pub fn feature_flag(&self, name: &str) -> Option<bool> {
        self.features.get(name).copied()
    }
}

/// License material persisted on disk after a successful activation
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LocalLicenseRecord {
    /// Token exactly as the authority signed it
    pub token: serde_json::Value,
    /// Base64 Ed25519 signature over the canonical token
    pub signature: String,
    /// Plaintext activation key, kept for re-activation
    pub key: String,
    pub activated_at: DateTime<Utc>,
}

impl LocalLicenseRecord {
    pub fn parsed_token(&self) -> Result<LicenseToken, LicenseError> {
        LicenseToken::from_value(&self.token)
    }
}

/// Status view handed to the rest of the application
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: String,
    pub is_valid: bool,
    pub identity: HardwareIdentity,
    pub license: Option<LicenseToken>,
    pub license_type: Option<LicenseType>,
    pub trial_remaining: Option<u32>,
    pub restricted_reason: Option<String>,
    pub auto_reactivating: bool,
    pub last_error: Option<String>,
    pub limits: crate::licensing::state::Limits,
}

/// Error types for licensing operations
#[derive(thiserror::Error, Debug)]
pub enum LicenseError {
    #[error("Hardware identity could not be resolved")]
    IdentityUnresolved,

    #[error("Device model is not available")]
    DeviceModelUnavailable,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Corrupt license record: {0}")]
    CorruptRecord(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Activation rejected: {0}")]
    ActivationRejected(String),

    #[error("License was revoked while the request was in flight")]
    Revoked,

    #[error("Another activation is already in progress")]
    ActivationInProgress,

    #[error("Invalid response from license server: {0}")]
    InvalidResponse(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LicenseError {
    /// Failures the next scheduled attempt may clear on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LicenseError::Network(_) | LicenseError::RateLimited | LicenseError::ActivationInProgress
        )
    }
}
