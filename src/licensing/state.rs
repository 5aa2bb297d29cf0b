use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::licensing::signature::SignatureVerifier;
use crate::licensing::types::{HardwareIdentity, LicenseToken, LicenseType, LocalLicenseRecord};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Feature gated on coin/bill payment acceptance
pub const FEATURE_INSERT_COIN: &str = "insert_coin";
pub const FEATURE_VOUCHER_GENERATION: &str = "voucher_generation";
pub const FEATURE_MULTI_SLOT: &str = "multi_slot";

/// Current authorization of the device. Derived, never persisted.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntitlementState {
    Trial { remaining_days: u32 },
    Active { token: LicenseToken },
    Restricted { reason: String },
}

impl EntitlementState {
    pub fn restricted(reason: impl Into<String>) -> Self {
        Self::Restricted {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntitlementState::Trial { .. } => "trial",
            EntitlementState::Active { .. } => "active",
            EntitlementState::Restricted { .. } => "restricted",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EntitlementState::Active { .. })
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, EntitlementState::Restricted { .. })
    }

    pub fn token(&self) -> Option<&LicenseToken> {
        match self {
            EntitlementState::Active { token } => Some(token),
            _ => None,
        }
    }
}

/// Capability set unlocked by a state
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub coin_acceptance: bool,
    /// None means unlimited
    pub max_coin_slots: Option<u32>,
    pub voucher_generation: bool,
}

impl Limits {
    pub const UNLIMITED: Limits = Limits {
        coin_acceptance: true,
        max_coin_slots: None,
        voucher_generation: true,
    };

    pub const CAPPED: Limits = Limits {
        coin_acceptance: true,
        max_coin_slots: Some(1),
        voucher_generation: false,
    };

    pub const DISABLED: Limits = Limits {
        coin_acceptance: false,
        max_coin_slots: Some(0),
        voucher_generation: false,
    };
}

/// Capabilities for a state
pub fn get_limits(state: &EntitlementState) -> Limits {
    match state {
        EntitlementState::Trial { .. } => Limits::UNLIMITED,
        EntitlementState::Active { token } => match token.license_type {
            LicenseType::Full | LicenseType::Trial | LicenseType::Developer => Limits::UNLIMITED,
            LicenseType::Restricted => Limits::CAPPED,
        },
        EntitlementState::Restricted { .. } => Limits::DISABLED,
    }
}

/// Whether a named feature is usable. Unknown names fail closed.
pub fn feature_enabled(state: &EntitlementState, name: &str) -> bool {
    let limits = get_limits(state);
    let by_limits = match name {
        FEATURE_INSERT_COIN => Some(limits.coin_acceptance),
        FEATURE_VOUCHER_GENERATION => Some(limits.voucher_generation),
        FEATURE_MULTI_SLOT => Some(limits.coin_acceptance && limits.max_coin_slots != Some(1)),
        _ => None,
    };
    let flag = state.token().and_then(|token| token.feature_flag(name));

    match (by_limits, flag) {
        (Some(allowed), Some(flag)) => allowed && flag,
        (Some(allowed), None) => allowed,
        (None, Some(flag)) => flag,
        (None, None) => false,
    }
}

/// Trial countdown from the install date
pub fn trial_state(install_date: DateTime<Utc>, now: DateTime<Utc>, trial_days: i64) -> EntitlementState {
    let elapsed_days = (now - install_date).num_seconds() as f64 / SECONDS_PER_DAY;
    let trial_days = trial_days as f64;

    if elapsed_days < trial_days {
        let remaining = (trial_days - elapsed_days.max(0.0)).ceil();
        EntitlementState::Trial {
            remaining_days: remaining as u32,
        }
    } else {
        EntitlementState::restricted("trial expired")
    }
}

/// The token a record carries, if it is trustworthy for this device right now
pub fn verified_token(
    record: &LocalLicenseRecord,
    identity: &HardwareIdentity,
    verifier: &SignatureVerifier,
    now: DateTime<Utc>,
) -> Option<LicenseToken> {
    if identity.is_unknown() {
        warn!("hardware identity unresolved, license cannot be honoured");
        return None;
    }

    if !verifier.verify(&record.token, &record.signature) {
        return None;
    }

    let token = match record.parsed_token() {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "signed token does not describe a license");
            return None;
        }
    };

    if token.bound_identity != *identity {
        warn!(
            bound = %token.bound_identity,
            resolved = %identity,
            "license bound to a different device"
        );
        return None;
    }

    if token.is_expired_at(now) {
        debug!(expires_at = ?token.expires_at, "license token expired");
        return None;
    }

    Some(token)
}

/// Boot-time derivation: a valid bound record wins, otherwise the trial clock decides
pub fn derive_state(
    record: Option<&LocalLicenseRecord>,
    identity: &HardwareIdentity,
    verifier: &SignatureVerifier,
    install_date: DateTime<Utc>,
    now: DateTime<Utc>,
    trial_days: i64,
) -> EntitlementState {
    if let Some(token) = record.and_then(|r| verified_token(r, identity, verifier, now)) {
        return EntitlementState::Active { token };
    }
    trial_state(install_date, now, trial_days)
}
