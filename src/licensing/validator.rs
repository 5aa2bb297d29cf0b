//! Periodic re-validation of the active license with the authority.
//!
//! Runs alongside the revocation listener so a missed push event is still
//! caught. Both paths end in the same idempotent `revoke`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::licensing::api::{LicenseRequest, ValidateResponse};
use crate::licensing::audit::{AuditEntry, AuditKind};
use crate::licensing::manager::EntitlementCore;

const BINDING_STATUSES: [&str; 5] = [
    "hwid_mismatch",
    "identity_mismatch",
    "device_mismatch",
    "not_bound",
    "unbound",
];

const BINDING_HINTS: [&str; 3] = ["hardware", "hwid", "binding"];

/// Whether a denial is about which device the key is bound to
pub fn is_binding_failure(response: &ValidateResponse) -> bool {
    let by_status = response
        .status
        .as_deref()
        .map(|status| {
            let status = status.trim().to_ascii_lowercase();
            BINDING_STATUSES.contains(&status.as_str())
        })
        .unwrap_or(false);

    let by_message = response
        .message
        .as_deref()
        .map(|message| {
            let message = message.to_ascii_lowercase();
            BINDING_HINTS.iter().any(|hint| message.contains(hint))
        })
        .unwrap_or(false);

    by_status || by_message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Validation {
    /// Not active, or nothing to validate with
    Skipped,
    Allowed,
    Refreshed,
    AutoBound,
    Revoked,
    /// Transient failure, retried on the next tick
    Deferred,
}

#[derive(Default)]
pub(crate) struct Revalidator {
    auto_bind_attempted: AtomicBool,
}

impl Revalidator {
    pub(crate) async fn validate_once(&self, core: &Arc<EntitlementCore>) -> Validation {
        if !core.current_state().is_active() {
            return Validation::Skipped;
        }
        let Some(key) = core.remembered_key() else {
            debug!("active license has no remembered key, validation skipped");
            return Validation::Skipped;
        };
        let identity = core.identity.resolve();
        if identity.is_unknown() {
            return Validation::Skipped;
        }

        let request = LicenseRequest {
            key,
            identity,
            device_model: core.device_model.device_model().unwrap_or_default(),
        };

        let epoch = core.revocation_epoch();
        let response = match core.authority.validate(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "validation deferred");
                return Validation::Deferred;
            }
        };

        if core.revocation_epoch() != epoch {
            debug!("license revoked while validating, reply ignored");
            return Validation::Skipped;
        }

        if response.allowed {
            return match response.signed_token() {
                Some((token, signature)) => {
                    match core.accept_refreshed_token(&request.key, token, signature, &request.identity, epoch) {
                        Ok(Some(_)) => Validation::Refreshed,
                        Ok(None) => Validation::Skipped,
                        Err(e) => {
                            warn!(error = %e, "refreshed token not accepted");
                            Validation::Allowed
                        }
                    }
                }
                None => Validation::Allowed,
            };
        }

        let reason = response.denial_reason();
        warn!(reason = %reason, status = ?response.status, "license denied on validation");
        audit_denial(core, &request, &response);

        if is_binding_failure(&response) && !self.auto_bind_attempted.swap(true, Ordering::AcqRel) {
            info!("identity binding denied, attempting one automatic re-bind");
            return match core.activate_since(&request.key, Some(epoch)).await {
                Ok(_) => Validation::AutoBound,
                Err(e) if e.is_transient() => {
                    // Nothing was decided, so the attempt is still owed
                    self.auto_bind_attempted.store(false, Ordering::Release);
                    debug!(error = %e, "automatic re-bind deferred");
                    Validation::Deferred
                }
                Err(e) => {
                    warn!(error = %e, "automatic re-bind rejected");
                    core.revoke(&reason);
                    Validation::Revoked
                }
            };
        }

        core.revoke(&reason);
        Validation::Revoked
    }
}

fn audit_denial(core: &EntitlementCore, request: &LicenseRequest, response: &ValidateResponse) {
    let entry = AuditEntry::new(
        AuditKind::ValidationDenial,
        &request.key,
        &request.identity,
        response.status.clone().unwrap_or_else(|| "denied".to_string()),
        response.message.clone(),
    );
    core.validation_log.append(&entry);

    let authority = core.authority.clone();
    tokio::spawn(async move {
        if let Err(e) = authority.record_audit(&entry).await {
            debug!(error = %e, "validation audit not recorded remotely");
        }
    });
}

/// Validate once shortly after boot, then on every poll interval
pub(crate) async fn run(core: Arc<EntitlementCore>) {
    let revalidator = Revalidator::default();

    tokio::time::sleep(core.config.poll_boot_delay()).await;
    revalidator.validate_once(&core).await;

    let period = core.config.poll_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        revalidator.validate_once(&core).await;
    }
}
