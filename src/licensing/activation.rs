use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::licensing::api::LicenseRequest;
use crate::licensing::audit::{AuditEntry, AuditKind};
use crate::licensing::heartbeat;
use crate::licensing::manager::EntitlementCore;
use crate::licensing::state::EntitlementState;
use crate::licensing::types::{HardwareIdentity, LicenseError, LicenseToken, LocalLicenseRecord};

/// Busy flag allowing a single activation in flight
#[derive(Default)]
pub struct ActivationGate {
    busy: AtomicBool,
}

impl ActivationGate {
    pub fn try_acquire(&self) -> Option<ActivationPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActivationPermit { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop
pub struct ActivationPermit<'a> {
    gate: &'a ActivationGate,
}

impl Drop for ActivationPermit<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

impl EntitlementCore {
    /// Bind `key` to this device with the authority.
    ///
    /// Nothing is persisted and the state is untouched unless the authority
    /// returns a token that verifies and is bound to this device.
    pub(crate) async fn activate(self: &Arc<Self>, key: &str) -> Result<LicenseToken, LicenseError> {
        self.activate_since(key, None).await
    }

    /// As `activate`, but the result is dropped if a revocation lands after `epoch`
    pub(crate) async fn activate_since(
        self: &Arc<Self>,
        key: &str,
        epoch: Option<u64>,
    ) -> Result<LicenseToken, LicenseError> {
        let _permit = self
            .gate
            .try_acquire()
            .ok_or(LicenseError::ActivationInProgress)?;

        let key = key.trim();
        if key.is_empty() {
            return Err(LicenseError::ActivationRejected("activation key is empty".to_string()));
        }

        let identity = self.identity.resolve();
        if identity.is_unknown() {
            return Err(LicenseError::IdentityUnresolved);
        }
        let device_model = self
            .device_model
            .device_model()
            .ok_or(LicenseError::DeviceModelUnavailable)?;

        let request = LicenseRequest {
            key: key.to_string(),
            identity,
            device_model,
        };

        info!(identity = %request.identity, "requesting activation");
        let result = match self.request_token(&request).await {
            Ok((token_value, signature, token)) => {
                let record = LocalLicenseRecord {
                    token: token_value,
                    signature,
                    key: key.to_string(),
                    activated_at: Utc::now(),
                };
                self.commit_since(
                    epoch,
                    EntitlementState::Active { token: token.clone() },
                    "activated",
                    || self.store.save(&record),
                )
                .and_then(|committed| if committed { Ok(token) } else { Err(LicenseError::Revoked) })
            }
            Err(e) => Err(e),
        };
        self.audit_activation(&request, &result);
        let token = result?;
        self.remember_key(key);

        let core = self.clone();
        tokio::spawn(async move {
            if let Err(e) = heartbeat::beat(&core).await {
                debug!(error = %e, "post-activation heartbeat failed");
            }
        });

        Ok(token)
    }

    async fn request_token(
        &self,
        request: &LicenseRequest,
    ) -> Result<(Value, String, LicenseToken), LicenseError> {
        let response = self.authority.activate(request).await?;
        let (token_value, signature) = response.signed_token().ok_or_else(|| {
            LicenseError::ActivationRejected(
                response
                    .error_message()
                    .unwrap_or_else(|| "response did not include a signed token".to_string()),
            )
        })?;

        let token = self.check_token(&token_value, &signature, &request.identity)?;
        Ok((token_value, signature, token))
    }

    /// Verify a token from the authority before it is trusted
    pub(crate) fn check_token(
        &self,
        token_value: &Value,
        signature: &str,
        identity: &HardwareIdentity,
    ) -> Result<LicenseToken, LicenseError> {
        if !self.verifier.verify(token_value, signature) {
            return Err(LicenseError::SignatureInvalid);
        }

        let token = LicenseToken::from_value(token_value)?;
        if token.bound_identity != *identity {
            return Err(LicenseError::ActivationRejected(format!(
                "token is bound to {}",
                token.bound_identity
            )));
        }
        Ok(token)
    }

    /// Write through a token returned by re-validation, keeping the original
    /// activation time. Returns None if the license was revoked after `epoch`.
    pub(crate) fn accept_refreshed_token(
        &self,
        key: &str,
        token_value: Value,
        signature: String,
        identity: &HardwareIdentity,
        epoch: u64,
    ) -> Result<Option<LicenseToken>, LicenseError> {
        let token = self.check_token(&token_value, &signature, identity)?;
        let activated_at = self
            .store
            .load()
            .map(|record| record.activated_at)
            .unwrap_or_else(Utc::now);
        let record = LocalLicenseRecord {
            token: token_value,
            signature,
            key: key.to_string(),
            activated_at,
        };

        let committed = self.commit_since(
            Some(epoch),
            EntitlementState::Active { token: token.clone() },
            "revalidated",
            || self.store.save(&record),
        )?;
        Ok(committed.then_some(token))
    }

    fn audit_activation<T>(&self, request: &LicenseRequest, result: &Result<T, LicenseError>) {
        let (outcome, detail) = match result {
            Ok(_) => ("activated".to_string(), None),
            Err(e) => {
                warn!(error = %e, "activation failed");
                ("failed".to_string(), Some(e.to_string()))
            }
        };
        let entry = AuditEntry::new(
            AuditKind::Activation,
            &request.key,
            &request.identity,
            outcome,
            detail,
        );
        self.activation_log.append(&entry);

        let authority = self.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = authority.record_audit(&entry).await {
                debug!(error = %e, "activation audit not recorded remotely");
            }
        });
    }
}
