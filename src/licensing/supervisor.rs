//! Boot-time recovery of a remembered activation key.

use std::sync::Arc;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::licensing::backoff::BackoffPolicy;
use crate::licensing::manager::EntitlementCore;

/// The key to reactivate with, if the device booted without a usable license
pub(crate) fn pending_key(core: &Arc<EntitlementCore>) -> Option<String> {
    if core.current_state().is_active() {
        return None;
    }
    core.remembered_key()
}

/// Retry activation on the policy's schedule until it succeeds or the
/// schedule runs out. The boot-derived state stands if every attempt fails.
pub(crate) async fn run(core: Arc<EntitlementCore>, key: String, policy: BackoffPolicy) {
    let started = Instant::now();
    info!(attempts = policy.attempts(), "auto-reactivation scheduled");

    let mut attempt = 0;
    while let Some(offset) = policy.delay(attempt) {
        attempt += 1;
        sleep_until(started + offset).await;

        if core.current_state().is_active() {
            debug!("license already active, auto-reactivation no longer needed");
            core.set_last_error(None);
            break;
        }

        match core.activate(&key).await {
            Ok(token) => {
                info!(attempt, license_type = token.license_type.as_str(), "auto-reactivation succeeded");
                core.set_last_error(None);
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "auto-reactivation attempt failed");
                core.set_last_error(Some(e.to_string()));
            }
        }
    }

    if !core.current_state().is_active() {
        warn!(attempts = attempt, "auto-reactivation gave up");
    }
    core.set_reactivating(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::licensing::config::ACTIVATION_KEY_KEY;
    use crate::licensing::settings::SettingsStore;
    use crate::licensing::testing::Fixture;
    use crate::licensing::types::LicenseError;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_no_pending_key_when_active() {
        let fixture = Fixture::new("SN-123");
        fixture.write_record("SN-123", "KEY-1");
        let core = fixture.core();
        core.boot();
        assert_eq!(pending_key(&core), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_key_from_settings() {
        let fixture = Fixture::expired_trial("SN-123");
        fixture.settings.set(ACTIVATION_KEY_KEY, "KEY-7").unwrap();
        let core = fixture.core();
        core.boot();
        assert_eq!(pending_key(&core).as_deref(), Some("KEY-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_gate_counts_as_failed_attempt() {
        let fixture = Fixture::expired_trial("SN-123");
        let core = fixture.core();
        core.boot();
        let held = core.gate.try_acquire();
        assert!(held.is_some());

        let task = tokio::spawn(run(core.clone(), "KEY-1".into(), BackoffPolicy::from_secs(&[1])));
        tokio::time::sleep(Duration::from_secs(2)).await;
        task.await.unwrap();

        assert!(fixture.authority.activation_requests().is_empty());
        let status = core.status();
        assert_eq!(
            status.last_error,
            Some(LicenseError::ActivationInProgress.to_string())
        );
        drop(held);
    }
}
