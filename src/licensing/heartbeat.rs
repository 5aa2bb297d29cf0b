use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::debug;

use crate::licensing::api::DeviceHeartbeat;
use crate::licensing::config::get_platform;
use crate::licensing::manager::EntitlementCore;
use crate::licensing::state::EntitlementState;
use crate::licensing::types::LicenseError;

/// Base interval plus up to `jitter` of random spread
pub fn next_delay(base: Duration, jitter: Duration, rng: &mut StdRng) -> Duration {
    if jitter.is_zero() {
        base
    } else {
        let jitter_ms = rng.gen_range(0..=jitter.as_millis().max(1)) as u64;
        base + Duration::from_millis(jitter_ms)
    }
}

/// Periodic inventory report. Failures wait for the next tick.
pub(crate) async fn run(core: Arc<EntitlementCore>) {
    let mut rng = StdRng::from_entropy();
    loop {
        let delay = next_delay(core.config.heartbeat_interval(), core.config.heartbeat_jitter(), &mut rng);
        tokio::time::sleep(delay).await;

        if let Err(e) = beat(&core).await {
            debug!(error = %e, "heartbeat not delivered");
        }
    }
}

/// Upsert one inventory row for this device
pub(crate) async fn beat(core: &EntitlementCore) -> Result<(), LicenseError> {
    let identity = core.identity.resolve();
    if identity.is_unknown() {
        return Err(LicenseError::IdentityUnresolved);
    }
    let device_model = core
        .device_model
        .device_model()
        .ok_or(LicenseError::DeviceModelUnavailable)?;

    let state = core.current_state();
    let trial_remaining = match &state {
        EntitlementState::Trial { remaining_days } => Some(*remaining_days),
        _ => None,
    };
    let heartbeat = DeviceHeartbeat {
        identity,
        device_model,
        metadata: json!({
            "platform": get_platform(),
            "arch": std::env::consts::ARCH,
            "version": env!("CARGO_PKG_VERSION"),
            "state": state.label(),
            "licenseType": state.token().map(|token| token.license_type.as_str()),
            "trialRemaining": trial_remaining,
        }),
    };

    core.authority.upsert_device(&heartbeat).await?;
    debug!(identity = %heartbeat.identity, "heartbeat delivered");
    Ok(())
}
