pub mod licensing;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::licensing::{EntitlementConfig, EntitlementService};

/// Install the global subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Daemon entry point: start the entitlement service and keep it running until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    init_logging();

    let config = EntitlementConfig::from_env()?;
    info!(
        server = %config.server_url,
        data_dir = %config.data_dir.display(),
        "starting entitlement service"
    );

    let service = EntitlementService::from_config(config)?;
    let state = service.init();
    let status = service.get_status();
    info!(
        state = state.label(),
        identity = %status.identity,
        trial_remaining = ?status.trial_remaining,
        auto_reactivating = status.auto_reactivating,
        "entitlement initialised"
    );

    let mut changes = service.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => info!(state = change.state.label(), reason = %change.reason, "entitlement changed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "state notifications skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("shutting down entitlement service");
    service.dispose();
    Ok(())
}
