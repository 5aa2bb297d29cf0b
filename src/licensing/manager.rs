use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::licensing::activation::ActivationGate;
use crate::licensing::api::{HttpAuthority, LicenseAuthority};
use crate::licensing::audit::AuditLog;
use crate::licensing::backoff::BackoffPolicy;
use crate::licensing::config::{EntitlementConfig, ACTIVATION_KEY_KEY};
use crate::licensing::identity::IdentityResolver;
use crate::licensing::revocation::{ChangeFeed, HttpChangeFeed, RevocationListener};
use crate::licensing::settings::{
    DeviceModelProvider, InstallationRecord, JsonFileSettings, SettingsStore, SystemDeviceModel,
};
use crate::licensing::signature::SignatureVerifier;
use crate::licensing::state::{self, derive_state, trial_state, EntitlementState};
use crate::licensing::storage::LicenseStore;
use crate::licensing::types::{LicenseError, LicenseToken, StatusReport};
use crate::licensing::{heartbeat, supervisor, validator};

/// Notification emitted whenever the entitlement state changes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateChange {
    pub state: EntitlementState,
    pub reason: String,
}

/// External services the entitlement core talks to
pub struct Collaborators {
    pub settings: Arc<dyn SettingsStore>,
    pub device_model: Arc<dyn DeviceModelProvider>,
    pub authority: Arc<dyn LicenseAuthority>,
    pub feed: Arc<dyn ChangeFeed>,
}

#[derive(Default)]
struct ReactivationStatus {
    running: bool,
    last_error: Option<String>,
}

/// Shared state behind the service. Background tasks hold an `Arc` of it.
pub(crate) struct EntitlementCore {
    pub(crate) config: EntitlementConfig,
    pub(crate) identity: IdentityResolver,
    pub(crate) store: LicenseStore,
    pub(crate) verifier: SignatureVerifier,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) device_model: Arc<dyn DeviceModelProvider>,
    pub(crate) authority: Arc<dyn LicenseAuthority>,
    pub(crate) activation_log: AuditLog,
    pub(crate) validation_log: AuditLog,
    pub(crate) gate: ActivationGate,
    install_date: RwLock<DateTime<Utc>>,
    state: RwLock<EntitlementState>,
    events: broadcast::Sender<StateChange>,
    revocations: AtomicU64,
    reactivation: Mutex<ReactivationStatus>,
}

impl EntitlementCore {
    pub(crate) fn new(config: EntitlementConfig, identity: IdentityResolver, collaborators: &Collaborators) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            store: LicenseStore::new(config.license_path()),
            verifier: SignatureVerifier::new(&config.public_key_file),
            activation_log: AuditLog::new(config.activation_audit_path()),
            validation_log: AuditLog::new(config.validation_audit_path()),
            settings: collaborators.settings.clone(),
            device_model: collaborators.device_model.clone(),
            authority: collaborators.authority.clone(),
            gate: ActivationGate::default(),
            install_date: RwLock::new(Utc::now()),
            state: RwLock::new(EntitlementState::restricted("not initialized")),
            reactivation: Mutex::new(ReactivationStatus::default()),
            revocations: AtomicU64::new(0),
            events,
            identity,
            config,
        }
    }

    /// Derive the boot state from local files only
    pub(crate) fn boot(&self) -> EntitlementState {
        let now = Utc::now();
        let identity = self.identity.resolve();
        let install = InstallationRecord::load_or_init(self.settings.as_ref(), now);
        *self.install_date.write().unwrap_or_else(PoisonError::into_inner) = install.install_date;

        let record = self.store.load();
        let derived = derive_state(
            record.as_ref(),
            &identity,
            &self.verifier,
            install.install_date,
            now,
            self.config.trial_days,
        );
        info!(identity = %identity, state = derived.label(), "entitlement derived at boot");
        self.transition(derived.clone(), "boot");
        derived
    }

    /// Current state, with the trial clock and token expiry re-applied
    pub(crate) fn current_state(&self) -> EntitlementState {
        let stored = self.state.read().unwrap_or_else(PoisonError::into_inner).clone();
        let now = Utc::now();
        let install_date = *self.install_date.read().unwrap_or_else(PoisonError::into_inner);

        match stored {
            EntitlementState::Trial { .. } => trial_state(install_date, now, self.config.trial_days),
            EntitlementState::Active { token } if token.is_expired_at(now) => {
                trial_state(install_date, now, self.config.trial_days)
            }
            other => other,
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, EntitlementState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, state: EntitlementState, reason: &str) {
        info!(state = state.label(), reason, "entitlement state changed");
        let _ = self.events.send(StateChange {
            state,
            reason: reason.to_string(),
        });
    }

    /// Replace the state, notifying subscribers if it actually changed
    pub(crate) fn transition(&self, next: EntitlementState, reason: &str) -> bool {
        {
            let mut current = self.write_state();
            if *current == next {
                return false;
            }
            *current = next.clone();
        }

        self.announce(next, reason);
        true
    }

    /// Number of revocations so far. Network round-trips capture it before
    /// the request and hand it to `commit_since`.
    pub(crate) fn revocation_epoch(&self) -> u64 {
        self.revocations.load(Ordering::Acquire)
    }

    /// Persist and apply `next` under the state lock, unless a revocation
    /// landed after `epoch`. Returns false when the commit was dropped.
    pub(crate) fn commit_since(
        &self,
        epoch: Option<u64>,
        next: EntitlementState,
        reason: &str,
        persist: impl FnOnce() -> Result<(), LicenseError>,
    ) -> Result<bool, LicenseError> {
        {
            let mut current = self.write_state();
            if let Some(epoch) = epoch {
                if self.revocation_epoch() != epoch {
                    warn!(reason, "license revoked while the request was in flight, result dropped");
                    return Ok(false);
                }
            }
            persist()?;
            if *current == next {
                return Ok(true);
            }
            *current = next.clone();
        }

        self.announce(next, reason);
        Ok(true)
    }

    /// Withdraw authorization. Safe to call from any path, any number of times.
    pub(crate) fn revoke(&self, reason: &str) -> bool {
        let next = EntitlementState::restricted(reason);
        {
            let mut current = self.write_state();
            self.revocations.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = self.store.delete() {
                warn!(error = %e, "failed to delete license record during revocation");
            }
            if current.is_restricted() {
                return false;
            }
            *current = next.clone();
        }

        warn!(reason, "license revoked");
        self.announce(next, reason);
        true
    }

    pub(crate) fn remembered_key(&self) -> Option<String> {
        self.settings
            .get(ACTIVATION_KEY_KEY)
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.store.load().map(|record| record.key))
    }

    pub(crate) fn remember_key(&self, key: &str) {
        if let Err(e) = self.settings.set(ACTIVATION_KEY_KEY, key) {
            warn!(error = %e, "failed to remember activation key");
        }
    }

    pub(crate) fn set_reactivating(&self, running: bool) {
        self.reactivation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running = running;
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        self.reactivation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = error;
    }

    pub(crate) fn status(&self) -> StatusReport {
        let state = self.current_state();
        let (auto_reactivating, last_error) = {
            let reactivation = self.reactivation.lock().unwrap_or_else(PoisonError::into_inner);
            (reactivation.running, reactivation.last_error.clone())
        };

        StatusReport {
            state: state.label().to_string(),
            is_valid: state.is_active(),
            identity: self.identity.resolve(),
            license: state.token().cloned(),
            license_type: state.token().map(|token| token.license_type),
            trial_remaining: match &state {
                EntitlementState::Trial { remaining_days } => Some(*remaining_days),
                _ => None,
            },
            restricted_reason: match &state {
                EntitlementState::Restricted { reason } => Some(reason.clone()),
                _ => None,
            },
            auto_reactivating,
            last_error,
            limits: state::get_limits(&state),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }
}

/// Entitlement service created once by the composition root.
///
/// Reads never wait on the network; background tasks only update state.
pub struct EntitlementService {
    core: Arc<EntitlementCore>,
    feed: Arc<dyn ChangeFeed>,
    listener: RevocationListener,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EntitlementService {
    pub fn new(config: EntitlementConfig, identity: IdentityResolver, collaborators: Collaborators) -> Self {
        let core = Arc::new(EntitlementCore::new(config, identity, &collaborators));
        Self {
            core,
            feed: collaborators.feed,
            listener: RevocationListener::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wire up the production collaborators for `config`
    pub fn from_config(config: EntitlementConfig) -> Result<Self, LicenseError> {
        let collaborators = Collaborators {
            settings: Arc::new(JsonFileSettings::new(config.settings_path())),
            device_model: Arc::new(SystemDeviceModel::default()),
            authority: Arc::new(HttpAuthority::new(&config)?),
            feed: Arc::new(HttpChangeFeed::new(&config)?),
        };
        Ok(Self::new(config, IdentityResolver::platform_default(), collaborators))
    }

    /// Derive the boot state and start the background tasks.
    /// Must be called from within a Tokio runtime.
    pub fn init(&self) -> EntitlementState {
        self.dispose();
        let boot_state = self.core.boot();

        self.listener.listen(self.core.clone(), self.feed.clone());

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(validator::run(self.core.clone())));
        tasks.push(tokio::spawn(heartbeat::run(self.core.clone())));

        if let Some(key) = supervisor::pending_key(&self.core) {
            let policy = BackoffPolicy::from_secs(&self.core.config.reactivation_schedule_secs);
            self.core.set_reactivating(true);
            tasks.push(tokio::spawn(supervisor::run(self.core.clone(), key, policy)));
        }

        boot_state
    }

    /// Stop every scheduled task
    pub fn dispose(&self) {
        self.listener.stop();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        self.core.set_reactivating(false);
    }

    /// Tear down the revocation subscription and open a fresh one
    pub fn relisten(&self) {
        self.listener.listen(self.core.clone(), self.feed.clone());
    }

    pub fn state(&self) -> EntitlementState {
        self.core.current_state()
    }

    pub fn get_status(&self) -> StatusReport {
        self.core.status()
    }

    pub fn is_feature_enabled(&self, name: &str) -> bool {
        state::feature_enabled(&self.core.current_state(), name)
    }

    /// Activate with a key entered by the operator
    pub async fn activate_license(&self, key: &str) -> Result<LicenseToken, LicenseError> {
        self.core.activate(key).await
    }

    pub fn revoke(&self, reason: &str) -> bool {
        self.core.revoke(reason)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.core.subscribe()
    }
}

impl Drop for EntitlementService {
    fn drop(&mut self) {
        self.dispose();
    }
}
