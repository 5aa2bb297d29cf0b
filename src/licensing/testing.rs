//! Shared fixtures: a scripted authority, an in-process change feed and a
//! temp-dir backed service.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::licensing::api::{
    ActivateResponse, DeviceHeartbeat, LicenseAuthority, LicenseRequest, ValidateResponse,
};
use crate::licensing::audit::AuditEntry;
use crate::licensing::config::{EntitlementConfig, INSTALL_DATE_KEY};
use crate::licensing::identity::{IdentityResolver, StaticProbe};
use crate::licensing::manager::{Collaborators, EntitlementCore, EntitlementService};
use crate::licensing::revocation::{ChangeFeed, FeedEvent};
use crate::licensing::settings::{MemorySettings, SettingsStore, StaticDeviceModel};
use crate::licensing::signature::testing::{authority_key, sign, write_trusted_key};
use crate::licensing::storage::LicenseStore;
use crate::licensing::types::{HardwareIdentity, LicenseError, LocalLicenseRecord};

/// A FULL token bound to `bound`, signed by the test authority
pub(crate) fn signed_token(bound: &str) -> (Value, String) {
    let token = json!({
        "ownerId": "op-1",
        "boundIdentity": bound,
        "licenseType": "FULL",
        "features": {}
    });
    let signature = sign(&authority_key(), &token);
    (token, signature)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Authority whose replies are queued by the test
#[derive(Default)]
pub(crate) struct MockAuthority {
    activations: Mutex<VecDeque<Result<ActivateResponse, LicenseError>>>,
    validations: Mutex<VecDeque<Result<ValidateResponse, LicenseError>>>,
    activation_requests: Mutex<Vec<LicenseRequest>>,
    validation_requests: Mutex<Vec<LicenseRequest>>,
    heartbeats: Mutex<Vec<DeviceHeartbeat>>,
    audits: Mutex<Vec<AuditEntry>>,
    fail_heartbeats: AtomicBool,
    activation_delay: Mutex<Option<std::time::Duration>>,
    validation_delay: Mutex<Option<std::time::Duration>>,
}

impl MockAuthority {
    /// Hold every activation reply for `delay`
    pub fn delay_activations(&self, delay: std::time::Duration) {
        *lock(&self.activation_delay) = Some(delay);
    }

    /// Hold every validation reply for `delay`
    pub fn delay_validations(&self, delay: std::time::Duration) {
        *lock(&self.validation_delay) = Some(delay);
    }

    pub fn push_activation(&self, reply: Result<ActivateResponse, LicenseError>) {
        lock(&self.activations).push_back(reply);
    }

    pub fn push_validation(&self, reply: Result<ValidateResponse, LicenseError>) {
        lock(&self.validations).push_back(reply);
    }

    pub fn fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    pub fn activation_requests(&self) -> Vec<LicenseRequest> {
        lock(&self.activation_requests).clone()
    }

    pub fn validation_requests(&self) -> Vec<LicenseRequest> {
        lock(&self.validation_requests).clone()
    }

    pub fn heartbeats(&self) -> Vec<DeviceHeartbeat> {
        lock(&self.heartbeats).clone()
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        lock(&self.audits).clone()
    }
}

#[async_trait]
impl LicenseAuthority for MockAuthority {
    async fn activate(&self, request: &LicenseRequest) -> Result<ActivateResponse, LicenseError> {
        lock(&self.activation_requests).push(request.clone());
        let delay = *lock(&self.activation_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.activations)
            .pop_front()
            .unwrap_or_else(|| Err(LicenseError::Network("no scripted activation reply".into())))
    }

    async fn validate(&self, request: &LicenseRequest) -> Result<ValidateResponse, LicenseError> {
        lock(&self.validation_requests).push(request.clone());
        let delay = *lock(&self.validation_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.validations).pop_front().unwrap_or_else(|| {
            Ok(ValidateResponse {
                allowed: true,
                ..Default::default()
            })
        })
    }

    async fn upsert_device(&self, heartbeat: &DeviceHeartbeat) -> Result<(), LicenseError> {
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(LicenseError::Network("inventory unreachable".into()));
        }
        lock(&self.heartbeats).push(heartbeat.clone());
        Ok(())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<(), LicenseError> {
        lock(&self.audits).push(entry.clone());
        Ok(())
    }
}

/// Change feed driven directly by the test
#[derive(Default)]
pub(crate) struct MockFeed {
    sender: Mutex<Option<mpsc::Sender<FeedEvent>>>,
    subscriptions: AtomicUsize,
    failures: AtomicUsize,
}

impl MockFeed {
    /// Fail the next `count` subscription attempts
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Subscription attempts so far, failed ones included
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn current_sender(&self) -> mpsc::Sender<FeedEvent> {
        lock(&self.sender).clone().expect("no active subscription")
    }

    pub async fn send(&self, event: FeedEvent) {
        let sender = lock(&self.sender).clone().expect("no active subscription");
        sender.send(event).await.expect("subscriber gone");
    }
}

#[async_trait]
impl ChangeFeed for MockFeed {
    async fn subscribe(&self, _identity: &HardwareIdentity) -> Result<mpsc::Receiver<FeedEvent>, LicenseError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LicenseError::Network("feed unreachable".into()));
        }

        let (tx, rx) = mpsc::channel(8);
        *lock(&self.sender) = Some(tx);
        Ok(rx)
    }
}

/// Service wiring over a temp dir, a static identity and the mocks above
pub(crate) struct Fixture {
    pub authority: Arc<MockAuthority>,
    pub feed: Arc<MockFeed>,
    pub settings: Arc<MemorySettings>,
    identity: Option<&'static str>,
    device_model: Option<String>,
    key_path: PathBuf,
    dir: TempDir,
}

impl Fixture {
    pub fn new(identity: &'static str) -> Self {
        Self::with_identity(Some(identity))
    }

    /// No identity probe succeeds
    pub fn unresolved() -> Self {
        Self::with_identity(None)
    }

    /// Installed long enough ago that the trial is over
    pub fn expired_trial(identity: &'static str) -> Self {
        let fixture = Self::new(identity);
        let installed = Utc::now() - Duration::days(11);
        fixture
            .settings
            .set(INSTALL_DATE_KEY, &installed.to_rfc3339())
            .unwrap();
        fixture
    }

    fn with_identity(identity: Option<&'static str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_trusted_key(dir.path()).key_path().to_path_buf();
        Self {
            authority: Arc::new(MockAuthority::default()),
            feed: Arc::new(MockFeed::default()),
            settings: Arc::new(MemorySettings::default()),
            identity,
            device_model: Some("Orange Pi One".to_string()),
            key_path,
            dir,
        }
    }

    pub fn without_device_model(mut self) -> Self {
        self.device_model = None;
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn config(&self) -> EntitlementConfig {
        EntitlementConfig {
            server_url: "http://authority.test".to_string(),
            data_dir: self.data_dir(),
            public_key_file: self.key_path.clone(),
            trial_days: 10,
            poll_interval_secs: 30,
            poll_boot_delay_secs: 10,
            heartbeat_interval_secs: 3_600,
            heartbeat_jitter_secs: 0,
            listener_retry_secs: 10,
            reactivation_schedule_secs: vec![5, 15, 30],
            ..EntitlementConfig::default()
        }
    }

    pub fn license_path(&self) -> PathBuf {
        self.config().license_path()
    }

    pub fn store(&self) -> LicenseStore {
        LicenseStore::new(self.license_path())
    }

    fn resolver(&self) -> IdentityResolver {
        IdentityResolver::with_probes(vec![Box::new(StaticProbe(self.identity))])
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            settings: self.settings.clone(),
            device_model: Arc::new(StaticDeviceModel(self.device_model.clone())),
            authority: self.authority.clone(),
            feed: self.feed.clone(),
        }
    }

    pub fn service(&self) -> EntitlementService {
        EntitlementService::new(self.config(), self.resolver(), self.collaborators())
    }

    pub fn core(&self) -> Arc<EntitlementCore> {
        self.core_with(self.resolver())
    }

    /// Core whose identity comes from `resolver` instead of the fixed one
    pub fn core_with(&self, resolver: IdentityResolver) -> Arc<EntitlementCore> {
        Arc::new(EntitlementCore::new(self.config(), resolver, &self.collaborators()))
    }

    pub fn activation_reply(&self, bound: &str) -> ActivateResponse {
        let (token, signature) = signed_token(bound);
        ActivateResponse {
            token: Some(token),
            signature: Some(signature),
            ..Default::default()
        }
    }

    pub fn write_record(&self, bound: &str, key: &str) {
        let (token, signature) = signed_token(bound);
        self.store()
            .save(&LocalLicenseRecord {
                token,
                signature,
                key: key.to_string(),
                activated_at: Utc::now(),
            })
            .unwrap();
    }
}
