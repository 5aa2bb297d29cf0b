use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::licensing::config::{EntitlementConfig, Endpoints};
use crate::licensing::manager::EntitlementCore;
use crate::licensing::types::{HardwareIdentity, LicenseError};

/// Change event pushed by the authority for this device's license
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FeedEvent {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub identity: Option<HardwareIdentity>,
}

impl FeedEvent {
    /// An explicit revocation, or any record not positively marked active
    pub fn is_revocation(&self) -> bool {
        self.status.as_deref() == Some("revoked") || self.active != Some(true)
    }

    pub fn reason(&self) -> String {
        match self.status.as_deref() {
            Some("revoked") => "license revoked".to_string(),
            Some(status) => format!("license {}", status),
            None => "license inactive".to_string(),
        }
    }
}

/// Parse one line of the feed stream. Accepts bare JSON, SSE `data:` lines
/// and row-change envelopes carrying the record under `new` or `record`.
pub fn parse_feed_line(line: &str) -> Option<FeedEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);

    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "ignoring unparsable feed line");
            return None;
        }
    };
    let record = ["new", "record"]
        .iter()
        .find_map(|field| value.get(*field).filter(|v| v.is_object()))
        .cloned()
        .unwrap_or(value);

    serde_json::from_value(record).ok()
}

/// Long-lived, identity-filtered subscription to license changes
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, identity: &HardwareIdentity) -> Result<mpsc::Receiver<FeedEvent>, LicenseError>;
}

/// Streaming HTTP feed (newline-delimited JSON or server-sent events)
pub struct HttpChangeFeed {
    client: reqwest::Client,
    endpoints: Endpoints,
    api_key: Option<String>,
}

impl HttpChangeFeed {
    pub fn new(config: &EntitlementConfig) -> Result<Self, LicenseError> {
        // No overall timeout: the stream stays open for the process lifetime
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| LicenseError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: config.endpoints(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn subscribe(&self, identity: &HardwareIdentity) -> Result<mpsc::Receiver<FeedEvent>, LicenseError> {
        let mut request = self
            .client
            .get(self.endpoints.license_feed())
            .query(&[("identity", identity.as_str())])
            .header("Accept", "application/x-ndjson, text/event-stream");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key).header("apikey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LicenseError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LicenseError::Network(format!(
                "feed subscription returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(forward_lines(response, tx));
        Ok(rx)
    }
}

/// Longest feed line accepted before the stream is dropped
pub const MAX_FEED_LINE_BYTES: usize = 64 * 1024;

/// Raw byte stream behind a feed subscription
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, or None once the stream has ended
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        match self.chunk().await {
            Ok(chunk) => chunk.map(|bytes| bytes.to_vec()),
            Err(e) => {
                debug!(error = %e, "feed stream interrupted");
                None
            }
        }
    }
}

/// Split `source` into lines and forward parsed events until the stream ends,
/// a line outgrows the limit, or the subscriber goes away. Returning drops
/// `source`, which closes the underlying connection.
pub async fn forward_lines<S: ChunkSource>(mut source: S, tx: mpsc::Sender<FeedEvent>) {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => {
                debug!("feed subscriber gone, closing stream");
                return;
            }
            chunk = source.next_chunk() => chunk,
        };
        let Some(chunk) = chunk else {
            return;
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if let Some(event) = parse_feed_line(&String::from_utf8_lossy(&line)) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        if buffer.len() > MAX_FEED_LINE_BYTES {
            warn!(buffered = buffer.len(), "feed line exceeds limit, dropping stream");
            return;
        }
    }
}

/// Owns the single revocation subscription task
#[derive(Default)]
pub struct RevocationListener {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RevocationListener {
    /// Start listening, tearing down any earlier subscription first
    pub(crate) fn listen(&self, core: Arc<EntitlementCore>, feed: Arc<dyn ChangeFeed>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = handle.take() {
            debug!("tearing down previous revocation subscription");
            previous.abort();
        }
        *handle = Some(tokio::spawn(run(core, feed)));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

async fn run(core: Arc<EntitlementCore>, feed: Arc<dyn ChangeFeed>) {
    let retry = core.config.listener_retry();

    loop {
        let identity = core.identity.resolve();
        if identity.is_unknown() {
            debug!("identity unresolved, revocation subscription deferred");
            tokio::time::sleep(retry).await;
            continue;
        }

        match feed.subscribe(&identity).await {
            Ok(mut events) => {
                info!(identity = %identity, "revocation feed subscribed");
                while let Some(event) = events.recv().await {
                    handle_event(&core, &identity, &event);
                }
                warn!("revocation feed closed, resubscribing");
            }
            Err(e) => warn!(error = %e, "revocation feed subscription failed"),
        }

        tokio::time::sleep(retry).await;
    }
}

fn handle_event(core: &EntitlementCore, identity: &HardwareIdentity, event: &FeedEvent) {
    if let Some(target) = &event.identity {
        if target != identity {
            debug!(target = %target, "feed event for another device ignored");
            return;
        }
    }

    if event.is_revocation() {
        core.revoke(&event.reason());
    } else {
        debug!(status = ?event.status, "license change does not revoke");
    }
}
