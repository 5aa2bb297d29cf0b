use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::licensing::types::HardwareIdentity;

/// Lowercase hex SHA-256 of the trimmed key. Audit rows never carry the key itself.
pub fn key_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.trim().as_bytes()))
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Activation,
    ValidationDenial,
}

/// One audit row, written locally and mirrored to the authority
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub key_hash: String,
    pub identity: HardwareIdentity,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        key: &str,
        identity: &HardwareIdentity,
        outcome: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            at: Utc::now(),
            kind,
            key_hash: key_hash(key),
            identity: identity.clone(),
            outcome: outcome.into(),
            detail,
        }
    }
}

/// Append-only JSON-lines log. Writes are best-effort.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &AuditEntry) {
        let result = serde_json::to_string(entry)
            .map_err(std::io::Error::other)
            .and_then(|line| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                writeln!(file, "{}", line)
            });

        if let Err(e) = result {
            debug!(path = %self.path.display(), error = %e, "audit append skipped");
        }
    }

    /// Entries currently in the log; unreadable lines are skipped
    pub fn entries(&self) -> Vec<AuditEntry> {
        std::fs::read_to_string(&self.path)
            .map(|contents| {
                contents
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_is_stable_hex() {
        let hash = key_hash(" VENDO-AAAA-BBBB \n");
        assert_eq!(hash, key_hash("VENDO-AAAA-BBBB"));
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("VENDO"));
        assert_eq!(
            key_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_log_appends_without_plaintext_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit").join("validation-audit.log"));
        let identity = HardwareIdentity::new("SN-1");
        log.append(&AuditEntry::new(AuditKind::ValidationDenial, "SECRET-KEY", &identity, "revoked", None));
        log.append(&AuditEntry::new(AuditKind::ValidationDenial, "SECRET-KEY", &identity, "expired", None));

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].outcome, "expired");
        let raw = std::fs::read_to_string(dir.path().join("audit").join("validation-audit.log")).unwrap();
        assert!(!raw.contains("SECRET-KEY"));
    }
}
