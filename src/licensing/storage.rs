use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::licensing::types::{LicenseError, LocalLicenseRecord};

/// Write `contents` next to `path` and atomically rename it into place.
///
/// Readers see either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LicenseError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| LicenseError::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| LicenseError::Storage(format!("Failed to create temp file: {}", e)))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| LicenseError::Storage(format!("Failed to write temp file: {}", e)))?;
    temp.persist(path)
        .map_err(|e| LicenseError::Storage(format!("Failed to replace {}: {}", path.display(), e)))?;

    Ok(())
}

/// Owner of the on-disk license record
pub struct LicenseStore {
    path: PathBuf,
}

impl LicenseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted record.
    ///
    /// A file that does not parse is quarantined and treated as absent.
    pub fn load(&self) -> Option<LocalLicenseRecord> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read license record");
                return None;
            }
        };

        match serde_json::from_slice::<LocalLicenseRecord>(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                let err = LicenseError::CorruptRecord(e.to_string());
                warn!(path = %self.path.display(), error = %err, "license record unreadable");
                self.quarantine();
                None
            }
        }
    }

    /// Persist a record via temp file + atomic rename
    pub fn save(&self, record: &LocalLicenseRecord) -> Result<(), LicenseError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| LicenseError::Storage(format!("Failed to serialize license record: {}", e)))?;
        write_atomic(&self.path, &json)?;
        debug!(path = %self.path.display(), "license record saved");
        Ok(())
    }

    /// Remove the record. Deleting an absent record succeeds.
    pub fn delete(&self) -> Result<(), LicenseError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "license record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LicenseError::Storage(format!(
                "Failed to delete license record: {}",
                e
            ))),
        }
    }

    /// Path a corrupt record is moved to, e.g. `license.json.corrupt-20260101T000000Z`
    pub fn quarantine_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{}", stamp));
        self.path.with_file_name(name)
    }

    fn quarantine(&self) {
        let target = self.quarantine_path();
        match std::fs::rename(&self.path, &target) {
            Ok(()) => warn!(quarantined = %target.display(), "corrupt license record quarantined"),
            Err(e) => error!(path = %self.path.display(), error = %e, "failed to quarantine license record"),
        }
    }
}
