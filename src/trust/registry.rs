//! Configured notaries.
//!
//! Records are kept one JSON file per notary in a directory so they can be
//! inspected and edited by hand. Queries never see a half-updated registry:
//! each mutation builds a new list and swaps the shared snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::bundle::{parse_bundle, NotaryRecord};
use super::error::BundleError;

/// Fetches bundle documents for background refresh.
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    /// Fetch the raw bundle bytes published at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BundleError>;
}

/// Outcome of one refresh pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// Names of records replaced with a fresh bundle.
    pub refreshed: Vec<String>,
    /// Names of records whose refresh failed; the old record was kept.
    pub failed: Vec<String>,
}

/// The set of configured notaries.
#[derive(Debug)]
pub struct NotaryRegistry {
    directory: Option<PathBuf>,
    records: RwLock<Arc<Vec<NotaryRecord>>>,
}

impl NotaryRegistry {
    /// Load every `*.json` record in `directory`, creating it if missing.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn load<P: AsRef<Path>>(directory: P) -> Result<Self, BundleError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory).map_err(|e| BundleError::Io {
            path: directory.clone(),
            source: e,
        })?;

        let entries = std::fs::read_dir(&directory).map_err(|e| BundleError::Io {
            path: directory.clone(),
            source: e,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(|e| BundleError::Io {
                    path: path.clone(),
                    source: e,
                })
                .and_then(|bytes| Ok(serde_json::from_slice::<NotaryRecord>(&bytes)?))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping notary record {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Loaded {} notary record(s) from {:?}", records.len(), directory);

        Ok(Self {
            directory: Some(directory),
            records: RwLock::new(Arc::new(records)),
        })
    }

    /// A registry that is never persisted (for testing).
    pub fn in_memory(records: Vec<NotaryRecord>) -> Self {
        Self {
            directory: None,
            records: RwLock::new(Arc::new(records)),
        }
    }

    /// Immutable view of the current records.
    pub fn snapshot(&self) -> Arc<Vec<NotaryRecord>> {
        self.records.read().unwrap().clone()
    }

    /// Current records (cloned).
    pub fn list(&self) -> Vec<NotaryRecord> {
        self.snapshot().as_ref().clone()
    }

    /// Whether `host:port` belongs to any configured notary, enabled or not.
    pub fn is_notary_endpoint(&self, host: &str, port: u16) -> bool {
        self.snapshot().iter().any(|r| r.serves(host, port))
    }

    /// Parse and add a bundle, replacing any record with the same name.
    pub fn import_bundle(&self, bytes: &[u8]) -> Result<NotaryRecord, BundleError> {
        let record = parse_bundle(bytes)?;
        self.import(record.clone())?;
        Ok(record)
    }

    /// Add a record, replacing any record with the same name.
    pub fn import(&self, record: NotaryRecord) -> Result<(), BundleError> {
        self.persist(&record)?;
        info!(
            "Imported notary '{}' with {} host(s)",
            record.name,
            record.notaries.len()
        );
        self.update(|records| {
            records.retain(|r| r.name != record.name);
            records.push(record);
            records.sort_by(|a, b| a.name.cmp(&b.name));
        });
        Ok(())
    }

    /// Enable or disable a notary.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), BundleError> {
        let mut record = self
            .snapshot()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| BundleError::NotFound(name.to_string()))?;
        record.enabled = enabled;
        self.persist(&record)?;
        self.update(|records| {
            if let Some(existing) = records.iter_mut().find(|r| r.name == name) {
                existing.enabled = enabled;
            }
        });
        Ok(())
    }

    /// Remove a notary.
    pub fn remove(&self, name: &str) -> Result<(), BundleError> {
        if !self.snapshot().iter().any(|r| r.name == name) {
            return Err(BundleError::NotFound(name.to_string()));
        }
        if let Some(path) = self.record_path(name) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BundleError::Io { path, source: e }),
            }
        }
        self.update(|records| records.retain(|r| r.name != name));
        info!("Removed notary '{}'", name);
        Ok(())
    }

    /// Re-fetch every record that has a bundle location.
    ///
    /// A refreshed record keeps its `enabled` flag. Any failure leaves the
    /// old record in place.
    pub async fn refresh(&self, fetcher: &dyn BundleFetcher) -> RefreshReport {
        let mut report = RefreshReport::default();

        for record in self.snapshot().iter() {
            let Some(url) = record.bundle_location.as_deref() else {
                continue;
            };

            let fetched = match fetcher.fetch(url).await {
                Ok(bytes) => parse_bundle(&bytes),
                Err(e) => Err(e),
            };

            let outcome = fetched.and_then(|mut fresh| {
                fresh.enabled = record.enabled;
                if fresh.name != record.name {
                    debug!("Bundle for '{}' renamed to '{}'", record.name, fresh.name);
                    fresh.name = record.name.clone();
                }
                self.import(fresh)
            });

            match outcome {
                Ok(()) => report.refreshed.push(record.name.clone()),
                Err(e) => {
                    warn!("Failed to refresh notary '{}': {}", record.name, e);
                    report.failed.push(record.name.clone());
                }
            }
        }

        report
    }

    fn update(&self, mutate: impl FnOnce(&mut Vec<NotaryRecord>)) {
        let mut guard = self.records.write().unwrap();
        let mut next = guard.as_ref().clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    fn persist(&self, record: &NotaryRecord) -> Result<(), BundleError> {
        let Some(path) = self.record_path(&record.name) else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&path, json).map_err(|e| BundleError::Io { path, source: e })
    }

    fn record_path(&self, name: &str) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", file_stem(name))))
    }
}

/// Longest readable prefix kept in a record file name.
const STEM_PREFIX_LEN: usize = 32;

/// Filesystem-safe stem for a notary name.
///
/// A readable prefix followed by the SHA-256 of the full name, so distinct
/// names never share a file.
fn file_stem(name: &str) -> String {
    let readable: String = name
        .chars()
        .take(STEM_PREFIX_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", readable, hex::encode(Sha256::digest(name.as_bytes())))
}
