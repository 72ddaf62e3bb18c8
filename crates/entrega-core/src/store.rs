use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{BusinessHours, ConsumerConfig};
use crate::error::{StoreError, StoreResult};

const DOCUMENT_VERSION: &str = "1.0.0";

/// The subset of a consumer configuration that survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    pub saved_at: DateTime<Utc>,
}

impl PersistedConfig {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            webhook_url: config.webhook_url.clone(),
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms,
            business_hours: config.business_hours,
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: String,
    last_updated: DateTime<Utc>,
    queues: BTreeMap<String, PersistedConfig>,
}

impl StoreDocument {
    fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION.to_string(),
            last_updated: Utc::now(),
            queues: BTreeMap::new(),
        }
    }
}

/// Store metadata for the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub path: String,
    pub queue_count: usize,
    pub last_updated: DateTime<Utc>,
    pub version: String,
}

/// Durable mapping `queue name -> persisted consumer config`, backed by a
/// single JSON document. Every mutation rewrites the whole document through
/// a same-directory temp file and an atomic rename; there are no partial
/// writes for a crash to expose.
pub struct ConfigStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles across concurrent callers.
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, name: &str, config: &ConsumerConfig) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.queues
            .insert(name.to_string(), PersistedConfig::from_config(config));
        self.write_document(&mut doc).await?;
        debug!(queue = name, "persisted consumer config");
        Ok(())
    }

    /// Remove a stored config. Returns whether an entry existed.
    pub async fn remove(&self, name: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        let existed = doc.queues.remove(name).is_some();
        if existed {
            self.write_document(&mut doc).await?;
            debug!(queue = name, "removed persisted consumer config");
        }
        Ok(existed)
    }

    pub async fn load(&self, name: &str) -> StoreResult<Option<PersistedConfig>> {
        let doc = self.read_document().await?;
        Ok(doc.queues.get(name).cloned())
    }

    pub async fn load_all(&self) -> StoreResult<BTreeMap<String, PersistedConfig>> {
        Ok(self.read_document().await?.queues)
    }

    pub async fn has(&self, name: &str) -> StoreResult<bool> {
        Ok(self.read_document().await?.queues.contains_key(name))
    }

    pub async fn clear(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.queues.clear();
        self.write_document(&mut doc).await?;
        info!("cleared all persisted consumer configs");
        Ok(())
    }

    /// Copy the current document to `target` (default
    /// `<store>.backup.<epoch>.json`). Returns the backup path.
    pub async fn backup(&self, target: Option<PathBuf>) -> StoreResult<PathBuf> {
        let _guard = self.write_lock.lock().await;
        // Materialise the document first so a backup of a never-written store
        // produces a valid empty document.
        let doc = self.read_document().await?;

        let target = target.unwrap_or_else(|| {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(format!(".backup.{}.json", Utc::now().timestamp()));
            PathBuf::from(name)
        });

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let contents = serde_json::to_vec_pretty(&doc)?;
        tokio::fs::write(&target, contents).await?;
        info!(path = %target.display(), "wrote config backup");
        Ok(target)
    }

    /// Replace the store contents with the document at `path`. The top-level
    /// `queues` object is validated to be map-typed before anything is
    /// overwritten. Returns the restored queue names.
    pub async fn restore(&self, path: &Path) -> StoreResult<Vec<String>> {
        let _guard = self.write_lock.lock().await;
        let contents = tokio::fs::read(path).await?;

        let raw: serde_json::Value = serde_json::from_slice(&contents)?;
        if !raw.get("queues").map(|q| q.is_object()).unwrap_or(false) {
            return Err(StoreError::InvalidDocument(
                "top-level `queues` object missing or not a map".to_string(),
            ));
        }

        let mut doc: StoreDocument = serde_json::from_value(raw)?;
        let names: Vec<String> = doc.queues.keys().cloned().collect();
        self.write_document(&mut doc).await?;
        info!(count = names.len(), source = %path.display(), "restored configs from backup");
        Ok(names)
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let doc = self.read_document().await?;
        Ok(StoreStats {
            path: self.path.display().to_string(),
            queue_count: doc.queues.len(),
            last_updated: doc.last_updated,
            version: doc.version,
        })
    }

    /// Read the document, creating the parent directory and an empty
    /// document on first use.
    async fn read_document(&self) -> StoreResult<StoreDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                let doc = StoreDocument::empty();
                let contents = serde_json::to_vec_pretty(&doc)?;
                tokio::fs::write(&self.path, contents).await?;
                debug!(path = %self.path.display(), "initialised empty config store");
                Ok(doc)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_document(&self, doc: &mut StoreDocument) -> StoreResult<()> {
        doc.last_updated = Utc::now();
        let contents = serde_json::to_vec_pretty(doc)?;

        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
