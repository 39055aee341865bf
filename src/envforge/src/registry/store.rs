//! Persisted environment records
//!
//! Single writer for environment state. Every mutation is written to disk
//! (temp file, fsync, rename) before the in-memory copy changes.

use super::locks::NameLocks;
use super::state::EnvironmentState;
use crate::artifact::VerifiedArtifact;
use crate::bridge::{BackendControl, BackendError};
use crate::common::{BridgeError, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Longest accepted environment name
pub const MAX_NAME_LEN: usize = 64;

/// A named, provisioned instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub state: EnvironmentState,
    pub storage_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_artifact_digest: String,
    pub source_artifact_url: String,
    /// Login user, set once configuration finalizes
    #[serde(default)]
    pub default_user: Option<String>,
}

impl Environment {
    pub fn is_ready(&self) -> bool {
        self.state == EnvironmentState::Ready
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Environment already exists: {0}")]
    AlreadyExists(String),

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Invalid environment name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid transition for '{name}': {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Environment '{name}' is not ready for update (state: {state})")]
    NotReadyForUpdate { name: String, state: String },

    #[error("Backend teardown of '{name}' failed (exit {exit_code}): {message}")]
    Teardown {
        name: String,
        exit_code: i32,
        message: String,
    },

    #[error("Backend error: {0}")]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Failed to persist record {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode record for '{name}': {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Check an environment name: 1-64 of `[A-Za-z0-9._-]`, not starting with `.` or `-`.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 64 characters"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("must not start with '.' or '-'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(invalid("only letters, digits, '.', '-' and '_' are allowed"));
    }
    Ok(())
}

fn key_for(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Registry of environment records, backed by `<root>/<name>.json` files.
pub struct EnvironmentRegistry {
    root: PathBuf,
    records: RwLock<HashMap<String, Environment>>,
    locks: NameLocks,
    backend: Arc<BackendControl>,
}

impl EnvironmentRegistry {
    /// Open the registry, loading every readable record under `root`.
    pub fn open(root: PathBuf, backend: Arc<BackendControl>) -> Result<Self, RegistryError> {
        std::fs::create_dir_all(&root).map_err(|e| RegistryError::Persistence {
            path: root.clone(),
            source: e,
        })?;

        let records = load_records(&root);
        tracing::info!(
            "[Registry] Opened {:?} ({} environment record(s))",
            root,
            records.len()
        );

        Ok(Self {
            root,
            records: RwLock::new(records),
            locks: NameLocks::new(),
            backend,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.records.read().await.contains_key(&key_for(name))
    }

    pub async fn get(&self, name: &str) -> Option<Environment> {
        self.records.read().await.get(&key_for(name)).cloned()
    }

    /// All records, sorted by name
    pub async fn list(&self) -> Vec<Environment> {
        let mut all: Vec<Environment> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Create a record in `ArtifactVerified`. Never overwrites.
    pub async fn create(
        &self,
        name: &str,
        storage_path: PathBuf,
        artifact: &VerifiedArtifact,
    ) -> Result<Environment, RegistryError> {
        validate_name(name)?;
        let key = key_for(name);
        let _guard = self.locks.lock(&key).await;

        if self.records.read().await.contains_key(&key) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }

        let now = Utc::now();
        let record = Environment {
            name: name.to_string(),
            state: EnvironmentState::ArtifactVerified,
            storage_path,
            created_at: now,
            updated_at: now,
            source_artifact_digest: artifact.digest().to_string(),
            source_artifact_url: artifact.url().to_string(),
            default_user: None,
        };

        self.persist(&key, &record).await?;
        self.records.write().await.insert(key, record.clone());
        tracing::info!("[Registry] Created environment '{}'", name);
        Ok(record)
    }

    /// Tear down the backend instance, then drop the record.
    ///
    /// The record is kept if the backend reports failure, including a failed
    /// listing: without it there is no telling whether an instance is alive.
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let key = key_for(name);
        let _guard = self.locks.lock(&key).await;

        let record = self.records.read().await.get(&key).cloned();
        let in_backend = self.backend.contains(name).await?;

        if record.is_none() && !in_backend {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        if in_backend {
            let result = self.backend.unregister(name).await?;
            if !result.success() {
                tracing::error!(
                    "[Registry] Teardown of '{}' failed (exit {}): {}",
                    name,
                    result.exit_code,
                    result.last_line()
                );
                return Err(RegistryError::Teardown {
                    name: name.to_string(),
                    exit_code: result.exit_code,
                    message: result.last_line().to_string(),
                });
            }
        } else {
            tracing::warn!(
                "[Registry] '{}' has a record but no backend instance, dropping record",
                name
            );
        }

        let path = self.record_path(&key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RegistryError::Persistence { path, source: e }),
        }
        self.records.write().await.remove(&key);

        if let Some(record) = record {
            // Only succeeds when the backend left the directory empty.
            let _ = tokio::fs::remove_dir(&record.storage_path).await;
        }

        tracing::info!("[Registry] Removed environment '{}'", name);
        Ok(())
    }

    /// Move a record to `new_state` if the transition is allowed.
    pub async fn set_state(
        &self,
        name: &str,
        new_state: EnvironmentState,
    ) -> Result<Environment, RegistryError> {
        self.update(name, |record| {
            if !record.state.can_transition_to(&new_state) {
                return Err(RegistryError::InvalidTransition {
                    name: record.name.clone(),
                    from: record.state.to_string(),
                    to: new_state.to_string(),
                });
            }
            record.state = new_state;
            Ok(())
        })
        .await
    }

    /// Terminal failure attributed to `stage`.
    pub async fn fail(
        &self,
        name: &str,
        stage: Stage,
        reason: impl Into<String>,
    ) -> Result<Environment, RegistryError> {
        self.set_state(
            name,
            EnvironmentState::Failed {
                stage,
                reason: reason.into(),
            },
        )
        .await
    }

    /// `Configuring -> Ready`, recording the default user in the same write.
    pub async fn mark_ready(
        &self,
        name: &str,
        default_user: &str,
    ) -> Result<Environment, RegistryError> {
        self.update(name, |record| {
            if !record.state.can_transition_to(&EnvironmentState::Ready) {
                return Err(RegistryError::InvalidTransition {
                    name: record.name.clone(),
                    from: record.state.to_string(),
                    to: EnvironmentState::Ready.to_string(),
                });
            }
            record.state = EnvironmentState::Ready;
            record.default_user = Some(default_user.to_string());
            Ok(())
        })
        .await
    }

    /// Start a new run at `Bootstrapping` for an existing environment.
    pub async fn begin_update(&self, name: &str) -> Result<Environment, RegistryError> {
        self.update(name, |record| {
            if !record.state.is_update_eligible() {
                return Err(RegistryError::NotReadyForUpdate {
                    name: record.name.clone(),
                    state: record.state.to_string(),
                });
            }
            record.state = EnvironmentState::Bootstrapping;
            Ok(())
        })
        .await
    }

    async fn update<F>(&self, name: &str, mutate: F) -> Result<Environment, RegistryError>
    where
        F: FnOnce(&mut Environment) -> Result<(), RegistryError>,
    {
        let key = key_for(name);
        let _guard = self.locks.lock(&key).await;

        let mut record = self
            .records
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let previous = record.state.clone();
        mutate(&mut record)?;
        record.updated_at = Utc::now();

        self.persist(&key, &record).await?;
        self.records.write().await.insert(key, record.clone());
        tracing::info!(
            "[Registry] '{}': {} -> {}",
            record.name,
            previous,
            record.state
        );
        Ok(record)
    }

    async fn persist(&self, key: &str, record: &Environment) -> Result<(), RegistryError> {
        let path = self.record_path(key);
        let data = serde_json::to_vec_pretty(record).map_err(|e| RegistryError::Encode {
            name: record.name.clone(),
            source: e,
        })?;
        write_atomic(&path, &data)
            .await
            .map_err(|e| RegistryError::Persistence { path, source: e })
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let temp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp_path, path).await
}

fn load_records(root: &Path) -> HashMap<String, Environment> {
    let mut records = HashMap::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("[Registry] Failed to read {:?}: {}", root, e);
            return records;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("[Registry] Failed to read {:?}: {}", path, e);
                continue;
            }
        };

        match serde_json::from_str::<Environment>(&content) {
            Ok(record) => {
                records.insert(key_for(&record.name), record);
            }
            Err(e) => {
                tracing::warn!("[Registry] Skipping unreadable record {:?}: {}", path, e);
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["dev", "Ubuntu-24.04", "work_env", "a"] {
            validate_name(name).unwrap();
        }
    }

    #[test]
    fn rejects_bad_names() {
        let too_long = "x".repeat(MAX_NAME_LEN + 1);
        for name in ["", ".hidden", "-flag", "has space", "../escape", too_long.as_str()] {
            assert!(
                matches!(validate_name(name), Err(RegistryError::InvalidName { .. })),
                "{:?} should be rejected",
                name
            );
        }
    }
}
