//! # ILM: the image layer catalog
//!
//! Persisted index of pulled images, keyed by repository and reference.
//! Each entry records where the image's bundle, config, and extracted
//! rootfs live on disk. The file shares the IPAM store's persistence
//! protocol (dual locking, atomic save) via [`crate::statefile`].

use crate::constants::STATE_VERSION;
use crate::error::{Error, Result};
use crate::fs::{FilesystemHandler, StdFilesystem};
use crate::statefile::StateFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Persisted State Model
// =============================================================================

/// Root of the persisted image catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayerState {
    /// Schema version of the state file.
    pub version: String,
    /// Catalog entries by repository name.
    #[serde(default, deserialize_with = "nullable_repositories")]
    pub repositories: BTreeMap<String, RepositoryInfo>,
}

/// All pulled references of one repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    /// Entries by reference (tag or digest).
    #[serde(default, deserialize_with = "nullable_references")]
    pub references: BTreeMap<String, ReferenceInfo>,
}

/// On-disk locations of one pulled image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceInfo {
    /// Bundle directory of the image.
    pub bundle_path: PathBuf,
    /// OCI image config JSON.
    pub config_path: PathBuf,
    /// Extracted rootfs directory.
    pub rootfs_path: PathBuf,
    /// When the image was stored.
    pub created_at: DateTime<Utc>,
}

fn nullable_repositories<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, RepositoryInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<BTreeMap<String, RepositoryInfo>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn nullable_references<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, ReferenceInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<BTreeMap<String, ReferenceInfo>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

// =============================================================================
// Store
// =============================================================================

/// On-disk image catalog store.
pub struct IlmStore {
    file: StateFile<ImageLayerState>,
}

impl IlmStore {
    /// Store at `path` with the production filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_handlers(path, Arc::new(StdFilesystem))
    }

    /// Store with an injected filesystem handler.
    pub fn with_handlers(path: impl Into<PathBuf>, fs: Arc<dyn FilesystemHandler>) -> Self {
        Self {
            file: StateFile::new(path, fs),
        }
    }

    fn with_lock<R>(&self, mutate: impl FnOnce(&mut ImageLayerState) -> Result<R>) -> Result<R> {
        self.file.with_lock(
            || {
                Ok(ImageLayerState {
                    version: STATE_VERSION.to_string(),
                    repositories: BTreeMap::new(),
                })
            },
            mutate,
        )
    }

    /// Upserts the catalog entry for (repository, reference).
    pub fn store_image(
        &self,
        repository: &str,
        reference: &str,
        bundle_path: PathBuf,
        config_path: PathBuf,
        rootfs_path: PathBuf,
    ) -> Result<()> {
        self.with_lock(|state| {
            let repo = state
                .repositories
                .entry(repository.to_string())
                .or_default();
            repo.references.insert(
                reference.to_string(),
                ReferenceInfo {
                    bundle_path,
                    config_path,
                    rootfs_path,
                    created_at: Utc::now(),
                },
            );
            info!(repository, reference, "image stored");
            Ok(())
        })
    }

    /// Removes the catalog entry for (repository, reference).
    pub fn remove_image(&self, repository: &str, reference: &str) -> Result<()> {
        self.with_lock(|state| {
            let repo = state
                .repositories
                .get_mut(repository)
                .ok_or_else(|| not_found(repository, reference))?;
            repo.references
                .remove(reference)
                .ok_or_else(|| not_found(repository, reference))?;
            info!(repository, reference, "image removed");
            Ok(())
        })
    }

    /// Bundle directory of a pulled image.
    pub fn get_bundle_path(&self, repository: &str, reference: &str) -> Result<PathBuf> {
        self.lookup(repository, reference, |entry| entry.bundle_path.clone())
    }

    /// OCI image config path of a pulled image.
    pub fn get_config_path(&self, repository: &str, reference: &str) -> Result<PathBuf> {
        self.lookup(repository, reference, |entry| entry.config_path.clone())
    }

    /// Extracted rootfs path of a pulled image.
    pub fn get_rootfs_path(&self, repository: &str, reference: &str) -> Result<PathBuf> {
        self.lookup(repository, reference, |entry| entry.rootfs_path.clone())
    }

    fn lookup<R>(
        &self,
        repository: &str,
        reference: &str,
        pick: impl FnOnce(&ReferenceInfo) -> R,
    ) -> Result<R> {
        self.with_lock(|state| {
            state
                .repositories
                .get(repository)
                .and_then(|repo| repo.references.get(reference))
                .map(pick)
                .ok_or_else(|| not_found(repository, reference))
        })
    }
}

fn not_found(repository: &str, reference: &str) -> Error {
    Error::ImageNotFound {
        repository: repository.to_string(),
        reference: reference.to_string(),
    }
}
