//! Image references, OCI image configs, and the image service.
//!
//! The reference grammar follows the docker-style shorthand:
//!
//! ```text
//! ubuntu                -> library/ubuntu:latest
//! ubuntu:24.04          -> library/ubuntu:24.04
//! library/ubuntu:24.04  -> library/ubuntu:24.04
//! nginx@sha256:...      -> library/nginx@sha256:...
//! ```
//!
//! An `@` takes precedence and splits into `repo@digest`; otherwise a
//! single `:` splits into `repo:tag` with the tag defaulting to `latest`.

use crate::error::{Error, Result};
use crate::ilm::IlmStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Image Reference
// =============================================================================

/// A parsed image reference: repository plus tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository, always namespaced (bare names get `library/`).
    pub repository: String,
    /// Tag or `sha256:...` digest.
    pub reference: String,
}

impl ImageReference {
    /// Parses a docker-style image string. Fails with an empty-repository
    /// error when the repository slot is empty.
    pub fn parse(image: &str) -> Result<Self> {
        let (repo, reference) = if let Some((repo, digest)) = image.split_once('@') {
            (repo, digest.to_string())
        } else {
            match image.split_once(':') {
                Some((repo, tag)) if !tag.is_empty() => (repo, tag.to_string()),
                Some((repo, _)) => (repo, "latest".to_string()),
                None => (image, "latest".to_string()),
            }
        };

        if repo.is_empty() {
            return Err(Error::EmptyRepository {
                reference: image.to_string(),
            });
        }

        let repository = if repo.contains('/') {
            repo.to_string()
        } else {
            format!("library/{repo}")
        };

        Ok(Self {
            repository,
            reference,
        })
    }

    /// True when the reference is a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.starts_with("sha256:")
    }
}

// =============================================================================
// OCI Image Config
// =============================================================================

/// The OCI image config document, reduced to the fields the spec
/// builder consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    /// Execution parameters recorded by the image build.
    #[serde(default, rename = "config")]
    pub config: ImageRuntimeConfig,
    /// Target operating system.
    #[serde(default)]
    pub os: String,
    /// Target architecture.
    #[serde(default)]
    pub architecture: String,
}

/// The `config` object inside an OCI image config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageRuntimeConfig {
    /// Environment, `KEY=value` entries.
    #[serde(default, rename = "Env")]
    pub env: Vec<String>,
    /// Entrypoint argv.
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Vec<String>,
    /// Default command argv.
    #[serde(default, rename = "Cmd")]
    pub cmd: Vec<String>,
    /// Working directory.
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: String,
}

/// Reads and parses an OCI image config JSON from disk.
pub fn load_image_config(path: &Path) -> Result<ImageConfig> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| Error::StateJsonBroken {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

// =============================================================================
// Registry Seam
// =============================================================================

/// Where a pulled image landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    /// Bundle directory.
    pub bundle_path: PathBuf,
    /// OCI image config JSON.
    pub config_path: PathBuf,
    /// Extracted rootfs directory.
    pub rootfs_path: PathBuf,
}

/// Registry adapter: downloads an image and materializes its bundle.
#[async_trait]
pub trait RegistryHandler: Send + Sync {
    /// Pulls (repository, reference) for the given platform and returns
    /// the on-disk locations of the materialized image.
    async fn pull(
        &self,
        repository: &str,
        reference: &str,
        os: &str,
        arch: &str,
    ) -> Result<PulledImage>;
}

// =============================================================================
// Image Service
// =============================================================================

/// Pull request delivered by the HTTP front.
#[derive(Debug, Clone)]
pub struct PullRequest {
    /// Docker-style image string.
    pub image: String,
    /// Target OS; defaults to `linux`.
    pub os: Option<String>,
    /// Target architecture; defaults to the host's.
    pub arch: Option<String>,
}

/// Image lifecycle: pull into the catalog, remove from it.
pub struct ImageService {
    registry: Arc<dyn RegistryHandler>,
    ilm: Arc<IlmStore>,
}

impl ImageService {
    pub fn new(registry: Arc<dyn RegistryHandler>, ilm: Arc<IlmStore>) -> Self {
        Self { registry, ilm }
    }

    /// Pulls an image and records it in the catalog.
    pub async fn pull(&self, request: PullRequest) -> Result<()> {
        let image_ref = ImageReference::parse(&request.image)?;
        let os = request.os.as_deref().unwrap_or("linux");
        let arch = request.arch.as_deref().unwrap_or(host_arch());

        info!(
            repository = %image_ref.repository,
            reference = %image_ref.reference,
            os,
            arch,
            "pulling image"
        );

        let pulled = self
            .registry
            .pull(&image_ref.repository, &image_ref.reference, os, arch)
            .await?;

        self.ilm.store_image(
            &image_ref.repository,
            &image_ref.reference,
            pulled.bundle_path,
            pulled.config_path,
            pulled.rootfs_path,
        )
    }

    /// Drops an image from the catalog.
    pub async fn remove(&self, image: &str) -> Result<()> {
        let image_ref = ImageReference::parse(image)?;
        self.ilm
            .remove_image(&image_ref.repository, &image_ref.reference)
    }
}

/// Host architecture in OCI platform vocabulary.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let parsed = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(parsed.repository, "library/ubuntu");
        assert_eq!(parsed.reference, "latest");
    }

    #[test]
    fn test_parse_name_with_tag() {
        let parsed = ImageReference::parse("ubuntu:24.04").unwrap();
        assert_eq!(parsed.repository, "library/ubuntu");
        assert_eq!(parsed.reference, "24.04");
    }

    #[test]
    fn test_parse_namespaced_preserved() {
        let parsed = ImageReference::parse("myorg/app:v1").unwrap();
        assert_eq!(parsed.repository, "myorg/app");
        assert_eq!(parsed.reference, "v1");
    }

    #[test]
    fn test_parse_digest_reference() {
        let parsed = ImageReference::parse("nginx@sha256:abcd").unwrap();
        assert_eq!(parsed.repository, "library/nginx");
        assert_eq!(parsed.reference, "sha256:abcd");
        assert!(parsed.is_digest());
    }

    #[test]
    fn test_parse_empty_repository_fails() {
        assert!(matches!(
            ImageReference::parse(":tag"),
            Err(Error::EmptyRepository { .. })
        ));
        assert!(matches!(
            ImageReference::parse("@sha256:abcd"),
            Err(Error::EmptyRepository { .. })
        ));
    }

    #[test]
    fn test_parse_trailing_colon_defaults_latest() {
        let parsed = ImageReference::parse("ubuntu:").unwrap();
        assert_eq!(parsed.reference, "latest");
    }

    #[test]
    fn test_image_config_capitalized_fields() {
        let raw = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Entrypoint": ["/bin/sh", "-c"],
                "Cmd": ["echo hi"],
                "WorkingDir": "/app"
            }
        }"#;

        let config: ImageConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.config.entrypoint, vec!["/bin/sh", "-c"]);
        assert_eq!(config.config.cmd, vec!["echo hi"]);
        assert_eq!(config.config.working_dir, "/app");
        assert_eq!(config.config.env, vec!["PATH=/usr/bin"]);
    }
}
