//! OCI registry client: pulls images and materializes their bundles.
//!
//! The pull path resolves multi-arch indexes to the requested platform,
//! downloads the config and layer blobs with digest verification, and
//! extracts the gzipped layers in order into
//! `<image_root>/<repository>/<reference>/rootfs`, with the image config
//! stored beside it as `config.json`.
//!
//! Registry authentication (bearer token negotiation against the Docker
//! Hub auth service) is handled by the `oci-distribution` client.

use crate::constants::{
    DEFAULT_REGISTRY, IMAGE_PULL_TIMEOUT, MAX_CONFIG_SIZE, MAX_IMAGE_REF_LEN, MAX_LAYERS,
    MAX_LAYER_SIZE,
};
use crate::error::{Error, Result};
use crate::image::{PulledImage, RegistryHandler};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

/// Registry client writing image bundles under a configured root.
pub struct RegistryClient {
    image_root: PathBuf,
    registry: String,
}

impl RegistryClient {
    /// Client materializing bundles under `image_root`, pulling from the
    /// default registry.
    pub fn new(image_root: impl Into<PathBuf>) -> Self {
        Self {
            image_root: image_root.into(),
            registry: DEFAULT_REGISTRY.to_string(),
        }
    }

    fn reference_for(&self, repository: &str, reference: &str) -> Result<Reference> {
        let raw = if reference.starts_with("sha256:") {
            format!("{}/{}@{}", self.registry, repository, reference)
        } else {
            format!("{}/{}:{}", self.registry, repository, reference)
        };

        if raw.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidImageReference {
                reference: raw,
                reason: format!("exceeds {MAX_IMAGE_REF_LEN} bytes"),
            });
        }

        raw.parse().map_err(|err| Error::InvalidImageReference {
            reference: raw.clone(),
            reason: format!("{err}"),
        })
    }

    fn bundle_dir(&self, repository: &str, reference: &str) -> PathBuf {
        // digest references contain a colon; keep the path component flat
        let reference = reference.replace(':', "-");
        self.image_root.join(repository).join(reference)
    }
}

#[async_trait]
impl RegistryHandler for RegistryClient {
    async fn pull(
        &self,
        repository: &str,
        reference: &str,
        os: &str,
        arch: &str,
    ) -> Result<PulledImage> {
        let image_ref = self.reference_for(repository, reference)?;
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        let auth = RegistryAuth::Anonymous;

        info!(%image_ref, os, arch, "pulling manifest");

        let (manifest, digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            client.pull_manifest(&image_ref, &auth).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {image_ref}"),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|err| Error::Registry {
            reason: format!("pull manifest for {image_ref}: {err}"),
        })?;

        let manifest = resolve_platform(&client, &image_ref, &auth, manifest, os, arch).await?;

        // config blob
        if manifest.config.size as usize > MAX_CONFIG_SIZE {
            return Err(Error::ImageTooLarge {
                size: manifest.config.size as u64,
                limit: MAX_CONFIG_SIZE as u64,
            });
        }
        let config_data = pull_blob(&client, &image_ref, &manifest.config).await?;

        // bundle layout
        let bundle_path = self.bundle_dir(repository, reference);
        let rootfs_path = bundle_path.join("rootfs");
        let config_path = bundle_path.join("config.json");
        std::fs::create_dir_all(&rootfs_path)?;
        std::fs::write(&config_path, &config_data)?;

        // layers, in manifest order
        if manifest.layers.len() > MAX_LAYERS {
            return Err(Error::Registry {
                reason: format!(
                    "too many layers: {} > {MAX_LAYERS}",
                    manifest.layers.len()
                ),
            });
        }
        for layer in &manifest.layers {
            if layer.size as usize > MAX_LAYER_SIZE {
                return Err(Error::ImageTooLarge {
                    size: layer.size as u64,
                    limit: MAX_LAYER_SIZE as u64,
                });
            }
            let data = pull_blob(&client, &image_ref, layer).await?;
            extract_layer(&layer.digest, &data, &rootfs_path)?;
        }

        info!(%image_ref, %digest, layers = manifest.layers.len(), "image pulled");

        Ok(PulledImage {
            bundle_path,
            config_path,
            rootfs_path,
        })
    }
}

/// Resolves an image index to the platform manifest, or passes a plain
/// manifest through.
async fn resolve_platform(
    client: &Client,
    image_ref: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
    os: &str,
    arch: &str,
) -> Result<OciImageManifest> {
    match manifest {
        OciManifest::Image(image) => Ok(image),
        OciManifest::ImageIndex(index) => {
            let matching = index
                .manifests
                .iter()
                .find(|entry| {
                    entry
                        .platform
                        .as_ref()
                        .is_some_and(|p| p.os == os && p.architecture == arch)
                })
                .ok_or_else(|| {
                    let available: Vec<String> = index
                        .manifests
                        .iter()
                        .filter_map(|entry| entry.platform.as_ref())
                        .map(|p| format!("{}/{}", p.os, p.architecture))
                        .collect();
                    Error::Registry {
                        reason: format!(
                            "no manifest for {os}/{arch} in {image_ref}; available: {}",
                            available.join(", ")
                        ),
                    }
                })?;

            let digest_ref: Reference = format!(
                "{}/{}@{}",
                image_ref.registry(),
                image_ref.repository(),
                matching.digest
            )
            .parse()
            .map_err(|err| Error::Registry {
                reason: format!("digest reference for {image_ref}: {err}"),
            })?;

            let (platform_manifest, _) =
                client
                    .pull_manifest(&digest_ref, auth)
                    .await
                    .map_err(|err| Error::Registry {
                        reason: format!("pull platform manifest {digest_ref}: {err}"),
                    })?;

            match platform_manifest {
                OciManifest::Image(image) => Ok(image),
                OciManifest::ImageIndex(_) => Err(Error::Registry {
                    reason: format!("nested image index in {image_ref}"),
                }),
            }
        }
    }
}

/// Downloads one blob with timeout and sha256 verification.
async fn pull_blob(
    client: &Client,
    image_ref: &Reference,
    descriptor: &OciDescriptor,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_blob(image_ref, descriptor, &mut data).await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("pull blob {}", descriptor.digest),
        duration: IMAGE_PULL_TIMEOUT,
    })?
    .map_err(|err| Error::Registry {
        reason: format!("pull blob {}: {err}", descriptor.digest),
    })?;

    verify_digest(&descriptor.digest, &data)?;
    Ok(data)
}

/// Checks blob content against its sha256 descriptor digest.
fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let expected = digest.strip_prefix("sha256:").ok_or_else(|| Error::Registry {
        reason: format!("unsupported digest algorithm: {digest}"),
    })?;

    let computed = hex::encode(Sha256::digest(data));
    if computed != expected {
        return Err(Error::Registry {
            reason: format!("digest mismatch: expected {expected}, computed {computed}"),
        });
    }
    Ok(())
}

/// Extracts one gzipped layer tar into the rootfs, applying whiteouts and
/// rejecting entries that would escape the rootfs.
fn extract_layer(digest: &str, data: &[u8], rootfs: &Path) -> Result<()> {
    debug!(digest, bytes = data.len(), "extracting layer");

    let decoder = GzDecoder::new(data);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries().map_err(|err| Error::Registry {
        reason: format!("layer {digest}: {err}"),
    })? {
        let mut entry = entry.map_err(|err| Error::Registry {
            reason: format!("layer {digest}: {err}"),
        })?;

        let path = entry
            .path()
            .map_err(|err| Error::Registry {
                reason: format!("layer {digest}: {err}"),
            })?
            .into_owned();

        let path_str = path.to_string_lossy();
        if path_str.contains("..") || path_str.starts_with('/') {
            return Err(Error::PathTraversal {
                path: path_str.into_owned(),
            });
        }

        // whiteout entries delete the shadowed path from lower layers
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target) = file_name.strip_prefix(".wh.") {
            let target_path = rootfs
                .join(path.parent().unwrap_or(Path::new("")))
                .join(target);
            if target_path.exists() {
                let _ = std::fs::remove_file(&target_path);
                let _ = std::fs::remove_dir_all(&target_path);
            }
            continue;
        }

        entry.unpack_in(rootfs).map_err(|err| Error::Registry {
            reason: format!("layer {digest} entry {path_str}: {err}"),
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_verify_digest_accepts_matching_content() {
        let data = b"hello world";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        verify_digest(&digest, data).unwrap();
    }

    #[test]
    fn test_verify_digest_rejects_mismatch() {
        let digest = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        assert!(verify_digest(digest, b"actual content").is_err());
    }

    #[test]
    fn test_verify_digest_rejects_other_algorithms() {
        assert!(verify_digest("sha512:abcd", b"data").is_err());
    }

    fn gzipped_tar(build: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_extract_layer_writes_files() {
        let temp = TempDir::new().unwrap();
        let layer = gzipped_tar(|builder| {
            let data = b"#!/bin/sh\n";
            let mut header = tar::Header::new_gnu();
            header.set_path("bin/run.sh").unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
        });

        extract_layer("sha256:test", &layer, temp.path()).unwrap();
        assert!(temp.path().join("bin/run.sh").exists());
    }

    #[test]
    fn test_extract_layer_applies_whiteouts() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("etc/removed.conf"), b"old").unwrap();

        let layer = gzipped_tar(|builder| {
            let mut header = tar::Header::new_gnu();
            header.set_path("etc/.wh.removed.conf").unwrap();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &b""[..]).unwrap();
        });

        extract_layer("sha256:test", &layer, temp.path()).unwrap();
        assert!(!temp.path().join("etc/removed.conf").exists());
    }

    #[test]
    fn test_extract_layer_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let layer = gzipped_tar(|builder| {
            let data = b"evil";
            let mut header = tar::Header::new_gnu();
            let name = b"../escape";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
        });

        let err = extract_layer("sha256:test", &layer, temp.path()).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
    }
}
