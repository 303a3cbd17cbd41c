//! Daemon configuration.
//!
//! Everything has a compiled default suitable for a system install;
//! `CONDENSER_*` environment variables override individual fields.

use crate::constants::DEFAULT_API_PORT;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Paths and addresses the control plane operates with.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address of the control API.
    pub api_addr: SocketAddr,
    /// Root directory for per-container state.
    pub container_root: PathBuf,
    /// Cgroup subtree the per-container directories are created under.
    pub cgroup_root: PathBuf,
    /// IPAM state file.
    pub ipam_state_path: PathBuf,
    /// ILM state file.
    pub ilm_state_path: PathBuf,
    /// Root directory for pulled image bundles.
    pub image_root: PathBuf,
    /// Droplet executor binary.
    pub droplet_binary: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
            container_root: PathBuf::from("/var/lib/condenser/containers"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/condenser"),
            ipam_state_path: PathBuf::from("/var/lib/condenser/ipam/state.json"),
            ilm_state_path: PathBuf::from("/var/lib/condenser/ilm/state.json"),
            image_root: PathBuf::from("/var/lib/condenser/images"),
            droplet_binary: PathBuf::from("droplet"),
        }
    }
}

impl Config {
    /// Defaults overridden by `CONDENSER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CONDENSER_API_ADDR") {
            config.api_addr = addr.parse().map_err(|_| Error::Config {
                reason: format!("CONDENSER_API_ADDR is not a socket address: {addr}"),
            })?;
        }
        if let Ok(path) = std::env::var("CONDENSER_CONTAINER_ROOT") {
            config.container_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CONDENSER_CGROUP_ROOT") {
            config.cgroup_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CONDENSER_IPAM_STATE") {
            config.ipam_state_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CONDENSER_ILM_STATE") {
            config.ilm_state_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CONDENSER_IMAGE_ROOT") {
            config.image_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CONDENSER_DROPLET_BIN") {
            config.droplet_binary = PathBuf::from(path);
        }

        Ok(config)
    }

    /// Directory of one container's on-disk state.
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.container_root.join(container_id)
    }

    /// Cgroup directory of one container.
    pub fn cgroup_dir(&self, container_id: &str) -> PathBuf {
        self.cgroup_root.join(container_id)
    }
}
