//! The droplet runtime adapter.
//!
//! The control plane never manipulates namespaces or mounts itself; it
//! hands a [`RuntimeSpec`] to the droplet executor and drives the OCI
//! lifecycle through the [`RuntimeHandler`] trait. [`DropletCli`] is the
//! production adapter, shelling out to the `droplet` binary; tests use
//! recording mocks.
//!
//! The spec document is serialized camelCase because its JSON shape is
//! the droplet executor's input format, hook command arrays included:
//! each hook is a single comma-joined curl argv, preserved literally.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Runtime Spec
// =============================================================================

/// The runtime specification handed to the droplet executor.
///
/// Field order and names follow the executor's expected `config.json`
/// input; every path is absolute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Overlay mount target serving as the container root.
    pub rootfs: PathBuf,
    /// Working directory of the container process.
    pub cwd: String,
    /// Single shell string executed via `/bin/sh -c`.
    pub command: String,
    /// Namespaces to unshare.
    pub namespace: Vec<String>,
    /// Container hostname (the container id).
    pub hostname: String,
    /// Environment, `KEY=value` entries.
    pub env: Vec<String>,
    /// Bind mounts requested at create.
    pub mount: Vec<String>,
    /// Host interface carrying the default route.
    pub host_interface: String,
    /// Bridge the container attaches to.
    pub bridge_interface: String,
    /// Interface name inside the container.
    pub container_interface: String,
    /// Container address in CIDR form.
    pub container_interface_addr: String,
    /// Container default gateway (no netmask suffix).
    pub container_gateway: String,
    /// DNS servers for resolv.conf handling.
    pub container_dns: Vec<String>,
    /// Image layer directories (overlay lowerdirs, bottom first).
    pub image_layer: Vec<PathBuf>,
    /// Overlay upper directory.
    pub upper_dir: PathBuf,
    /// Overlay work directory.
    pub work_dir: PathBuf,
    /// createRuntime hook commands.
    pub create_runtime_hook: Vec<String>,
    /// createContainer hook commands.
    pub create_container_hook: Vec<String>,
    /// poststart hook commands.
    pub poststart_hook: Vec<String>,
    /// stopContainer hook commands.
    pub stop_container_hook: Vec<String>,
    /// poststop hook commands.
    pub poststop_hook: Vec<String>,
    /// Directory the executor writes `config.json` into.
    pub output: PathBuf,
}

// =============================================================================
// Runtime Adapter
// =============================================================================

/// OCI lifecycle operations on the droplet executor.
///
/// `spec` materializes `config.json`; the remaining operations block
/// until the executor has completed the corresponding OCI stage,
/// including its hook callbacks.
#[async_trait]
pub trait RuntimeHandler: Send + Sync {
    /// Writes the runtime spec into the spec's output directory.
    async fn spec(&self, spec: &RuntimeSpec) -> Result<()>;

    /// Creates runtime state and runs createRuntime/createContainer hooks.
    async fn create(&self, container_id: &str) -> Result<()>;

    /// Starts the container process; `interactive` selects TTY attach.
    async fn start(&self, container_id: &str, interactive: bool) -> Result<()>;

    /// Stops the container.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Deletes runtime state and runs the poststop hook.
    async fn delete(&self, container_id: &str) -> Result<()>;

    /// Runs a command inside the container.
    async fn exec(&self, container_id: &str, command: &[String]) -> Result<()>;
}

// =============================================================================
// Droplet CLI Adapter
// =============================================================================

/// Production adapter shelling out to the `droplet` binary.
pub struct DropletCli {
    binary: PathBuf,
}

impl DropletCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs one droplet subcommand, optionally feeding stdin, and maps a
    /// non-zero exit into a runtime error carrying stderr.
    async fn run(&self, args: &[&str], stdin: Option<Vec<u8>>) -> Result<()> {
        debug!(binary = %self.binary.display(), ?args, "invoking droplet");

        let mut command = Command::new(&self.binary);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| Error::Runtime {
            reason: format!("spawn {}: {err}", self.binary.display()),
        })?;

        if let Some(data) = stdin {
            let mut pipe = child.stdin.take().ok_or_else(|| Error::Runtime {
                reason: "droplet stdin unavailable".to_string(),
            })?;
            pipe.write_all(&data).await.map_err(|err| Error::Runtime {
                reason: format!("write droplet stdin: {err}"),
            })?;
        }

        let output = child.wait_with_output().await.map_err(|err| Error::Runtime {
            reason: format!("wait for droplet: {err}"),
        })?;

        if !output.status.success() {
            return Err(Error::Runtime {
                reason: format!(
                    "droplet {} failed: {}",
                    args.first().copied().unwrap_or(""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeHandler for DropletCli {
    async fn spec(&self, spec: &RuntimeSpec) -> Result<()> {
        let payload =
            serde_json::to_vec(spec).map_err(|err| Error::Serialization(err.to_string()))?;
        let bundle = spec.output.display().to_string();
        self.run(&["spec", "--bundle", &bundle], Some(payload)).await
    }

    async fn create(&self, container_id: &str) -> Result<()> {
        self.run(&["create", container_id], None).await
    }

    async fn start(&self, container_id: &str, interactive: bool) -> Result<()> {
        if interactive {
            self.run(&["start", "--interactive", container_id], None).await
        } else {
            self.run(&["start", container_id], None).await
        }
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.run(&["stop", container_id], None).await
    }

    async fn delete(&self, container_id: &str) -> Result<()> {
        self.run(&["delete", container_id], None).await
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<()> {
        let mut args = vec!["exec", container_id, "--"];
        args.extend(command.iter().map(String::as_str));
        self.run(&args, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = RuntimeSpec {
            rootfs: PathBuf::from("/var/lib/condenser/containers/abc/merged"),
            container_interface_addr: "10.166.0.1/24".to_string(),
            create_runtime_hook: vec!["curl,-sS".to_string()],
            ..Default::default()
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            json["rootfs"],
            "/var/lib/condenser/containers/abc/merged"
        );
        assert_eq!(json["containerInterfaceAddr"], "10.166.0.1/24");
        assert_eq!(json["createRuntimeHook"][0], "curl,-sS");
        assert!(json.get("container_interface_addr").is_none());
    }

    #[tokio::test]
    async fn test_droplet_failure_carries_stderr() {
        // `false` exits non-zero with empty stderr; the error still names
        // the subcommand
        let cli = DropletCli::new("false");
        let err = cli.create("abc").await.unwrap_err();
        match err {
            Error::Runtime { reason } => assert!(reason.contains("create")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_runtime_error() {
        let cli = DropletCli::new("/nonexistent/droplet");
        assert!(matches!(
            cli.stop("abc").await,
            Err(Error::Runtime { .. })
        ));
    }
}
