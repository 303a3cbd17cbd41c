//! The container lifecycle service.
//!
//! Create turns an image reference plus a create request into a fully
//! formed container: on-disk directory layout, overlay paths, a runtime
//! spec with curl hook commands, a bridge address from IPAM, and any
//! requested port-forward rules. Delete reverses every recorded effect.
//!
//! ```text
//! create:  id → directories → etc files → cgroup → spec (IP alloc)
//!            → forward rules → droplet create
//! delete:  droplet delete → remove forward rules → release IP
//!            → remove directory → remove cgroup
//! ```
//!
//! Steps run strictly in order and the service performs no automatic
//! rollback: if step k fails, the effects of steps before k stay on disk
//! and a later delete of the same id cleans up whatever was installed.

use crate::config::Config;
use crate::constants::{
    CONTAINER_INTERFACE, CONTAINER_NAMESPACES, CONTAINER_NETMASK_SUFFIX, CURL_BINARY,
    DEFAULT_BRIDGE_INTERFACE, DEFAULT_DNS, DEFAULT_POOL_GATEWAY, DIR_MODE, ETC_FILE_MODE,
    HOOK_CONNECT_TIMEOUT_SECS, HOOK_ENDPOINT_PATH, HOOK_MAX_TIME_SECS, HOOK_PORT,
};
use crate::error::{Error, Result};
use crate::fs::FilesystemHandler;
use crate::ilm::IlmStore;
use crate::image::{self, ImageReference};
use crate::ipam::{IpamManager, IpamStore};
use crate::network::{ForwardRule, NetworkHandler};
use crate::runtime::{RuntimeHandler, RuntimeSpec};
use std::sync::{Arc, Mutex};
use tracing::info;
use ulid::Generator;

// =============================================================================
// Request Models
// =============================================================================

/// A decoded container create request.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Docker-style image string.
    pub image: String,
    /// Command override; empty means use the image entrypoint/cmd.
    pub command: Vec<String>,
    /// Port-forward specs, `HOST:CONTAINER[:PROTOCOL]`.
    pub port: Vec<String>,
    /// Bind mount specs, passed to the runtime verbatim.
    pub mount: Vec<String>,
}

// =============================================================================
// Container Service
// =============================================================================

/// Orchestrates the container lifecycle above the droplet executor.
pub struct ContainerService {
    config: Config,
    fs: Arc<dyn FilesystemHandler>,
    runtime: Arc<dyn RuntimeHandler>,
    network: Arc<dyn NetworkHandler>,
    ipam_store: Arc<IpamStore>,
    ipam: IpamManager,
    ilm: Arc<IlmStore>,
    ids: Mutex<Generator>,
}

impl ContainerService {
    /// Service with fully injected adapters.
    pub fn new(
        config: Config,
        fs: Arc<dyn FilesystemHandler>,
        runtime: Arc<dyn RuntimeHandler>,
        network: Arc<dyn NetworkHandler>,
        ipam_store: Arc<IpamStore>,
        ilm: Arc<IlmStore>,
    ) -> Self {
        let ipam = IpamManager::new(Arc::clone(&ipam_store));
        Self {
            config,
            fs,
            runtime,
            network,
            ipam_store,
            ipam,
            ilm,
            ids: Mutex::new(Generator::new()),
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a container and returns its id.
    pub async fn create(&self, request: CreateRequest) -> Result<String> {
        let container_id = self.next_id()?;
        info!(%container_id, image = %request.image, "creating container");

        self.setup_container_directory(&container_id)?;
        self.setup_etc_files(&container_id)?;
        self.setup_cgroup_subtree(&container_id)?;
        self.create_container_spec(&container_id, &request).await?;
        self.setup_forward_rules(&container_id, &request.port).await?;
        self.runtime.create(&container_id).await?;

        info!(%container_id, "container created");
        Ok(container_id)
    }

    /// ULID, monotonic within the process.
    fn next_id(&self) -> Result<String> {
        let mut ids = self.ids.lock().unwrap_or_else(|poison| poison.into_inner());
        ids.generate()
            .map(|ulid| ulid.to_string())
            .map_err(|err| Error::Internal(format!("generate container id: {err}")))
    }

    fn setup_container_directory(&self, container_id: &str) -> Result<()> {
        let container_dir = self.config.container_dir(container_id);
        for dir in ["diff", "work", "merged", "etc"] {
            self.fs.create_dir_all(&container_dir.join(dir), DIR_MODE)?;
        }
        Ok(())
    }

    fn setup_etc_files(&self, container_id: &str) -> Result<()> {
        let etc_dir = self.config.container_dir(container_id).join("etc");

        self.fs.write_file(
            &etc_dir.join("hosts"),
            b"127.0.0.1 localhost\n",
            ETC_FILE_MODE,
        )?;
        self.fs.write_file(
            &etc_dir.join("hostname"),
            format!("{container_id}\n").as_bytes(),
            ETC_FILE_MODE,
        )?;
        self.fs.write_file(
            &etc_dir.join("resolv.conf"),
            format!("nameserver {DEFAULT_DNS}\n").as_bytes(),
            ETC_FILE_MODE,
        )?;
        Ok(())
    }

    fn setup_cgroup_subtree(&self, container_id: &str) -> Result<()> {
        self.fs
            .create_dir_all(&self.config.cgroup_dir(container_id), DIR_MODE)?;
        Ok(())
    }

    async fn create_container_spec(
        &self,
        container_id: &str,
        request: &CreateRequest,
    ) -> Result<()> {
        let image_ref = ImageReference::parse(&request.image)?;
        let config_path = self
            .ilm
            .get_config_path(&image_ref.repository, &image_ref.reference)?;
        let image_config = image::load_image_config(&config_path)?;

        let container_dir = self.config.container_dir(container_id);

        let cwd = if image_config.config.working_dir.is_empty() {
            "/".to_string()
        } else {
            image_config.config.working_dir.clone()
        };

        let command = if request.command.is_empty() {
            build_shell_command(&image_config.config.entrypoint, &image_config.config.cmd)
        } else {
            build_shell_command(&request.command, &[])
        };

        let host_interface = self.ipam_store.default_interface()?;
        let container_interface_addr = format!(
            "{}{}",
            self.ipam.allocate(container_id, DEFAULT_BRIDGE_INTERFACE)?,
            CONTAINER_NETMASK_SUFFIX
        );
        let container_gateway = DEFAULT_POOL_GATEWAY
            .split('/')
            .next()
            .unwrap_or(DEFAULT_POOL_GATEWAY)
            .to_string();

        let image_layer = self
            .ilm
            .get_rootfs_path(&image_ref.repository, &image_ref.reference)?;

        let hook_addr = self.ipam_store.default_interface_addr()?;
        let hook_addr = hook_addr.split('/').next().unwrap_or(&hook_addr).to_string();

        let spec = RuntimeSpec {
            rootfs: container_dir.join("merged"),
            cwd,
            command,
            namespace: CONTAINER_NAMESPACES.iter().map(|ns| ns.to_string()).collect(),
            hostname: container_id.to_string(),
            env: image_config.config.env.clone(),
            mount: request.mount.clone(),
            host_interface,
            bridge_interface: DEFAULT_BRIDGE_INTERFACE.to_string(),
            container_interface: CONTAINER_INTERFACE.to_string(),
            container_interface_addr,
            container_gateway,
            container_dns: vec![DEFAULT_DNS.to_string()],
            image_layer: vec![image_layer],
            upper_dir: container_dir.join("diff"),
            work_dir: container_dir.join("work"),
            create_runtime_hook: vec![hook_command(&hook_addr, "createRuntime")],
            create_container_hook: vec![hook_command(&hook_addr, "createContainer")],
            poststart_hook: vec![hook_command(&hook_addr, "poststart")],
            stop_container_hook: vec![hook_command(&hook_addr, "stopContainer")],
            poststop_hook: vec![hook_command(&hook_addr, "poststop")],
            output: container_dir,
        };

        self.runtime.spec(&spec).await
    }

    async fn setup_forward_rules(&self, container_id: &str, ports: &[String]) -> Result<()> {
        for port in ports {
            let rule: ForwardRule = port.parse()?;
            self.network.create_forwarding_rule(container_id, &rule).await?;
            self.ipam_store.set_forward_info(container_id, rule)?;
        }
        Ok(())
    }

    // =========================================================================
    // Start / Stop / Exec
    // =========================================================================

    /// Starts a created container.
    pub async fn start(&self, container_id: &str, interactive: bool) -> Result<String> {
        self.runtime.start(container_id, interactive).await?;
        info!(container_id, interactive, "container started");
        Ok(container_id.to_string())
    }

    /// Stops a running container.
    pub async fn stop(&self, container_id: &str) -> Result<String> {
        self.runtime.stop(container_id).await?;
        info!(container_id, "container stopped");
        Ok(container_id.to_string())
    }

    /// Runs a command in a running container.
    pub async fn exec(&self, container_id: &str, command: &[String]) -> Result<String> {
        self.runtime.exec(container_id, command).await?;
        Ok(container_id.to_string())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes a container, reversing every recorded create effect.
    pub async fn delete(&self, container_id: &str) -> Result<String> {
        self.runtime.delete(container_id).await?;
        self.cleanup_forward_rules(container_id).await?;
        self.ipam.release(container_id)?;
        self.fs
            .remove_dir_all(&self.config.container_dir(container_id))?;
        self.fs.remove_dir(&self.config.cgroup_dir(container_id))?;

        info!(container_id, "container deleted");
        Ok(container_id.to_string())
    }

    async fn cleanup_forward_rules(&self, container_id: &str) -> Result<()> {
        let forwards = self.ipam_store.forward_info(container_id)?;
        if forwards.is_empty() {
            return Ok(());
        }

        for rule in &forwards {
            self.network.remove_forwarding_rule(container_id, rule).await?;
        }
        info!(container_id, rules = forwards.len(), "forwarding rules removed");
        Ok(())
    }
}

// =============================================================================
// Command Assembly
// =============================================================================

/// Quotes one argv element for `/bin/sh -c`: wrap in single quotes,
/// escaping embedded single quotes as `'\''`. Elements made only of
/// shell-safe characters pass through unquoted.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    let safe = arg.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
    });
    if safe {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Concatenates entrypoint and cmd into the single shell string the
/// runtime executes via `/bin/sh -c`.
pub fn build_shell_command(entrypoint: &[String], cmd: &[String]) -> String {
    entrypoint
        .iter()
        .chain(cmd.iter())
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One hook command: a comma-joined curl argv POSTing the runtime's
/// stdin JSON to the hook endpoint, tagged with the stage name.
fn hook_command(hook_addr: &str, stage: &str) -> String {
    let connect_timeout = HOOK_CONNECT_TIMEOUT_SECS.to_string();
    let max_time = HOOK_MAX_TIME_SECS.to_string();
    let event_header = format!("X-Hook-Event: {stage}");
    let endpoint = format!("http://{hook_addr}:{HOOK_PORT}{HOOK_ENDPOINT_PATH}");

    [
        CURL_BINARY,
        "-sS",
        "-X",
        "POST",
        "--fail-with-body",
        "--connect-timeout",
        connect_timeout.as_str(),
        "--max-time",
        max_time.as_str(),
        "-H",
        "Content-Type: application/json",
        "-H",
        event_header.as_str(),
        "--data-binary",
        "@-",
        endpoint.as_str(),
    ]
    .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_passes_safe_args() {
        assert_eq!(shell_quote("/bin/sh"), "/bin/sh");
        assert_eq!(shell_quote("-c"), "-c");
        assert_eq!(shell_quote("PATH=/usr/bin"), "PATH=/usr/bin");
    }

    #[test]
    fn test_shell_quote_wraps_spaces() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_build_shell_command_joins_entrypoint_and_cmd() {
        let entrypoint = vec!["/bin/sh".to_string(), "-c".to_string()];
        let cmd = vec!["echo hi".to_string()];
        assert_eq!(
            build_shell_command(&entrypoint, &cmd),
            "/bin/sh -c 'echo hi'"
        );
    }

    #[test]
    fn test_hook_command_shape() {
        let command = hook_command("192.168.1.10", "poststart");
        assert!(command.starts_with("/usr/bin/curl,-sS,-X,POST,--fail-with-body"));
        assert!(command.contains(",--connect-timeout,1,--max-time,2,"));
        assert!(command.contains(",-H,X-Hook-Event: poststart,"));
        assert!(command.ends_with(",--data-binary,@-,http://192.168.1.10:7756/v1/hooks/droplet"));
    }
}
