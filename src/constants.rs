//! Constants for the control plane.
//!
//! Network defaults, hook wiring, limits, and file modes are defined here
//! to keep magic values out of the rest of the codebase.

use std::time::Duration;

// =============================================================================
// Network Defaults
// =============================================================================

/// Subnet reserved for the whole runtime (all bridge pools carve from it).
pub const DEFAULT_RUNTIME_SUBNET: &str = "10.166.0.0/16";

/// Default bridge interface containers attach to.
pub const DEFAULT_BRIDGE_INTERFACE: &str = "raind0";

/// Subnet of the default bridge pool.
pub const DEFAULT_POOL_SUBNET: &str = "10.166.0.0/24";

/// Gateway address (CIDR form) of the default bridge pool.
pub const DEFAULT_POOL_GATEWAY: &str = "10.166.0.254/24";

/// Interface name inside every container.
pub const CONTAINER_INTERFACE: &str = "eth0";

/// Netmask suffix appended to allocated container addresses.
pub const CONTAINER_NETMASK_SUFFIX: &str = "/24";

/// Default DNS server handed to containers.
pub const DEFAULT_DNS: &str = "8.8.8.8";

// =============================================================================
// Hook Wiring
// =============================================================================

/// Port the hook endpoint listens on (bound to the host interface).
pub const HOOK_PORT: u16 = 7756;

/// Path of the droplet hook endpoint.
pub const HOOK_ENDPOINT_PATH: &str = "/v1/hooks/droplet";

/// Header carrying the OCI lifecycle stage name.
pub const HOOK_EVENT_HEADER: &str = "X-Hook-Event";

/// Maximum accepted hook body size (1 MiB).
pub const MAX_HOOK_BODY: usize = 1024 * 1024;

/// curl binary invoked from inside the container for hook callbacks.
pub const CURL_BINARY: &str = "/usr/bin/curl";

/// Hook curl connect timeout (seconds, `--connect-timeout`).
pub const HOOK_CONNECT_TIMEOUT_SECS: u64 = 1;

/// Hook curl total deadline (seconds, `--max-time`).
pub const HOOK_MAX_TIME_SECS: u64 = 2;

// =============================================================================
// Runtime Spec
// =============================================================================

/// Namespaces every container is created with.
pub const CONTAINER_NAMESPACES: [&str; 7] =
    ["mount", "network", "uts", "pid", "ipc", "user", "cgroup"];

// =============================================================================
// Control API
// =============================================================================

/// Default port of the control API.
pub const DEFAULT_API_PORT: u16 = 7755;

// =============================================================================
// Persisted State
// =============================================================================

/// Version stamped into freshly created state files.
pub const STATE_VERSION: &str = "0.1.0";

/// Mode for container/cgroup directories.
pub const DIR_MODE: u32 = 0o755;

/// Mode for persisted state files, lock files, and temp files.
pub const STATE_FILE_MODE: u32 = 0o600;

/// Mode for generated etc files.
pub const ETC_FILE_MODE: u32 = 0o644;

// =============================================================================
// Registry Limits
// =============================================================================

/// Default registry host for unqualified image references.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum size of a single OCI layer (512 MiB).
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum OCI image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;
