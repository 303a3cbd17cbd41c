//! Error types for the control plane.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Image reference with an empty repository slot.
    #[error("empty repository in image reference '{reference}'")]
    EmptyRepository { reference: String },

    /// Malformed image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Port string that does not match `HOST:CONTAINER[:PROTOCOL]`.
    #[error("port format failed: {spec}")]
    PortFormat { spec: String },

    /// Hook callback with an unrecognized `X-Hook-Event` value.
    #[error("unknown hook event: {event}")]
    UnknownHookEvent { event: String },

    /// Hook callback whose state document cannot be used.
    #[error("invalid hook state: {reason}")]
    InvalidHookState { reason: String },

    /// Daemon configuration that cannot be applied.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Pool exists but lacks a subnet or gateway.
    #[error("ipam not configured")]
    IpamNotConfigured,

    /// No pool matches the requested bridge interface.
    #[error("target bridge not configured: {bridge}")]
    BridgeNotConfigured { bridge: String },

    /// Every host address in the pool subnet is taken.
    #[error("no free ip in subnet {subnet}")]
    NoFreeIp { subnet: String },

    /// Release for a container id with no allocation.
    #[error("allocation not found for container {container_id}")]
    AllocationNotFound { container_id: String },

    /// Store field queried before it was configured.
    #[error("{what} is not configured")]
    NotConfigured { what: String },

    /// `ip -4 route show default` produced no usable route.
    #[error("no default route found (ipv4)")]
    NoDefaultRoute,

    /// Interface carries no IPv4 address.
    #[error("no ipv4 address found for {interface}")]
    NoAddress { interface: String },

    /// CIDR string that does not parse as IPv4 network.
    #[error("invalid cidr: {cidr}")]
    InvalidCidr { cidr: String },

    /// Image catalog has no entry for (repository, reference).
    #[error("image not found: {repository}:{reference}")]
    ImageNotFound {
        repository: String,
        reference: String,
    },

    /// Container id unknown to the queried subsystem.
    #[error("container not found: {container_id}")]
    ContainerNotFound { container_id: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// State file exists but is not valid JSON for its schema.
    #[error("state json broken at {path}: {reason}")]
    StateJsonBroken { path: PathBuf, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Adapter Errors
    // =========================================================================
    /// Error surfaced by the droplet runtime.
    #[error("runtime error: {reason}")]
    Runtime { reason: String },

    /// Error surfaced by the network adapter.
    #[error("network error: {reason}")]
    Network { reason: String },

    /// Error surfaced by the registry client.
    #[error("registry error: {reason}")]
    Registry { reason: String },

    /// Image or layer exceeds a configured size limit.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by the caller's input; the HTTP layer maps
    /// these to 400 and everything else to 500.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyRepository { .. }
                | Self::InvalidImageReference { .. }
                | Self::PortFormat { .. }
                | Self::UnknownHookEvent { .. }
                | Self::InvalidHookState { .. }
        )
    }
}
