//! # IPAM: the bridge address ledger
//!
//! Persisted, crash-safe bookkeeping for container IPs and port-forward
//! records. One JSON state file holds the runtime subnet, the discovered
//! host interface, and an ordered list of bridge pools; each pool maps
//! allocated addresses to the owning container.
//!
//! ```text
//! state.json
//! ├── version / runtimeSubnet / hostInterface / hostInterfaceAddr
//! └── pools[]
//!     ├── interface  (bridge, e.g. raind0)
//!     ├── subnet     (10.166.0.0/24)
//!     ├── address    (gateway, 10.166.0.254/24)
//!     └── allocations: ip → { containerId, assignedAt, forwards[] }
//! ```
//!
//! Invariants the store maintains:
//! - network, gateway, and broadcast addresses are never allocated;
//! - each allocated IP belongs to exactly one container;
//! - container ids are unique across all pools;
//! - a container's forward records live inside its allocation entry.
//!
//! Every operation, including the logically read-only queries, runs under
//! the dual-lock discipline of [`crate::statefile`], so cooperating
//! processes sharing the state file always observe a consistent image.

mod alloc;
mod route;
mod store;

pub use alloc::IpamManager;
pub use route::{IpRoute, RouteDiscovery};
pub use store::IpamStore;

use crate::network::ForwardRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Persisted State Model
// =============================================================================

/// Root of the persisted IPAM state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamState {
    /// Schema version of the state file.
    pub version: String,
    /// Subnet reserved for the whole runtime.
    pub runtime_subnet: String,
    /// Host interface carrying the default route.
    pub host_interface: String,
    /// CIDR address of the host interface.
    pub host_interface_addr: String,
    /// Bridge pools, in configuration order.
    #[serde(default)]
    pub pools: Vec<Pool>,
}

/// A bridge-attached subnet and its current allocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Bridge interface this pool serves.
    pub interface: String,
    /// Pool subnet (CIDR).
    pub subnet: String,
    /// Gateway address of the pool (CIDR).
    pub address: String,
    /// Allocated addresses, keyed by dotted-quad IP.
    #[serde(default, deserialize_with = "nullable_map")]
    pub allocations: BTreeMap<String, Allocation>,
}

/// One allocated address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Owning container.
    pub container_id: String,
    /// When the address was handed out.
    pub assigned_at: DateTime<Utc>,
    /// Port-forward records installed for this container.
    #[serde(default, deserialize_with = "nullable_vec")]
    pub forwards: Vec<ForwardRule>,
}

/// Pool summary returned by [`IpamStore::network_list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Bridge interface name.
    pub interface: String,
    /// Gateway address (CIDR).
    pub address: String,
}

/// Location of a container on the bridge network, from
/// [`IpamStore::container_address`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAddress {
    /// Host interface carrying the default route.
    pub host_interface: String,
    /// Bridge the container's pool is attached to.
    pub bridge_interface: String,
    /// The container's allocated IP (no netmask suffix).
    pub address: String,
}

/// Older state files serialize empty maps as `null`; normalize on load.
fn nullable_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, Allocation>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<BTreeMap<String, Allocation>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn nullable_vec<'de, D>(deserializer: D) -> Result<Vec<ForwardRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<Vec<ForwardRule>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}
