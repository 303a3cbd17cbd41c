//! The persisted IPAM store.

use super::{ContainerAddress, IpamState, NetworkInfo, Pool, RouteDiscovery};
use crate::constants::{
    DEFAULT_BRIDGE_INTERFACE, DEFAULT_POOL_GATEWAY, DEFAULT_POOL_SUBNET, DEFAULT_RUNTIME_SUBNET,
    STATE_VERSION,
};
use crate::error::{Error, Result};
use crate::fs::{FilesystemHandler, StdFilesystem};
use crate::ipam::IpRoute;
use crate::network::ForwardRule;
use crate::statefile::StateFile;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// On-disk ledger of bridge pools, container addresses, and forward
/// records. See the module docs for the state layout and invariants.
pub struct IpamStore {
    file: StateFile<IpamState>,
    discovery: Arc<dyn RouteDiscovery>,
}

impl IpamStore {
    /// Store at `path` with production filesystem and route discovery.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_handlers(path, Arc::new(StdFilesystem), Arc::new(IpRoute))
    }

    /// Store with injected filesystem and discovery handlers.
    pub fn with_handlers(
        path: impl Into<PathBuf>,
        fs: Arc<dyn FilesystemHandler>,
        discovery: Arc<dyn RouteDiscovery>,
    ) -> Self {
        Self {
            file: StateFile::new(path, fs),
            discovery,
        }
    }

    /// Runs `mutate` under the full persistence discipline. Missing state
    /// files bootstrap a default configuration, which consults route
    /// discovery for the host interface.
    pub(crate) fn with_lock<R>(&self, mutate: impl FnOnce(&mut IpamState) -> Result<R>) -> Result<R> {
        self.file
            .with_lock(|| self.bootstrap_state(), mutate)
    }

    fn bootstrap_state(&self) -> Result<IpamState> {
        let host_interface = self.discovery.default_interface()?;
        let host_interface_addr = self.discovery.interface_address(&host_interface)?;

        info!(%host_interface, %host_interface_addr, "initializing ipam state");

        Ok(IpamState {
            version: STATE_VERSION.to_string(),
            runtime_subnet: DEFAULT_RUNTIME_SUBNET.to_string(),
            host_interface,
            host_interface_addr,
            pools: vec![Pool {
                interface: DEFAULT_BRIDGE_INTERFACE.to_string(),
                subnet: DEFAULT_POOL_SUBNET.to_string(),
                address: DEFAULT_POOL_GATEWAY.to_string(),
                allocations: BTreeMap::new(),
            }],
        })
    }

    /// Re-runs route discovery and rewrites the base configuration. The
    /// default pool is appended only when no pools exist yet; allocations
    /// are never touched.
    pub fn set_config(&self) -> Result<()> {
        let host_interface = self.discovery.default_interface()?;
        let host_interface_addr = self.discovery.interface_address(&host_interface)?;

        self.with_lock(|state| {
            state.version = STATE_VERSION.to_string();
            state.runtime_subnet = DEFAULT_RUNTIME_SUBNET.to_string();
            state.host_interface = host_interface.clone();
            state.host_interface_addr = host_interface_addr.clone();
            if state.pools.is_empty() {
                state.pools.push(Pool {
                    interface: DEFAULT_BRIDGE_INTERFACE.to_string(),
                    subnet: DEFAULT_POOL_SUBNET.to_string(),
                    address: DEFAULT_POOL_GATEWAY.to_string(),
                    allocations: BTreeMap::new(),
                });
            }
            Ok(())
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All configured pools as (interface, gateway) pairs.
    pub fn network_list(&self) -> Result<Vec<NetworkInfo>> {
        self.with_lock(|state| {
            let list: Vec<NetworkInfo> = state
                .pools
                .iter()
                .map(|pool| NetworkInfo {
                    interface: pool.interface.clone(),
                    address: pool.address.clone(),
                })
                .collect();
            if list.is_empty() {
                return Err(Error::NotConfigured {
                    what: "network".to_string(),
                });
            }
            Ok(list)
        })
    }

    /// The runtime-wide subnet.
    pub fn runtime_subnet(&self) -> Result<String> {
        self.with_lock(|state| {
            if state.runtime_subnet.is_empty() {
                return Err(Error::NotConfigured {
                    what: "runtime subnet".to_string(),
                });
            }
            Ok(state.runtime_subnet.clone())
        })
    }

    /// The host interface carrying the default route.
    pub fn default_interface(&self) -> Result<String> {
        self.with_lock(|state| {
            if state.host_interface.is_empty() {
                return Err(Error::NotConfigured {
                    what: "default interface".to_string(),
                });
            }
            Ok(state.host_interface.clone())
        })
    }

    /// CIDR address of the host interface.
    pub fn default_interface_addr(&self) -> Result<String> {
        self.with_lock(|state| {
            if state.host_interface_addr.is_empty() {
                return Err(Error::NotConfigured {
                    what: "default interface address".to_string(),
                });
            }
            Ok(state.host_interface_addr.clone())
        })
    }

    /// Where a container sits on the bridge network.
    pub fn container_address(&self, container_id: &str) -> Result<ContainerAddress> {
        self.with_lock(|state| {
            for pool in &state.pools {
                for (address, allocation) in &pool.allocations {
                    if allocation.container_id == container_id {
                        return Ok(ContainerAddress {
                            host_interface: state.host_interface.clone(),
                            bridge_interface: pool.interface.clone(),
                            address: address.clone(),
                        });
                    }
                }
            }
            Err(Error::ContainerNotFound {
                container_id: container_id.to_string(),
            })
        })
    }

    /// Appends a forward record to the container's allocation entry.
    pub fn set_forward_info(&self, container_id: &str, rule: ForwardRule) -> Result<()> {
        self.with_lock(|state| {
            for pool in &mut state.pools {
                for allocation in pool.allocations.values_mut() {
                    if allocation.container_id == container_id {
                        allocation.forwards.push(rule);
                        return Ok(());
                    }
                }
            }
            Err(Error::ContainerNotFound {
                container_id: container_id.to_string(),
            })
        })
    }

    /// All forward records for a container. Empty when the container has
    /// no allocation or no forwards.
    pub fn forward_info(&self, container_id: &str) -> Result<Vec<ForwardRule>> {
        self.with_lock(|state| {
            let mut forwards = Vec::new();
            for pool in &state.pools {
                for allocation in pool.allocations.values() {
                    if allocation.container_id == container_id {
                        forwards.extend(allocation.forwards.iter().copied());
                    }
                }
            }
            Ok(forwards)
        })
    }
}
