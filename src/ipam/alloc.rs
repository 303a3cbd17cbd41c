//! Address allocation over the IPAM store.

use super::{Allocation, IpamStore};
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

/// Allocates and releases container addresses on bridge pools.
pub struct IpamManager {
    store: Arc<IpamStore>,
}

impl IpamManager {
    pub fn new(store: Arc<IpamStore>) -> Self {
        Self { store }
    }

    /// Reserves the first free address in the pool attached to `bridge`
    /// and records it against `container_id`. Returns the dotted-quad IP.
    pub fn allocate(&self, container_id: &str, bridge: &str) -> Result<String> {
        let container_id = container_id.to_string();
        let bridge = bridge.to_string();

        self.store.with_lock(move |state| {
            for pool in &mut state.pools {
                if pool.interface != bridge {
                    continue;
                }
                if pool.subnet.is_empty() || pool.address.is_empty() {
                    return Err(Error::IpamNotConfigured);
                }

                let subnet = parse_cidr(&pool.subnet)?;
                let (gateway, _) = parse_cidr(&pool.address)?;
                let next = find_free_ipv4(subnet, gateway, &pool.allocations)?;

                let ip = next.to_string();
                pool.allocations.insert(
                    ip.clone(),
                    Allocation {
                        container_id: container_id.clone(),
                        assigned_at: Utc::now(),
                        forwards: Vec::new(),
                    },
                );

                info!(%container_id, %bridge, %ip, "address allocated");
                return Ok(ip);
            }
            Err(Error::BridgeNotConfigured { bridge })
        })
    }

    /// Removes the allocation owned by `container_id`, searching every
    /// pool. Exactly one entry is removed.
    pub fn release(&self, container_id: &str) -> Result<()> {
        let container_id = container_id.to_string();

        self.store.with_lock(move |state| {
            for pool in &mut state.pools {
                let found = pool
                    .allocations
                    .iter()
                    .find(|(_, alloc)| alloc.container_id == container_id)
                    .map(|(ip, _)| ip.clone());
                if let Some(ip) = found {
                    pool.allocations.remove(&ip);
                    info!(%container_id, %ip, "address released");
                    return Ok(());
                }
            }
            Err(Error::AllocationNotFound { container_id })
        })
    }
}

// =============================================================================
// IPv4 Math
// =============================================================================

/// Parses `a.b.c.d/len` into the address and its network mask.
pub(crate) fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32)> {
    let invalid = || Error::InvalidCidr { cidr: cidr.into() };

    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    Ok((addr, mask))
}

/// First address of the subnet not reserved and not in `allocations`.
///
/// The scan starts at network+1 and walks at most the subnet's host count,
/// skipping the network, gateway, and broadcast addresses. A cursor that
/// leaves the subnet wraps back to network+1.
fn find_free_ipv4(
    subnet: (Ipv4Addr, u32),
    gateway: Ipv4Addr,
    allocations: &BTreeMap<String, Allocation>,
) -> Result<Ipv4Addr> {
    let (addr, mask) = subnet;
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    let gateway = u32::from(gateway);

    let start = network.wrapping_add(1);
    let host_count = u64::from(!mask) + 1;

    let mut cursor = start;
    for _ in 0..host_count {
        if cursor & mask != network {
            cursor = start;
        }
        if cursor == network || cursor == gateway || cursor == broadcast {
            cursor = cursor.wrapping_add(1);
            continue;
        }
        let candidate = Ipv4Addr::from(cursor);
        if !allocations.contains_key(&candidate.to_string()) {
            return Ok(candidate);
        }
        cursor = cursor.wrapping_add(1);
    }

    Err(Error::NoFreeIp {
        subnet: format!("{}/{}", Ipv4Addr::from(network), mask.count_ones()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alloc_for(id: &str) -> Allocation {
        Allocation {
            container_id: id.to_string(),
            assigned_at: Utc::now(),
            forwards: Vec::new(),
        }
    }

    fn subnet_24() -> (Ipv4Addr, u32) {
        parse_cidr("10.166.0.0/24").unwrap()
    }

    #[test]
    fn test_parse_cidr() {
        let (addr, mask) = parse_cidr("10.166.0.254/24").unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 166, 0, 254));
        assert_eq!(mask, 0xffff_ff00);

        assert!(parse_cidr("10.166.0.0").is_err());
        assert!(parse_cidr("10.166.0.0/33").is_err());
        assert!(parse_cidr("banana/24").is_err());
    }

    #[test]
    fn test_first_free_is_network_plus_one() {
        let free = find_free_ipv4(
            subnet_24(),
            Ipv4Addr::new(10, 166, 0, 254),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(free, Ipv4Addr::new(10, 166, 0, 1));
    }

    #[test]
    fn test_skips_allocated_addresses() {
        let mut allocations = BTreeMap::new();
        allocations.insert("10.166.0.1".to_string(), alloc_for("c1"));
        allocations.insert("10.166.0.2".to_string(), alloc_for("c2"));

        let free = find_free_ipv4(subnet_24(), Ipv4Addr::new(10, 166, 0, 254), &allocations)
            .unwrap();
        assert_eq!(free, Ipv4Addr::new(10, 166, 0, 3));
    }

    #[test]
    fn test_never_returns_gateway_or_broadcast() {
        let mut allocations = BTreeMap::new();
        for host in 1..=252u8 {
            allocations.insert(
                Ipv4Addr::new(10, 166, 0, host).to_string(),
                alloc_for(&format!("c{host}")),
            );
        }

        // .253 is the only remaining host address: .254 is the gateway,
        // .255 the broadcast, .0 the network
        let free = find_free_ipv4(subnet_24(), Ipv4Addr::new(10, 166, 0, 254), &allocations)
            .unwrap();
        assert_eq!(free, Ipv4Addr::new(10, 166, 0, 253));

        allocations.insert("10.166.0.253".to_string(), alloc_for("c253"));
        let err = find_free_ipv4(subnet_24(), Ipv4Addr::new(10, 166, 0, 254), &allocations)
            .unwrap_err();
        assert!(matches!(err, Error::NoFreeIp { .. }));
    }

    #[test]
    fn test_scan_is_bounded_by_host_count() {
        // a /30 has exactly one usable host once gateway is reserved
        let subnet = parse_cidr("10.0.0.0/30").unwrap();
        let gateway = Ipv4Addr::new(10, 0, 0, 2);

        let free = find_free_ipv4(subnet, gateway, &BTreeMap::new()).unwrap();
        assert_eq!(free, Ipv4Addr::new(10, 0, 0, 1));

        let mut allocations = BTreeMap::new();
        allocations.insert("10.0.0.1".to_string(), alloc_for("only"));
        assert!(find_free_ipv4(subnet, gateway, &allocations).is_err());
    }
}
