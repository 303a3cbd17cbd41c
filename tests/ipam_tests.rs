//! Tests for the IPAM store and allocator.
//!
//! Covers first-fit allocation, reserved addresses, the persisted state
//! invariants, crash-safety of the atomic save, and cross-store
//! concurrency over one shared state file.

use condenser::fs::StdFilesystem;
use condenser::ipam::{IpamManager, IpamState, IpamStore, RouteDiscovery};
use condenser::{Error, ForwardRule, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Discovery stub so store tests never shell out to `ip`.
struct FixedRoute;

impl RouteDiscovery for FixedRoute {
    fn default_interface(&self) -> Result<String> {
        Ok("eth0".to_string())
    }

    fn interface_address(&self, _interface: &str) -> Result<String> {
        Ok("192.168.1.10/24".to_string())
    }
}

fn state_path(temp: &TempDir) -> PathBuf {
    temp.path().join("ipam").join("state.json")
}

fn store_at(path: PathBuf) -> Arc<IpamStore> {
    Arc::new(IpamStore::with_handlers(
        path,
        Arc::new(StdFilesystem),
        Arc::new(FixedRoute),
    ))
}

fn load_state(path: &PathBuf) -> IpamState {
    let raw = std::fs::read(path).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

// =============================================================================
// Bootstrap
// =============================================================================

#[test]
fn test_first_use_bootstraps_default_state() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());

    let subnet = store.runtime_subnet().unwrap();
    assert_eq!(subnet, "10.166.0.0/16");

    let state = load_state(&path);
    assert_eq!(state.version, "0.1.0");
    assert_eq!(state.host_interface, "eth0");
    assert_eq!(state.host_interface_addr, "192.168.1.10/24");
    assert_eq!(state.pools.len(), 1);
    assert_eq!(state.pools[0].interface, "raind0");
    assert_eq!(state.pools[0].subnet, "10.166.0.0/24");
    assert_eq!(state.pools[0].address, "10.166.0.254/24");
    assert!(state.pools[0].allocations.is_empty());
}

#[test]
fn test_state_file_mode_is_0600() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());
    store.runtime_subnet().unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_queries_report_configured_values() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));

    assert_eq!(store.default_interface().unwrap(), "eth0");
    assert_eq!(store.default_interface_addr().unwrap(), "192.168.1.10/24");

    let networks = store.network_list().unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].interface, "raind0");
    assert_eq!(networks[0].address, "10.166.0.254/24");
}

// =============================================================================
// Allocation
// =============================================================================

#[test]
fn test_allocate_first_addresses_in_order() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));
    let manager = IpamManager::new(Arc::clone(&store));

    assert_eq!(manager.allocate("c1", "raind0").unwrap(), "10.166.0.1");
    assert_eq!(manager.allocate("c2", "raind0").unwrap(), "10.166.0.2");
}

#[test]
fn test_allocate_unknown_bridge_fails() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));
    let manager = IpamManager::new(store);

    assert!(matches!(
        manager.allocate("c1", "raind9"),
        Err(Error::BridgeNotConfigured { .. })
    ));
}

#[test]
fn test_pool_exhaustion_reports_no_free_ip() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));
    let manager = IpamManager::new(Arc::clone(&store));

    // .1 through .253 are the usable hosts: .0 network, .254 gateway,
    // .255 broadcast
    for n in 1..=253 {
        let ip = manager.allocate(&format!("c{n}"), "raind0").unwrap();
        assert_eq!(ip, format!("10.166.0.{n}"));
    }

    assert!(matches!(
        manager.allocate("c254", "raind0"),
        Err(Error::NoFreeIp { .. })
    ));
}

#[test]
fn test_allocations_satisfy_state_invariants() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());
    let manager = IpamManager::new(Arc::clone(&store));

    for n in 0..40 {
        manager.allocate(&format!("c{n}"), "raind0").unwrap();
    }

    let state = load_state(&path);
    let pool = &state.pools[0];

    let mut ips = HashSet::new();
    let mut containers = HashSet::new();
    for (ip, allocation) in &pool.allocations {
        // in-subnet, none of the reserved addresses
        assert!(ip.starts_with("10.166.0."), "ip {ip} outside pool subnet");
        assert_ne!(ip, "10.166.0.0");
        assert_ne!(ip, "10.166.0.254");
        assert_ne!(ip, "10.166.0.255");
        // unique ip, unique owner
        assert!(ips.insert(ip.clone()), "duplicate ip {ip}");
        assert!(
            containers.insert(allocation.container_id.clone()),
            "duplicate container {}",
            allocation.container_id
        );
    }
}

// =============================================================================
// Release
// =============================================================================

#[test]
fn test_release_restores_prior_allocations() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());
    let manager = IpamManager::new(Arc::clone(&store));

    manager.allocate("keep", "raind0").unwrap();
    let before: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

    manager.allocate("scratch", "raind0").unwrap();
    manager.release("scratch").unwrap();

    let after: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_release_unknown_container_fails() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));
    let manager = IpamManager::new(store);

    assert!(matches!(
        manager.release("ghost"),
        Err(Error::AllocationNotFound { .. })
    ));
}

#[test]
fn test_released_address_is_reused() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));
    let manager = IpamManager::new(Arc::clone(&store));

    assert_eq!(manager.allocate("a", "raind0").unwrap(), "10.166.0.1");
    assert_eq!(manager.allocate("b", "raind0").unwrap(), "10.166.0.2");
    manager.release("a").unwrap();
    assert_eq!(manager.allocate("c", "raind0").unwrap(), "10.166.0.1");
}

// =============================================================================
// Forward Records
// =============================================================================

#[test]
fn test_forward_records_live_in_allocation() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());
    let manager = IpamManager::new(Arc::clone(&store));

    manager.allocate("web", "raind0").unwrap();
    let rule: ForwardRule = "8080:80".parse().unwrap();
    store.set_forward_info("web", rule).unwrap();

    assert_eq!(store.forward_info("web").unwrap(), vec![rule]);

    let state = load_state(&path);
    let allocation = state.pools[0].allocations.get("10.166.0.1").unwrap();
    assert_eq!(allocation.container_id, "web");
    assert_eq!(allocation.forwards, vec![rule]);
}

#[test]
fn test_forward_record_requires_allocation() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));

    let rule: ForwardRule = "8080:80".parse().unwrap();
    assert!(matches!(
        store.set_forward_info("ghost", rule),
        Err(Error::ContainerNotFound { .. })
    ));
    assert!(store.forward_info("ghost").unwrap().is_empty());
}

#[test]
fn test_container_address_lookup() {
    let temp = TempDir::new().unwrap();
    let store = store_at(state_path(&temp));
    let manager = IpamManager::new(Arc::clone(&store));

    manager.allocate("web", "raind0").unwrap();
    let location = store.container_address("web").unwrap();
    assert_eq!(location.host_interface, "eth0");
    assert_eq!(location.bridge_interface, "raind0");
    assert_eq!(location.address, "10.166.0.1");

    assert!(matches!(
        store.container_address("ghost"),
        Err(Error::ContainerNotFound { .. })
    ));
}

// =============================================================================
// Persistence Protocol
// =============================================================================

#[test]
fn test_load_noop_save_roundtrip_normalizes_null_maps() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        r#"{
  "version": "0.1.0",
  "runtimeSubnet": "10.166.0.0/16",
  "hostInterface": "eth0",
  "hostInterfaceAddr": "192.168.1.10/24",
  "pools": [
    {"interface": "raind0", "subnet": "10.166.0.0/24",
     "address": "10.166.0.254/24", "allocations": null}
  ]
}"#,
    )
    .unwrap();

    let original = load_state(&path);
    let store = store_at(path.clone());
    store.runtime_subnet().unwrap(); // read-only query still rewrites

    let saved: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(saved, serde_json::to_value(&original).unwrap());
    assert_eq!(saved["pools"][0]["allocations"], serde_json::json!({}));
}

#[test]
fn test_set_config_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());

    store.set_config().unwrap();
    let first: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

    store.set_config().unwrap();
    let second: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_broken_state_file_is_surfaced() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"{definitely not json").unwrap();

    let store = store_at(path);
    assert!(matches!(
        store.runtime_subnet(),
        Err(Error::StateJsonBroken { .. })
    ));
}

#[test]
fn test_concurrent_allocation_yields_distinct_ips() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);

    // two store instances simulate two cooperating processes: they share
    // the state file and the flock, not the in-process mutex
    let stores = [store_at(path.clone()), store_at(path)];

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = Arc::clone(&stores[worker % 2]);
        handles.push(std::thread::spawn(move || {
            let manager = IpamManager::new(store);
            manager.allocate(&format!("c{worker}"), "raind0").unwrap()
        }));
    }

    let ips: HashSet<String> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(ips.len(), 8, "concurrent allocations must not collide");
}

#[test]
fn test_readers_never_observe_partial_saves() {
    let temp = TempDir::new().unwrap();
    let path = state_path(&temp);
    let store = store_at(path.clone());
    store.set_config().unwrap();

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            let manager = IpamManager::new(store);
            for n in 0..50 {
                manager.allocate(&format!("w{n}"), "raind0").unwrap();
            }
        })
    };

    // a concurrent reader must always see a complete pre- or post-image
    let mut last_count = 0usize;
    while !writer.is_finished() {
        let raw = std::fs::read(&path).unwrap();
        let state: IpamState =
            serde_json::from_slice(&raw).expect("reader saw a torn state file");
        let count = state.pools[0].allocations.len();
        assert!(count >= last_count, "allocation count went backwards");
        last_count = count;
    }
    writer.join().unwrap();

    let state = load_state(&path);
    assert_eq!(state.pools[0].allocations.len(), 50);
}
