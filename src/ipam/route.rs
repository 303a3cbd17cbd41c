//! Default-route discovery via the host `ip` tool.

use crate::error::{Error, Result};
use std::process::Command;

/// Discovers the host's default IPv4 interface and its address.
///
/// Behind a trait so stores under test never shell out.
pub trait RouteDiscovery: Send + Sync {
    /// Name of the interface carrying the default IPv4 route.
    fn default_interface(&self) -> Result<String>;

    /// First IPv4 address (CIDR form) of the given interface.
    fn interface_address(&self, interface: &str) -> Result<String>;
}

/// Production discovery: parses `ip -4 route show default` and
/// `ip -4 addr show <iface>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpRoute;

impl RouteDiscovery for IpRoute {
    fn default_interface(&self) -> Result<String> {
        let output = Command::new("ip")
            .args(["-4", "route", "show", "default"])
            .output()?;
        if !output.status.success() {
            return Err(Error::NoDefaultRoute);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_default_route(&stdout)
    }

    fn interface_address(&self, interface: &str) -> Result<String> {
        let output = Command::new("ip")
            .args(["-4", "addr", "show", interface])
            .output()?;
        if !output.status.success() {
            return Err(Error::NoAddress {
                interface: interface.to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_inet_address(&stdout).ok_or_else(|| Error::NoAddress {
            interface: interface.to_string(),
        })
    }
}

/// Pulls the `dev <name>` field out of the first route line.
fn parse_default_route(routes: &str) -> Result<String> {
    let first = routes.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        return Err(Error::NoDefaultRoute);
    }

    let fields: Vec<&str> = first.split_whitespace().collect();
    fields
        .windows(2)
        .find(|pair| pair[0] == "dev")
        .map(|pair| pair[1].to_string())
        .ok_or(Error::NoDefaultRoute)
}

/// Finds the first `inet <cidr>` pair in `ip addr` output.
fn parse_inet_address(addrs: &str) -> Option<String> {
    for line in addrs.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" {
                if let Some(addr) = fields.next() {
                    if addr.contains('/') {
                        return Some(addr.to_string());
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route_extracts_dev() {
        let routes = "default via 192.168.1.1 dev enp3s0 proto dhcp metric 100\n";
        assert_eq!(parse_default_route(routes).unwrap(), "enp3s0");
    }

    #[test]
    fn test_parse_default_route_rejects_empty() {
        assert!(matches!(
            parse_default_route("\n"),
            Err(Error::NoDefaultRoute)
        ));
        assert!(matches!(
            parse_default_route("default via 192.168.1.1"),
            Err(Error::NoDefaultRoute)
        ));
    }

    #[test]
    fn test_parse_inet_address_finds_cidr() {
        let addrs = "\
2: enp3s0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP
    inet 192.168.1.10/24 brd 192.168.1.255 scope global dynamic enp3s0
       valid_lft 86000sec preferred_lft 86000sec
";
        assert_eq!(
            parse_inet_address(addrs).as_deref(),
            Some("192.168.1.10/24")
        );
    }

    #[test]
    fn test_parse_inet_address_none_without_inet() {
        assert_eq!(parse_inet_address("3: docker0: <NO-CARRIER>\n"), None);
    }
}
