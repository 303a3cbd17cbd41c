//! Port forwarding: the forward-rule model and the host network adapter.
//!
//! Port strings arriving from create requests parse into [`ForwardRule`]s
//! (`HOST:CONTAINER` or `HOST:CONTAINER:PROTOCOL`). The [`NetworkHandler`]
//! trait is the seam to the host firewall; [`IptablesNetwork`] installs
//! DNAT rules tagged with the owning container id so delete can reverse
//! them rule by rule.

use crate::error::{Error, Result};
use crate::ipam::IpamStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

// =============================================================================
// Protocol
// =============================================================================

/// Network protocol for port forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP port forwarding.
    Tcp,
    /// UDP port forwarding.
    Udp,
}

impl Protocol {
    /// Protocol name as used on the wire and in iptables arguments.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ForwardRule
// =============================================================================

/// A single host-to-container port mapping.
///
/// Serialized inside the container's IPAM allocation entry, so the exact
/// field names are part of the persisted state format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    /// Port on the host to listen on.
    pub host_port: u16,
    /// Port inside the container to forward to.
    pub container_port: u16,
    /// Protocol (tcp or udp).
    pub protocol: Protocol,
}

impl FromStr for ForwardRule {
    type Err = Error;

    /// Parses `HOST:CONTAINER` (protocol defaults to tcp) or
    /// `HOST:CONTAINER:PROTOCOL`. Ports must be in 1..=65535.
    fn from_str(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, protocol) = match parts.as_slice() {
            [host, container] => (*host, *container, "tcp"),
            [host, container, protocol] => (*host, *container, *protocol),
            _ => {
                return Err(Error::PortFormat { spec: spec.into() });
            }
        };

        let protocol = match protocol {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => {
                return Err(Error::PortFormat { spec: spec.into() });
            }
        };

        Ok(Self {
            host_port: parse_port(host, spec)?,
            container_port: parse_port(container, spec)?,
            protocol,
        })
    }
}

fn parse_port(value: &str, spec: &str) -> Result<u16> {
    let port: u16 = value.parse().map_err(|_| Error::PortFormat { spec: spec.into() })?;
    if port == 0 {
        return Err(Error::PortFormat { spec: spec.into() });
    }
    Ok(port)
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

// =============================================================================
// Network Adapter
// =============================================================================

/// Host network adapter: installs and removes port-forwarding rules.
///
/// Rules are tagged with the owning container id; `remove_forwarding_rule`
/// must be called with the same parameters `create_forwarding_rule` was.
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    /// Installs a forwarding rule for the container.
    async fn create_forwarding_rule(&self, container_id: &str, rule: &ForwardRule) -> Result<()>;

    /// Removes a previously installed forwarding rule.
    async fn remove_forwarding_rule(&self, container_id: &str, rule: &ForwardRule) -> Result<()>;
}

/// [`NetworkHandler`] backed by iptables DNAT rules on the nat table.
///
/// The destination address is resolved from the container's IPAM
/// allocation, so the allocation must exist before rules are installed.
pub struct IptablesNetwork {
    ipam: Arc<IpamStore>,
}

impl IptablesNetwork {
    pub fn new(ipam: Arc<IpamStore>) -> Self {
        Self { ipam }
    }

    async fn apply(&self, action: &str, container_id: &str, rule: &ForwardRule) -> Result<()> {
        let address = self.ipam.container_address(container_id)?.address;

        let host_port = rule.host_port.to_string();
        let destination = format!("{}:{}", address, rule.container_port);
        let comment = format!("condenser-{container_id}");
        let args = [
            "-t",
            "nat",
            action,
            "PREROUTING",
            "-p",
            rule.protocol.as_str(),
            "--dport",
            host_port.as_str(),
            "-m",
            "comment",
            "--comment",
            comment.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            destination.as_str(),
        ];

        debug!(container_id, %rule, action, "applying iptables rule");

        let output = Command::new("iptables").args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Network {
                reason: format!(
                    "iptables {action} failed for {rule}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkHandler for IptablesNetwork {
    async fn create_forwarding_rule(&self, container_id: &str, rule: &ForwardRule) -> Result<()> {
        self.apply("-A", container_id, rule).await?;
        info!(container_id, %rule, "forwarding rule installed");
        Ok(())
    }

    async fn remove_forwarding_rule(&self, container_id: &str, rule: &ForwardRule) -> Result<()> {
        self.apply("-D", container_id, rule).await?;
        info!(container_id, %rule, "forwarding rule removed");
        Ok(())
    }
}
