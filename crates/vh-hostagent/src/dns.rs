//! Host resolver contract
//!
//! The host agent does not answer DNS itself. It picks the listening ports,
//! assembles the static host table and hands both to a [`HostResolver`]
//! implementation, shutting the returned handle down when the instance stops.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use futures::future::BoxFuture;
use vh_core::Instance;

use crate::setup::{find_free_tcp_local_port, find_free_udp_local_port, ssh_host_name};

/// Name under which the guest reaches the host
pub const HOST_INTERNAL_NAME: &str = "host.vmhost.internal";

/// Host address as seen from the user-mode guest network
pub const HOST_INTERNAL_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 2);

/// Guest address on the user-mode network
pub const GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 15);

/// Everything a resolver needs to start serving an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    pub address: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub ipv6: bool,
    /// Static entries, answered before any upstream lookup
    pub hosts: BTreeMap<String, IpAddr>,
}

impl ResolverOptions {
    /// Options for `inst` on the given loopback ports
    ///
    /// The built-in names of the host and the guest cannot be overridden
    /// by configured entries.
    pub fn new(inst: &Instance, udp_port: u16, tcp_port: u16) -> Self {
        let mut hosts: BTreeMap<String, IpAddr> = inst
            .config
            .host_resolver
            .hosts
            .iter()
            .map(|(name, addr)| (name.clone(), *addr))
            .collect();
        hosts.insert(HOST_INTERNAL_NAME.to_string(), IpAddr::V4(HOST_INTERNAL_ADDR));
        hosts.insert(ssh_host_name(&inst.name), IpAddr::V4(GUEST_ADDR));

        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port,
            tcp_port,
            ipv6: inst.config.host_resolver.ipv6,
            hosts,
        }
    }

    /// Options on freshly picked free ports
    pub fn with_free_ports(inst: &Instance) -> anyhow::Result<Self> {
        let udp_port = find_free_udp_local_port()?;
        let tcp_port = find_free_tcp_local_port()?;
        Ok(Self::new(inst, udp_port, tcp_port))
    }
}

/// A DNS server serving one instance
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Start serving and return a handle that stops it
    async fn start(&self, options: ResolverOptions) -> anyhow::Result<Box<dyn ResolverHandle>>;
}

/// A running resolver
pub trait ResolverHandle: Send {
    fn shutdown(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<()>>;
}
