//! Guest agent messages
//!
//! The guest agent listens on a unix socket (or a vsock port) inside the VM.
//! A client writes exactly one [`GuestRequest`] line per connection and then
//! reads either a single [`GuestInfo`] line or an unbounded stream of
//! [`GuestEvent`] lines.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocol of a listening socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// A listening IP endpoint reported by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub proto: Proto,
}

impl IpPort {
    /// A TCP endpoint
    pub fn tcp(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            proto: Proto::Tcp,
        }
    }

    /// A UDP endpoint
    pub fn udp(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            proto: Proto::Udp,
        }
    }
}

impl Default for IpPort {
    fn default() -> Self {
        Self::tcp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl fmt::Display for IpPort {
    /// Formats as `host:port`, bracketing IPv6 hosts
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

/// Request line sent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestRequest {
    /// One-shot info query
    Info,
    /// Subscribe to the socket event stream
    Events,
}

/// Reply to [`GuestRequest::Info`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    /// Listeners open at the time of the query
    #[serde(default)]
    pub local_ports: Vec<IpPort>,
}

/// One notification from the guest event stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_added: Vec<IpPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_removed: Vec<IpPort>,
    /// Unix socket paths that started listening
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sockets_added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sockets_removed: Vec<String>,
    /// Errors the guest agent hit while producing this event
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl GuestEvent {
    /// Whether the event carries no socket changes
    pub fn is_empty(&self) -> bool {
        self.local_ports_added.is_empty()
            && self.local_ports_removed.is_empty()
            && self.sockets_added.is_empty()
            && self.sockets_removed.is_empty()
    }
}
