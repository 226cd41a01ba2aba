//! Port-forward rule configuration

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vh_protocol::Proto;

use crate::error::ConfigError;

/// Default guest and host address of a rule
pub const IPV4_LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Subdirectory of the instance directory holding relative host sockets
const SOCKET_DIR: &str = "sock";

/// A configured mapping from a guest endpoint to a host endpoint.
///
/// Rules are consulted in order and the first match wins. After
/// [`PortForwardRule::fill_defaults`] the IPs are set and both port ranges
/// are non-zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortForwardRule {
    /// Guest listen address pattern; `0.0.0.0` matches any address
    pub guest_ip: Option<IpAddr>,
    /// Only match listeners bound to the zero address
    pub guest_ip_must_be_zero: bool,
    pub guest_port: u16,
    pub guest_port_range: [u16; 2],
    /// Unix socket path inside the guest
    pub guest_socket: Option<String>,
    pub host_ip: Option<IpAddr>,
    pub host_port: u16,
    pub host_port_range: [u16; 2],
    /// Unix socket path on the host, relative paths resolve under the instance directory
    pub host_socket: Option<String>,
    pub proto: Proto,
    /// Matching listeners are never forwarded
    pub ignore: bool,
    /// Forward host socket into the guest instead of guest into host
    pub reverse: bool,
}

impl PortForwardRule {
    /// A rule suppressing forwarding of `port` on every guest address
    pub fn deny_port(port: u16) -> Self {
        Self {
            guest_ip: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            guest_port: port,
            ignore: true,
            ..Default::default()
        }
    }

    /// The catch-all forwarding every loopback listener to the same host port
    pub fn loopback_default() -> Self {
        Self {
            guest_ip: Some(IPV4_LOOPBACK),
            ..Default::default()
        }
    }

    /// Guest IP pattern, with the default applied
    pub fn guest_ip(&self) -> IpAddr {
        self.guest_ip.unwrap_or(if self.guest_ip_must_be_zero {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IPV4_LOOPBACK
        })
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip.unwrap_or(IPV4_LOOPBACK)
    }

    /// Whether this rule forwards a unix socket rather than ports
    pub fn is_socket(&self) -> bool {
        self.guest_socket.is_some()
    }

    /// Fill every unset field. Idempotent.
    pub fn fill_defaults(&mut self, inst_dir: &Path) {
        self.guest_ip = Some(self.guest_ip());
        self.host_ip = Some(self.host_ip());

        if self.guest_port_range == [0, 0] {
            self.guest_port_range = if self.guest_port == 0 {
                [1, 65535]
            } else {
                [self.guest_port, self.guest_port]
            };
        }
        if self.host_port_range == [0, 0] {
            self.host_port_range = if self.host_port == 0 {
                self.guest_port_range
            } else {
                [self.host_port, self.host_port]
            };
        }

        if let Some(socket) = &self.host_socket {
            let path = PathBuf::from(socket);
            if path.is_relative() {
                self.host_socket = Some(
                    inst_dir
                        .join(SOCKET_DIR)
                        .join(path)
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
    }

    /// Check range ordering and that port ranges have equal widths
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let [gs, ge] = self.guest_port_range;
        let [hs, he] = self.host_port_range;
        if gs > ge {
            return Err(ConfigError::Invalid(format!(
                "port_forwards[{}]: guest_port_range {}-{} is reversed",
                index, gs, ge
            )));
        }
        if hs > he {
            return Err(ConfigError::Invalid(format!(
                "port_forwards[{}]: host_port_range {}-{} is reversed",
                index, hs, he
            )));
        }
        if !self.is_socket() && self.host_socket.is_none() && ge - gs != he - hs {
            return Err(ConfigError::Invalid(format!(
                "port_forwards[{}]: host_port_range must be the same width as guest_port_range",
                index
            )));
        }
        if self.reverse && !self.is_socket() {
            return Err(ConfigError::Invalid(format!(
                "port_forwards[{}]: reverse is only supported for guest_socket rules",
                index
            )));
        }
        Ok(())
    }

    /// Host port for a guest listener on `guest_port`
    pub fn host_port_for(&self, guest_port: u16) -> u16 {
        let offset = i32::from(self.host_port_range[0]) - i32::from(self.guest_port_range[0]);
        (i32::from(guest_port) + offset).clamp(0, i32::from(u16::MAX)) as u16
    }
}
