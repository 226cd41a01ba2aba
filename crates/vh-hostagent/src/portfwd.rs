//! Port-forward rule engine
//!
//! Turns guest listener notifications into ssh forwards. Rules are walked in
//! a fixed order: deny rules for the guest sshd port and the host ssh port,
//! then the user rules, then a catch-all for loopback listeners. The first
//! matching rule decides.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vh_core::config::{PortForwardRule, IPV4_LOOPBACK};
use vh_protocol::{GuestEvent, IpPort, Proto};

use crate::ssh::{Forwarder, Verb};

/// Port the guest's sshd listens on
pub const SSH_GUEST_PORT: u16 = 22;

/// A tunnel currently installed by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveForward {
    /// Host endpoint, `ip:port` or a socket path
    pub local: String,
    /// Guest endpoint, `ip:port` or a socket path
    pub remote: String,
    pub reverse: bool,
    /// Index of the owning rule in [`PortForwarder::rules`]
    pub rule: usize,
}

impl ActiveForward {
    fn key(&self) -> (String, String) {
        (self.local.clone(), self.remote.clone())
    }
}

/// Matches guest listeners against the rules and tracks installed forwards
///
/// Owned by the guest event watcher; events are handled one at a time, so
/// the active map needs no locking.
pub struct PortForwarder {
    rules: Vec<PortForwardRule>,
    forwarder: Arc<dyn Forwarder>,
    active: HashMap<(String, String), ActiveForward>,
}

impl PortForwarder {
    pub fn new(
        user_rules: &[PortForwardRule],
        ssh_local_port: u16,
        inst_dir: &Path,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        let mut rules = Vec::with_capacity(user_rules.len() + 3);
        rules.push(PortForwardRule::deny_port(SSH_GUEST_PORT));
        if ssh_local_port != 0 {
            rules.push(PortForwardRule::deny_port(ssh_local_port));
        }
        rules.extend(user_rules.iter().cloned());
        rules.push(PortForwardRule::loopback_default());
        for rule in &mut rules {
            rule.fill_defaults(inst_dir);
        }

        Self {
            rules,
            forwarder,
            active: HashMap::new(),
        }
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[PortForwardRule] {
        &self.rules
    }

    /// Currently installed forwards, in no particular order
    pub fn active(&self) -> impl Iterator<Item = &ActiveForward> {
        self.active.values()
    }

    /// The forward a guest listener maps to, or `None` if it is not forwarded
    pub fn forwarding_for(&self, guest: &IpPort) -> Option<ActiveForward> {
        if guest.port == 0 {
            return None;
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.is_socket() || rule.proto != guest.proto {
                continue;
            }
            let [start, end] = rule.guest_port_range;
            if guest.port < start || guest.port > end {
                continue;
            }
            if !guest_ip_matches(guest.ip, rule) {
                continue;
            }
            if rule.ignore {
                // A deny on a specific address leaves a wildcard listener
                // to the rules below.
                if guest.ip.is_unspecified() && !rule.guest_ip().is_unspecified() {
                    continue;
                }
                return None;
            }
            return Some(ActiveForward {
                local: host_address(rule, Some(guest.port)),
                remote: guest.to_string(),
                reverse: false,
                rule: index,
            });
        }
        None
    }

    /// The forward a guest unix socket maps to
    pub fn socket_forwarding_for(&self, guest_socket: &str) -> Option<ActiveForward> {
        let (index, rule) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, r)| r.guest_socket.as_deref() == Some(guest_socket))?;
        if rule.ignore {
            return None;
        }
        socket_forward(index, rule)
    }

    /// Apply one guest event
    ///
    /// Errors reported by the guest are logged; removals are handled before
    /// additions.
    pub async fn on_event(&mut self, cancel: &CancellationToken, host: &str, event: &GuestEvent) {
        for err in &event.errors {
            tracing::warn!("Guest agent reported an error: {}", err);
        }

        for guest in &event.local_ports_removed {
            if let Some(fwd) = self.port_forward(guest) {
                self.stop(cancel, host, fwd).await;
            }
        }
        for guest in &event.local_ports_added {
            if let Some(fwd) = self.port_forward(guest) {
                self.start(cancel, host, fwd).await;
            }
        }
        for path in &event.sockets_removed {
            if let Some(fwd) = self.socket_forwarding_for(path) {
                self.stop(cancel, host, fwd).await;
            }
        }
        for path in &event.sockets_added {
            if let Some(fwd) = self.socket_forwarding_for(path) {
                self.start(cancel, host, fwd).await;
            }
        }
    }

    /// Install every socket rule up front, without waiting for the guest
    pub async fn install_static_sockets(&mut self, cancel: &CancellationToken, host: &str) {
        let forwards: Vec<_> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_socket() && !r.ignore)
            .filter_map(|(i, r)| socket_forward(i, r))
            .collect();
        for fwd in forwards {
            self.start(cancel, host, fwd).await;
        }
    }

    /// Cancel every installed forward
    ///
    /// Runs with a fresh token since the caller's token is usually already
    /// cancelled at this point.
    pub async fn shutdown(&mut self, host: &str) {
        let cancel = CancellationToken::new();
        let forwards: Vec<_> = self.active.drain().map(|(_, fwd)| fwd).collect();
        if !forwards.is_empty() {
            tracing::info!("Cancelling {} forward(s)", forwards.len());
        }
        for fwd in forwards {
            self.cancel(&cancel, host, &fwd).await;
        }
    }

    fn port_forward(&self, guest: &IpPort) -> Option<ActiveForward> {
        let fwd = self.forwarding_for(guest)?;
        if guest.proto == Proto::Udp {
            tracing::info!("Not forwarding UDP {} (unsupported over ssh)", guest);
            return None;
        }
        Some(fwd)
    }

    async fn start(&mut self, cancel: &CancellationToken, host: &str, fwd: ActiveForward) {
        let key = fwd.key();
        if self.active.contains_key(&key) {
            tracing::debug!("{} is already forwarded to {}", fwd.remote, fwd.local);
            return;
        }

        tracing::info!("Forwarding {} (guest) to {} (host)", fwd.remote, fwd.local);
        match self
            .forwarder
            .forward(
                cancel.clone(),
                host,
                &fwd.local,
                &fwd.remote,
                Verb::Forward,
                fwd.reverse,
            )
            .await
        {
            Ok(()) => {
                self.active.insert(key, fwd);
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to set up forwarding {} (guest) to {} (host): {}",
                    fwd.remote,
                    fwd.local,
                    e
                );
            }
        }
    }

    async fn stop(&mut self, cancel: &CancellationToken, host: &str, fwd: ActiveForward) {
        let Some(active) = self.active.remove(&fwd.key()) else {
            tracing::debug!("{} was not forwarded, nothing to stop", fwd.remote);
            return;
        };
        tracing::info!(
            "Stopping forwarding {} (guest) to {} (host)",
            active.remote,
            active.local
        );
        self.cancel(cancel, host, &active).await;
    }

    async fn cancel(&self, cancel: &CancellationToken, host: &str, fwd: &ActiveForward) {
        if let Err(e) = self
            .forwarder
            .forward(
                cancel.clone(),
                host,
                &fwd.local,
                &fwd.remote,
                Verb::Cancel,
                fwd.reverse,
            )
            .await
        {
            tracing::warn!(
                "Failed to stop forwarding {} (guest) to {} (host): {}",
                fwd.remote,
                fwd.local,
                e
            );
        }
    }
}

fn guest_ip_matches(guest: IpAddr, rule: &PortForwardRule) -> bool {
    let pattern = rule.guest_ip();
    guest.is_unspecified()
        || guest == pattern
        || is_loopback_pair(guest, pattern)
        || (pattern.is_unspecified() && !rule.guest_ip_must_be_zero)
}

/// IPv4 and IPv6 loopback are interchangeable
fn is_loopback_pair(a: IpAddr, b: IpAddr) -> bool {
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);
    (a == V6 && b == IPV4_LOOPBACK) || (a == IPV4_LOOPBACK && b == V6)
}

/// Host endpoint of `rule`, for a guest listener on `guest_port`
fn host_address(rule: &PortForwardRule, guest_port: Option<u16>) -> String {
    if let Some(socket) = &rule.host_socket {
        return socket.clone();
    }
    let port = match guest_port {
        Some(port) => rule.host_port_for(port),
        None => rule.host_port,
    };
    IpPort::tcp(rule.host_ip(), port).to_string()
}

fn socket_forward(index: usize, rule: &PortForwardRule) -> Option<ActiveForward> {
    let remote = rule.guest_socket.clone()?;
    if rule.host_socket.is_none() && rule.host_port == 0 {
        tracing::warn!(
            "Socket rule for {} has neither host_socket nor host_port, skipping",
            remote
        );
        return None;
    }
    Some(ActiveForward {
        local: host_address(rule, None),
        remote,
        reverse: rule.reverse,
        rule: index,
    })
}
