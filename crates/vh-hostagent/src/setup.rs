//! Host-side preparation done before the VM starts

use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::path::Path;

use anyhow::{bail, Context};
use vh_core::instance::filenames;
use vh_core::Instance;

/// Instance that keeps the historical fixed ssh port
pub const DEFAULT_INSTANCE: &str = "default";

/// ssh port of [`DEFAULT_INSTANCE`] when none is configured
pub const DEFAULT_SSH_LOCAL_PORT: u16 = 60022;

/// Host name used for the instance in the generated ssh config
pub fn ssh_host_name(inst_name: &str) -> String {
    format!("vmhost-{}", inst_name)
}

/// Pick the host port forwarded to the guest's sshd
pub fn determine_ssh_local_port(configured: u16, inst_name: &str) -> anyhow::Result<u16> {
    if configured > 0 {
        return Ok(configured);
    }
    if inst_name == DEFAULT_INSTANCE {
        return Ok(DEFAULT_SSH_LOCAL_PORT);
    }
    find_free_tcp_local_port()
        .context("failed to find a free port, try setting ssh.local_port manually")
}

/// A TCP port on 127.0.0.1 that was free a moment ago
pub fn find_free_tcp_local_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    nonzero(listener.local_addr()?.port())
}

/// A UDP port on 127.0.0.1 that was free a moment ago
pub fn find_free_udp_local_port() -> io::Result<u16> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    nonzero(socket.local_addr()?.port())
}

fn nonzero(port: u16) -> io::Result<u16> {
    if port == 0 {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "kernel returned port 0",
        ));
    }
    Ok(port)
}

/// Contents of the client config usable with `ssh -F`
///
/// `options` are `Key=Value` pairs as passed to `ssh -o`.
pub fn ssh_config_contents(inst_name: &str, address: &str, port: u16, options: &[String]) -> String {
    let mut out = String::from(
        "# This SSH config file can be passed to 'ssh -F'.\n\
         # This file is created by vmhost, but not used by vmhost itself currently.\n\
         # Modifications to this file will be lost on restarting the vmhost instance.\n",
    );
    out.push_str(&format!("Host {}\n", ssh_host_name(inst_name)));
    for option in options {
        let (key, value) = option.split_once('=').unwrap_or((option.as_str(), ""));
        out.push_str(&format!("  {} {}\n", key.trim(), value.trim()));
    }
    out.push_str(&format!("  Hostname {}\n", address));
    out.push_str(&format!("  Port {}\n", port));
    out
}

/// Write `ssh.config` into the instance directory
pub fn write_ssh_config_file(
    inst: &Instance,
    address: &str,
    port: u16,
    options: &[String],
) -> anyhow::Result<()> {
    if inst.dir.as_os_str().is_empty() {
        bail!("directory is unknown for the instance {:?}", inst.name);
    }
    let path = inst.path(filenames::SSH_CONFIG);
    let contents = ssh_config_contents(&inst.name, address, port, options);
    write_private_file(&path, contents.as_bytes())
        .with_context(|| format!("failed to write {:?}", path))
}

/// Write `contents` to `path` readable only by the owner
pub fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // An existing file keeps its old mode on open
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    file.sync_all()
}
