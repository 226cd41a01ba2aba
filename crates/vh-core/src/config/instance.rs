//! Per-instance configuration (`vmhost.toml`)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::port_forward::PortForwardRule;
use crate::error::ConfigError;

/// Kind of VM backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    #[default]
    Qemu,
    Vz,
    /// The guest agent is reached over vsock and the SSH address is
    /// only known after the VM has started
    Wsl2,
}

/// How host directories are shared with the guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountType {
    /// sshfs in the guest served by an sftp-server on the host
    #[default]
    ReverseSshfs,
    /// Mounts are handled by the driver, or not at all
    None,
}

/// Configuration of one VM instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub vm_type: VmType,

    /// Plain mode disables mounts, port forwarding and the guest agent
    pub plain: bool,

    pub ssh: SshSettings,

    /// User-defined forwarding rules, in priority order
    pub port_forwards: Vec<PortForwardRule>,

    pub mount_type: MountType,

    pub mounts: Vec<MountConfig>,

    /// Names of attached disks locked for the lifetime of the instance
    pub additional_disks: Vec<String>,

    /// Guest files copied to the host once the VM is ready
    pub copy_to_host: Vec<CopyToHost>,

    /// Extra readiness scripts checked with the optional requirements
    pub probes: Vec<ProbeConfig>,

    pub video: VideoConfig,

    pub host_resolver: HostResolverConfig,

    pub requirements: RequirementsConfig,

    pub guest_agent: GuestAgentConfig,

    pub driver: DriverConfig,
}

impl InstanceConfig {
    /// Fill rule defaults and validate cross-field constraints
    pub fn finalize(&mut self, inst_dir: &Path) -> Result<(), ConfigError> {
        if inst_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "instance directory is unknown".to_string(),
            ));
        }
        for (i, rule) in self.port_forwards.iter_mut().enumerate() {
            rule.fill_defaults(inst_dir);
            rule.validate(i)?;
        }
        for (i, mount) in self.mounts.iter().enumerate() {
            if mount.location.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mounts[{}]: location is required",
                    i
                )));
            }
        }
        if self.video.is_vnc() {
            VncDisplay::parse(&self.video.vnc_display)?;
        }
        Ok(())
    }

    /// Whether the reverse-sshfs mounts should be set up
    pub fn wants_reverse_sshfs(&self) -> bool {
        self.mount_type == MountType::ReverseSshfs && !self.plain && !self.mounts.is_empty()
    }
}

/// SSH access to the guest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Host port forwarded to the guest's sshd (0 = pick one)
    pub local_port: u16,

    /// Address the host reaches the guest's sshd on
    pub address: String,

    /// ssh client binary
    pub binary: PathBuf,

    /// Extra `Key=Value` options appended to every invocation
    pub options: Vec<String>,

    /// Forward the host's ssh-agent into the guest
    pub forward_agent: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            local_port: 0,
            address: "127.0.0.1".to_string(),
            binary: PathBuf::from("ssh"),
            options: vec![],
            forward_agent: false,
        }
    }
}

/// A host directory shared with the guest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Host path
    pub location: PathBuf,
    /// Guest path, defaults to `location`
    pub mount_point: Option<PathBuf>,
    pub writable: bool,
}

impl MountConfig {
    pub fn guest_path(&self) -> &Path {
        self.mount_point.as_deref().unwrap_or(&self.location)
    }
}

/// A guest file copied to the host after boot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyToHost {
    pub guest: String,
    pub host: PathBuf,
    /// Remove the host copy when the instance stops
    pub delete_on_stop: bool,
}

/// A user-supplied readiness probe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub description: String,
    /// Script with a shebang line, run in the guest
    pub script: String,
    pub hint: String,
}

/// Graphical display settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// `vnc` to enable the remote display, anything else disables it
    pub display: Option<String>,
    /// `host:display[,options]`, e.g. `127.0.0.1:0,to=9`
    pub vnc_display: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            display: None,
            vnc_display: "127.0.0.1:0,to=9".to_string(),
        }
    }
}

impl VideoConfig {
    pub fn is_vnc(&self) -> bool {
        self.display.as_deref() == Some("vnc")
    }
}

/// Parsed `vnc_display` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncDisplay {
    pub host: String,
    /// Display number, port is 5900 + number
    pub number: u16,
    /// Raw option string after the first comma
    pub options: String,
}

impl VncDisplay {
    /// First TCP port of VNC displays
    pub const BASE_PORT: u16 = 5900;

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (display, options) = s.split_once(',').unwrap_or((s, ""));
        let (host, number) = display.rsplit_once(':').ok_or_else(|| {
            ConfigError::Invalid(format!("vnc_display {:?} is not host:display", s))
        })?;
        let number = number.parse::<u16>().map_err(|e| {
            ConfigError::Invalid(format!("vnc_display {:?} has a bad display number: {}", s, e))
        })?;
        if number > u16::MAX - Self::BASE_PORT {
            return Err(ConfigError::Invalid(format!(
                "vnc_display {:?}: display number {} out of range",
                s, number
            )));
        }
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            number,
            options: options.to_string(),
        })
    }

    pub fn port(&self) -> u16 {
        Self::BASE_PORT + self.number
    }

    /// Whether the display port is chosen by the VM (`to=` option)
    pub fn has_port_range(&self) -> bool {
        self.options.split(',').any(|o| o.starts_with("to="))
    }

    /// `host:number` as written to the display file
    pub fn display_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.number)
        } else {
            format!("{}:{}", self.host, self.number)
        }
    }
}

/// Host-side DNS resolver for the guest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostResolverConfig {
    pub enabled: bool,
    pub ipv6: bool,
    /// Static host entries served to the guest
    pub hosts: HashMap<String, IpAddr>,
}

impl Default for HostResolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ipv6: false,
            hosts: HashMap::new(),
        }
    }
}

/// Retry policy of startup requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementsConfig {
    pub retries: u32,
    /// Pause between attempts, in seconds (`interval = 10` or `0.5`)
    #[serde(with = "interval_secs")]
    pub interval: Duration,
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            retries: 60,
            interval: Duration::from_secs(10),
        }
    }
}

mod interval_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Whole(u64),
        Fraction(f64),
    }

    pub fn serialize<S: Serializer>(interval: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if interval.subsec_nanos() == 0 {
            s.serialize_u64(interval.as_secs())
        } else {
            s.serialize_f64(interval.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Secs::deserialize(d)? {
            Secs::Whole(secs) => Ok(Duration::from_secs(secs)),
            Secs::Fraction(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|_| de::Error::custom(format!("invalid interval {}", secs))),
        }
    }
}

/// How the host reaches the guest agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestAgentConfig {
    /// Context ID of the guest, used by vsock transports
    pub vsock_cid: u32,
    /// Port the guest agent listens on over vsock (0 = pick one)
    pub vsock_port: u32,
}

impl Default for GuestAgentConfig {
    fn default() -> Self {
        Self {
            vsock_cid: 3,
            vsock_port: 0,
        }
    }
}

/// Bundled process driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Command line launching the VM; runs until the VM exits
    pub command: Vec<String>,
}
