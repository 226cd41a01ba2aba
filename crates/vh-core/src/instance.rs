//! The managed VM instance and its on-host directory

use std::path::{Path, PathBuf};

use crate::config::{self, InstanceConfig};
use crate::error::ConfigError;

/// Well-known file names inside an instance directory
pub mod filenames {
    /// Instance configuration
    pub const CONFIG: &str = "vmhost.toml";
    /// Generated client config usable with `ssh -F`
    pub const SSH_CONFIG: &str = "ssh.config";
    /// ssh ControlMaster socket
    pub const SSH_CONTROL: &str = "ssh.sock";
    /// Host end of the forwarded guest agent socket
    pub const GUEST_AGENT_SOCK: &str = "ga.sock";
    pub const VNC_PASSWORD: &str = "vncpassword";
    pub const VNC_DISPLAY: &str = "vncdisplay";
    /// PID of the running host agent
    pub const HOST_AGENT_PID: &str = "ha.pid";
    /// Directory of additional disks, relative to the instances root
    pub const DISKS_DIR: &str = "_disks";
    /// Lock file inside a disk directory naming the instance using it
    pub const DISK_IN_USE_BY: &str = "in_use_by";
}

/// One managed virtual machine
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    /// Directory holding the instance's config and runtime files
    pub dir: PathBuf,
    /// Directory of additional disks shared by all instances
    pub disks_dir: PathBuf,
    /// Finalized configuration
    pub config: InstanceConfig,
}

impl Instance {
    /// Load the instance `name` under the instances root `root`
    pub fn inspect(root: &Path, name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() || name.contains('/') || name.starts_with('_') {
            return Err(ConfigError::Invalid(format!(
                "invalid instance name {:?}",
                name
            )));
        }
        let dir = root.join(name);
        if !dir.is_dir() {
            return Err(ConfigError::NotFound(dir));
        }
        let config: InstanceConfig = config::load_config(&dir.join(filenames::CONFIG))?;
        Self::new(name, dir, root.join(filenames::DISKS_DIR), config)
    }

    /// Build an instance from an already loaded configuration
    pub fn new(
        name: impl Into<String>,
        dir: PathBuf,
        disks_dir: PathBuf,
        mut config: InstanceConfig,
    ) -> Result<Self, ConfigError> {
        config.finalize(&dir)?;
        Ok(Self {
            name: name.into(),
            dir,
            disks_dir,
            config,
        })
    }

    /// Path of a file inside the instance directory
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Lock file of the additional disk `disk`
    pub fn disk_lock_path(&self, disk: &str) -> PathBuf {
        self.disks_dir.join(disk).join(filenames::DISK_IN_USE_BY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_inspect_loads_config() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("dev");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(filenames::CONFIG),
            "plain = true\n[[port_forwards]]\nguest_port = 80\n",
        )
        .unwrap();

        let inst = Instance::inspect(root.path(), "dev").unwrap();
        assert_eq!(inst.name, "dev");
        assert!(inst.config.plain);
        assert_eq!(inst.config.port_forwards[0].guest_port_range, [80, 80]);
        assert_eq!(
            inst.disk_lock_path("data"),
            root.path().join("_disks").join("data").join("in_use_by")
        );
    }

    #[test]
    fn test_inspect_missing_instance() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            Instance::inspect(root.path(), "ghost"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_inspect_rejects_bad_names() {
        let root = TempDir::new().unwrap();
        assert!(Instance::inspect(root.path(), "").is_err());
        assert!(Instance::inspect(root.path(), "a/b").is_err());
        assert!(Instance::inspect(root.path(), "_disks").is_err());
    }
}
