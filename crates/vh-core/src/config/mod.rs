//! Configuration management for vmhost

mod instance;
mod port_forward;

pub use instance::{
    CopyToHost, DriverConfig, GuestAgentConfig, HostResolverConfig, InstanceConfig, MountConfig,
    MountType, ProbeConfig, RequirementsConfig, SshSettings, VideoConfig, VmType, VncDisplay,
};
pub use port_forward::{PortForwardRule, IPV4_LOOPBACK};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Environment variable overriding the instances root
pub const HOME_ENV: &str = "VMHOST_HOME";

/// Get the default directory holding one subdirectory per instance
pub fn default_instances_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vmhost")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
