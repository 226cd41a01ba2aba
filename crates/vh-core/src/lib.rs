//! vh-core: Core abstractions and configuration for vmhost
//!
//! This crate provides the instance model, the per-instance TOML
//! configuration, the error taxonomy shared by the host agent, and the
//! [`VmDriver`] trait that VM backends implement.

pub mod config;
pub mod error;
pub mod instance;
pub mod pidfile;
pub mod traits;

pub use error::{ConfigError, DriverError, MultiError};
pub use instance::Instance;
pub use traits::VmDriver;
