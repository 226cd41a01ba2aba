//! Core trait definitions

mod driver;

pub use driver::{DriverErrors, VmDriver};
