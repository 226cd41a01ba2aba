//! VM driver trait

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;

/// Receives at most one error, sent when the VM stops unexpectedly.
///
/// A driver keeps the sender alive for as long as the VM runs; dropping it
/// without sending is treated as the VM having gone away.
pub type DriverErrors = oneshot::Receiver<DriverError>;

/// Abstraction over a VM backend
///
/// The host agent depends only on this capability set; each backend kind is
/// one implementation selected when the host agent is constructed.
#[async_trait]
pub trait VmDriver: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Launch the VM
    ///
    /// Returns once the backend reports the VM launched, not once it has
    /// booted.
    async fn start(&self, cancel: CancellationToken) -> Result<DriverErrors, DriverError>;

    /// Stop the VM
    async fn stop(&self, cancel: CancellationToken) -> Result<(), DriverError>;

    /// Whether the backend has a graphical front-end that must run in the foreground
    fn can_run_gui(&self) -> bool {
        false
    }

    /// Run the graphical front-end until it is closed
    async fn run_gui(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("graphical front-end"))
    }

    /// Set the remote display password
    async fn change_display_password(
        &self,
        _cancel: CancellationToken,
        _password: &str,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("display password"))
    }

    /// Port the remote display actually listens on
    async fn display_connection(&self, _cancel: CancellationToken) -> Result<String, DriverError> {
        Err(DriverError::Unsupported("display connection info"))
    }

    /// SSH address discovered after start, for backends that assign it dynamically
    async fn ssh_address(&self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }
}
