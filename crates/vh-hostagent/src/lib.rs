//! vh-hostagent: Host-side control process of a vmhost instance
//!
//! The host agent starts the VM through a [`vh_core::VmDriver`], waits for
//! the guest to become reachable over ssh, projects guest listeners onto the
//! host with ssh port forwards, and reports its status as a stream of JSON
//! events. Everything acquired during startup registers a cleanup on the
//! [`ShutdownStack`], which is drained in reverse order on termination.

pub mod display;
pub mod dns;
pub mod driver;
pub mod events;
pub mod guestagent;
pub mod hostagent;
pub mod mounts;
pub mod portfwd;
pub mod requirements;
pub mod setup;
pub mod shutdown;
pub mod signals;
pub mod ssh;

pub use events::EventEmitter;
pub use hostagent::HostAgent;
pub use portfwd::PortForwarder;
pub use shutdown::ShutdownStack;
pub use ssh::{Forwarder, SshForwarder, SshRunner, TunnelError, Verb};
