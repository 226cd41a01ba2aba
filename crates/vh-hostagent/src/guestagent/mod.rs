//! Guest agent transport and event watcher

mod client;
#[cfg(target_os = "linux")]
mod vsock;
mod watcher;

pub use client::{ClientError, EventStream, GuestAgentClient, Transport};
pub use watcher::{GuestEventWatcher, GUEST_AGENT_RETRY_INTERVAL, GUEST_AGENT_SOCKET};
