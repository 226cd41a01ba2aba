//! Guest event watcher
//!
//! Keeps a subscription to the guest agent open for the lifetime of the
//! instance and feeds every event to the rule engine. Connection failures
//! are never fatal: the watcher waits [`GUEST_AGENT_RETRY_INTERVAL`] and
//! tries again until cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::client::{ClientError, GuestAgentClient, Transport};
use crate::portfwd::PortForwarder;
use crate::ssh::{Forwarder, Verb};

/// Delay between connection attempts
pub const GUEST_AGENT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Socket the guest agent listens on inside the guest
pub const GUEST_AGENT_SOCKET: &str = "/run/vmhost-guestagent.sock";

/// Owns the rule engine and the reconnect loop
pub struct GuestEventWatcher {
    client: GuestAgentClient,
    engine: PortForwarder,
    forwarder: Arc<dyn Forwarder>,
    host: String,
    /// Host end of the agent socket tunnel, once installed
    transport_tunnel: Option<PathBuf>,
}

impl GuestEventWatcher {
    pub fn new(
        client: GuestAgentClient,
        engine: PortForwarder,
        forwarder: Arc<dyn Forwarder>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            client,
            engine,
            forwarder,
            host: host.into(),
            transport_tunnel: None,
        }
    }

    /// Watch until `cancel` fires, then remove every forward
    pub async fn run(mut self, cancel: CancellationToken) {
        // No static socket forwards for vsock guests
        if matches!(self.client.transport(), Transport::Unix(_)) {
            self.engine
                .install_static_sockets(&cancel, &self.host)
                .await;
        }

        loop {
            match self.watch_once(&cancel).await {
                Ok(()) => tracing::debug!("Guest agent event stream ended"),
                Err(ClientError::Cancelled) => {}
                Err(e) => tracing::warn!("Guest agent events: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(GUEST_AGENT_RETRY_INTERVAL) => {}
            }
        }

        self.teardown().await;
    }

    /// One connection attempt, streaming until the agent hangs up
    async fn watch_once(&mut self, cancel: &CancellationToken) -> Result<(), ClientError> {
        if let Err(e) = self.client.info(cancel).await {
            if matches!(e, ClientError::Cancelled) {
                return Err(e);
            }
            if let Transport::Unix(local) = self.client.transport().clone() {
                tracing::debug!("Guest agent is not reachable ({}), forwarding its socket", e);
                self.forward_transport(cancel, local).await;
            }
        }

        let mut stream = tokio::select! {
            stream = self.client.subscribe() => stream?,
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        };
        tracing::info!("Watching guest agent events on {}", self.client.transport());

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            };
            match item {
                Some(Ok(event)) => self.engine.on_event(cancel, &self.host, &event).await,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    async fn forward_transport(&mut self, cancel: &CancellationToken, local: PathBuf) {
        let local_str = local.to_string_lossy().into_owned();
        match self
            .forwarder
            .forward(
                cancel.clone(),
                &self.host,
                &local_str,
                GUEST_AGENT_SOCKET,
                Verb::Forward,
                false,
            )
            .await
        {
            Ok(()) => self.transport_tunnel = Some(local),
            Err(e) => tracing::warn!("Failed to forward the guest agent socket: {}", e),
        }
    }

    async fn teardown(&mut self) {
        self.engine.shutdown(&self.host).await;

        if let Some(local) = self.transport_tunnel.take() {
            let result = self
                .forwarder
                .forward(
                    CancellationToken::new(),
                    &self.host,
                    &local.to_string_lossy(),
                    GUEST_AGENT_SOCKET,
                    Verb::Cancel,
                    false,
                )
                .await;
            if let Err(e) = result {
                tracing::warn!("Failed to stop forwarding the guest agent socket: {}", e);
            }
        }
    }
}
