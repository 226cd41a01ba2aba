//! Process signals that end the host agent

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;

/// Ctrl+C and SIGTERM, by name, for the lifetime of the process
pub fn shutdown_signals() -> BoxStream<'static, &'static str> {
    let ctrl_c = stream::unfold((), |()| async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(("Ctrl+C", ())),
            Err(e) => {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                None
            }
        }
    });

    #[cfg(unix)]
    let terminate = {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(sigterm) => stream::unfold(sigterm, |mut sigterm| async move {
                sigterm.recv().await.map(|()| ("SIGTERM", sigterm))
            })
            .boxed(),
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                stream::empty().boxed()
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = stream::empty::<&'static str>();

    stream::select(ctrl_c, terminate).boxed()
}

/// Turn the first signal into an interrupt of the agent
///
/// Keeps listening afterwards and returns the name of the next signal, which
/// arrives while teardown is still running. Returns `None` once `signals`
/// ends.
pub async fn relay_interrupts(
    mut signals: impl Stream<Item = &'static str> + Unpin,
    interrupt: mpsc::Sender<()>,
) -> Option<&'static str> {
    let first = signals.next().await?;
    tracing::info!("Received {}, initiating shutdown...", first);
    if interrupt.send(()).await.is_err() {
        tracing::debug!("Host agent already stopped");
    }
    signals.next().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_signal_is_returned() {
        let (tx, mut rx) = mpsc::channel(1);
        let second = relay_interrupts(stream::iter(["Ctrl+C", "SIGTERM"]), tx).await;
        assert_eq!(second, Some("SIGTERM"));
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_single_signal_interrupts_once() {
        let (tx, mut rx) = mpsc::channel(1);
        assert_eq!(relay_interrupts(stream::iter(["SIGTERM"]), tx).await, None);
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stopped_agent_still_relays() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let second = relay_interrupts(stream::iter(["Ctrl+C", "Ctrl+C"]), tx).await;
        assert_eq!(second, Some("Ctrl+C"));
    }
}
