//! Process-backed VM driver
//!
//! Runs the configured command line as the VM. The process is expected to
//! live as long as the VM does; its exit before [`VmDriver::stop`] is
//! reported on the driver's error channel.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vh_core::config::DriverConfig;
use vh_core::traits::DriverErrors;
use vh_core::{DriverError, VmDriver};

/// How long the VM process gets to exit after SIGTERM
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Running {
    stop: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Drives a VM that is a single long-running host process
pub struct ProcessDriver {
    command: Vec<String>,
    running: Mutex<Option<Running>>,
}

impl ProcessDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            command: config.command.clone(),
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl VmDriver for ProcessDriver {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<DriverErrors, DriverError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| DriverError::Start("driver.command is empty".to_string()))?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DriverError::Start("the VM is already running".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(DriverError::Start("cancelled".to_string()));
        }

        // stdout belongs to the status event stream
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Start(format!("{}: {}", program, e)))?;
        tracing::info!("Started VM process {} (pid {:?})", program, child.id());

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines("stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines("stderr", stderr));
        }

        let (tx, rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(child, stop.clone(), tx));
        *running = Some(Running { stop, supervisor });
        Ok(rx)
    }

    async fn stop(&self, cancel: CancellationToken) -> Result<(), DriverError> {
        let Some(running) = self.running.lock().await.take() else {
            tracing::debug!("VM process is not running");
            return Ok(());
        };

        running.stop.cancel();
        tokio::select! {
            joined = running.supervisor => {
                joined.map_err(|e| DriverError::Stop(format!("supervisor task failed: {}", e)))
            }
            _ = cancel.cancelled() => Err(DriverError::Stop("cancelled".to_string())),
        }
    }
}

/// Wait for the VM process, reporting an exit nobody asked for
async fn supervise(mut child: Child, stop: CancellationToken, errors: oneshot::Sender<DriverError>) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("process exited with {}", status),
                Err(e) => format!("failed to wait for the process: {}", e),
            };
            tracing::warn!("VM process stopped: {}", reason);
            let _ = errors.send(DriverError::Exited(reason));
        }
        _ = stop.cancelled() => {
            terminate(&mut child).await;
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        tracing::info!("Sending SIGTERM to VM process {}", pid);
        // SAFETY: pid refers to our own child, which has not been reaped yet
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("VM process exited with {}", status);
                return;
            }
            Ok(Err(e)) => tracing::warn!("Failed to wait for the VM process: {}", e),
            Err(_) => tracing::warn!("VM process did not exit within {:?}", STOP_TIMEOUT),
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill the VM process: {}", e);
    }
}

async fn log_lines(stream: &'static str, pipe: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!("[vm {}] {}", stream, line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("VM {} closed: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(command: &[&str]) -> ProcessDriver {
        ProcessDriver::new(&DriverConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_empty_command_fails_to_start() {
        let err = driver(&[]).start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DriverError::Start(_)));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let d = driver(&["sh", "-c", "exit 3"]);
        let errors = d.start(CancellationToken::new()).await.unwrap();
        let err = errors.await.unwrap();
        assert!(matches!(err, DriverError::Exited(_)));
        assert!(err.to_string().contains("exit status: 3"));
    }

    #[tokio::test]
    async fn test_stop_terminates_without_error_report() {
        let d = driver(&["sleep", "30"]);
        let errors = d.start(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            d.start(CancellationToken::new()).await,
            Err(DriverError::Start(_))
        ));

        d.stop(CancellationToken::new()).await.unwrap();
        // Sender dropped without a report
        assert!(errors.await.is_err());
        // Stopping twice is fine
        d.stop(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = driver(&["/nonexistent/vmhost-vm"])
            .start(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/vmhost-vm"));
    }
}
