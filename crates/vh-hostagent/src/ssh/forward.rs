//! Installing and cancelling ssh forwards

use std::fmt;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{run, shell_quote, SshRunner, TunnelError};

/// Control operation sent to the ssh master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Forward,
    Cancel,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Forward => "forward",
            Verb::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installs and cancels tunnels between a host endpoint and a guest endpoint
///
/// `local` and `remote` are either `host:port` or absolute unix socket
/// paths. With `reverse` the host endpoint is the one being connected to.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        cancel: CancellationToken,
        host: &str,
        local: &str,
        remote: &str,
        verb: Verb,
        reverse: bool,
    ) -> Result<(), TunnelError>;
}

/// [`Forwarder`] driving `ssh -O forward` / `ssh -O cancel` on the master
#[derive(Debug, Clone)]
pub struct SshForwarder {
    runner: SshRunner,
}

impl SshForwarder {
    pub fn new(runner: SshRunner) -> Self {
        Self { runner }
    }

    fn control_command(
        &self,
        host: &str,
        local: &str,
        remote: &str,
        verb: Verb,
        reverse: bool,
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.runner.binary());
        cmd.args(self.runner.args()).args(["-T", "-O", verb.as_str()]);
        if reverse {
            cmd.arg("-R").arg(format!("{}:{}", remote, local));
        } else {
            cmd.arg("-L").arg(format!("{}:{}", local, remote));
        }
        cmd.args(["-N", "-f", "-p"])
            .arg(self.runner.port().to_string())
            .arg(host)
            .arg("--");
        cmd
    }

    /// Best-effort `rm -f` of a guest path
    async fn remove_remote(&self, cancel: &CancellationToken, host: &str, remote: &str, when: &str) {
        let quoted = shell_quote(remote);
        if let Err(e) = self
            .runner
            .execute(cancel, host, &["rm", "-f", &quoted])
            .await
        {
            tracing::warn!("Failed to clean up {:?} (guest) {}: {}", remote, when, e);
        }
    }
}

fn remove_local(local: &str, when: &str) {
    if let Err(e) = remove_all(Path::new(local)) {
        tracing::warn!("Failed to clean up {:?} (host) {}: {}", local, when, e);
    }
}

fn remove_all(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Forwarder for SshForwarder {
    async fn forward(
        &self,
        cancel: CancellationToken,
        host: &str,
        local: &str,
        remote: &str,
        verb: Verb,
        reverse: bool,
    ) -> Result<(), TunnelError> {
        let is_socket = local.starts_with('/');

        if is_socket {
            match (verb, reverse) {
                (Verb::Forward, true) => {
                    tracing::info!("Forwarding {:?} (host) to {:?} (guest)", local, remote);
                    self.remove_remote(&cancel, host, remote, "before setting up forwarding")
                        .await;
                }
                (Verb::Forward, false) => {
                    tracing::info!("Forwarding {:?} (guest) to {:?} (host)", remote, local);
                    remove_local(local, "before setting up forwarding");
                }
                (Verb::Cancel, true) => {
                    tracing::info!("Stopping forwarding {:?} (host) to {:?} (guest)", local, remote);
                    self.remove_remote(&cancel, host, remote, "after stopping forwarding")
                        .await;
                }
                (Verb::Cancel, false) => {
                    tracing::info!("Stopping forwarding {:?} (guest) to {:?} (host)", remote, local);
                }
            }
            if verb == Verb::Forward {
                if let Some(parent) = Path::new(local).parent() {
                    create_socket_dir(parent).map_err(|source| TunnelError::LocalDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
        }

        let cmd = self.control_command(host, local, remote, verb, reverse);
        let result = run(&cancel, cmd, None).await;

        if is_socket {
            match (verb, reverse, &result) {
                (Verb::Forward, true, Err(e)) => {
                    tracing::warn!(
                        "Failed to set up forward from {:?} (host) to {:?} (guest): {}",
                        local,
                        remote,
                        e
                    );
                    self.remove_remote(&cancel, host, remote, "after forwarding failed")
                        .await;
                }
                (Verb::Forward, false, Err(e)) => {
                    tracing::warn!(
                        "Failed to set up forward from {:?} (guest) to {:?} (host): {}",
                        remote,
                        local,
                        e
                    );
                    remove_local(local, "after forwarding failed");
                }
                (Verb::Cancel, false, _) => remove_local(local, "after stopping forwarding"),
                _ => {}
            }
        }

        result.map(|_| ())
    }
}

fn create_socket_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)
}
