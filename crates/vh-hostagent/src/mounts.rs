//! Reverse-sshfs mounts
//!
//! A host directory is served by a local `sftp-server` whose stdio is wired
//! to an ssh session running `sshfs -o slave` in the guest.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vh_core::config::MountConfig;
use vh_core::MultiError;

use crate::ssh::{shell_quote, SshRunner};

/// Well-known locations of the OpenSSH sftp-server
const SFTP_SERVER_PATHS: &[&str] = &[
    "/usr/libexec/sftp-server",
    "/usr/lib/openssh/sftp-server",
    "/usr/lib/ssh/sftp-server",
    "/usr/libexec/openssh/sftp-server",
];

/// An active reverse-sshfs mount
pub struct Mount {
    location: PathBuf,
    mount_point: PathBuf,
    runner: SshRunner,
    host: String,
    sftp_server: Child,
    sshfs: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl Mount {
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount in the guest, then stop both processes
    pub async fn close(mut self) -> anyhow::Result<()> {
        tracing::info!(
            "Unmounting {:?} (guest) from {:?} (host)",
            self.mount_point,
            self.location
        );
        let mount_point = shell_quote(&self.mount_point.to_string_lossy());
        let result = self
            .runner
            .execute(
                &CancellationToken::new(),
                &self.host,
                &["sudo", "umount", &mount_point],
            )
            .await
            .with_context(|| format!("failed to unmount {:?}", self.mount_point));

        for child in [&mut self.sshfs, &mut self.sftp_server] {
            if let Err(e) = child.kill().await {
                tracing::debug!("Failed to kill mount process: {}", e);
            }
        }
        for pump in self.pumps {
            pump.abort();
        }
        result.map(|_| ())
    }
}

/// Mount every configured directory
///
/// Returns the mounts that came up together with the errors of those that
/// didn't.
pub async fn setup_mounts(
    cancel: &CancellationToken,
    runner: &SshRunner,
    host: &str,
    mounts: &[MountConfig],
) -> (Vec<Mount>, MultiError) {
    let mut active = Vec::new();
    let mut errors = MultiError::new();
    for config in mounts {
        match setup_mount(cancel, runner, host, config).await {
            Ok(mount) => active.push(mount),
            Err(e) => errors.push(e.context(format!("failed to mount {:?}", config.location))),
        }
    }
    (active, errors)
}

async fn setup_mount(
    cancel: &CancellationToken,
    runner: &SshRunner,
    host: &str,
    config: &MountConfig,
) -> anyhow::Result<Mount> {
    let location = config.location.clone();
    let mount_point = config.guest_path().to_path_buf();
    tracing::info!("Mounting {:?} (host) on {:?} (guest)", location, mount_point);

    let quoted = shell_quote(&mount_point.to_string_lossy());
    runner
        .execute(cancel, host, &["sudo", "mkdir", "-p", &quoted])
        .await
        .context("failed to create the mount point")?;

    let sftp_path = find_sftp_server(SFTP_SERVER_PATHS)?;
    let mut sftp_server = Command::new(&sftp_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to run {:?}", sftp_path))?;

    let args = sshfs_args(&location, &mount_point, config.writable);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut cmd = runner.command(host, &args);
    let mut sshfs = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to run sshfs over ssh")?;

    let (Some(mut sftp_out), Some(mut sftp_in)) =
        (sftp_server.stdout.take(), sftp_server.stdin.take())
    else {
        return Err(anyhow!("sftp-server stdio is not piped"));
    };
    let (Some(mut ssh_out), Some(mut ssh_in)) = (sshfs.stdout.take(), sshfs.stdin.take()) else {
        return Err(anyhow!("ssh stdio is not piped"));
    };

    let pumps = vec![
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut sftp_out, &mut ssh_in).await {
                tracing::debug!("sftp-server -> sshfs stream ended: {}", e);
            }
        }),
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut ssh_out, &mut sftp_in).await {
                tracing::debug!("sshfs -> sftp-server stream ended: {}", e);
            }
        }),
    ];

    Ok(Mount {
        location,
        mount_point,
        runner: runner.clone(),
        host: host.to_string(),
        sftp_server,
        sshfs,
        pumps,
    })
}

/// Remote command running sshfs in slave mode
fn sshfs_args(location: &Path, mount_point: &Path, writable: bool) -> Vec<String> {
    let mut args = vec![
        "sshfs".to_string(),
        shell_quote(&format!(":{}", location.display())),
        shell_quote(&mount_point.to_string_lossy()),
        "-o".to_string(),
        "slave".to_string(),
        "-o".to_string(),
        "follow_symlinks".to_string(),
        "-o".to_string(),
        "allow_other".to_string(),
    ];
    if !writable {
        args.push("-o".to_string());
        args.push("ro".to_string());
    }
    args
}

fn find_sftp_server(candidates: &[&str]) -> anyhow::Result<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow!("sftp-server not found in {:?}", candidates))
}
