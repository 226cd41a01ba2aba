//! External ssh client invocations
//!
//! Every command goes through one ControlMaster connection per instance, so
//! only the first invocation pays for the handshake. The host agent never
//! binds a forwarding socket itself; the ssh master does.

mod forward;

pub use forward::{Forwarder, SshForwarder, Verb};

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use vh_core::config::SshSettings;

use crate::setup::write_private_file;

/// Errors from running the ssh client
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The client binary could not be started
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The client exited unsuccessfully
    #[error("Command {command} failed ({status}): stdout={stdout:?} stderr={stderr:?}")]
    Failed {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// The governing token was cancelled and the client was killed
    #[error("Command {command} was cancelled")]
    Cancelled { command: String },

    #[error("Can't create directory for local socket {path:?}: {source}")]
    LocalDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs the ssh client against one instance
#[derive(Debug, Clone)]
pub struct SshRunner {
    binary: PathBuf,
    args: Vec<String>,
    port: u16,
}

impl SshRunner {
    /// Create a runner multiplexing over the control socket at `control_path`
    pub fn new(settings: &SshSettings, control_path: &Path, port: u16) -> Self {
        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
        ];
        for option in &settings.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }

        Self {
            binary: settings.binary.clone(),
            args,
            port,
        }
    }

    /// A runner that bypasses the ControlMaster
    pub fn without_master(&self) -> Self {
        let mut args = Vec::with_capacity(self.args.len());
        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                if let Some(option) = iter.next() {
                    if option.starts_with("ControlMaster=")
                        || option.starts_with("ControlPersist=")
                    {
                        continue;
                    }
                    args.push(arg.clone());
                    args.push(option.clone());
                }
                continue;
            }
            args.push(arg.clone());
        }
        args.push("-o".to_string());
        args.push("ControlMaster=no".to_string());

        Self {
            binary: self.binary.clone(),
            args,
            port: self.port,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Options shared by every invocation
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Host port of the guest's sshd
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A command running `remote` in the guest
    pub fn command(&self, host: &str, remote: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .arg("-p")
            .arg(self.port.to_string())
            .arg(host)
            .arg("--")
            .args(remote);
        cmd
    }

    /// Run `remote` in the guest and return its stdout
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        host: &str,
        remote: &[&str],
    ) -> Result<String, TunnelError> {
        let output = run(cancel, self.command(host, remote), None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a script in the guest with the interpreter named by its shebang
    ///
    /// The script is piped through stdin. Returns stdout and stderr.
    pub async fn run_script(
        &self,
        cancel: &CancellationToken,
        host: &str,
        script: &str,
        description: &str,
    ) -> Result<(String, String), TunnelError> {
        let interpreter = parse_interpreter(script)?;
        tracing::debug!("Running script {:?} with {:?}", description, interpreter);

        let cmd = self.command(host, &interpreter);
        let output = run(cancel, cmd, Some(script.as_bytes().to_vec())).await?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    /// Ask the ControlMaster to exit
    pub async fn exit_master(&self, host: &str) -> Result<(), TunnelError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .args(["-O", "exit", "-p"])
            .arg(self.port.to_string())
            .arg(host);
        run(&CancellationToken::new(), cmd, None).await?;
        Ok(())
    }

    /// Copy the guest file `guest` to `local` on the host
    ///
    /// The file is read with `sudo cat` and written with mode 0600; its
    /// parent directory is created with mode 0700.
    pub async fn copy_to_host(
        &self,
        cancel: &CancellationToken,
        host: &str,
        guest: &str,
        local: &Path,
    ) -> Result<(), TunnelError> {
        let output = run(cancel, self.command(host, &["sudo", "cat", guest]), None).await?;

        if let Some(parent) = local.parent() {
            create_private_dir(parent)?;
        }
        write_private_file(local, &output.stdout)?;
        tracing::info!("Copied {} (guest) to {:?} (host)", guest, local);
        Ok(())
    }
}

/// Run `cmd` to completion, killing it if `cancel` fires first
pub(crate) async fn run(
    cancel: &CancellationToken,
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
) -> Result<Output, TunnelError> {
    let command = format!("{:?}", cmd.as_std());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    tracing::debug!("Executing {}", command);
    let mut child = cmd.spawn().map_err(|source| TunnelError::Spawn {
        command: command.clone(),
        source,
    })?;

    if let (Some(mut pipe), Some(data)) = (child.stdin.take(), stdin) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&data).await {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    tracing::debug!("Failed to write stdin: {}", e);
                }
            }
        });
    }

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => {
            return Err(TunnelError::Cancelled { command });
        }
    };

    if !output.status.success() {
        return Err(TunnelError::Failed {
            command,
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Split the shebang line of `script` into an argv
fn parse_interpreter(script: &str) -> Result<Vec<&str>, TunnelError> {
    let first = script.lines().next().unwrap_or_default();
    let line = first
        .strip_prefix("#!")
        .ok_or_else(|| TunnelError::InvalidScript(format!("no shebang in {:?}", first)))?;
    let argv: Vec<&str> = line.split_whitespace().collect();
    if argv.is_empty() {
        return Err(TunnelError::InvalidScript(
            "empty interpreter in shebang".to_string(),
        ));
    }
    Ok(argv)
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

/// Quote `s` for a POSIX shell
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@=,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(binary: &str) -> SshRunner {
        let settings = SshSettings {
            binary: PathBuf::from(binary),
            options: vec!["StrictHostKeyChecking=no".to_string()],
            ..Default::default()
        };
        SshRunner::new(&settings, Path::new("/inst/ssh.sock"), 60022)
    }

    #[test]
    fn test_common_args() {
        let r = runner("ssh");
        assert_eq!(
            r.args(),
            [
                "-o",
                "ControlMaster=auto",
                "-o",
                "ControlPath=/inst/ssh.sock",
                "-o",
                "ControlPersist=yes",
                "-o",
                "StrictHostKeyChecking=no"
            ]
        );
        assert_eq!(r.port(), 60022);
    }

    #[test]
    fn test_without_master() {
        let r = runner("ssh").without_master();
        assert_eq!(
            r.args(),
            [
                "-o",
                "ControlPath=/inst/ssh.sock",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "ControlMaster=no"
            ]
        );
    }

    #[test]
    fn test_command_layout() {
        let cmd = runner("ssh").command("127.0.0.1", &["uname", "-a"]);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let tail = &args[args.len() - 6..];
        assert_eq!(tail, ["-p", "60022", "127.0.0.1", "--", "uname", "-a"]);
    }

    #[test]
    fn test_parse_interpreter() {
        assert_eq!(
            parse_interpreter("#!/bin/bash\ntrue\n").unwrap(),
            vec!["/bin/bash"]
        );
        assert_eq!(
            parse_interpreter("#!/usr/bin/env bash -eux\n").unwrap(),
            vec!["/usr/bin/env", "bash", "-eux"]
        );
        assert!(parse_interpreter("echo hi").is_err());
        assert!(parse_interpreter("#!\n").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/run/user/1000/docker.sock"), "/run/user/1000/docker.sock");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_run_reports_failure_with_command() {
        let err = run(&CancellationToken::new(), Command::new("false"), None)
            .await
            .unwrap_err();
        match err {
            TunnelError::Failed { command, .. } => assert!(command.contains("false")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_run_pipes_stdin() {
        let output = run(
            &CancellationToken::new(),
            Command::new("cat"),
            Some(b"hello".to_vec()),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_run_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = run(&cancel, cmd, None).await.unwrap_err();
        assert!(matches!(err, TunnelError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = run(
            &CancellationToken::new(),
            Command::new("/nonexistent/vmhost-ssh"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { .. }));
    }
}
