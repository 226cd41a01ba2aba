//! Guest readiness requirements
//!
//! Startup waits for three phases of requirements: essential (ssh works),
//! optional (guest agent, user probes) and final (boot scripts done). Each
//! requirement is a script run in the guest and retried until it succeeds.

use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use vh_core::config::{InstanceConfig, RequirementsConfig};
use vh_core::MultiError;

use crate::guestagent::GUEST_AGENT_SOCKET;
use crate::ssh::SshRunner;

/// A readiness check run in the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub description: String,
    /// Script with a shebang line
    pub script: String,
    /// Shown to the user when the requirement cannot be satisfied
    pub debug_hint: String,
    /// Stop checking the rest of the phase if this one fails
    pub fatal: bool,
    /// Run over a fresh connection instead of the ControlMaster
    pub no_master: bool,
}

impl Requirement {
    fn new(description: &str, script: &str, debug_hint: &str) -> Self {
        Self {
            description: description.to_string(),
            script: script.to_string(),
            debug_hint: debug_hint.to_string(),
            fatal: false,
            no_master: false,
        }
    }

    fn no_master(mut self) -> Self {
        self.no_master = true;
        self
    }

    fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// Requirements that must hold before anything else talks to the guest
pub fn essential_requirements(config: &InstanceConfig) -> Vec<Requirement> {
    let mut reqs = vec![Requirement::new(
        "ssh",
        "#!/bin/bash\ntrue\n",
        "Failed to SSH into the guest.\n\
         Make sure that ssh.local_port is not used by other processes on the host.\n\
         If any private key under ~/.ssh is protected with a passphrase, you need to have ssh-agent running.\n",
    )
    .no_master()
    .fatal()];
    if config.plain {
        return reqs;
    }

    reqs.push(
        Requirement::new(
            "user session is ready for ssh",
            r#"#!/bin/bash
set -eux -o pipefail
if ! timeout 30s bash -c "until sudo diff -q /run/vmhost-ssh-ready /mnt/vmhost-cidata/meta-data 2>/dev/null; do sleep 3; done"; then
	echo >&2 "not ready to start persistent ssh session"
	exit 1
fi
"#,
            "The boot sequence resets the user session after updating /etc/environment.\n\
             The persistent ssh session must not be created before that reset.\n",
        )
        .no_master(),
    );
    reqs.push(Requirement::new(
        "explicitly start ssh ControlMaster",
        "#!/bin/bash\ntrue\n",
        "The persistent ssh ControlMaster should start immediately.\n",
    ));

    if config.wants_reverse_sshfs() {
        reqs.push(Requirement::new(
            "sshfs binary to be installed",
            r#"#!/bin/bash
set -eux -o pipefail
if ! timeout 30s bash -c "until command -v sshfs; do sleep 3; done"; then
	echo >&2 "sshfs is not installed yet"
	exit 1
fi
"#,
            "The sshfs binary was not installed in the guest.\n\
             Check /var/log/cloud-init-output.log in the guest.\n",
        ));
        reqs.push(Requirement::new(
            "/etc/fuse.conf (/etc/fuse3.conf) to contain \"user_allow_other\"",
            r#"#!/bin/bash
set -eux -o pipefail
if ! timeout 30s bash -c "until grep -q ^user_allow_other /etc/fuse*.conf; do sleep 3; done"; then
	echo >&2 "/etc/fuse.conf (/etc/fuse3.conf) does not contain \"user_allow_other\""
	exit 1
fi
"#,
            "Append \"user_allow_other\" to /etc/fuse.conf (/etc/fuse3.conf) in the guest.\n",
        ));
    }
    reqs
}

/// Requirements whose failure leaves the instance degraded
pub fn optional_requirements(config: &InstanceConfig) -> Vec<Requirement> {
    let mut reqs = Vec::new();
    if !config.plain {
        reqs.push(Requirement::new(
            "the guest agent to be running",
            &format!(
                r#"#!/bin/bash
set -eux -o pipefail
sock="{}"
if ! timeout 30s bash -c "until [ -S \"${{sock}}\" ]; do sleep 3; done"; then
	echo >&2 "the guest agent is not running yet"
	exit 1
fi
"#,
                GUEST_AGENT_SOCKET
            ),
            "The guest agent does not seem to be running.\n\
             Port forwards will not work until it starts.\n",
        ));
    }
    for probe in &config.probes {
        reqs.push(Requirement::new(&probe.description, &probe.script, &probe.hint));
    }
    reqs
}

/// Requirements checked last, once everything else is up
pub fn final_requirements(_config: &InstanceConfig) -> Vec<Requirement> {
    vec![Requirement::new(
        "boot scripts must have finished",
        r#"#!/bin/bash
set -eux -o pipefail
if ! timeout 30s bash -c "until sudo diff -q /run/vmhost-boot-done /mnt/vmhost-cidata/meta-data 2>/dev/null; do sleep 3; done"; then
	echo >&2 "boot scripts have not finished"
	exit 1
fi
"#,
        "All boot scripts and readiness probes must finish before the instance is ready.\n\
         Check /var/log/cloud-init-output.log in the guest to see where the process is blocked.\n",
    )]
}

/// Runs requirement scripts with the configured retry policy
#[derive(Debug, Clone)]
pub struct RequirementWaiter {
    runner: SshRunner,
    host: String,
    retries: u32,
    interval: Duration,
}

impl RequirementWaiter {
    pub fn new(runner: SshRunner, host: impl Into<String>, policy: &RequirementsConfig) -> Self {
        Self {
            runner,
            host: host.into(),
            retries: policy.retries.max(1),
            interval: policy.interval,
        }
    }

    /// Wait for every requirement of one phase
    ///
    /// All failures are collected. A failing fatal requirement ends the phase
    /// early.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        label: &str,
        requirements: &[Requirement],
    ) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        let total = requirements.len();

        for (i, req) in requirements.iter().enumerate() {
            let n = i + 1;
            tracing::info!(
                "Waiting for the {} requirement {} of {}: {:?}",
                label,
                n,
                total,
                req.description
            );

            match self.wait_one(cancel, req).await {
                Ok(()) => {
                    tracing::info!("The {} requirement {} of {} is satisfied", label, n, total);
                }
                Err(WaitError::Cancelled) => {
                    errors.push(anyhow!("waiting for the {} requirements was cancelled", label));
                    break;
                }
                Err(WaitError::Failed(e)) => {
                    errors.push(anyhow!(
                        "failed to satisfy the {} requirement {} of {} {:?}: {}: {}",
                        label,
                        n,
                        total,
                        req.description,
                        req.debug_hint.trim_end(),
                        e
                    ));
                    if req.fatal {
                        tracing::info!("No further {} requirements will be checked", label);
                        break;
                    }
                }
            }
        }
        errors.into_result()
    }

    async fn wait_one(
        &self,
        cancel: &CancellationToken,
        req: &Requirement,
    ) -> Result<(), WaitError> {
        let runner = if req.no_master {
            self.runner.without_master()
        } else {
            self.runner.clone()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match runner
                .run_script(cancel, &self.host, &req.script, &req.description)
                .await
            {
                Ok((stdout, stderr)) => {
                    tracing::debug!("stdout={:?}, stderr={:?}", stdout, stderr);
                    return Ok(());
                }
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            tracing::debug!(
                "Requirement {:?} attempt {} failed: {}",
                req.description,
                attempt,
                err
            );
            if attempt >= self.retries {
                return Err(WaitError::Failed(err.into()));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

enum WaitError {
    Cancelled,
    Failed(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use vh_core::config::{MountConfig, ProbeConfig, SshSettings};

    fn waiter(binary: &str, retries: u32) -> RequirementWaiter {
        let settings = SshSettings {
            binary: PathBuf::from(binary),
            ..Default::default()
        };
        RequirementWaiter::new(
            SshRunner::new(&settings, Path::new("/inst/ssh.sock"), 2222),
            "127.0.0.1",
            &RequirementsConfig {
                retries,
                interval: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_plain_essential_is_ssh_only() {
        let config = InstanceConfig {
            plain: true,
            ..Default::default()
        };
        let reqs = essential_requirements(&config);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].description, "ssh");
        assert!(reqs[0].no_master);
        assert!(reqs[0].fatal);
        assert!(optional_requirements(&config).is_empty());
    }

    #[test]
    fn test_sshfs_requirements_follow_mounts() {
        let mut config = InstanceConfig::default();
        assert_eq!(essential_requirements(&config).len(), 3);

        config.mounts.push(MountConfig {
            location: PathBuf::from("/home/me"),
            ..Default::default()
        });
        let reqs = essential_requirements(&config);
        assert_eq!(reqs.len(), 5);
        assert_eq!(reqs[3].description, "sshfs binary to be installed");
    }

    #[test]
    fn test_probes_are_optional_requirements() {
        let config = InstanceConfig {
            probes: vec![ProbeConfig {
                description: "docker".to_string(),
                script: "#!/bin/sh\ndocker info\n".to_string(),
                hint: "start docker".to_string(),
            }],
            ..Default::default()
        };
        let reqs = optional_requirements(&config);
        assert_eq!(reqs.len(), 2);
        assert!(reqs[0].script.contains(GUEST_AGENT_SOCKET));
        assert_eq!(reqs[1].debug_hint, "start docker");
    }

    #[tokio::test]
    async fn test_all_satisfied() {
        let reqs = final_requirements(&InstanceConfig::default());
        waiter("true", 3)
            .wait(&CancellationToken::new(), "final", &reqs)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_joined() {
        let reqs = vec![
            Requirement::new("one", "#!/bin/sh\nfalse\n", "hint one"),
            Requirement::new("two", "#!/bin/sh\nfalse\n", "hint two"),
        ];
        let err = waiter("false", 2)
            .wait(&CancellationToken::new(), "optional", &reqs)
            .await
            .unwrap_err();
        let messages = err.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("optional requirement 1 of 2 \"one\": hint one"));
        assert!(messages[1].contains("hint two"));
    }

    #[tokio::test]
    async fn test_fatal_stops_phase() {
        let mut first = Requirement::new("systemd", "#!/bin/sh\nfalse\n", "");
        first.fatal = true;
        let reqs = vec![first, Requirement::new("later", "#!/bin/sh\ntrue\n", "")];

        let err = waiter("false", 1)
            .wait(&CancellationToken::new(), "optional", &reqs)
            .await
            .unwrap_err();
        assert_eq!(err.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_guest_skips_rest_of_essential() {
        let reqs = essential_requirements(&InstanceConfig::default());
        assert_eq!(reqs.len(), 3);

        let err = waiter("false", 1)
            .wait(&CancellationToken::new(), "essential", &reqs)
            .await
            .unwrap_err();
        let messages = err.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("essential requirement 1 of 3 \"ssh\""));
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reqs = final_requirements(&InstanceConfig::default());
        let err = waiter("false", 5)
            .wait(&cancel, "final", &reqs)
            .await
            .unwrap_err();
        assert!(err.messages()[0].contains("cancelled"));
    }
}
