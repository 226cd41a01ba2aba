//! Lifecycle of one instance
//!
//! [`HostAgent::run`] starts the VM, reports booting, runs the startup
//! routines in the background and then waits for the first of: a driver
//! error, an interrupt, the graphical front-end closing, or cancellation.
//! Whatever the trigger, teardown is the same: cancel the routines, drain
//! the shutdown stack, stop the VM, and report exiting last.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vh_core::config::VmType;
use vh_core::instance::filenames;
use vh_core::traits::DriverErrors;
use vh_core::{Instance, MultiError, VmDriver};
use vh_protocol::Status;

use crate::display::setup_vnc;
use crate::dns::{HostResolver, ResolverHandle, ResolverOptions};
use crate::events::EventEmitter;
use crate::guestagent::{GuestAgentClient, GuestEventWatcher, Transport};
use crate::mounts::setup_mounts;
use crate::portfwd::PortForwarder;
use crate::requirements::{
    essential_requirements, final_requirements, optional_requirements, RequirementWaiter,
};
use crate::setup::{determine_ssh_local_port, write_ssh_config_file};
use crate::shutdown::ShutdownStack;
use crate::ssh::{Forwarder, SshForwarder, SshRunner};

/// Links the forwarded ssh-agent socket to a fixed guest path
const FORWARD_AGENT_SCRIPT: &str = r#"#!/bin/bash
set -eux -o pipefail
sudo mkdir -p -m 700 /run/host-services
sudo ln -sf "${SSH_AUTH_SOCK}" /run/host-services/ssh-auth.sock
sudo chown -R "${USER}" /run/host-services
"#;

/// Lowest vsock port picked for the guest agent
const MIN_VSOCK_PORT: u32 = 1024;

/// Host-side control process of one instance
pub struct HostAgent {
    instance: Arc<Instance>,
    driver: Arc<dyn VmDriver>,
    emitter: Arc<EventEmitter>,
    stack: Arc<ShutdownStack>,
    runner: SshRunner,
    forwarder: Arc<dyn Forwarder>,
    ssh_local_port: u16,
    ssh_address: String,
    transport: Transport,
    resolver: Option<Arc<dyn HostResolver>>,
    resolver_options: Option<ResolverOptions>,
    interrupt: mpsc::Receiver<()>,
}

impl HostAgent {
    /// Prepare the host side of `instance`
    ///
    /// Picks the ssh and resolver ports and writes `ssh.config`. Any
    /// message on `interrupt` shuts the agent down.
    pub fn new(
        instance: Instance,
        driver: Arc<dyn VmDriver>,
        emitter: Arc<EventEmitter>,
        interrupt: mpsc::Receiver<()>,
    ) -> anyhow::Result<Self> {
        let config = &instance.config;
        let ssh_local_port = determine_ssh_local_port(config.ssh.local_port, &instance.name)?;

        let resolver_options = if config.host_resolver.enabled {
            let options = ResolverOptions::with_free_ports(&instance)
                .context("failed to find free ports for the host resolver")?;
            Some(options)
        } else {
            None
        };

        let mut settings = config.ssh.clone();
        if settings.forward_agent {
            settings.options.push("ForwardAgent=yes".to_string());
        }
        let runner = SshRunner::new(
            &settings,
            &instance.path(filenames::SSH_CONTROL),
            ssh_local_port,
        );
        let ssh_address = config.ssh.address.clone();
        write_ssh_config_file(&instance, &ssh_address, ssh_local_port, &ssh_options(&runner))?;

        let transport = match config.vm_type {
            VmType::Wsl2 => Transport::Vsock {
                cid: config.guest_agent.vsock_cid,
                port: vsock_port(config.guest_agent.vsock_port),
            },
            VmType::Qemu | VmType::Vz => Transport::Unix(instance.path(filenames::GUEST_AGENT_SOCK)),
        };
        let forwarder: Arc<dyn Forwarder> = Arc::new(SshForwarder::new(runner.clone()));

        Ok(Self {
            instance: Arc::new(instance),
            driver,
            emitter,
            stack: Arc::new(ShutdownStack::new()),
            runner,
            forwarder,
            ssh_local_port,
            ssh_address,
            transport,
            resolver: None,
            resolver_options,
            interrupt,
        })
    }

    /// Serve DNS to the guest with `resolver`
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the ssh forwarder used for port and socket forwards
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn ssh_local_port(&self) -> u16 {
        self.ssh_local_port
    }

    /// How the guest agent is reached
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Run the instance until it is told to stop or the VM goes away
    ///
    /// Returns the error that ended the run: a startup failure or the
    /// failure to stop the VM. The last status event is always exiting.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let result = self.run_inner(&cancel).await;

        let mut exiting = self.base_status();
        exiting.exiting = true;
        if let Err(e) = &result {
            exiting.errors.push(format!("{:#}", e));
        }
        self.emitter.emit_status(exiting);
        result
    }

    fn base_status(&self) -> Status {
        Status {
            ssh_local_port: self.ssh_local_port,
            ..Default::default()
        }
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.emitter.emit_status(self.base_status());

        let resolver = self.start_resolver().await?;
        let result = self.run_vm(cancel).await;
        if let Some(handle) = resolver {
            if let Err(e) = handle.shutdown().await {
                tracing::warn!("Failed to shut down the host resolver: {:#}", e);
            }
        }
        result
    }

    async fn start_resolver(&self) -> anyhow::Result<Option<Box<dyn ResolverHandle>>> {
        let Some(options) = self.resolver_options.clone() else {
            return Ok(None);
        };
        let Some(resolver) = &self.resolver else {
            tracing::debug!("No host resolver available, the guest keeps its default DNS");
            return Ok(None);
        };
        tracing::info!(
            "Starting host resolver on udp port {} and tcp port {}",
            options.udp_port,
            options.tcp_port
        );
        let handle = resolver
            .start(options)
            .await
            .context("cannot start DNS server")?;
        Ok(Some(handle))
    }

    async fn run_vm(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        tracing::info!(
            "Starting instance {:?} with the {} driver",
            self.instance.name,
            self.driver.name()
        );
        let errors = self
            .driver
            .start(cancel.clone())
            .await
            .context("failed to start the VM")?;

        if let Err(e) = self.prepare(cancel).await {
            if let Err(stop_err) = self.stop_driver().await {
                tracing::warn!("{:#}", stop_err);
            }
            return Err(e);
        }

        if self.driver.can_run_gui() {
            self.run_with_gui(cancel, errors).await
        } else {
            self.start_routines_and_wait(cancel, errors, None).await
        }
    }

    /// Setup after the VM launched that aborts the run when it fails
    async fn prepare(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let address = self
            .driver
            .ssh_address()
            .await
            .context("failed to get the ssh address of the VM")?;
        if let Some(address) = address.filter(|a| *a != self.ssh_address) {
            tracing::info!("SSH address of {:?} is {}", self.instance.name, address);
            self.ssh_address = address;
            write_ssh_config_file(
                &self.instance,
                &self.ssh_address,
                self.ssh_local_port,
                &ssh_options(&self.runner),
            )?;
        }

        if self.instance.config.video.is_vnc() {
            setup_vnc(cancel, self.driver.as_ref(), &self.instance).await?;
        }
        Ok(())
    }

    async fn run_with_gui(
        &mut self,
        cancel: &CancellationToken,
        errors: DriverErrors,
    ) -> anyhow::Result<()> {
        let gui_exited = CancellationToken::new();
        let driver = self.driver.clone();
        let token = gui_exited.clone();
        let gui = tokio::spawn(async move {
            let result = driver.run_gui().await;
            token.cancel();
            result
        });

        let result = self
            .start_routines_and_wait(cancel, errors, Some(gui_exited))
            .await;

        if !gui.is_finished() {
            gui.abort();
        }
        match gui.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Graphical front-end failed: {}", e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!("Graphical front-end task failed: {}", e),
        }
        result
    }

    async fn start_routines_and_wait(
        &mut self,
        cancel: &CancellationToken,
        mut errors: DriverErrors,
        gui_exited: Option<CancellationToken>,
    ) -> anyhow::Result<()> {
        let routines_cancel = cancel.child_token();
        let routines = self.routines();
        let emitter = self.emitter.clone();
        let mut running = self.base_status();
        let token = routines_cancel.clone();
        let task = tokio::spawn(async move {
            let result = routines.start(&token).await;
            if token.is_cancelled() {
                tracing::debug!("Startup was cancelled before the instance became ready");
                return;
            }
            running.running = true;
            if let Err(errs) = result {
                running.degraded = true;
                running.errors = errs.messages();
                for message in &running.errors {
                    tracing::warn!("{}", message);
                }
            }
            tracing::info!("Instance is running (degraded: {})", running.degraded);
            emitter.emit_status(running);
        });

        let gui_closed = async {
            match &gui_exited {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            received = &mut errors => match received {
                Ok(e) => tracing::warn!("Driver stopped due to error: {}", e),
                Err(_) => tracing::warn!("Driver went away without reporting an error"),
            },
            Some(()) = self.interrupt.recv() => {
                tracing::info!("Received an interrupt, shutting down the host agent");
            }
            _ = gui_closed => {
                tracing::info!("Graphical front-end closed, shutting down the host agent");
            }
            _ = cancel.cancelled() => {
                tracing::info!("Host agent cancelled, shutting down");
            }
        }

        // Routines finish before the stack drains so nothing registers late
        routines_cancel.cancel();
        if let Err(e) = task.await {
            tracing::warn!("Startup task failed: {}", e);
        }
        if let Err(e) = self.stack.drain().await {
            tracing::warn!("Errors while shutting down the host agent:\n{}", e);
        }
        self.stop_driver().await
    }

    async fn stop_driver(&self) -> anyhow::Result<()> {
        tracing::info!("Stopping the VM");
        self.driver
            .stop(CancellationToken::new())
            .await
            .context("failed to stop the VM")
    }

    fn routines(&self) -> Routines {
        Routines {
            instance: self.instance.clone(),
            runner: self.runner.clone(),
            host: self.ssh_address.clone(),
            ssh_local_port: self.ssh_local_port,
            stack: self.stack.clone(),
            forwarder: self.forwarder.clone(),
            transport: self.transport.clone(),
        }
    }
}

/// Everything the background startup task needs
struct Routines {
    instance: Arc<Instance>,
    runner: SshRunner,
    host: String,
    ssh_local_port: u16,
    stack: Arc<ShutdownStack>,
    forwarder: Arc<dyn Forwarder>,
    transport: Transport,
}

impl Routines {
    /// Bring the guest side up
    ///
    /// Steps are independent: each failure is collected and the rest still
    /// run. Each acquired resource registers its cleanup on the stack.
    async fn start(self, cancel: &CancellationToken) -> Result<(), MultiError> {
        let config = &self.instance.config;
        if config.plain {
            tracing::info!(
                "Running in plain mode. Mounts, port forwarding and the guest agent are disabled"
            );
        }

        let runner = self.runner.clone();
        let host = self.host.clone();
        self.stack.push("ssh master", move || async move {
            tracing::debug!("Shutting down the SSH master");
            if let Err(e) = runner.exit_master(&host).await {
                tracing::warn!("Failed to exit the SSH master: {}", e);
            }
            Ok(())
        });

        let waiter =
            RequirementWaiter::new(self.runner.clone(), self.host.clone(), &config.requirements);
        let mut errors = MultiError::new();
        if let Err(e) = waiter
            .wait(cancel, "essential", &essential_requirements(config))
            .await
        {
            errors.extend(e);
        }

        if config.ssh.forward_agent {
            if let Err(e) = self
                .runner
                .run_script(cancel, &self.host, FORWARD_AGENT_SCRIPT, "forward ssh agent")
                .await
            {
                errors.push(anyhow::Error::new(e).context("failed to forward the ssh agent"));
            }
        }

        if config.wants_reverse_sshfs() {
            let (mounts, mount_errors) =
                setup_mounts(cancel, &self.runner, &self.host, &config.mounts).await;
            errors.extend(mount_errors);
            self.stack.push("mounts", move || async move {
                let mut unmount_errors = MultiError::new();
                for mount in mounts {
                    unmount_errors.check(mount.close().await);
                }
                unmount_errors.into_result().map_err(anyhow::Error::from)
            });
        }

        if !config.additional_disks.is_empty() {
            let instance = self.instance.clone();
            self.stack.push("additional disks", move || async move {
                let mut unlock_errors = MultiError::new();
                for disk in &instance.config.additional_disks {
                    tracing::info!("Unlocking disk {:?}", disk);
                    unlock_errors.check(
                        remove_if_exists(&instance.disk_lock_path(disk))
                            .with_context(|| format!("failed to unlock disk {:?}", disk)),
                    );
                }
                unlock_errors.into_result().map_err(anyhow::Error::from)
            });
        }

        if !config.plain {
            let engine = PortForwarder::new(
                &config.port_forwards,
                self.ssh_local_port,
                &self.instance.dir,
                self.forwarder.clone(),
            );
            let watcher = GuestEventWatcher::new(
                GuestAgentClient::new(self.transport.clone()),
                engine,
                self.forwarder.clone(),
                self.host.clone(),
            );
            let handle = tokio::spawn(watcher.run(cancel.clone()));
            self.stack.push("guest agent watcher", move || async move {
                handle.await.context("guest agent watcher failed")
            });
        }

        if let Err(e) = waiter
            .wait(cancel, "optional", &optional_requirements(config))
            .await
        {
            errors.extend(e);
        }
        if let Err(e) = waiter
            .wait(cancel, "final", &final_requirements(config))
            .await
        {
            errors.extend(e);
        }

        for rule in &config.copy_to_host {
            if let Err(e) = self
                .runner
                .copy_to_host(cancel, &self.host, &rule.guest, &rule.host)
                .await
            {
                errors.push(
                    anyhow::Error::new(e)
                        .context(format!("failed to copy {} to {:?}", rule.guest, rule.host)),
                );
            }
        }
        let instance = self.instance.clone();
        self.stack.push("copied files", move || async move {
            let mut remove_errors = MultiError::new();
            for rule in instance.config.copy_to_host.iter().filter(|r| r.delete_on_stop) {
                tracing::info!("Deleting {:?}", rule.host);
                remove_errors.check(
                    remove_if_exists(&rule.host)
                        .with_context(|| format!("failed to delete {:?}", rule.host)),
                );
            }
            remove_errors.into_result().map_err(anyhow::Error::from)
        });

        errors.into_result()
    }
}

/// `Key=Value` options of every invocation of `runner`
fn ssh_options(runner: &SshRunner) -> Vec<String> {
    runner
        .args()
        .chunks(2)
        .filter(|pair| pair.len() == 2 && pair[0] == "-o")
        .map(|pair| pair[1].clone())
        .collect()
}

fn vsock_port(configured: u32) -> u32 {
    if configured != 0 {
        return configured;
    }
    rand::thread_rng().gen_range(MIN_VSOCK_PORT..=u32::from(u16::MAX))
}

/// Remove a file or directory tree; a missing path is not an error
fn remove_if_exists(path: &Path) -> io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
