//! vmhost host agent
//!
//! Runs one instance in the foreground of its supervisor: starts the VM,
//! keeps the guest reachable over ssh and writes status events to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vh_core::config;
use vh_core::pidfile::{self, PidFileGuard};
use vh_core::{Instance, VmDriver};
use vh_hostagent::driver::ProcessDriver;
use vh_hostagent::signals::{relay_interrupts, shutdown_signals};
use vh_hostagent::{EventEmitter, HostAgent};

#[derive(Parser)]
#[command(name = "vh-hostagent")]
#[command(about = "vmhost host agent - runs a VM instance and forwards its ports")]
#[command(version)]
struct Args {
    /// Instance name
    instance: String,

    /// Directory holding the instances (defaults to $VMHOST_HOME or ~/.vmhost)
    #[arg(long, env = config::HOME_ENV)]
    instances_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout carries the status events
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let root = args
        .instances_dir
        .unwrap_or_else(config::default_instances_dir);
    let instance = Instance::inspect(&root, &args.instance)
        .with_context(|| format!("Failed to load instance {:?}", args.instance))?;

    let pid_path = pidfile::pid_path(&instance);
    if let Some(pid) = pidfile::running_host_agent(&pid_path)? {
        bail!(
            "host agent for {:?} is already running (pid {})",
            instance.name,
            pid
        );
    }
    let _pid_guard = PidFileGuard::new(pid_path.clone(), std::process::id())
        .with_context(|| format!("Failed to write {:?}", pid_path))?;

    tracing::info!("vmhost host agent starting for {:?}", instance.name);

    let driver: Arc<dyn VmDriver> = Arc::new(ProcessDriver::new(&instance.config.driver));
    let emitter = Arc::new(EventEmitter::stdout());

    // Setup signal handlers; a second signal skips the teardown
    let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
    let signals = shutdown_signals();
    tokio::spawn(async move {
        if let Some(signal) = relay_interrupts(signals, interrupt_tx).await {
            tracing::warn!("Received {} during shutdown, exiting immediately", signal);
            std::process::exit(1);
        }
    });

    let agent = HostAgent::new(instance, driver, emitter, interrupt_rx)?;
    agent.run(CancellationToken::new()).await?;

    tracing::info!("Host agent shutdown complete");
    Ok(())
}
