//! Host agent lifecycle against a fake driver
//!
//! `true` stands in for the ssh client, so every guest command succeeds
//! without a guest.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use vh_core::config::{CopyToHost, InstanceConfig, RequirementsConfig, SshSettings};
use vh_core::traits::DriverErrors;
use vh_core::{DriverError, Instance, VmDriver};
use vh_hostagent::dns::{HostResolver, ResolverHandle, ResolverOptions};
use vh_hostagent::{EventEmitter, Forwarder, HostAgent, TunnelError, Verb};
use vh_protocol::Event;

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Vec<u8>>>);

impl Write for Shared {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Shared {
    fn events(&self) -> Vec<Event> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

/// Ordered record of what the fakes were asked to do
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct FakeDriver {
    fail_start: bool,
    fail_display_password: bool,
    gui: bool,
    ssh_address: Option<String>,
    log: Log,
    gui_closed: Notify,
    errors: Mutex<Option<oneshot::Sender<DriverError>>>,
    stops: AtomicUsize,
}

impl FakeDriver {
    fn crash(&self) {
        if let Some(tx) = self.errors.lock().unwrap().take() {
            let _ = tx.send(DriverError::Exited("qemu killed".to_string()));
        }
    }

    fn close_gui(&self) {
        self.gui_closed.notify_one();
    }
}

#[async_trait]
impl VmDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<DriverErrors, DriverError> {
        self.log.push("driver start");
        if self.fail_start {
            return Err(DriverError::Start("no hypervisor".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        *self.errors.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<(), DriverError> {
        self.log.push("driver stop");
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn can_run_gui(&self) -> bool {
        self.gui
    }

    async fn run_gui(&self) -> Result<(), DriverError> {
        self.gui_closed.notified().await;
        self.log.push("gui closed");
        Ok(())
    }

    async fn change_display_password(
        &self,
        _cancel: CancellationToken,
        _password: &str,
    ) -> Result<(), DriverError> {
        if self.fail_display_password {
            return Err(DriverError::Io(io::Error::other("monitor socket closed")));
        }
        Ok(())
    }

    async fn ssh_address(&self) -> Result<Option<String>, DriverError> {
        Ok(self.ssh_address.clone())
    }
}

/// Forwarder that logs the socket name instead of running ssh
struct Recorder(Log);

#[async_trait]
impl Forwarder for Recorder {
    async fn forward(
        &self,
        _cancel: CancellationToken,
        _host: &str,
        local: &str,
        _remote: &str,
        verb: Verb,
        _reverse: bool,
    ) -> Result<(), TunnelError> {
        let name = Path::new(local)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.to_string());
        self.0.push(format!("{} {}", verb, name));
        Ok(())
    }
}

struct FakeResolver {
    fail: bool,
    log: Log,
}

#[async_trait]
impl HostResolver for FakeResolver {
    async fn start(&self, options: ResolverOptions) -> anyhow::Result<Box<dyn ResolverHandle>> {
        if self.fail {
            anyhow::bail!("port {} in use", options.udp_port);
        }
        self.log.push(format!("dns start {}", options.hosts.len()));
        Ok(Box::new(FakeResolverHandle(self.log.clone())))
    }
}

struct FakeResolverHandle(Log);

impl ResolverHandle for FakeResolverHandle {
    fn shutdown(self: Box<Self>) -> BoxFuture<'static, anyhow::Result<()>> {
        let log = self.0.clone();
        Box::pin(async move {
            log.push("dns shutdown");
            Ok(())
        })
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    inst_dir: PathBuf,
    out: Shared,
    driver: Arc<FakeDriver>,
    interrupt: mpsc::Sender<()>,
    agent: HostAgent,
}

fn harness(driver: FakeDriver, tweak: impl FnOnce(&mut InstanceConfig, &Path)) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let inst_dir = root.join("dev");
    std::fs::create_dir_all(&inst_dir).unwrap();

    let mut config = InstanceConfig {
        plain: true,
        ssh: SshSettings {
            local_port: 2222,
            binary: PathBuf::from("true"),
            ..Default::default()
        },
        requirements: RequirementsConfig {
            retries: 1,
            interval: Duration::ZERO,
        },
        ..Default::default()
    };
    config.host_resolver.enabled = false;
    tweak(&mut config, &root);
    let instance = Instance::new("dev", inst_dir.clone(), root.join("_disks"), config).unwrap();

    let out = Shared::default();
    let driver = Arc::new(driver);
    let (interrupt, rx) = mpsc::channel(1);
    let agent = HostAgent::new(
        instance,
        driver.clone(),
        Arc::new(EventEmitter::new(out.clone())),
        rx,
    )
    .unwrap();

    Harness {
        _dir: dir,
        root,
        inst_dir,
        out,
        driver,
        interrupt,
        agent,
    }
}

async fn wait_for_running(out: &Shared) -> Event {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(event) = out.events().into_iter().find(|e| e.status.running) {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("instance never became ready")
}

async fn wait_for_entry(log: &Log, entry: &str) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !log.entries().iter().any(|e| e == entry) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{:?} never logged, got {:?}", entry, log.entries()))
}

#[tokio::test]
async fn test_start_failure_reports_booting_then_exiting() {
    let h = harness(
        FakeDriver {
            fail_start: true,
            ..Default::default()
        },
        |_, _| {},
    );

    let err = h.agent.run(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("no hypervisor"));

    let events = h.out.events();
    assert_eq!(events.len(), 2);
    assert!(!events[0].status.running && !events[0].status.exiting);
    assert_eq!(events[0].status.ssh_local_port, 2222);
    assert!(events.iter().all(|e| e.time.is_some()));
    assert!(events[1].status.exiting);
    assert!(events[1].status.errors[0].contains("no hypervisor"));
    assert_eq!(h.driver.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_interrupt_runs_teardown() {
    let h = harness(FakeDriver::default(), |config, root| {
        config.additional_disks = vec!["data".to_string()];
        config.copy_to_host = vec![CopyToHost {
            guest: "/etc/k3s.yaml".to_string(),
            host: root.join("out").join("kubeconfig"),
            delete_on_stop: true,
        }];
    });
    let lock = h.root.join("_disks").join("data").join("in_use_by");
    std::fs::create_dir_all(lock.parent().unwrap()).unwrap();
    std::fs::write(&lock, b"dev").unwrap();
    let copied = h.root.join("out").join("kubeconfig");

    let run = tokio::spawn(h.agent.run(CancellationToken::new()));
    let running = wait_for_running(&h.out).await;
    assert!(!running.status.degraded);
    assert!(copied.exists());

    h.interrupt.send(()).await.unwrap();
    run.await.unwrap().unwrap();

    let events = h.out.events();
    assert_eq!(events.len(), 3);
    assert!(events[1].status.running);
    assert!(events[2].status.exiting);
    assert!(events[2].status.errors.is_empty());
    assert_eq!(h.driver.stops.load(Ordering::SeqCst), 1);
    assert!(!lock.exists());
    assert!(!copied.exists());
}

#[tokio::test]
async fn test_driver_error_runs_teardown() {
    let h = harness(FakeDriver::default(), |_, _| {});
    let run = tokio::spawn(h.agent.run(CancellationToken::new()));
    wait_for_running(&h.out).await;

    h.driver.crash();
    run.await.unwrap().unwrap();

    let events = h.out.events();
    assert_eq!(events.len(), 3);
    assert!(events[2].status.exiting);
    assert_eq!(h.driver.stops.load(Ordering::SeqCst), 1);
    drop(h.interrupt);
}

#[tokio::test]
async fn test_failed_copy_degrades_but_keeps_running() {
    let h = harness(FakeDriver::default(), |config, root| {
        let blocker = root.join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        config.copy_to_host = vec![CopyToHost {
            guest: "/etc/k3s.yaml".to_string(),
            host: blocker.join("kubeconfig"),
            delete_on_stop: false,
        }];
    });

    let cancel = CancellationToken::new();
    let run = tokio::spawn(h.agent.run(cancel.clone()));
    let running = wait_for_running(&h.out).await;
    assert!(running.status.degraded);
    assert_eq!(running.status.errors.len(), 1);
    assert!(running.status.errors[0].contains("failed to copy /etc/k3s.yaml"));

    cancel.cancel();
    run.await.unwrap().unwrap();
    let events = h.out.events();
    assert!(events.last().unwrap().status.exiting);
    assert_eq!(events.iter().filter(|e| e.status.running).count(), 1);
}

#[tokio::test]
async fn test_guest_agent_watcher_is_torn_down_before_stop() {
    let log = Log::default();
    let h = harness(
        FakeDriver {
            log: log.clone(),
            ..Default::default()
        },
        |config, _| config.plain = false,
    );
    let agent = h
        .agent
        .with_forwarder(Arc::new(Recorder(log.clone())));

    let run = tokio::spawn(agent.run(CancellationToken::new()));
    let running = wait_for_running(&h.out).await;
    assert!(!running.status.degraded, "{:?}", running.status.errors);
    // Nothing listens on ga.sock, so the watcher tunnels it from the guest
    wait_for_entry(&log, "forward ga.sock").await;

    h.interrupt.send(()).await.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(
        log.entries(),
        [
            "driver start",
            "forward ga.sock",
            "cancel ga.sock",
            "driver stop"
        ]
    );
    let events = h.out.events();
    assert_eq!(events.len(), 3);
    assert!(events[2].status.exiting);
}

#[tokio::test]
async fn test_closing_gui_runs_teardown() {
    let log = Log::default();
    let h = harness(
        FakeDriver {
            gui: true,
            ssh_address: Some("10.0.0.9".to_string()),
            log: log.clone(),
            ..Default::default()
        },
        |_, _| {},
    );
    let ssh_config = h.inst_dir.join("ssh.config");
    assert!(std::fs::read_to_string(&ssh_config)
        .unwrap()
        .contains("  Hostname 127.0.0.1\n"));

    let run = tokio::spawn(h.agent.run(CancellationToken::new()));
    wait_for_running(&h.out).await;
    assert!(std::fs::read_to_string(&ssh_config)
        .unwrap()
        .ends_with("  Hostname 10.0.0.9\n  Port 2222\n"));

    h.driver.close_gui();
    run.await.unwrap().unwrap();

    assert_eq!(log.entries(), ["driver start", "gui closed", "driver stop"]);
    let events = h.out.events();
    assert_eq!(events.len(), 3);
    assert!(events[1].status.running);
    assert!(events[2].status.exiting);
    assert!(events[2].status.errors.is_empty());
    drop(h.interrupt);
}

#[tokio::test]
async fn test_display_failure_stops_started_vm() {
    let h = harness(
        FakeDriver {
            fail_display_password: true,
            ..Default::default()
        },
        |config, _| config.video.display = Some("vnc".to_string()),
    );

    let err = h.agent.run(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("failed to set the display password"));

    let events = h.out.events();
    assert_eq!(events.len(), 2);
    assert!(events[1].status.exiting);
    assert!(events[1].status.errors[0].contains("monitor socket closed"));
    assert_eq!(h.driver.stops.load(Ordering::SeqCst), 1);
    assert!(!h.inst_dir.join("vncpassword").exists());
}

#[tokio::test]
async fn test_resolver_outlives_the_vm() {
    let log = Log::default();
    let h = harness(
        FakeDriver {
            log: log.clone(),
            ..Default::default()
        },
        |config, _| config.host_resolver.enabled = true,
    );
    let agent = h.agent.with_resolver(Arc::new(FakeResolver {
        fail: false,
        log: log.clone(),
    }));

    let run = tokio::spawn(agent.run(CancellationToken::new()));
    wait_for_running(&h.out).await;
    h.interrupt.send(()).await.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(
        log.entries(),
        ["dns start 2", "driver start", "driver stop", "dns shutdown"]
    );
}

#[tokio::test]
async fn test_resolver_failure_never_starts_vm() {
    let log = Log::default();
    let h = harness(
        FakeDriver {
            log: log.clone(),
            ..Default::default()
        },
        |config, _| config.host_resolver.enabled = true,
    );
    let agent = h.agent.with_resolver(Arc::new(FakeResolver {
        fail: true,
        log: log.clone(),
    }));

    let err = agent.run(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("cannot start DNS server"));
    assert!(log.entries().is_empty());

    let events = h.out.events();
    assert_eq!(events.len(), 2);
    assert!(events[1].status.errors[0].contains("port"));
    assert_eq!(h.driver.stops.load(Ordering::SeqCst), 0);
}
