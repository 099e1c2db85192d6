//! Session orchestrator.
//!
//! Drives one test VM from nothing to a logged-in desktop:
//!
//! ```text
//! init → keypair_ready → [image_built] → vm_running → console_ready
//!      → proxy_running → ssh_ready → mounted → [pre_login_done]
//!      → login_screen_seen → logged_in → [post_login_done] → complete
//! ```
//!
//! Bracketed phases only run the first time a working directory is used.
//! Any failure, and a Ctrl-C during setup, tears down whatever was started
//! before the error is returned.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use testvm_core::error::{Result, VmError};
use testvm_core::event::events;
use testvm_core::{EventEmitter, SessionConfig, SessionEvent, SessionLayout, SessionPhase};

use crate::builder::{nixfile_base, BuildRequest, ImageBuilder, NixBuilder};
use crate::console::{MonitorClient, MonitorProxy, MonitorProxyHandle};
use crate::host_check::check_virtualization_support;
use crate::keypair::KeyPair;
use crate::login::LoginSynchronizer;
use crate::ssh::SshBridge;
use crate::vmm::{HypervisorProvider, LaunchRequest, QemuLauncher, VmHandler};

/// Extra time, beyond one accept window, the proxy gets to finish at teardown.
const PROXY_JOIN_MARGIN: Duration = Duration::from_secs(2);

/// Per-start inputs.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Nix expression describing the VM; guest scripts are looked up next to it
    pub nixfile: PathBuf,
    /// Host directory shared into the guest
    pub code_dir: PathBuf,
    /// Stream build and hypervisor output to the terminal
    pub verbose: bool,
}

/// Resources started so far, torn down if setup does not finish.
#[derive(Default)]
struct Started {
    handler: Option<Box<dyn VmHandler>>,
    proxy: Option<MonitorProxyHandle>,
}

/// What setup hands over to the running session.
struct Ready {
    bridge: SshBridge,
    ssh_port: u16,
    vnc_port: u16,
}

/// Creates sessions. Backends are trait objects so tests can run the full
/// sequence without nix or QEMU.
pub struct SessionOrchestrator {
    config: SessionConfig,
    builder: Arc<dyn ImageBuilder>,
    hypervisor: Arc<dyn HypervisorProvider>,
    event_emitter: EventEmitter,
}

impl SessionOrchestrator {
    /// Orchestrator backed by `nix-build` and the generated QEMU launch script.
    pub fn new(config: SessionConfig, event_emitter: EventEmitter) -> Self {
        let builder = NixBuilder::new(config.programs.nix_build.clone());
        Self::with_backends(
            config,
            Arc::new(builder),
            Arc::new(QemuLauncher::new()),
            event_emitter,
        )
    }

    pub fn with_backends(
        config: SessionConfig,
        builder: Arc<dyn ImageBuilder>,
        hypervisor: Arc<dyn HypervisorProvider>,
        event_emitter: EventEmitter,
    ) -> Self {
        Self {
            config,
            builder,
            hypervisor,
            event_emitter,
        }
    }

    /// Set up a session; Ctrl-C aborts setup with `VmError::Interrupted`.
    pub async fn start(&self, layout: SessionLayout, options: StartOptions) -> Result<VmSession> {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        self.start_until(layout, options, interrupt).await
    }

    /// Set up a session, aborting with `VmError::Interrupted` if `interrupt`
    /// resolves first.
    pub async fn start_until<F>(
        &self,
        layout: SessionLayout,
        options: StartOptions,
        interrupt: F,
    ) -> Result<VmSession>
    where
        F: Future<Output = ()>,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let proxy_grace = self.config.proxy_accept_timeout() + PROXY_JOIN_MARGIN;
        let mut started = Started::default();

        let outcome = tokio::select! {
            result = self.setup(&id, &layout, &options, &mut started) => result,
            _ = interrupt => {
                tracing::info!(session_id = %id, "Setup interrupted");
                Err(VmError::Interrupted)
            }
        };

        match outcome {
            Ok(ready) => match (started.handler.take(), started.proxy.take()) {
                (Some(handler), Some(proxy)) => Ok(VmSession {
                    id,
                    layout,
                    bridge: ready.bridge,
                    handler: Some(handler),
                    proxy: Some(proxy),
                    ssh_port: ready.ssh_port,
                    vnc_port: ready.vnc_port,
                    proxy_grace,
                    mount_point: self.config.guest_mount_point.clone(),
                    event_emitter: self.event_emitter.clone(),
                }),
                (handler, proxy) => {
                    teardown(&id, handler, proxy, proxy_grace).await;
                    Err(VmError::Other("Session setup finished without a running VM".to_string()))
                }
            },
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Setup failed, shutting down");
                teardown(&id, started.handler.take(), started.proxy.take(), proxy_grace).await;
                self.event_emitter.emit(SessionEvent::empty(events::SESSION_FAILED));
                Err(e)
            }
        }
    }

    fn transition(&self, id: &str, phase: SessionPhase) {
        tracing::info!(session_id = %id, phase = %phase, "Session phase");
        self.event_emitter.emit(SessionEvent::phase(phase));
    }

    async fn setup(
        &self,
        id: &str,
        layout: &SessionLayout,
        options: &StartOptions,
        started: &mut Started,
    ) -> Result<Ready> {
        let config = &self.config;
        self.transition(id, SessionPhase::Init);

        let script_base = nixfile_base(&options.nixfile)?;
        let code_dir = absolute(&options.code_dir)?;
        let already_setup = layout.is_setup_complete();
        tracing::info!(
            session_id = %id,
            vm_dir = %layout.root().display(),
            already_setup,
            "Starting session"
        );
        if already_setup {
            tracing::info!("Already set up VM in this dir, skipping one-time steps");
        }

        let keypair = KeyPair::ensure(layout, &config.programs.ssh_keygen).await?;
        self.transition(id, SessionPhase::KeypairReady);

        if !already_setup {
            let request = BuildRequest {
                nixfile: options.nixfile.clone(),
                out_link: layout.result_dir(),
                public_key: keypair.public_key().to_string(),
                user_password: config.user_password.clone(),
                marker: Some(layout.setup_complete_file()),
                verbose: options.verbose,
            };
            self.builder.build(&request).await?;
            self.transition(id, SessionPhase::ImageBuilt);
        }

        if let Err(e) = check_virtualization_support() {
            tracing::warn!(error = %e, "Hardware virtualization unavailable, VM will be slow");
        }

        let launch = LaunchRequest::new(layout, config, &code_dir, options.verbose);
        let vm = self.hypervisor.launch(&launch).await?;
        let mut monitor = vm.monitor;
        started.handler = Some(vm.handler);
        tracing::info!(session_id = %id, ssh_port = vm.ssh_port, vnc_port = vm.vnc_port, "VM accepting VNC connections");
        self.transition(id, SessionPhase::VmRunning);

        let greeting = tokio::time::timeout(config.monitor_connect_timeout(), monitor.wait_for_prompt())
            .await
            .map_err(|_| VmError::ReadinessTimeout {
                target: "hypervisor console".to_string(),
                waited_secs: config.monitor_connect_timeout_secs,
            })??;
        tracing::debug!(greeting = %String::from_utf8_lossy(&greeting).trim(), "Monitor ready");
        self.transition(id, SessionPhase::ConsoleReady);

        let proxy = MonitorProxy::spawn(
            monitor,
            layout.monitor_proxy_socket(),
            config.proxy_accept_timeout(),
        )?;
        let proxy_socket = proxy.socket_path().to_path_buf();
        started.proxy = Some(proxy);
        self.transition(id, SessionPhase::ProxyRunning);

        let bridge = SshBridge::create(layout, config, vm.ssh_port)?;
        tracing::info!("Waiting for SSH");
        bridge.wait_until_ready().await?;
        self.transition(id, SessionPhase::SshReady);

        bridge.mount_shared_dir().await?;
        self.transition(id, SessionPhase::Mounted);

        if !already_setup {
            bridge
                .run_guest_script(&with_suffix(&script_base, ".sh"), "pre-login script")
                .await?;
            self.transition(id, SessionPhase::PreLoginDone);
        }

        let login = LoginSynchronizer::new(
            MonitorClient::unix(proxy_socket),
            config.login.clone(),
            config.user_password.clone(),
        );
        tracing::info!("Waiting for login screen");
        login.wait_for_login_screen().await?;
        self.transition(id, SessionPhase::LoginScreenSeen);

        tracing::info!(user = %config.identities.user, "Logging in user");
        login.log_in().await?;
        self.transition(id, SessionPhase::LoggedIn);

        if !already_setup {
            bridge
                .run_guest_script(&with_suffix(&script_base, "_post.sh"), "post-login script")
                .await?;
            let common = options
                .nixfile
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("common.sh");
            bridge.run_guest_script(&common, "post-login script").await?;
            self.transition(id, SessionPhase::PostLoginDone);

            layout.mark_setup_complete()?;
        }

        self.transition(id, SessionPhase::Complete);
        Ok(Ready {
            bridge,
            ssh_port: vm.ssh_port,
            vnc_port: vm.vnc_port,
        })
    }
}

/// A running, logged-in test VM.
pub struct VmSession {
    id: String,
    layout: SessionLayout,
    bridge: SshBridge,
    handler: Option<Box<dyn VmHandler>>,
    proxy: Option<MonitorProxyHandle>,
    ssh_port: u16,
    vnc_port: u16,
    proxy_grace: Duration,
    mount_point: String,
    event_emitter: EventEmitter,
}

impl VmSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn bridge(&self) -> &SshBridge {
        &self.bridge
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn vnc_port(&self) -> u16 {
        self.vnc_port
    }

    /// Client for the monitor proxy.
    pub fn monitor_client(&self) -> MonitorClient {
        MonitorClient::unix(self.layout.monitor_proxy_socket())
    }

    pub fn is_running(&self) -> bool {
        self.handler.as_ref().is_some_and(|h| h.is_running())
    }

    /// Interactive shell as the ordinary user, in the shared directory.
    pub async fn interactive_shell(&self) -> Result<ExitStatus> {
        let command = format!("cd {} && bash", self.mount_point);
        self.bridge.user().interactive(&["-t", &command]).await
    }

    /// Stop the proxy and kill the VM.
    pub async fn shutdown(mut self) -> Result<()> {
        teardown(
            &self.id,
            self.handler.take(),
            self.proxy.take(),
            self.proxy_grace,
        )
        .await;
        self.event_emitter
            .emit(SessionEvent::empty(events::SESSION_SHUTDOWN));
        Ok(())
    }
}

/// Signal the proxy, kill the hypervisor, then wait for the proxy task.
///
/// Best effort: every step runs even if an earlier one fails.
async fn teardown(
    id: &str,
    handler: Option<Box<dyn VmHandler>>,
    proxy: Option<MonitorProxyHandle>,
    proxy_grace: Duration,
) {
    if let Some(proxy) = &proxy {
        proxy.cancel();
    }

    if let Some(mut handler) = handler {
        tracing::info!(session_id = %id, pid = handler.pid(), "Stopping VM");
        if let Err(e) = handler.stop() {
            tracing::warn!(session_id = %id, error = %e, "Failed to stop VM");
        }
    }

    if let Some(mut proxy) = proxy {
        // The monitor is normally gone by now, so an in-flight exchange ends
        // with a transport error. A launch script that outlives its kill can
        // keep the monitor open.
        match proxy.join_within(proxy_grace).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::debug!(session_id = %id, error = %e, "Monitor proxy ended with error");
            }
            None => {
                tracing::warn!(
                    session_id = %id,
                    grace_ms = proxy_grace.as_millis() as u64,
                    "Monitor proxy did not stop in time, aborted"
                );
            }
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::LaunchedVm;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBuilder {
        calls: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl ImageBuilder for CountingBuilder {
        async fn build(&self, request: &BuildRequest) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(request.out_link.clone())
        }
    }

    struct NoLaunch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HypervisorProvider for NoLaunch {
        async fn launch(&self, _request: &LaunchRequest) -> Result<LaunchedVm> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(VmError::BootError {
                message: "no hypervisor in unit tests".to_string(),
                hint: None,
            })
        }
    }

    fn orchestrator(
        dir: &Path,
        hang: bool,
    ) -> (SessionOrchestrator, Arc<CountingBuilder>, Arc<NoLaunch>) {
        // Fake ssh-keygen so key generation works without openssh
        let keygen = dir.join("ssh-keygen");
        std::fs::write(&keygen, "#!/bin/sh\necho k > \"$4\"\necho 'ssh-rsa AAAA' > \"$4.pub\"\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&keygen, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = SessionConfig::default();
        config.programs.ssh_keygen = keygen.display().to_string();

        let builder = Arc::new(CountingBuilder {
            calls: AtomicUsize::new(0),
            hang,
        });
        let hypervisor = Arc::new(NoLaunch {
            calls: AtomicUsize::new(0),
        });
        let orch = SessionOrchestrator::with_backends(
            config,
            builder.clone(),
            hypervisor.clone(),
            EventEmitter::default(),
        );
        (orch, builder, hypervisor)
    }

    fn options(nixfile: &str) -> StartOptions {
        StartOptions {
            nixfile: PathBuf::from(nixfile),
            code_dir: PathBuf::from("/srv/code"),
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_nixfile_must_end_in_nix() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, builder, _) = orchestrator(dir.path(), false);
        let layout = SessionLayout::create(dir.path().join("vm")).unwrap();

        let err = orch
            .start_until(layout, options("tests/desktop.txt"), std::future::pending())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VmError::Config(_)));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_emits_failed_event() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, builder, hypervisor) = orchestrator(dir.path(), false);
        let mut rx = orch.event_emitter.subscribe();
        let layout = SessionLayout::create(dir.path().join("vm")).unwrap();

        let err = orch
            .start_until(layout.clone(), options("tests/desktop.nix"), std::future::pending())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VmError::BootError { .. }));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hypervisor.calls.load(Ordering::SeqCst), 1);
        assert!(!layout.is_setup_complete());

        let mut phases = Vec::new();
        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            match event.phase {
                Some(phase) => phases.push(phase),
                None => failed |= event.key == events::SESSION_FAILED,
            }
        }
        assert_eq!(
            phases,
            vec![SessionPhase::Init, SessionPhase::KeypairReady, SessionPhase::ImageBuilt]
        );
        assert!(failed);
    }

    #[tokio::test]
    async fn test_interrupt_during_build() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, builder, hypervisor) = orchestrator(dir.path(), true);
        let layout = SessionLayout::create(dir.path().join("vm")).unwrap();

        let interrupt = tokio::time::sleep(std::time::Duration::from_millis(100));
        let err = orch
            .start_until(layout, options("tests/desktop.nix"), interrupt)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VmError::Interrupted));
        assert!(err.is_expected());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hypervisor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_teardown_does_not_wait_forever_on_proxy() {
        use crate::console::MonitorChannel;
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");
        // The monitor stays open and silent, as if the hypervisor survived
        let (client, _hypervisor) = tokio::io::duplex(1024);
        let proxy = MonitorProxy::spawn(
            MonitorChannel::new(client),
            &path,
            Duration::from_millis(50),
        )
        .unwrap();

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"screendump /tmp/x.ppm\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        teardown("session", None, Some(proxy), Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!path.exists());
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("tests/desktop"), "_post.sh"),
            PathBuf::from("tests/desktop_post.sh")
        );
    }
}
