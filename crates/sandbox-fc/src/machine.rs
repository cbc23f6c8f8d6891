//! Firecracker microVM lifecycle.
//!
//! Start sequence (every step has a compensating teardown):
//! 1. bind the vsock listener (must exist before the guest boots),
//! 2. spawn Firecracker in the VM's network namespace with `--api-sock`,
//! 3. wait for the API socket (bounded),
//! 4. configure machine → boot source → rootfs drive → overlay drive →
//!    network interface → vsock, in that order,
//! 5. `InstanceStart`,
//! 6. wait for the guest handshake, then transition to running.
//!
//! States move `created → configuring → running → stopping → stopped`; any
//! failure lands in `error` (terminal) and the factory's destroy path still
//! reclaims every resource.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    ExecRequest, ExecResult, ProcessExit, ResourceLimits, Sandbox, SandboxError, SpawnHandle,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use vsock_host::{VsockError, VsockTransport};

use crate::api::{BootSource, Drive, FirecrackerApi, MachineConfig, NetworkInterface, VsockDevice};
use crate::config::FirecrackerConfig;
use crate::network::{NetworkAlloc, kernel_boot_args};
use crate::paths::VmPaths;

/// Firecracker API readiness budget after process spawn.
const API_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Guest handshake budget after InstanceStart.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful guest shutdown budget before the process is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// CID the guest's vsock device answers on.
const GUEST_CID: u32 = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmState {
    Created = 0,
    Configuring = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Error = 5,
}

impl VmState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Configuring,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

pub struct FirecrackerVm {
    fc_config: FirecrackerConfig,
    resources: ResourceLimits,
    pub(crate) id: String,
    pub(crate) paths: VmPaths,
    pub(crate) network: NetworkAlloc,
    process: Option<tokio::process::Child>,
    /// Shared with the console monitor task for crash detection.
    state: Arc<AtomicU8>,
    /// Shared with the monitor task so it can drop the guest connection
    /// when the process dies under us.
    transport: Arc<std::sync::Mutex<Option<VsockTransport>>>,
}

impl FirecrackerVm {
    pub(crate) fn new(
        id: String,
        fc_config: FirecrackerConfig,
        resources: ResourceLimits,
        paths: VmPaths,
        network: NetworkAlloc,
    ) -> Self {
        Self {
            fc_config,
            resources,
            id,
            paths,
            network,
            process: None,
            state: Arc::new(AtomicU8::new(VmState::Created as u8)),
            transport: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn current_state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: VmState, to: VmState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn transport(&self) -> sandbox::Result<VsockTransport> {
        let guard = self
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone().ok_or_else(|| {
            SandboxError::ExecFailed(format!("vm not running (state: {})", self.current_state()))
        })
    }

    fn set_transport(&self, value: Option<VsockTransport>) -> Option<VsockTransport> {
        let mut guard = self
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut guard, value)
    }

    /// Spawn Firecracker inside the VM's network namespace.
    ///
    /// The runner itself is unprivileged: the chain is
    /// `sudo ip netns exec <ns> sudo -u <runner-user> firecracker`.
    async fn spawn_firecracker(&mut self) -> sandbox::Result<()> {
        let username = crate::process::current_username()
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;

        let mut child = tokio::process::Command::new("sudo")
            .args(["ip", "netns", "exec"])
            .arg(&self.network.netns)
            .args(["sudo", "-u"])
            .arg(&username)
            .arg(&self.fc_config.binary_path)
            .arg("--api-sock")
            .arg(self.paths.api_sock())
            .current_dir(self.paths.dir())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::StartFailed(format!("spawn firecracker: {e}")))?;

        monitor_process(
            &self.id,
            &mut child,
            self.paths.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.transport),
        );
        self.process = Some(child);
        Ok(())
    }

    /// Push the full machine description through the API in fixed order.
    async fn configure(&self) -> Result<(), crate::api::ApiError> {
        let api = FirecrackerApi::new(&self.paths.api_sock());

        api.put_machine_config(&MachineConfig {
            vcpu_count: self.resources.cpu_count,
            mem_size_mib: self.resources.memory_mb,
        })
        .await?;

        api.put_boot_source(&BootSource {
            kernel_image_path: self.fc_config.kernel_path.display().to_string(),
            boot_args: kernel_boot_args(&self.network),
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "rootfs".into(),
            path_on_host: self.fc_config.rootfs_path.display().to_string(),
            is_root_device: true,
            is_read_only: true,
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "overlay".into(),
            path_on_host: self.paths.overlay().display().to_string(),
            is_root_device: false,
            is_read_only: false,
        })
        .await?;

        api.put_network_interface(&NetworkInterface {
            iface_id: "eth0".into(),
            guest_mac: self.network.guest_mac.clone(),
            host_dev_name: self.network.tap_device.clone(),
        })
        .await?;

        api.put_vsock(&VsockDevice {
            guest_cid: GUEST_CID,
            uds_path: self.paths.vsock().display().to_string(),
        })
        .await?;

        api.start_instance().await
    }

    /// Reap the Firecracker process tree.
    async fn kill_process(&mut self) {
        let Some(mut child) = self.process.take() else {
            return;
        };
        if let Some(pid) = child.id() {
            crate::process::kill_process_tree(pid).await;
        }
        let _ = child.wait().await;
    }

    /// Abort a failed start: mark terminal, reap everything this method
    /// created. Network/overlay/workdir reclamation stays with the factory.
    async fn fail_start(
        &mut self,
        handshake: Option<tokio::task::JoinHandle<vsock_host::Result<VsockTransport>>>,
        error: SandboxError,
    ) -> SandboxError {
        if let Some(task) = handshake {
            task.abort();
        }
        if let Some(transport) = self.set_transport(None) {
            transport.close().await;
        }
        self.kill_process().await;
        self.state.store(VmState::Error as u8, Ordering::Release);
        error
    }
}

#[async_trait]
impl Sandbox for FirecrackerVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_ip(&self) -> &str {
        &self.network.veth_ns_ip
    }

    fn guest_ip(&self) -> &str {
        &self.network.guest_ip
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        if !self.transition(VmState::Created, VmState::Configuring) {
            return Err(SandboxError::StartFailed(format!(
                "vm already started (state: {})",
                self.current_state()
            )));
        }

        let _ = tokio::fs::remove_file(self.paths.api_sock()).await;

        // The vsock listener must exist before the guest tries to connect.
        let vsock_path = self.paths.vsock().display().to_string();
        let handshake = tokio::spawn(async move {
            VsockTransport::wait_for_guest(&vsock_path, HANDSHAKE_TIMEOUT).await
        });

        if let Err(e) = self.spawn_firecracker().await {
            return Err(self.fail_start(Some(handshake), e).await);
        }

        let api = FirecrackerApi::new(&self.paths.api_sock());
        if api.wait_until_ready(API_READY_TIMEOUT).await.is_err() {
            let e = SandboxError::BootTimeout(API_READY_TIMEOUT.as_secs());
            return Err(self.fail_start(Some(handshake), e).await);
        }

        if let Err(e) = self.configure().await {
            let e = SandboxError::Api(e.to_string());
            return Err(self.fail_start(Some(handshake), e).await);
        }

        let transport = match handshake.await {
            Ok(Ok(transport)) => transport,
            Ok(Err(VsockError::Timeout)) => {
                let e = SandboxError::HandshakeTimeout(HANDSHAKE_TIMEOUT.as_secs());
                return Err(self.fail_start(None, e).await);
            }
            Ok(Err(e)) => {
                let e = SandboxError::StartFailed(format!("guest handshake: {e}"));
                return Err(self.fail_start(None, e).await);
            }
            Err(e) => {
                let e = SandboxError::StartFailed(format!("handshake task: {e}"));
                return Err(self.fail_start(None, e).await);
            }
        };

        self.set_transport(Some(transport));

        // CAS guards against the monitor task having flagged a dead process
        // between spawn and handshake.
        if !self.transition(VmState::Configuring, VmState::Running) {
            let e = SandboxError::StartFailed("firecracker exited during startup".into());
            return Err(self.fail_start(None, e).await);
        }

        info!(id = %self.id, guest_ip = %self.network.guest_ip, "vm running");
        Ok(())
    }

    async fn stop(&mut self) -> sandbox::Result<()> {
        if self.transition(VmState::Running, VmState::Stopping) {
            // Ask the guest first; fall back to the hypervisor's
            // ctrl-alt-del; the kill below is the backstop.
            if let Some(transport) = self.set_transport(None) {
                if !transport.shutdown(SHUTDOWN_TIMEOUT).await {
                    warn!(id = %self.id, "graceful guest shutdown timed out");
                    let api = FirecrackerApi::new(&self.paths.api_sock());
                    let _ = api.send_ctrl_alt_del().await;
                }
                transport.close().await;
            }
        }
        self.kill_process().await;
        self.state.store(VmState::Stopped as u8, Ordering::Release);
        info!(id = %self.id, "vm stopped");
        Ok(())
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        let prev = VmState::from_u8(
            self.state
                .swap(VmState::Stopping as u8, Ordering::AcqRel),
        );
        if prev == VmState::Stopped {
            self.state.store(VmState::Stopped as u8, Ordering::Release);
            return Ok(());
        }
        if let Some(transport) = self.set_transport(None) {
            transport.close().await;
        }
        self.kill_process().await;
        self.state.store(VmState::Stopped as u8, Ordering::Release);
        info!(id = %self.id, "vm killed");
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecResult> {
        let transport = self.transport()?;
        let result = transport
            .exec(request.cmd, request.timeout_ms())
            .await
            .map_err(map_vsock_err)?;
        Ok(ExecResult {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> sandbox::Result<()> {
        let transport = self.transport()?;
        transport
            .write_file(path, content)
            .await
            .map_err(map_vsock_err)
    }

    async fn spawn_watch(&self, request: &ExecRequest<'_>) -> sandbox::Result<SpawnHandle> {
        let transport = self.transport()?;
        let pid = transport
            .spawn_watch(request.cmd, request.timeout_ms())
            .await
            .map_err(map_vsock_err)?;
        Ok(SpawnHandle { pid })
    }

    async fn wait_exit(
        &self,
        handle: SpawnHandle,
        timeout: Duration,
    ) -> sandbox::Result<ProcessExit> {
        let transport = self.transport()?;
        let exit = transport
            .wait_for_exit(handle.pid, timeout)
            .await
            .map_err(map_vsock_err)?;
        Ok(ProcessExit {
            pid: exit.pid,
            exit_code: exit.exit_code,
            stderr: exit.stderr,
        })
    }

    async fn redirect_egress(&self, proxy_port: u16) -> sandbox::Result<()> {
        crate::network::redirect_through_proxy(&self.network, proxy_port)
            .await
            .map_err(|e| SandboxError::Syscall(e.to_string()))
    }
}

fn map_vsock_err(e: VsockError) -> SandboxError {
    match e {
        VsockError::Timeout => SandboxError::Timeout,
        other => SandboxError::ExecFailed(other.to_string()),
    }
}

/// Forward Firecracker console output to tracing and the VM's console log;
/// flag an unexpected process exit by swapping the state to stopped and
/// dropping the guest connection.
fn monitor_process(
    id: &str,
    child: &mut tokio::process::Child,
    paths: VmPaths,
    state: Arc<AtomicU8>,
    transport: Arc<std::sync::Mutex<Option<VsockTransport>>>,
) {
    if let Some(stdout) = child.stdout.take() {
        let id = id.to_owned();
        tokio::spawn(async move {
            let mut console = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(paths.console_log())
                .await
                .ok();

            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                info!(id = %id, "{line}");
                if let Some(file) = console.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
            }

            // Pipe closed: the process exited.
            let prev = VmState::from_u8(state.swap(VmState::Stopped as u8, Ordering::AcqRel));
            if prev == VmState::Running || prev == VmState::Configuring {
                warn!(id = %id, "firecracker exited unexpectedly");
                let taken = {
                    let mut guard = transport.lock().unwrap_or_else(|p| p.into_inner());
                    guard.take()
                };
                if let Some(t) = taken {
                    t.close().await;
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let id = id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(id = %id, "stderr: {line}");
                }
            }
        });
    }
}
