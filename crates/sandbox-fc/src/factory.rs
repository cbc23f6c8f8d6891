use async_trait::async_trait;
use sandbox::{Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{info, warn};

use crate::config::FirecrackerConfig;
use crate::machine::FirecrackerVm;
use crate::network::{NetworkAllocator, NetworkError};
use crate::overlay::create_overlay;
use crate::paths::FactoryPaths;

pub struct FirecrackerFactory {
    config: FirecrackerConfig,
    paths: FactoryPaths,
    allocator: Option<NetworkAllocator>,
}

impl FirecrackerFactory {
    /// Create the factory without touching host state; `startup()` performs
    /// the privileged initialisation.
    pub fn new(config: FirecrackerConfig) -> Self {
        let paths = FactoryPaths::new(config.base_dir.clone());
        Self {
            config,
            paths,
            allocator: None,
        }
    }

    /// # Panics
    /// Panics if called before `startup()`; a programming error.
    #[allow(clippy::expect_used)]
    fn allocator(&self) -> &NetworkAllocator {
        self.allocator.as_ref().expect("factory not started")
    }
}

#[async_trait]
impl SandboxFactory for FirecrackerFactory {
    fn name(&self) -> &str {
        "firecracker"
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.allocator.is_some() {
            return Err(SandboxError::CreationFailed("factory already started".into()));
        }

        crate::prerequisites::check_prerequisites(&self.config).await?;

        tokio::fs::create_dir_all(self.paths.vms())
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("mkdir vms dir: {e}")))?;

        let allocator = NetworkAllocator::new(self.config.max_vms)
            .await
            .map_err(map_network_err)?;
        self.allocator = Some(allocator);

        info!(max_vms = self.config.max_vms, "firecracker factory started");
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        // 12 hex chars of the run-derived UUID keep socket paths well under
        // the sun_path limit while staying unique per host.
        let full = config.id.simple().to_string();
        let id = full.get(..12).unwrap_or(&full).to_string();
        let paths = self.paths.vm(&id);

        // Clear leftovers from a crashed VM with the same id.
        if paths.dir().exists()
            && let Err(e) = tokio::fs::remove_dir_all(paths.dir()).await
        {
            warn!(id = %id, error = %e, "failed to clear stale vm dir");
        }
        tokio::fs::create_dir_all(paths.logs())
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("mkdir vm dir: {e}")))?;

        // Overlay creation and network allocation have no ordering
        // dependency; run them concurrently.
        let overlay_path = paths.overlay();
        let (overlay_result, network_result) = tokio::join!(
            create_overlay(&overlay_path),
            self.allocator().allocate(),
        );

        let network = match network_result {
            Ok(network) => network,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(paths.dir()).await;
                return Err(map_network_err(e));
            }
        };
        if let Err(e) = overlay_result {
            self.allocator().release(&network).await;
            let _ = tokio::fs::remove_dir_all(paths.dir()).await;
            return Err(SandboxError::CreationFailed(e.to_string()));
        }

        info!(id = %id, ns = %network.netns, "vm created");
        Ok(Box::new(FirecrackerVm::new(
            id,
            self.config.clone(),
            config.resources,
            paths,
            network,
        )))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        let mut vm = match (sandbox as Box<dyn std::any::Any>).downcast::<FirecrackerVm>() {
            Ok(vm) => *vm,
            Err(_) => {
                warn!("destroy called with a non-firecracker sandbox, ignoring");
                return;
            }
        };

        let _ = vm.kill().await;
        let id = vm.id.clone();

        self.allocator().release(&vm.network).await;

        if let Err(e) = tokio::fs::remove_dir_all(vm.paths.dir()).await {
            warn!(id = %id, error = %e, "failed to delete vm dir");
        }
        info!(id = %id, "vm destroyed");
    }

    async fn shutdown(&mut self) {
        self.allocator.take();
        // Sweep anything a crashed executor may have leaked.
        crate::network::cleanup_orphans().await;
        info!("firecracker factory shut down");
    }
}

fn map_network_err(e: NetworkError) -> SandboxError {
    match e {
        NetworkError::Exhausted => SandboxError::NetworkExhausted,
        other => SandboxError::Syscall(other.to_string()),
    }
}
