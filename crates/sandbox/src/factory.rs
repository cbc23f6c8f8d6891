use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "firecracker").
    fn name(&self) -> &str;

    /// Verify host prerequisites and initialize factory resources.
    /// Must be called before `create()` or `destroy()`.
    async fn startup(&mut self) -> Result<()>;

    /// Allocate host resources and return a sandbox ready to `start()`.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;

    /// Tear down a sandbox, releasing every host resource it owns.
    /// Safe to call on a sandbox in any state, including after a failed start.
    async fn destroy(&self, sandbox: Box<dyn Sandbox>);

    /// Release all factory-level resources. Requires exclusive ownership;
    /// callers sharing via `Arc` must first recover ownership after all
    /// concurrent users have been dropped.
    async fn shutdown(&mut self);
}
