use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecRequest, ExecResult, ProcessExit, SpawnHandle};

/// A running (or startable) isolated guest.
///
/// `Any` is a supertrait so factories can recover their concrete type in
/// `destroy` via trait upcasting.
#[async_trait]
pub trait Sandbox: std::any::Any + Send + Sync {
    // -- identity --

    fn id(&self) -> &str;

    /// Source IP this sandbox's egress traffic carries when it reaches the
    /// host-side proxy. Keys the proxy's VM registry.
    fn source_ip(&self) -> &str;

    /// IP assigned to the guest's NIC.
    fn guest_ip(&self) -> &str;

    // -- lifecycle --

    async fn start(&mut self) -> Result<()>;

    /// Graceful stop: ask the guest to shut down, then reclaim the process.
    async fn stop(&mut self) -> Result<()>;

    /// Immediate stop without a guest shutdown request.
    async fn kill(&mut self) -> Result<()>;

    // -- operations --

    async fn exec(&self, request: &ExecRequest<'_>) -> Result<ExecResult>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    async fn spawn_watch(&self, request: &ExecRequest<'_>) -> Result<SpawnHandle>;

    async fn wait_exit(&self, handle: SpawnHandle, timeout: Duration) -> Result<ProcessExit>;

    /// Redirect this sandbox's outbound HTTP/HTTPS traffic through the
    /// host-side proxy port. Undone automatically when the sandbox's network
    /// identity is released.
    async fn redirect_egress(&self, proxy_port: u16) -> Result<()>;
}
