//! Typed client for the Firecracker API on its Unix domain socket.
//!
//! Firecracker speaks plain HTTP/1.1 over the UDS; one short-lived
//! connection per call keeps the exchange self-delimiting (`Connection:
//! close`), so no HTTP client stack is needed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("firecracker api io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("firecracker api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed firecracker api response: {0}")]
    BadResponse(String),

    #[error("firecracker api not ready within {0}s")]
    NotReady(u64),

    #[error("request encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

// -- request bodies (Firecracker swagger names) -----------------------------

#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Serialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: String,
}

#[derive(Debug, Serialize)]
struct Action {
    action_type: &'static str,
}

/// Client bound to one VM's API socket.
pub struct FirecrackerApi {
    socket_path: PathBuf,
}

impl FirecrackerApi {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    /// Poll the socket until the API answers, with a bounded budget.
    /// Distinguishable from other failures so the poller can requeue.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(50);

        loop {
            if self.request("GET", "/", None).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ApiError::NotReady(timeout.as_secs()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, source: &BootSource) -> Result<()> {
        self.put("/boot-source", source).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn put_vsock(&self, vsock: &VsockDevice) -> Result<()> {
        self.put("/vsock", vsock).await
    }

    /// Boot the configured machine.
    pub async fn start_instance(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "InstanceStart",
            },
        )
        .await
    }

    /// Graceful shutdown request to the guest. Best-effort by contract.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "SendCtrlAltDel",
            },
        )
        .await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let json = serde_json::to_vec(body)?;
        debug!(path, "firecracker api PUT");
        self.request("PUT", path, Some(&json)).await
    }

    /// One HTTP/1.1 exchange over a fresh connection.
    async fn request(&self, method: &str, path: &str, body: Option<&[u8]>) -> Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let body = body.unwrap_or_default();
        let head = format!(
            "{method} {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Accept: application/json\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        parse_status(&response)
    }
}

/// Validate the status line of a raw HTTP response; surface the body on
/// non-2xx.
fn parse_status(response: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(response);
    let status_line = text
        .lines()
        .next()
        .ok_or_else(|| ApiError::BadResponse("empty response".into()))?;

    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ApiError::BadResponse(status_line.to_string()))?;

    if (200..300).contains(&status) {
        Ok(())
    } else {
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.trim().to_string())
            .unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}
