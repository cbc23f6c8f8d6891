#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("sandbox start failed: {0}")]
    StartFailed(String),

    #[error("no free network slots on this host")]
    NetworkExhausted,

    #[error("privileged operation failed: {0}")]
    Syscall(String),

    #[error("hypervisor API error: {0}")]
    Api(String),

    #[error("hypervisor API not ready within {0}s")]
    BootTimeout(u64),

    #[error("guest did not complete vsock handshake within {0}s")]
    HandshakeTimeout(u64),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
