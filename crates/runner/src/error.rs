use sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("api error: {0}")]
    Api(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("storage fetch failed: {0}")]
    StorageFetch(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Infrastructure failures are not the job's fault: the claim is NACKed
    /// so the platform can reassign it to another host.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Sandbox(
                SandboxError::BootTimeout(_)
                    | SandboxError::HandshakeTimeout(_)
                    | SandboxError::NetworkExhausted
            )
        )
    }

    /// Event kind reported to the platform for infrastructure failures.
    pub fn event_kind(&self) -> &'static str {
        match self {
            Self::Sandbox(SandboxError::BootTimeout(_)) => "vm-boot-timeout",
            Self::Sandbox(SandboxError::HandshakeTimeout(_)) => "guest-handshake-timeout",
            Self::Sandbox(SandboxError::NetworkExhausted) => "network-exhausted",
            _ => "runner-error",
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
