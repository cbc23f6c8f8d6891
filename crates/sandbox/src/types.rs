use std::time::Duration;

/// A command to run inside the guest.
pub struct ExecRequest<'a> {
    pub cmd: &'a str,
    /// Guest-side timeout; the guest kills the process group when exceeded.
    pub timeout: Duration,
}

impl ExecRequest<'_> {
    /// Timeout in milliseconds, saturating at `u32::MAX`.
    pub fn timeout_ms(&self) -> u32 {
        u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

/// Result of a synchronous guest command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Handle for a process started with `spawn_watch`.
#[derive(Debug, Clone, Copy)]
pub struct SpawnHandle {
    pub pid: u32,
}

/// Exit notification for a watched guest process.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub pid: u32,
    pub exit_code: i32,
    pub stderr: Vec<u8>,
}
