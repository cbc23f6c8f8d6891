use tokio::process::Command;
use tracing::trace;

/// Error from a failed host command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a host command is executed.
#[derive(Debug, Clone, Copy)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

fn display_of(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run a host command, returning trimmed stdout on success.
///
/// The program is invoked directly (no shell), so paths and names taken from
/// configuration cannot be used for injection.
pub async fn exec(program: &str, args: &[&str], privilege: Privilege) -> Result<String, CommandError> {
    let command_display = display_of(program, args, privilege);
    trace!(command = %command_display, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            let mut all = vec![program];
            all.extend_from_slice(args);
            Command::new("sudo").args(&all).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    };

    let output = output.map_err(|e| CommandError {
        command: command_display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: command_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a host command, swallowing failure (cleanup paths).
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    if let Err(e) = exec(program, args, privilege).await {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sudo_prefix() {
        assert_eq!(
            display_of("ip", &["link", "del", "x"], Privilege::Sudo),
            "sudo ip link del x"
        );
        assert_eq!(display_of("echo", &["hi"], Privilege::User), "echo hi");
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let out = exec("echo", &["hello"], Privilege::User).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn exec_failure_carries_stderr() {
        let err = exec("sh", &["-c", "echo nope >&2; exit 2"], Privilege::User)
            .await
            .unwrap_err();
        assert!(err.detail.contains("nope"), "detail: {}", err.detail);
    }

    #[tokio::test]
    async fn exec_ignore_errors_swallows_failure() {
        exec_ignore_errors("false", &[], Privilege::User).await;
    }
}
