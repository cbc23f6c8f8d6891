use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sandbox::SandboxError;

use crate::command::{Privilege, exec};
use crate::config::FirecrackerConfig;

/// Verify host prerequisites before the factory comes up.
///
/// All failures are collected and reported together so an operator fixes
/// the host in one pass.
pub async fn check_prerequisites(config: &FirecrackerConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_file(&config.binary_path, "firecracker binary", &mut errors);
    check_executable(&config.binary_path, "firecracker binary", &mut errors);
    check_file(&config.kernel_path, "kernel", &mut errors);
    check_file(&config.rootfs_path, "rootfs", &mut errors);
    check_kvm(&mut errors);
    check_commands(&mut errors);
    check_sudo(&mut errors).await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfig(errors.join("; ")))
    }
}

fn check_file(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}

fn check_commands(errors: &mut Vec<String>) {
    for cmd in ["ip", "iptables", "iptables-save", "sysctl", "pgrep", "mkfs.ext4"] {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec("sudo", &["-n", "true"], Privilege::User).await.is_err() {
        errors.push(
            "passwordless sudo required for network and VM setup; configure sudoers".to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn missing_artifacts_are_all_reported() {
        let config = FirecrackerConfig {
            binary_path: PathBuf::from("/nonexistent/firecracker"),
            kernel_path: PathBuf::from("/nonexistent/vmlinux"),
            rootfs_path: PathBuf::from("/nonexistent/rootfs.squashfs"),
            base_dir: PathBuf::from("/tmp"),
            max_vms: 1,
        };
        let err = check_prerequisites(&config).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("firecracker binary not found"));
        assert!(msg.contains("kernel not found"));
        assert!(msg.contains("rootfs not found"));
    }
}
