use std::path::{Path, PathBuf};

/// Factory-level layout under the runner base directory.
pub struct FactoryPaths {
    base_dir: PathBuf,
}

impl FactoryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn vms(&self) -> PathBuf {
        self.base_dir.join("vms")
    }

    pub fn vm(&self, id: &str) -> VmPaths {
        VmPaths::new(self.vms().join(id))
    }
}

/// Per-VM runtime layout: `<base>/vms/<vmId>/{firecracker.sock, vsock.sock,
/// overlay.ext4, logs/}`. The whole directory is removed on cleanup.
#[derive(Debug, Clone)]
pub struct VmPaths {
    dir: PathBuf,
}

impl VmPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn api_sock(&self) -> PathBuf {
        self.dir.join("firecracker.sock")
    }

    pub fn vsock(&self) -> PathBuf {
        self.dir.join("vsock.sock")
    }

    pub fn overlay(&self) -> PathBuf {
        self.dir.join("overlay.ext4")
    }

    pub fn logs(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn console_log(&self) -> PathBuf {
        self.logs().join("console.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_layout_matches_contract() {
        let paths = FactoryPaths::new(PathBuf::from("/srv/runner")).vm("ab12cd34ef56");
        assert_eq!(
            paths.api_sock(),
            PathBuf::from("/srv/runner/vms/ab12cd34ef56/firecracker.sock")
        );
        assert_eq!(
            paths.vsock(),
            PathBuf::from("/srv/runner/vms/ab12cd34ef56/vsock.sock")
        );
        assert_eq!(
            paths.overlay(),
            PathBuf::from("/srv/runner/vms/ab12cd34ef56/overlay.ext4")
        );
        assert_eq!(
            paths.console_log(),
            PathBuf::from("/srv/runner/vms/ab12cd34ef56/logs/console.log")
        );
    }

    #[test]
    fn socket_paths_fit_sun_path_for_typical_base() {
        // sun_path is 108 bytes including NUL; the vsock listener adds a
        // `_{port}` suffix on top of vsock.sock.
        let paths = FactoryPaths::new(PathBuf::from("/var/lib/skiff-runner")).vm("ab12cd34ef56");
        let listener = format!("{}_{}", paths.vsock().display(), 1024);
        assert!(listener.len() <= 107, "vsock listener path too long: {listener}");
        assert!(paths.api_sock().as_os_str().len() <= 107);
    }
}
