use std::path::PathBuf;

/// Host-side layout under the runner base directory.
pub struct RunnerPaths {
    base_dir: PathBuf,
}

impl RunnerPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn status(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    /// Persisted mirror of the proxy's VM registry.
    pub fn registry(&self) -> PathBuf {
        self.base_dir.join("proxy-registry.json")
    }

    pub fn network_logs_dir(&self) -> PathBuf {
        self.base_dir.join("network-logs")
    }

    /// Per-run JSONL sink the egress proxy appends to.
    pub fn network_log(&self, run_id: &uuid::Uuid) -> PathBuf {
        self.network_logs_dir().join(format!("{run_id}.jsonl"))
    }
}

/// Guest paths; must match the rootfs image layout.
pub mod guest {
    /// Environment JSON staged by the host before the agent starts.
    pub const ENV_FILE: &str = "/run/skiff/env.json";

    /// Supervised entrypoint: loads the env JSON and execs the configured
    /// agent binary.
    pub const AGENT_ENTRYPOINT: &str = "/usr/local/bin/skiff-agent";

    /// Proxy CA certificate baked into the guest trust store.
    pub const PROXY_CA_CERT: &str = "/usr/local/share/ca-certificates/skiff-proxy-ca.crt";

    /// Staging directory for storage tarballs before extraction.
    pub const STAGING_DIR: &str = "/tmp/skiff-stage";

    /// Combined stdout/stderr of the agent process.
    pub fn system_log(run_id: &uuid::Uuid) -> String {
        format!("/tmp/skiff-{run_id}.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn layout_is_under_base_dir() {
        let paths = RunnerPaths::new(PathBuf::from("/srv/runner"));
        assert_eq!(paths.status(), PathBuf::from("/srv/runner/status.json"));
        assert_eq!(
            paths.registry(),
            PathBuf::from("/srv/runner/proxy-registry.json")
        );
        let id = Uuid::nil();
        assert_eq!(
            paths.network_log(&id),
            PathBuf::from(format!("/srv/runner/network-logs/{id}.jsonl"))
        );
    }

    #[test]
    fn guest_system_log_embeds_run_id() {
        let id = Uuid::nil();
        assert_eq!(
            guest::system_log(&id),
            format!("/tmp/skiff-{id}.log")
        );
    }
}
