use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_VCPU: u32 = 2;
pub(crate) const DEFAULT_MEMORY_MB: u32 = 2048;
pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
/// Default wall-clock ceiling for one job (2 hours). Host policy; the
/// platform does not dictate it.
pub(crate) const DEFAULT_MAX_JOB_SECS: u64 = 7200;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    /// Runner group this host claims from, `<scope>/<name>`.
    pub group: String,
    pub base_dir: PathBuf,
    pub firecracker: FirecrackerPaths,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct FirecrackerPaths {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub vcpu: u32,
    pub memory_mb: u32,
    pub max_concurrent: usize,
    pub max_job_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            vcpu: DEFAULT_VCPU,
            memory_mb: DEFAULT_MEMORY_MB,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_job_secs: DEFAULT_MAX_JOB_SECS,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Directory holding (or receiving) the proxy CA pair. MITM policies
    /// require it; without it the proxy runs SNI-only.
    pub ca_dir: Option<PathBuf>,
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths resolve against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate(&config).await?;
    Ok(config)
}

async fn check_exists(path: &Path, label: &str) -> RunnerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| RunnerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(RunnerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

async fn validate(config: &RunnerConfig) -> RunnerResult<()> {
    check_exists(&config.firecracker.binary, "firecracker binary").await?;
    check_exists(&config.firecracker.kernel, "kernel").await?;
    check_exists(&config.firecracker.rootfs, "rootfs").await?;
    if !config.group.contains('/') {
        return Err(RunnerError::Config(format!(
            "group must be <scope>/<name>, got: {}",
            config.group
        )));
    }
    Ok(())
}

impl RunnerConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        resolve(&mut self.firecracker.binary);
        resolve(&mut self.firecracker.kernel);
        resolve(&mut self.firecracker.rootfs);
        if let Some(ca_dir) = &mut self.proxy.ca_dir {
            resolve(ca_dir);
        }
    }

    pub fn firecracker_config(&self) -> sandbox_fc::FirecrackerConfig {
        sandbox_fc::FirecrackerConfig {
            binary_path: self.firecracker.binary.clone(),
            kernel_path: self.firecracker.kernel.clone(),
            rootfs_path: self.firecracker.rootfs.clone(),
            base_dir: self.base_dir.clone(),
            max_vms: self.sandbox.max_concurrent,
        }
    }
}
