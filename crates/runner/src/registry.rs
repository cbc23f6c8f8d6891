//! VM registry: the egress proxy's source of truth.
//!
//! Maps a VM's source IP (the veth peer address its traffic carries on the
//! host) to its run identity and firewall policy. Lives in memory behind a
//! mutex with O(1) critical sections; every mutation is mirrored to a JSON
//! file (atomic tmp+rename) so the view can be recovered across restarts.
//! Entries are bounded by the VM's lifetime: inserted before the guest boots,
//! removed during teardown on every path.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::FirewallRule;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRegistryEntry {
    pub run_id: String,
    pub sandbox_token: String,
    pub firewall_rules: Vec<FirewallRule>,
    pub mitm_enabled: bool,
    pub seal_secrets_enabled: bool,
    /// JSONL file the proxy appends this VM's NetworkLogRecords to.
    pub network_log_path: PathBuf,
    pub registered_at: i64,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRegistry {
    vms: HashMap<String, VmRegistryEntry>,
    updated_at: i64,
}

pub struct VmRegistry {
    inner: std::sync::Mutex<HashMap<String, VmRegistryEntry>>,
    persist_path: PathBuf,
}

impl VmRegistry {
    /// Open the registry, recovering any persisted view from a previous
    /// process. Stale entries are harmless: their IPs are only reachable
    /// while the owning VM's netns exists.
    pub async fn open(persist_path: PathBuf) -> Self {
        let recovered = match tokio::fs::read_to_string(&persist_path).await {
            Ok(content) => match serde_json::from_str::<PersistedRegistry>(&content) {
                Ok(persisted) => persisted.vms,
                Err(e) => {
                    warn!(error = %e, "corrupt registry file, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered registry entries");
        }
        Self {
            inner: std::sync::Mutex::new(recovered),
            persist_path,
        }
    }

    pub async fn register(&self, source_ip: &str, entry: VmRegistryEntry) {
        let run_id = entry.run_id.clone();
        {
            let mut map = self.lock();
            map.insert(source_ip.to_string(), entry);
        }
        self.persist().await;
        info!(source_ip, run_id = %run_id, "vm registered");
    }

    /// Idempotent; a missing key is a no-op.
    pub async fn unregister(&self, source_ip: &str) {
        let removed = {
            let mut map = self.lock();
            map.remove(source_ip).is_some()
        };
        self.persist().await;
        if removed {
            info!(source_ip, "vm unregistered");
        }
    }

    pub fn lookup(&self, source_ip: &str) -> Option<VmRegistryEntry> {
        self.lock().get(source_ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VmRegistryEntry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mirror the current map to disk; the snapshot is taken under the lock,
    /// the write happens outside it.
    async fn persist(&self) {
        let snapshot = PersistedRegistry {
            vms: self.lock().clone(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let Ok(content) = serde_json::to_vec(&snapshot) else {
            return;
        };
        let tmp = self.persist_path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, &content).await {
            warn!(error = %e, "registry persist failed");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.persist_path).await {
            warn!(error = %e, "registry rename failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleAction;

    fn entry(run_id: &str) -> VmRegistryEntry {
        VmRegistryEntry {
            run_id: run_id.into(),
            sandbox_token: "tok".into(),
            firewall_rules: vec![FirewallRule {
                action: RuleAction::Allow,
                host: Some("api.example.com".into()),
                cidr: None,
                port: None,
            }],
            mitm_enabled: true,
            seal_secrets_enabled: false,
            network_log_path: PathBuf::from("/tmp/log.jsonl"),
            registered_at: 1000,
        }
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::open(dir.path().join("registry.json")).await;

        registry.register("10.200.0.2", entry("run-1")).await;
        let found = registry.lookup("10.200.0.2").unwrap();
        assert_eq!(found.run_id, "run-1");
        assert!(found.mitm_enabled);

        registry.unregister("10.200.0.2").await;
        assert!(registry.lookup("10.200.0.2").is_none());

        // Idempotent on a missing key.
        registry.unregister("10.200.0.2").await;
        registry.unregister("10.200.0.99").await;
    }

    #[tokio::test]
    async fn registry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let registry = VmRegistry::open(path.clone()).await;
            registry.register("10.200.0.2", entry("run-1")).await;
            registry.register("10.200.0.6", entry("run-2")).await;
        }

        let recovered = VmRegistry::open(path).await;
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.lookup("10.200.0.6").unwrap().run_id, "run-2");
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let registry = VmRegistry::open(path).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reregister_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::open(dir.path().join("registry.json")).await;

        registry.register("10.200.0.2", entry("run-1")).await;
        registry.register("10.200.0.2", entry("run-2")).await;
        assert_eq!(registry.lookup("10.200.0.2").unwrap().run_id, "run-2");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn persisted_file_is_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = VmRegistry::open(path.clone()).await;
        registry.register("10.200.0.2", entry("run-1")).await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let vm = &json["vms"]["10.200.0.2"];
        assert_eq!(vm["runId"], "run-1");
        assert_eq!(vm["sealSecretsEnabled"], false);
        assert!(vm["firewallRules"].is_array());
    }
}
