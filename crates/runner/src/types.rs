use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Claim (execution context)
// ---------------------------------------------------------------------------

/// Everything the executor needs to run one job. Immutable once claimed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub sandbox_token: String,
    pub prompt: String,
    pub working_dir: String,
    /// Tag selecting the in-guest agent binary; empty means the default.
    #[serde(default)]
    pub cli_agent_type: String,
    /// User environment, already expanded from template references.
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
    /// Plaintext secret values, for in-guest log masking.
    #[serde(default)]
    pub secret_values: Option<Vec<String>>,
    #[serde(default)]
    pub storage_manifest: Option<StorageManifest>,
    #[serde(default)]
    pub resume_session: Option<ResumeSession>,
    #[serde(default)]
    pub firewall_policy: Option<FirewallPolicy>,
    /// Epoch milliseconds at which the platform accepted the run.
    #[serde(default)]
    pub api_start_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManifest {
    #[serde(default)]
    pub artifact: Option<ArtifactEntry>,
    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEntry {
    pub name: String,
    pub version_id: String,
    pub mount_path: String,
    /// Pre-signed download URL; content-addressed platform fetch otherwise.
    #[serde(default)]
    pub archive_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    pub name: String,
    pub version_id: String,
    pub mount_path: String,
    /// Optional volumes absent upstream are skipped silently.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub archive_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    pub session_history: String,
    /// Working directory the session was recorded under; falls back to the
    /// context working dir.
    #[serde(default)]
    pub working_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Firewall policy
// ---------------------------------------------------------------------------

/// Ordered first-match rules plus the two proxy behaviour flags. A job
/// without a policy gets direct egress and no network logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPolicy {
    pub rules: Vec<FirewallRule>,
    #[serde(default)]
    pub mitm_enabled: bool,
    #[serde(default)]
    pub seal_secrets_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub action: RuleAction,
    /// Hostname glob (`*.example.com`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// CIDR block matched against the resolved destination address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    #[serde(rename = "allow")]
    Allow,
    #[serde(rename = "deny")]
    Deny,
}

// ---------------------------------------------------------------------------
// Completion / events
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub run_id: Uuid,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub run_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_claim_deserializes() {
        let json = r#"{
            "runId": "550e8400-e29b-41d4-a716-446655440000",
            "sandboxToken": "tok",
            "prompt": "echo hi",
            "workingDir": "/workspace"
        }"#;
        let ctx: ExecutionContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.prompt, "echo hi");
        assert!(ctx.cli_agent_type.is_empty());
        assert!(ctx.firewall_policy.is_none());
        assert!(ctx.storage_manifest.is_none());
    }

    #[test]
    fn full_claim_deserializes() {
        let json = r#"{
            "runId": "550e8400-e29b-41d4-a716-446655440000",
            "sandboxToken": "tok",
            "prompt": "build it",
            "workingDir": "/workspace",
            "cliAgentType": "codex",
            "environment": {"FOO": "bar"},
            "secretValues": ["hunter2"],
            "storageManifest": {
                "artifact": {"name": "app", "versionId": "v1", "mountPath": "/workspace"},
                "volumes": [
                    {"name": "cache", "versionId": "v9", "mountPath": "/cache", "optional": true}
                ]
            },
            "resumeSession": {"sessionId": "s-1", "sessionHistory": "{}"},
            "firewallPolicy": {
                "rules": [{"action": "allow", "host": "api.example.com"}],
                "mitmEnabled": true,
                "sealSecretsEnabled": true
            },
            "apiStartTime": 1700000000000.0
        }"#;
        let ctx: ExecutionContext = serde_json::from_str(json).unwrap();
        let manifest = ctx.storage_manifest.unwrap();
        assert_eq!(manifest.artifact.unwrap().name, "app");
        assert!(manifest.volumes[0].optional);
        let policy = ctx.firewall_policy.unwrap();
        assert!(policy.mitm_enabled);
        assert_eq!(policy.rules[0].action, RuleAction::Allow);
        assert_eq!(policy.rules[0].host.as_deref(), Some("api.example.com"));
    }

    #[test]
    fn firewall_rule_wire_format() {
        let rules = vec![
            FirewallRule {
                action: RuleAction::Allow,
                host: Some("*.example.com".into()),
                cidr: None,
                port: None,
            },
            FirewallRule {
                action: RuleAction::Deny,
                host: None,
                cidr: Some("10.0.0.0/8".into()),
                port: None,
            },
        ];
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json[0]["action"], "allow");
        assert_eq!(json[0]["host"], "*.example.com");
        assert!(json[0].get("cidr").is_none());
        assert_eq!(json[1]["cidr"], "10.0.0.0/8");
    }

    #[test]
    fn complete_request_omits_missing_error() {
        let req = CompleteRequest {
            run_id: Uuid::nil(),
            exit_code: 0,
            error: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert!(json.get("error").is_none());
    }
}
