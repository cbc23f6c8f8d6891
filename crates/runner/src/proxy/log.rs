//! Network log records: one JSONL line per proxied connection.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLogRecord {
    pub timestamp: String,
    /// `mitm` for parsed flows (plaintext HTTP or decrypted HTTPS),
    /// `sni` for opaque TLS passthrough.
    pub mode: String,
    /// `ALLOW` or `DENY`.
    pub action: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_matched: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
}

impl NetworkLogRecord {
    /// A connection-level record (no HTTP visibility).
    pub fn connection(mode: &str, action: &str, host: &str, port: u16, rule: Option<&str>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            mode: mode.to_string(),
            action: action.to_string(),
            host: host.to_string(),
            port,
            rule_matched: rule.map(String::from),
            method: None,
            url: None,
            status: None,
            latency_ms: None,
            request_size: None,
            response_size: None,
        }
    }
}

/// Append one record to the VM's JSONL sink. Best-effort: a log failure
/// never affects the proxied connection.
pub async fn append(path: &Path, record: &NetworkLogRecord) {
    let Ok(mut line) = serde_json::to_vec(record) else {
        return;
    };
    line.push(b'\n');

    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!(error = %e, "network log dir create failed");
        return;
    }

    let result = async {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await
    }
    .await;

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "network log append failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run.jsonl");

        append(
            &path,
            &NetworkLogRecord::connection("sni", "ALLOW", "api.example.com", 443, Some("host:*")),
        )
        .await;
        append(
            &path,
            &NetworkLogRecord::connection("sni", "DENY", "evil.example.com", 443, None),
        )
        .await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "ALLOW");
        assert_eq!(first["host"], "api.example.com");
        assert_eq!(first["ruleMatched"], "host:*");
        assert!(first.get("method").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["action"], "DENY");
        assert!(second.get("ruleMatched").is_none());
    }

    #[test]
    fn mitm_fields_serialize_camel_case() {
        let mut record =
            NetworkLogRecord::connection("mitm", "ALLOW", "api.example.com", 443, None);
        record.method = Some("POST".into());
        record.url = Some("https://api.example.com/v1".into());
        record.status = Some(200);
        record.latency_ms = Some(42);
        record.request_size = Some(128);
        record.response_size = Some(4096);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["latencyMs"], 42);
        assert_eq!(json["requestSize"], 128);
        assert_eq!(json["responseSize"], 4096);
        assert_eq!(json["status"], 200);
    }
}
