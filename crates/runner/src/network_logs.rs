use std::path::Path;

use reqwest::Method;
use tracing::{info, warn};
use uuid::Uuid;

use crate::http::HttpClient;
use crate::proxy::log::NetworkLogRecord;

/// Upload a run's network log JSONL to the platform and delete the file on
/// success. Best-effort: failures only warn.
pub async fn upload_network_logs(http: &HttpClient, run_id: Uuid, sandbox_token: &str, path: &Path) {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "failed to read network logs");
            return;
        }
    };

    let records: Vec<NetworkLogRecord> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "malformed network log line skipped");
                None
            }
        })
        .collect();

    if records.is_empty() {
        let _ = tokio::fs::remove_file(path).await;
        return;
    }

    info!(run_id = %run_id, count = records.len(), "uploading network logs");

    let result = http
        .request(Method::POST, "/telemetry/network", sandbox_token)
        .json(&records)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(run_id = %run_id, error = %e, "failed to delete network log file");
            }
        }
        Ok(resp) => {
            warn!(run_id = %run_id, status = %resp.status(), "network log upload rejected");
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "network log upload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_lines_parse_into_records() {
        let sni = r#"{"timestamp":"2026-03-01T10:00:00Z","mode":"sni","action":"ALLOW","host":"example.com","port":443,"ruleMatched":"host:*.example.com"}"#;
        let mitm = r#"{"timestamp":"2026-03-01T10:00:01Z","mode":"mitm","action":"ALLOW","host":"api.example.com","port":443,"method":"POST","url":"https://api.example.com/v1","status":200,"latencyMs":12,"requestSize":4,"responseSize":128}"#;

        let a: NetworkLogRecord = serde_json::from_str(sni).unwrap();
        assert_eq!(a.mode, "sni");
        assert!(a.method.is_none());

        let b: NetworkLogRecord = serde_json::from_str(mitm).unwrap();
        assert_eq!(b.status, Some(200));
        assert_eq!(b.latency_ms, Some(12));
    }

    #[test]
    fn malformed_line_is_not_a_record() {
        assert!(serde_json::from_str::<NetworkLogRecord>("not json").is_err());
    }
}
