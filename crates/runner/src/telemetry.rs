use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::http::HttpClient;

/// Auto-flush pending ops once the oldest has waited this long.
const FLUSH_THRESHOLD: Duration = Duration::from_secs(30);

/// Telemetry requests get a shorter timeout than regular API calls.
const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct SandboxOp {
    action_type: String,
    duration_ms: u64,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Per-job collector for sandbox operation metrics.
///
/// Buffers `{actionType, durationMs, success}` records, auto-flushes on the
/// 30 s threshold (fire-and-forget) and flushes at job end. Owns its state:
/// passed as `&mut`, no lock needed.
pub struct JobTelemetry {
    http: HttpClient,
    run_id: Uuid,
    sandbox_token: String,
    pending: Vec<SandboxOp>,
    oldest_pending: Option<Instant>,
}

impl JobTelemetry {
    pub fn new(http: HttpClient, run_id: Uuid, sandbox_token: String) -> Self {
        Self {
            http,
            run_id,
            sandbox_token,
            pending: Vec::new(),
            oldest_pending: None,
        }
    }

    /// Record one timed operation.
    pub fn record(
        &mut self,
        action_type: &str,
        duration: Duration,
        success: bool,
        error: Option<&str>,
    ) {
        self.pending.push(SandboxOp {
            action_type: action_type.to_string(),
            duration_ms: duration.as_millis() as u64,
            success,
            error: error.map(String::from),
        });
        if self.oldest_pending.is_none() {
            self.oldest_pending = Some(Instant::now());
        }

        if let Some(oldest) = self.oldest_pending
            && oldest.elapsed() >= FLUSH_THRESHOLD
        {
            self.flush_in_background();
        }
    }

    /// Time an operation and record it with the outcome of `f`.
    pub async fn timed<T, E: std::fmt::Display>(
        &mut self,
        action_type: &str,
        f: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let start = Instant::now();
        let result = f.await;
        match &result {
            Ok(_) => self.record(action_type, start.elapsed(), true, None),
            Err(e) => self.record(action_type, start.elapsed(), false, Some(&e.to_string())),
        }
        result
    }

    /// Final flush; consumes self so nothing records afterwards.
    pub async fn flush(mut self) {
        if self.pending.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.pending);
        send_ops(&self.http, self.run_id, &self.sandbox_token, ops).await;
    }

    fn flush_in_background(&mut self) {
        let ops = std::mem::take(&mut self.pending);
        self.oldest_pending = None;

        let http = self.http.clone();
        let run_id = self.run_id;
        let token = self.sandbox_token.clone();
        tokio::spawn(async move {
            send_ops(&http, run_id, &token, ops).await;
        });
    }
}

async fn send_ops(http: &HttpClient, run_id: Uuid, sandbox_token: &str, ops: Vec<SandboxOp>) {
    if ops.is_empty() {
        return;
    }
    let result = http
        .request(reqwest::Method::POST, "/telemetry/ops", sandbox_token)
        .timeout(TELEMETRY_TIMEOUT)
        .json(&ops)
        .send()
        .await;

    match result {
        Ok(resp) if !resp.status().is_success() => {
            warn!(run_id = %run_id, status = %resp.status(), "telemetry flush rejected");
        }
        Err(e) => warn!(run_id = %run_id, error = %e, "telemetry flush failed"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_serializes_camel_case() {
        let op = SandboxOp {
            action_type: "vm_start".into(),
            duration_ms: 1500,
            success: true,
            error: None,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["actionType"], "vm_start");
        assert_eq!(json["durationMs"], 1500);
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn record_buffers_ops() {
        let http = HttpClient::new("http://localhost".into()).unwrap();
        let mut telemetry = JobTelemetry::new(http, Uuid::nil(), "tok".into());

        telemetry.record("vm_create", Duration::from_millis(500), true, None);
        telemetry.record("agent_execute", Duration::from_secs(9), false, Some("timeout"));

        assert_eq!(telemetry.pending.len(), 2);
        assert_eq!(telemetry.pending[0].action_type, "vm_create");
        assert!(telemetry.pending[0].success);
        assert_eq!(telemetry.pending[1].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn timed_records_failure() {
        let http = HttpClient::new("http://localhost".into()).unwrap();
        let mut telemetry = JobTelemetry::new(http, Uuid::nil(), "tok".into());

        let result: Result<(), String> = telemetry
            .timed("probe", async { Err("boom".to_string()) })
            .await;
        assert!(result.is_err());
        assert_eq!(telemetry.pending.len(), 1);
        assert!(!telemetry.pending[0].success);
        assert_eq!(telemetry.pending[0].error.as_deref(), Some("boom"));
    }
}
