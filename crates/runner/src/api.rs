use reqwest::{Method, StatusCode};
use tracing::warn;
use uuid::Uuid;

use crate::error::{RunnerError, RunnerResult};
use crate::http::HttpClient;
use crate::types::{CompleteRequest, EventRequest, ExecutionContext};

/// Client for the platform runner API.
///
/// The runner token authenticates host-level calls (claim/nack); everything
/// scoped to one run uses that run's sandbox token.
#[derive(Clone)]
pub struct ApiClient {
    http: HttpClient,
    runner_token: String,
}

impl ApiClient {
    pub fn new(http: HttpClient, runner_token: String) -> Self {
        Self { http, runner_token }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Claim the next job for this runner group. `None` when the queue is
    /// empty.
    pub async fn claim(&self, runner_group: &str) -> RunnerResult<Option<ExecutionContext>> {
        let resp = self
            .http
            .request(Method::POST, "/runners/claim", &self.runner_token)
            .json(&serde_json::json!({ "runnerGroup": runner_group }))
            .send()
            .await
            .map_err(|e| RunnerError::Api(format!("claim: {e}")))?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RunnerError::Api(format!("claim {status}: {body}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| RunnerError::Api(format!("claim body: {e}")))?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let ctx: ExecutionContext = serde_json::from_str(&body)
            .map_err(|e| RunnerError::Api(format!("claim decode: {e}")))?;
        Ok(Some(ctx))
    }

    /// Return a claim so the platform can reassign it. Best-effort.
    pub async fn nack(&self, run_id: Uuid, reason: &str) {
        let path = format!("/runners/jobs/{run_id}/nack");
        let result = self
            .http
            .request(Method::POST, &path, &self.runner_token)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(run_id = %run_id, status = %resp.status(), "nack rejected");
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "nack failed"),
            _ => {}
        }
    }

    /// Report run completion through the agent webhook.
    pub async fn complete(
        &self,
        sandbox_token: &str,
        run_id: Uuid,
        exit_code: i32,
        error: Option<&str>,
    ) -> RunnerResult<()> {
        let body = CompleteRequest {
            run_id,
            exit_code,
            error: error.map(String::from),
        };
        let resp = self
            .http
            .request(Method::POST, "/webhooks/agent/complete", sandbox_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RunnerError::Api(format!("complete: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RunnerError::Api(format!("complete {status}: {body}")));
        }
        Ok(())
    }

    /// Emit a run lifecycle event. Best-effort.
    pub async fn emit_event(
        &self,
        sandbox_token: &str,
        run_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) {
        let body = EventRequest {
            run_id,
            kind: kind.to_string(),
            payload,
        };
        let result = self
            .http
            .request(Method::POST, "/events", sandbox_token)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(run_id = %run_id, kind, status = %resp.status(), "event rejected");
            }
            Err(e) => warn!(run_id = %run_id, kind, error = %e, "event failed"),
            _ => {}
        }
    }
}
