//! Job executor: one ExecutionContext → one completed run.
//!
//! The run's resources (VM, network identity, registry entry, log files)
//! are all reclaimed by the teardown block at the bottom of
//! [`execute_inner`], which runs on every control path. Infrastructure
//! failures (boot/handshake timeouts, exhausted network slots) are NACKed
//! back to the platform instead of failing the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use sandbox::{ExecRequest, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::error::{RunnerError, RunnerResult};
use crate::paths::{RunnerPaths, guest};
use crate::registry::{VmRegistry, VmRegistryEntry};
use crate::telemetry::JobTelemetry;
use crate::types::{ExecutionContext, ResumeSession};
use crate::{network_logs, session, storage};

/// Extra host-side wait beyond the guest-side job timeout, so the guest's
/// own kill (and its exit report) wins the race.
const WAIT_EXIT_SLACK: Duration = Duration::from_secs(5);

/// Timeout for short guest housekeeping commands.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Exit codes that warrant an OOM probe (SIGKILL family).
const OOM_EXIT_CODES: [i32; 2] = [9, 137];

/// Stable user-visible OOM message.
pub const OOM_ERROR: &str = "Agent process killed by OOM killer";

/// Markers searched for in the guest's dmesg tail.
const OOM_MARKERS: [&str; 3] = ["out of memory", "oom-killer", "killed"];

pub struct ExecutorConfig {
    pub api_url: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    /// Wall-clock ceiling for the agent process. Host policy.
    pub max_job: Duration,
    /// Whether the proxy CA is available (adds the extra CA trust variable
    /// for MITM'd runs).
    pub mitm_ca_available: bool,
}

/// Everything a job execution borrows from the host process.
pub struct ExecutorDeps {
    pub api: ApiClient,
    pub factory: Arc<dyn SandboxFactory>,
    pub registry: Arc<VmRegistry>,
    pub proxy_port: u16,
    pub paths: Arc<RunnerPaths>,
    pub config: ExecutorConfig,
}

/// Run one job end to end and report its outcome to the platform.
pub async fn execute_job(deps: &ExecutorDeps, context: ExecutionContext) {
    let run_id = context.run_id;

    match execute_inner(deps, &context).await {
        Ok((exit_code, err)) => {
            info!(run_id = %run_id, exit_code, "job finished, reporting completion");
            report_completion(deps, &context, exit_code, err.as_deref()).await;
        }
        Err(e) if e.is_infrastructure() => {
            error!(run_id = %run_id, error = %e, "infrastructure failure, returning claim");
            deps.api
                .emit_event(
                    &context.sandbox_token,
                    run_id,
                    e.event_kind(),
                    serde_json::json!({ "error": e.to_string() }),
                )
                .await;
            deps.api.nack(run_id, &e.to_string()).await;
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "job execution failed");
            report_completion(deps, &context, 1, Some(&e.to_string())).await;
        }
    }
}

/// Completion is the run's terminal signal; retry once before giving up.
async fn report_completion(
    deps: &ExecutorDeps,
    context: &ExecutionContext,
    exit_code: i32,
    error: Option<&str>,
) {
    let run_id = context.run_id;
    if let Err(e) = deps
        .api
        .complete(&context.sandbox_token, run_id, exit_code, error)
        .await
    {
        warn!(run_id = %run_id, error = %e, "completion report failed, retrying");
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Err(e) = deps
            .api
            .complete(&context.sandbox_token, run_id, exit_code, error)
            .await
        {
            error!(run_id = %run_id, error = %e, "failed to report completion after retry");
        }
    }
}

async fn execute_inner(
    deps: &ExecutorDeps,
    context: &ExecutionContext,
) -> RunnerResult<(i32, Option<String>)> {
    let run_id = context.run_id;
    let mut telemetry = JobTelemetry::new(
        deps.api.http().clone(),
        run_id,
        context.sandbox_token.clone(),
    );

    // Time from the platform accepting the run to this host picking it up.
    if let Some(api_start_ms) = context.api_start_time {
        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
        let latency = (now_ms - api_start_ms).max(0.0) as u64;
        telemetry.record(
            "api_to_vm_start",
            Duration::from_millis(latency),
            true,
            None,
        );
    }

    let sandbox_config = SandboxConfig {
        id: run_id,
        resources: sandbox::ResourceLimits {
            cpu_count: deps.config.vcpu,
            memory_mb: deps.config.memory_mb,
        },
    };

    info!(run_id = %run_id, "creating vm");
    let mut vm = telemetry
        .timed("vm_create", deps.factory.create(sandbox_config))
        .await?;
    let source_ip = vm.source_ip().to_string();

    // Register with the proxy before the guest boots so its very first
    // connection is already attributable and policed.
    let firewall_enabled = context.firewall_policy.is_some();
    if let Some(policy) = &context.firewall_policy {
        deps.registry
            .register(
                &source_ip,
                VmRegistryEntry {
                    run_id: run_id.to_string(),
                    sandbox_token: context.sandbox_token.clone(),
                    firewall_rules: policy.rules.clone(),
                    mitm_enabled: policy.mitm_enabled,
                    seal_secrets_enabled: policy.seal_secrets_enabled,
                    network_log_path: deps.paths.network_log(&run_id),
                    registered_at: chrono::Utc::now().timestamp_millis(),
                },
            )
            .await;
    }

    let result = async {
        if firewall_enabled {
            vm.redirect_egress(deps.proxy_port).await?;
        }
        telemetry.timed("vm_start", vm.start()).await?;
        run_in_vm(vm.as_ref(), deps, context, &mut telemetry).await
    }
    .await;

    // -- teardown: reached on every path ------------------------------------
    if firewall_enabled {
        deps.registry.unregister(&source_ip).await;
        network_logs::upload_network_logs(
            deps.api.http(),
            run_id,
            &context.sandbox_token,
            &deps.paths.network_log(&run_id),
        )
        .await;
    }
    if let Err(e) = vm.stop().await {
        warn!(run_id = %run_id, error = %e, "vm stop failed");
    }
    deps.factory.destroy(vm).await;
    telemetry.flush().await;

    result
}

async fn run_in_vm(
    vm: &dyn Sandbox,
    deps: &ExecutorDeps,
    context: &ExecutionContext,
    telemetry: &mut JobTelemetry,
) -> RunnerResult<(i32, Option<String>)> {
    let run_id = context.run_id;

    // Stage storage snapshots in parallel.
    if let Some(manifest) = &context.storage_manifest {
        telemetry
            .timed(
                "storage_stage",
                storage::stage_all(vm, deps.api.http(), context, manifest),
            )
            .await?;
    }

    if let Some(resume) = &context.resume_session {
        restore_session(vm, context, resume).await?;
    }

    // The environment file is the supervised entrypoint's only input.
    let env = build_env_map(context, &deps.config);
    let env_json = serde_json::to_vec_pretty(&env)
        .map_err(|e| RunnerError::Internal(format!("env json: {e}")))?;
    vm.write_file(guest::ENV_FILE, &env_json).await?;

    let log_file = guest::system_log(&run_id);
    let agent_cmd = format!("{} > {log_file} 2>&1", guest::AGENT_ENTRYPOINT);
    info!(run_id = %run_id, "spawning agent");

    let handle = vm
        .spawn_watch(&ExecRequest {
            cmd: &agent_cmd,
            timeout: deps.config.max_job,
        })
        .await?;

    let exit = match vm
        .wait_exit(handle, deps.config.max_job + WAIT_EXIT_SLACK)
        .await
    {
        Ok(exit) => exit,
        Err(SandboxError::Timeout) => {
            return Ok((
                1,
                Some(format!(
                    "Agent execution timed out after {}s",
                    deps.config.max_job.as_secs()
                )),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    info!(run_id = %run_id, exit_code = exit.exit_code, "agent exited");

    if OOM_EXIT_CODES.contains(&exit.exit_code) && probe_oom(vm).await {
        return Ok((1, Some(OOM_ERROR.to_string())));
    }

    Ok((exit.exit_code, completion_error(exit.exit_code, &exit.stderr)))
}

/// Error string for the completion webhook. A non-zero exit always carries
/// one: the guest's stderr when it said anything, a generic reason
/// otherwise. The agent command redirects its streams into the guest log
/// file, so the exit event's stderr is usually empty.
fn completion_error(exit_code: i32, stderr: &[u8]) -> Option<String> {
    if exit_code == 0 {
        return None;
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        Some("Unknown error".to_string())
    } else {
        Some(stderr.to_string())
    }
}

/// Stage the prior session's history file under the agent family's tree.
async fn restore_session(
    vm: &dyn Sandbox,
    context: &ExecutionContext,
    resume: &ResumeSession,
) -> RunnerResult<()> {
    let working_dir = resume
        .working_dir
        .as_deref()
        .unwrap_or(&context.working_dir);
    let Some(path) =
        session::session_history_path(&context.cli_agent_type, working_dir, &resume.session_id)
    else {
        debug!(
            run_id = %context.run_id,
            agent = %context.cli_agent_type,
            "agent family without session restore, skipping"
        );
        return Ok(());
    };

    vm.write_file(&path, resume.session_history.as_bytes())
        .await?;
    info!(run_id = %context.run_id, path = %path, "session history restored");
    Ok(())
}

/// Scan the guest's kernel log for OOM-killer traces.
async fn probe_oom(vm: &dyn Sandbox) -> bool {
    let result = vm
        .exec(&ExecRequest {
            cmd: "dmesg | tail -n 50",
            timeout: DEFAULT_EXEC_TIMEOUT,
        })
        .await;
    match result {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout).to_lowercase();
            OOM_MARKERS.iter().any(|marker| text.contains(marker))
        }
        Err(e) => {
            warn!(error = %e, "oom probe failed");
            false
        }
    }
}

/// Build the environment map written into the guest.
fn build_env_map(context: &ExecutionContext, config: &ExecutorConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();

    env.insert("SKIFF_API_URL".into(), config.api_url.clone());
    env.insert("SKIFF_RUN_ID".into(), context.run_id.to_string());
    env.insert("SKIFF_API_TOKEN".into(), context.sandbox_token.clone());
    env.insert("SKIFF_PROMPT".into(), context.prompt.clone());
    env.insert("SKIFF_WORKING_DIR".into(), context.working_dir.clone());
    env.insert(
        "SKIFF_API_START_TIME".into(),
        context
            .api_start_time
            .map(|t| t.to_string())
            .unwrap_or_default(),
    );
    // The platform omits the agent type for the default agent.
    env.insert(
        "CLI_AGENT_TYPE".into(),
        if context.cli_agent_type.is_empty() {
            "claude-code".into()
        } else {
            context.cli_agent_type.clone()
        },
    );

    // Optional pass-through: mock agent binary for integration testing.
    if let Ok(mock) = std::env::var("SKIFF_MOCK_AGENT") {
        env.insert("SKIFF_MOCK_AGENT".into(), mock);
    }

    if let Some(artifact) = context
        .storage_manifest
        .as_ref()
        .and_then(|m| m.artifact.as_ref())
    {
        env.insert("SKIFF_ARTIFACT_DRIVER".into(), "snapshot".into());
        env.insert(
            "SKIFF_ARTIFACT_MOUNT_PATH".into(),
            artifact.mount_path.clone(),
        );
        env.insert("SKIFF_ARTIFACT_VOLUME_NAME".into(), artifact.name.clone());
        env.insert(
            "SKIFF_ARTIFACT_VERSION_ID".into(),
            artifact.version_id.clone(),
        );
    }

    if let Some(resume) = &context.resume_session {
        env.insert("SKIFF_RESUME_SESSION_ID".into(), resume.session_id.clone());
    }

    if let Some(user_env) = &context.environment {
        for (key, value) in user_env {
            env.insert(key.clone(), value.clone());
        }
    }

    // Base64-encoded, comma-separated secret values for in-guest masking.
    // Appended after the user environment so it cannot be overridden.
    if let Some(secrets) = &context.secret_values
        && !secrets.is_empty()
    {
        let encoded: Vec<String> = secrets
            .iter()
            .map(|s| base64::engine::general_purpose::STANDARD.encode(s))
            .collect();
        env.insert("SKIFF_SECRET_VALUES".into(), encoded.join(","));
    }

    // Node-based agents only trust the interception CA when it is named
    // explicitly.
    if config.mitm_ca_available
        && context
            .firewall_policy
            .as_ref()
            .is_some_and(|p| p.mitm_enabled)
    {
        env.insert("NODE_EXTRA_CA_CERTS".into(), guest::PROXY_CA_CERT.into());
    }

    env
}
