//! Claim loop: long-polls the platform for jobs in this host's runner group
//! and hands them to executors, bounded by the concurrency limit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use sandbox::SandboxFactory;
use sandbox_fc::FirecrackerFactory;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::api::ApiClient;
use crate::config;
use crate::error::{RunnerError, RunnerResult};
use crate::executor::{ExecutorConfig, ExecutorDeps, execute_job};
use crate::http::HttpClient;
use crate::paths::RunnerPaths;
use crate::proxy::mitm::ProxyCa;
use crate::proxy::{EgressProxy, ProxyConfig};
use crate::registry::VmRegistry;
use crate::seal::Sealer;
use crate::status::{RunnerMode, StatusTracker};

/// Wait between claim attempts when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct StartArgs {
    /// Path to the runner.yaml config file
    #[arg(long)]
    config: PathBuf,
    /// Base64 master key for unsealing secret tokens at the proxy
    #[arg(long, env = "SKIFF_SEAL_MASTER_KEY", hide_env_values = true)]
    seal_master_key: Option<String>,
}

/// Bring up the host process and run the claim loop until signalled.
pub async fn run_start(args: StartArgs) -> RunnerResult<()> {
    let config = config::load(&args.config).await?;

    tokio::fs::create_dir_all(&config.base_dir).await?;
    let paths = Arc::new(RunnerPaths::new(config.base_dir.clone()));
    tokio::fs::create_dir_all(paths.network_logs_dir()).await?;

    let mut factory = FirecrackerFactory::new(config.firecracker_config());
    factory.startup().await?;
    let factory = Arc::new(factory);

    let registry = Arc::new(VmRegistry::open(paths.registry()).await);
    if !registry.is_empty() {
        info!(entries = registry.len(), "recovered proxy registry entries");
    }

    let sealer = match &args.seal_master_key {
        Some(encoded) => {
            use base64::Engine as _;
            let master = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| RunnerError::Config(format!("seal master key: {e}")))?;
            Some(Arc::new(Sealer::from_master(&master)))
        }
        None => None,
    };

    let ca = match &config.proxy.ca_dir {
        Some(dir) => Some(Arc::new(ProxyCa::load_or_generate(dir)?)),
        None => None,
    };
    let mitm_ca_available = ca.is_some();

    let proxy = EgressProxy::start(ProxyConfig {
        port: 0,
        registry: Arc::clone(&registry),
        sealer,
        ca,
    })
    .await?;

    let http = HttpClient::new(config.server.url.clone())?;
    let api = ApiClient::new(http, config.server.token.clone());

    let deps = Arc::new(ExecutorDeps {
        api,
        factory: Arc::clone(&factory) as Arc<dyn SandboxFactory>,
        registry,
        proxy_port: proxy.port(),
        paths: Arc::clone(&paths),
        config: ExecutorConfig {
            api_url: config.server.url.clone(),
            vcpu: config.sandbox.vcpu,
            memory_mb: config.sandbox.memory_mb,
            max_job: Duration::from_secs(config.sandbox.max_job_secs),
            mitm_ca_available,
        },
    });

    let status = Arc::new(StatusTracker::new(paths.status()));
    poll_loop(
        Arc::clone(&deps),
        Arc::clone(&status),
        config.group.clone(),
        config.sandbox.max_concurrent,
    )
    .await;

    proxy.stop();
    drop(deps);

    info!("shutting down factory");
    let mut factory = Arc::try_unwrap(factory)
        .map_err(|_| RunnerError::Internal("factory still referenced at shutdown".into()))?;
    factory.shutdown().await;

    status.set_mode(RunnerMode::Stopped).await;
    info!("runner stopped");
    Ok(())
}

async fn poll_loop(
    deps: Arc<ExecutorDeps>,
    status: Arc<StatusTracker>,
    group: String,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut jobs = JoinSet::new();

    status.write_initial().await;
    info!(group = %group, max_concurrent, "runner started, claiming jobs");

    // -----------------------------------------------------------------------
    // Signal handling: SIGTERM/SIGINT stop, SIGUSR1 drains.
    // -----------------------------------------------------------------------
    let (mode_tx, mut mode_rx) = tokio::sync::watch::channel(RunnerMode::Running);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigusr1 = signal(SignalKind::user_defined1()).ok();

        loop {
            tokio::select! {
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, stopping");
                    let _ = mode_tx.send(RunnerMode::Stopping);
                    return;
                }
                _ = recv_signal(&mut sigint) => {
                    info!("received SIGINT, stopping");
                    let _ = mode_tx.send(RunnerMode::Stopping);
                    return;
                }
                _ = recv_signal(&mut sigusr1) => {
                    info!("received SIGUSR1, draining");
                    let _ = mode_tx.send(RunnerMode::Draining);
                }
            }
        }
    });

    // -----------------------------------------------------------------------
    // Claim loop
    // -----------------------------------------------------------------------
    let mut current_mode = RunnerMode::Running;
    loop {
        let mode = *mode_rx.borrow_and_update();
        if mode != current_mode {
            current_mode = mode;
            status.set_mode(mode).await;
        }
        match mode {
            RunnerMode::Stopping | RunnerMode::Stopped => break,
            RunnerMode::Draining => {
                if jobs.is_empty() {
                    info!("all jobs drained");
                    break;
                }
                tokio::select! {
                    _ = mode_rx.changed() => {}
                    result = jobs.join_next() => {
                        if let Some(Err(e)) = result {
                            error!(error = %e, "job task panicked");
                        }
                    }
                }
                continue;
            }
            RunnerMode::Running => {}
        }

        // Saturated: stop claiming until a slot frees up.
        if semaphore.available_permits() == 0 {
            tokio::select! {
                _ = mode_rx.changed() => {}
                result = jobs.join_next() => {
                    if let Some(Err(e)) = result {
                        error!(error = %e, "job task panicked");
                    }
                }
            }
            continue;
        }

        let claimed = tokio::select! {
            result = deps.api.claim(&group) => result,
            _ = mode_rx.changed() => continue,
        };

        let context = match claimed {
            Ok(Some(context)) => context,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = mode_rx.changed() => {}
                }
                continue;
            }
            Err(e) => {
                error!(error = %e, "claim failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = mode_rx.changed() => {}
                }
                continue;
            }
        };

        let run_id = context.run_id;
        info!(run_id = %run_id, "job claimed, spawning executor");

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("semaphore closed unexpectedly");
                break;
            }
        };

        status.add_run(run_id).await;
        let deps = Arc::clone(&deps);
        let status = Arc::clone(&status);
        jobs.spawn(async move {
            execute_job(&deps, context).await;
            status.remove_run(run_id).await;
            drop(permit);
        });
    }

    // -----------------------------------------------------------------------
    // Drain remaining jobs (Stopping; Draining already waited above).
    // -----------------------------------------------------------------------
    let remaining = jobs.len();
    if remaining > 0 {
        info!(remaining, "waiting for running jobs to finish");
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "job task panicked during drain");
            }
        }
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
