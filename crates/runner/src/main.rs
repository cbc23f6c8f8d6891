mod api;
mod benchmark;
mod config;
mod error;
mod executor;
mod http;
mod network_logs;
mod paths;
mod poller;
mod proxy;
mod registry;
mod seal;
mod session;
mod status;
mod storage;
mod telemetry;
mod types;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the runner: claim jobs and execute them in microVMs
    Start(Box<poller::StartArgs>),
    /// Run a single command in a fresh VM for benchmarking
    Benchmark(benchmark::BenchmarkArgs),
    /// Mint a sealed secret token (for exercising the egress proxy)
    SealToken(SealTokenArgs),
}

#[derive(clap::Args)]
struct SealTokenArgs {
    /// Base64 master key, shared with the running proxy
    #[arg(long, env = "SKIFF_SEAL_MASTER_KEY", hide_env_values = true)]
    master_key: String,
    /// Run id the token is bound to
    #[arg(long)]
    run_id: String,
    /// User id recorded in the token
    #[arg(long)]
    user_id: String,
    /// Secret name recorded in the token
    #[arg(long)]
    name: String,
    /// Plaintext secret value
    #[arg(long)]
    value: String,
    /// Token lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    ttl_secs: i64,
}

fn run_seal_token(args: SealTokenArgs) -> Result<ExitCode, error::RunnerError> {
    use base64::Engine as _;
    let master = base64::engine::general_purpose::STANDARD
        .decode(args.master_key.trim())
        .map_err(|e| error::RunnerError::Config(format!("master key: {e}")))?;
    let sealer = seal::Sealer::from_master(&master);
    let token = sealer
        .seal(
            &args.run_id,
            &args.user_id,
            &args.name,
            &args.value,
            chrono::Utc::now().timestamp_millis(),
            args.ttl_secs * 1000,
        )
        .map_err(|e| error::RunnerError::Internal(e.to_string()))?;
    println!("{token}");
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    // Pin the process-wide TLS provider before any rustls config is built;
    // reqwest enables a second provider feature and rustls refuses to guess.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    if nix::unistd::getuid().is_root() {
        eprintln!("error: runner must not run as root (it invokes sudo internally as needed)");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start(args) => poller::run_start(*args).await.map(|()| ExitCode::SUCCESS),
        Command::Benchmark(args) => benchmark::run_benchmark(args).await,
        Command::SealToken(args) => run_seal_token(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
