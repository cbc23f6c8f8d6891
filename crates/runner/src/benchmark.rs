//! Benchmark mode: run one command directly in a fresh VM and report its
//! wall-clock phases. No platform, no supervised entrypoint: the command
//! is the user's prompt executed as-is.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Args;
use sandbox::{ExecRequest, SandboxConfig, SandboxFactory};
use sandbox_fc::FirecrackerFactory;
use tracing::info;
use uuid::Uuid;

use crate::error::RunnerResult;

#[derive(Args)]
pub struct BenchmarkArgs {
    /// Path to the Firecracker binary
    #[arg(long)]
    firecracker: PathBuf,
    /// Path to the guest kernel image
    #[arg(long)]
    kernel: PathBuf,
    /// Path to the squashfs rootfs image
    #[arg(long)]
    rootfs: PathBuf,
    /// Base directory for runtime data
    #[arg(long)]
    base_dir: PathBuf,
    /// Command to run inside the guest
    #[arg(long)]
    command: String,
    /// vCPUs for the VM
    #[arg(long, default_value_t = 2)]
    vcpu: u32,
    /// Memory (MiB) for the VM
    #[arg(long, default_value_t = 2048)]
    memory_mb: u32,
    /// Guest-side command timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

pub async fn run_benchmark(args: BenchmarkArgs) -> RunnerResult<ExitCode> {
    tokio::fs::create_dir_all(&args.base_dir).await?;

    let mut factory = FirecrackerFactory::new(sandbox_fc::FirecrackerConfig {
        binary_path: args.firecracker,
        kernel_path: args.kernel,
        rootfs_path: args.rootfs,
        base_dir: args.base_dir,
        max_vms: 1,
    });
    factory.startup().await?;

    let create_start = Instant::now();
    let mut vm = factory
        .create(SandboxConfig {
            id: Uuid::new_v4(),
            resources: sandbox::ResourceLimits {
                cpu_count: args.vcpu,
                memory_mb: args.memory_mb,
            },
        })
        .await?;
    let created = create_start.elapsed();

    let boot_start = Instant::now();
    let exit_code = match vm.start().await {
        Ok(()) => {
            let booted = boot_start.elapsed();
            info!(create_ms = created.as_millis() as u64, boot_ms = booted.as_millis() as u64, "vm ready");

            let exec_start = Instant::now();
            let result = vm
                .exec(&ExecRequest {
                    cmd: &args.command,
                    timeout: Duration::from_secs(args.timeout_secs),
                })
                .await?;
            let ran = exec_start.elapsed();

            print!("{}", String::from_utf8_lossy(&result.stdout));
            eprint!("{}", String::from_utf8_lossy(&result.stderr));
            info!(
                exec_ms = ran.as_millis() as u64,
                exit_code = result.exit_code,
                "command finished"
            );
            result.exit_code
        }
        Err(e) => {
            factory.destroy(vm).await;
            factory.shutdown().await;
            return Err(e.into());
        }
    };

    let _ = vm.stop().await;
    factory.destroy(vm).await;
    factory.shutdown().await;

    Ok(if exit_code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(u8::try_from(exit_code.clamp(1, 255)).unwrap_or(1))
    })
}
