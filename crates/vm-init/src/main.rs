//! PID 1 for the microVM.
//!
//! Boot contract: the base rootfs arrives read-only on /dev/vda (squashfs),
//! the per-VM writable layer on /dev/vdb (ext4). The kernel configures eth0
//! from its `ip=` boot argument before userspace starts. This binary:
//!
//! 1. assembles the overlayfs root and pivots into it,
//! 2. installs PID 1 signal handlers and reaps zombies,
//! 3. runs the vsock agent shim until the host requests shutdown,
//! 4. powers the machine off.

mod fs;
mod pid1;

use std::thread;
use std::time::Duration;

fn main() {
    eprintln!("[vm-init] starting");

    if let Err(e) = fs::assemble_root() {
        eprintln!("[vm-init] FATAL: root assembly failed: {e}");
        std::process::exit(1);
    }

    pid1::install_signal_handlers();

    // Reap orphans continuously while the agent shim owns the foreground.
    thread::spawn(|| {
        loop {
            pid1::reap_zombies();
            if pid1::shutdown_requested() {
                eprintln!("[vm-init] shutdown signal received");
                pid1::power_off();
            }
            thread::sleep(Duration::from_millis(100));
        }
    });

    match vsock_guest::run(None) {
        Ok(()) => {
            eprintln!("[vm-init] agent shim finished, powering off");
            pid1::power_off();
        }
        Err(e) => {
            vsock_guest::log("ERROR", &format!("fatal: {e}"));
            std::process::exit(1);
        }
    }
}
