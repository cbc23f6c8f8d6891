//! PID 1 duties: signal handling, zombie reaping, power-off.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Install PID 1 signal handlers.
///
/// SIGTERM/SIGINT set the shutdown flag; SIGTTIN/SIGTTOU and SIGPIPE are
/// ignored. SIGCHLD stays at SIG_DFL: SIG_IGN would make the kernel
/// auto-reap children and race the shim's own waitpid calls.
pub fn install_signal_handlers() {
    // SAFETY: installing handlers before any other threads exist; the
    // handler only touches an atomic.
    unsafe {
        libc::signal(libc::SIGTERM, on_shutdown_signal as *const () as usize);
        libc::signal(libc::SIGINT, on_shutdown_signal as *const () as usize);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Reap every zombie that is ready (non-blocking).
pub fn reap_zombies() {
    loop {
        // SAFETY: waitpid with WNOHANG and a null status pointer is safe.
        let reaped = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if reaped <= 0 {
            break;
        }
    }
}

/// Sync and power the machine off. Never returns on success.
pub fn power_off() -> ! {
    // SAFETY: sync(2) has no preconditions.
    unsafe {
        libc::sync();
    }
    let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF);
    // reboot(2) only fails without CAP_SYS_BOOT; nothing left to do but exit.
    std::process::exit(0);
}
