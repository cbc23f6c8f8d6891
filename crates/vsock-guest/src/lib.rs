//! In-guest agent shim: serves the host's control RPCs over vsock.
//!
//! Runs as the only long-lived service inside the microVM (started by the
//! init process), so it is a plain synchronous implementation on std. The
//! host side of the protocol lives in `vsock-host`; framing in `vsock-proto`.
//!
//! Flow: connect to the host (CID 2), announce with `hello`, then answer
//! exec / write_file / spawn / shutdown requests until the host disconnects
//! or asks for shutdown.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vsock_proto::{
    CommandPayload, ExecResultPayload, ExitPayload, Frame, FrameDecoder, Kind, WriteFilePayload,
};

/// Set when the host requested shutdown; `run` stops reconnecting.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "linux")]
const HOST_CID: u32 = 2;

const READ_BUF_LEN: usize = 64 * 1024;

/// Exit code reported when the guest-side timeout kills a command
/// (matches `timeout(1)`).
const EXIT_CODE_TIMEOUT: i32 = 124;

/// Reconnect budget after a dropped connection.
const MAX_CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Account that agent commands run as in release images. Debug builds run
/// as the current user so the shim can be exercised on a dev host.
fn exec_user() -> Option<&'static str> {
    #[cfg(debug_assertions)]
    {
        None
    }
    #[cfg(not(debug_assertions))]
    {
        Some("user")
    }
}

fn shell_command(command: &str) -> Command {
    match exec_user() {
        Some(user) => {
            let mut c = Command::new("su");
            c.arg("-").arg(user).arg("-c").arg(command);
            c
        }
        None => {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        }
    }
}

pub fn log(level: &str, msg: &str) {
    eprintln!("[guest-shim] [{level}] {msg}");
}

fn proto_err(e: vsock_proto::ProtoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Truncate a command for log lines, respecting UTF-8 boundaries.
fn preview(s: &str) -> String {
    const MAX: usize = 100;
    if s.len() <= MAX {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < MAX)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(MAX);
    format!("{}...", s.get(..end).unwrap_or(s))
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|sig| 128 + sig).unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Wait for a child with a timeout; kills the whole process group when the
/// deadline passes. `timeout_ms == 0` waits forever.
fn wait_with_timeout(child: Child, timeout_ms: u32) -> (i32, Vec<u8>, Vec<u8>) {
    use std::sync::mpsc;

    if timeout_ms == 0 {
        return match child.wait_with_output() {
            Ok(out) => (exit_code_of(out.status), out.stdout, out.stderr),
            Err(e) => (1, Vec::new(), format!("wait failed: {e}").into_bytes()),
        };
    }

    let child_id = child.id();
    let timed_out = Arc::new(AtomicBool::new(false));
    let timed_out_flag = Arc::clone(&timed_out);
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::spawn(move || {
        if done_rx
            .recv_timeout(Duration::from_millis(u64::from(timeout_ms)))
            .is_err()
        {
            timed_out_flag.store(true, Ordering::SeqCst);
            // Negative pid kills the whole process group; the child was
            // spawned with process_group(0) so its pgid equals its pid.
            // SAFETY: kill(2) with a pid/pgid has no memory preconditions.
            unsafe {
                libc::kill(-(child_id as i32), libc::SIGKILL);
            }
        }
    });

    let output = child.wait_with_output();
    let _ = done_tx.send(());

    match output {
        Ok(out) => {
            if timed_out.load(Ordering::SeqCst) {
                (EXIT_CODE_TIMEOUT, out.stdout, b"Timeout".to_vec())
            } else {
                (exit_code_of(out.status), out.stdout, out.stderr)
            }
        }
        Err(e) => (1, Vec::new(), format!("wait failed: {e}").into_bytes()),
    }
}

fn spawn_in_group(command: &str) -> io::Result<Child> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        shell_command(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
    }
    #[cfg(not(unix))]
    {
        shell_command(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

fn handle_exec(timeout_ms: u32, command: &str) -> (i32, Vec<u8>, Vec<u8>) {
    log(
        "INFO",
        &format!("exec: {} (timeout={timeout_ms}ms)", preview(command)),
    );
    match spawn_in_group(command) {
        Ok(child) => wait_with_timeout(child, timeout_ms),
        Err(e) => (1, Vec::new(), format!("failed to execute: {e}").into_bytes()),
    }
}

/// Write a file, creating parent directories. Ownership is handed to the
/// agent account so the sandboxed process can read what the host staged.
fn handle_write_file(path: &str, content: &[u8]) -> (bool, String) {
    log(
        "INFO",
        &format!("write_file: path={path} size={}", content.len()),
    );

    let target = std::path::Path::new(path);
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        return (false, format!("mkdir {}: {e}", parent.display()));
    }
    if let Err(e) = std::fs::write(target, content) {
        return (false, format!("write {path}: {e}"));
    }
    chown_to_agent(target);
    if let Some(parent) = target.parent() {
        chown_to_agent(parent);
    }
    (true, String::new())
}

/// Best-effort chown to the agent account (UID/GID 1000). No-op failures
/// are fine in debug images where the shim runs unprivileged.
fn chown_to_agent(path: &std::path::Path) {
    if exec_user().is_none() {
        return;
    }
    if let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
        // SAFETY: cpath is a valid NUL-terminated path for the duration of
        // the call.
        unsafe {
            libc::chown(cpath.as_ptr(), 1000, 1000);
        }
    }
}

fn handle_shutdown(seq: u32) -> io::Result<Vec<u8>> {
    log("INFO", "shutdown requested, syncing filesystems");
    // SAFETY: sync(2) flushes pending writes; no preconditions.
    unsafe {
        libc::sync();
    }
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    vsock_proto::frame(Kind::ShutdownAck, seq, &[]).map_err(proto_err)
}

/// Spawn a process and report its pid immediately; a watcher thread emits
/// the `exit` event (seq 0) through the shared writer when it terminates.
fn handle_spawn(
    timeout_ms: u32,
    command: &str,
    seq: u32,
    writer: Arc<Mutex<UnixStream>>,
) -> io::Result<Vec<u8>> {
    log(
        "INFO",
        &format!("spawn: {} (timeout={timeout_ms}ms)", preview(command)),
    );

    match spawn_in_group(command) {
        Ok(child) => {
            let pid = child.id();
            thread::spawn(move || {
                let (exit_code, _stdout, stderr) = wait_with_timeout(child, timeout_ms);
                log("INFO", &format!("spawned pid={pid} exited code={exit_code}"));

                let payload = ExitPayload {
                    pid,
                    exit_code,
                    stderr: &stderr,
                }
                .encode();
                let frame = match vsock_proto::frame(Kind::Exit, 0, &payload) {
                    Ok(f) => f,
                    Err(e) => {
                        log("ERROR", &format!("encode exit event: {e}"));
                        return;
                    }
                };
                // Recover a poisoned writer lock: the exit event must still
                // go out on a best-effort basis.
                let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = w.write_all(&frame) {
                    log("ERROR", &format!("send exit event: {e}"));
                }
            });

            let payload = vsock_proto::encode_spawn_result(pid);
            vsock_proto::frame(Kind::SpawnResult, seq, &payload).map_err(proto_err)
        }
        Err(e) => {
            let payload = vsock_proto::encode_error(&format!("failed to spawn: {e}"));
            vsock_proto::frame(Kind::Error, seq, &payload).map_err(proto_err)
        }
    }
}

/// Handle one request frame. `spawn` is dispatched by the caller because it
/// needs the shared writer for its exit event.
fn handle_request(frame: &Frame) -> io::Result<Option<Vec<u8>>> {
    match frame.kind {
        Kind::Ping => Ok(Some(
            vsock_proto::frame(Kind::Pong, frame.seq, &[]).map_err(proto_err)?,
        )),
        Kind::Exec => {
            let cmd = CommandPayload::decode(&frame.payload).map_err(proto_err)?;
            let (exit_code, stdout, stderr) = handle_exec(cmd.timeout_ms, cmd.cmd);
            let payload = ExecResultPayload {
                exit_code,
                stdout: &stdout,
                stderr: &stderr,
            }
            .encode();
            Ok(Some(
                vsock_proto::frame(Kind::ExecResult, frame.seq, &payload).map_err(proto_err)?,
            ))
        }
        Kind::WriteFile => {
            let req = WriteFilePayload::decode(&frame.payload).map_err(proto_err)?;
            let (ok, error) = handle_write_file(req.path, req.content);
            let payload = vsock_proto::encode_write_result(ok, &error);
            Ok(Some(
                vsock_proto::frame(Kind::WriteFileResult, frame.seq, &payload).map_err(proto_err)?,
            ))
        }
        Kind::Shutdown => Ok(Some(handle_shutdown(frame.seq)?)),
        other => {
            let payload = vsock_proto::encode_error(&format!("unexpected request {other:?}"));
            Ok(Some(
                vsock_proto::frame(Kind::Error, frame.seq, &payload).map_err(proto_err)?,
            ))
        }
    }
}

/// Open a vsock stream to the host.
#[cfg(target_os = "linux")]
pub fn connect_vsock() -> io::Result<UnixStream> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: socket(2) with valid constants; fd checked below.
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = libc::sockaddr_vm {
        svm_family: libc::AF_VSOCK as u16,
        svm_reserved1: 0,
        svm_port: vsock_proto::CONTROL_PORT,
        svm_cid: HOST_CID,
        svm_zero: [0; 4],
    };

    // SAFETY: fd is a live socket, addr is fully initialised, and the length
    // matches sockaddr_vm.
    let ret = unsafe {
        libc::connect(
            fd,
            std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_vm>() as u32,
        )
    };
    if ret < 0 {
        // SAFETY: fd is a live descriptor we own.
        unsafe { libc::close(fd) };
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fd is a valid connected socket; ownership moves to UnixStream.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
pub fn connect_vsock() -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock requires Linux",
    ))
}

/// Serve one connection until the host disconnects.
///
/// The stream is cloned into a read side and a mutex-guarded write side so
/// spawn watcher threads can emit exit events while the main loop blocks in
/// `read`.
pub fn serve_connection(stream: UnixStream) -> io::Result<()> {
    let mut reader = stream.try_clone()?;
    let writer = Arc::new(Mutex::new(stream));

    {
        let hello = vsock_proto::frame(Kind::Hello, 0, &[]).map_err(proto_err)?;
        let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
        w.write_all(&hello)?;
    }
    log("INFO", "announced to host");

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        for frame in decoder
            .push(buf.get(..n).unwrap_or_default())
            .map_err(proto_err)?
        {
            let response = if frame.kind == Kind::Spawn {
                let cmd = CommandPayload::decode(&frame.payload).map_err(proto_err)?;
                Some(handle_spawn(
                    cmd.timeout_ms,
                    cmd.cmd,
                    frame.seq,
                    Arc::clone(&writer),
                )?)
            } else {
                handle_request(&frame)?
            };

            if let Some(response) = response {
                let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
                w.write_all(&response)?;
            }
        }
    }

    log("INFO", "host disconnected");
    Ok(())
}

/// Main entrypoint: connect (vsock, or a Unix socket path for tests) and
/// serve, reconnecting after transient failures until the budget runs out
/// or the host requests shutdown.
pub fn run(unix_socket: Option<&str>) -> io::Result<()> {
    let mut attempts = 0u32;

    loop {
        let result = match unix_socket {
            Some(path) => UnixStream::connect(path).and_then(|stream| {
                attempts = 0;
                serve_connection(stream)
            }),
            None => connect_vsock().and_then(|stream| {
                attempts = 0;
                serve_connection(stream)
            }),
        };

        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            log("INFO", "shutdown complete");
            return Ok(());
        }

        attempts += 1;
        if attempts >= MAX_CONNECT_ATTEMPTS {
            return match result {
                Ok(()) => Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection budget exhausted",
                )),
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(()) => log("INFO", &format!("reconnecting ({attempts})")),
            Err(e) => log("WARN", &format!("connection error: {e}, retrying ({attempts})")),
        }
        thread::sleep(CONNECT_RETRY_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let (ok, err) = handle_write_file(path.to_str().unwrap(), b"data");
        assert!(ok, "write failed: {err}");
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn write_file_reports_failure() {
        let (ok, err) = handle_write_file("/proc/definitely/not/writable", b"x");
        assert!(!ok);
        assert!(!err.is_empty());
    }

    #[test]
    fn exec_captures_output_and_exit_code() {
        let (code, stdout, stderr) = handle_exec(5000, "echo out; echo err >&2; exit 3");
        assert_eq!(code, 3);
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");
    }

    #[test]
    fn exec_timeout_kills_process_group() {
        let start = std::time::Instant::now();
        let (code, _, stderr) = handle_exec(200, "sleep 30");
        assert_eq!(code, EXIT_CODE_TIMEOUT);
        assert_eq!(stderr, b"Timeout");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn preview_truncates_long_commands() {
        let long = "x".repeat(300);
        let p = preview(&long);
        assert!(p.len() < 110);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn preview_keeps_short_commands() {
        assert_eq!(preview("ls"), "ls");
    }

    #[test]
    fn handle_request_answers_ping() {
        let frame = Frame {
            kind: Kind::Ping,
            seq: 9,
            payload: Vec::new(),
        };
        let resp = handle_request(&frame).unwrap().unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&resp).unwrap();
        assert_eq!(frames[0].kind, Kind::Pong);
        assert_eq!(frames[0].seq, 9);
    }

    #[test]
    fn handle_request_rejects_unexpected_kind() {
        let frame = Frame {
            kind: Kind::ExecResult,
            seq: 2,
            payload: Vec::new(),
        };
        let resp = handle_request(&frame).unwrap().unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&resp).unwrap();
        assert_eq!(frames[0].kind, Kind::Error);
    }
}
