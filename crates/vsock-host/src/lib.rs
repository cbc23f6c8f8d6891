//! Host-side transport to the in-guest agent shim.
//!
//! Firecracker exposes the guest's vsock as a Unix socket on the host: a
//! guest `connect(CID 2, port)` shows up as a connection on
//! `{vsock_path}_{port}`. The transport owns that single connection and
//! multiplexes it:
//!
//! - writes are serialised through an async mutex,
//! - a dedicated reader task demultiplexes responses by sequence number and
//!   `exit` events by pid, waking the matching waiter,
//! - any number of requests may be in flight concurrently,
//! - closing the transport (explicitly or on reader EOF) fails every
//!   outstanding operation with [`VsockError::Closed`].
//!
//! Connection flow: bind listener → guest connects → guest sends `hello` →
//! host ping/pong roundtrip → established.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use vsock_proto::{
    CommandPayload, ExecResultPayload, ExitPayload, Frame, FrameDecoder, Kind, WriteFilePayload,
};

const READ_BUF_LEN: usize = 64 * 1024;

/// Extra wait on top of the guest-side timeout so the guest's own kill
/// fires first and its exit report wins over a host-side timeout.
const GUEST_REPLY_SLACK: Duration = Duration::from_secs(5);

/// Deadline for control responses that don't run guest commands.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for file writes (large payloads over a slow virtio path).
const WRITE_FILE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum VsockError {
    /// The transport was closed; the operation cannot complete.
    #[error("vsock transport closed")]
    Closed,

    #[error("vsock operation timed out")]
    Timeout,

    #[error("vsock protocol error: {0}")]
    Protocol(String),

    /// The guest reported a failure for this operation.
    #[error("guest error: {0}")]
    Remote(String),

    #[error("vsock io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VsockError>;

/// Result of a synchronous guest command.
#[derive(Debug, Clone)]
pub struct GuestExec {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Exit notification for a spawned guest process.
#[derive(Debug, Clone)]
pub struct GuestExit {
    pub pid: u32,
    pub exit_code: i32,
    pub stderr: Vec<u8>,
}

struct Shared {
    closed: bool,
    /// Response waiters keyed by sequence number.
    pending: HashMap<u32, oneshot::Sender<Frame>>,
    /// Exit events that arrived before anyone waited for them.
    exited: HashMap<u32, GuestExit>,
    /// Exit waiters keyed by pid.
    exit_waiters: HashMap<u32, oneshot::Sender<GuestExit>>,
    /// Fired once when the guest's hello frame arrives.
    hello: Option<oneshot::Sender<()>>,
}

impl Shared {
    /// Mark closed and fail every waiter by dropping its sender.
    fn poison(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.exit_waiters.clear();
        self.hello.take();
    }
}

struct Inner {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    shared: Mutex<Shared>,
    next_seq: AtomicU32,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Cloneable handle to one guest connection. All clones share the
/// connection; operations may run concurrently from different tasks.
#[derive(Clone)]
pub struct VsockTransport {
    inner: Arc<Inner>,
}

impl VsockTransport {
    /// Bind `{vsock_path}_{port}`, wait for the guest to connect, and
    /// perform the hello/ping/pong handshake.
    ///
    /// The listener is removed once the single expected connection arrives.
    pub async fn wait_for_guest(vsock_path: &str, timeout: Duration) -> Result<Self> {
        let listener_path = format!("{vsock_path}_{}", vsock_proto::CONTROL_PORT);
        let _ = std::fs::remove_file(&listener_path);

        let listener = UnixListener::bind(&listener_path)?;
        let deadline = Instant::now() + timeout;

        let accepted = time::timeout_at(deadline, listener.accept()).await;
        drop(listener);
        let _ = std::fs::remove_file(&listener_path);

        let (stream, _) = accepted.map_err(|_| VsockError::Timeout)??;
        Self::establish(stream, deadline).await
    }

    /// Build a transport over an already-connected stream and run the
    /// handshake. Public so tests can drive a socketpair.
    pub async fn establish(stream: UnixStream, deadline: Instant) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        let (hello_tx, hello_rx) = oneshot::channel();

        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            shared: Mutex::new(Shared {
                closed: false,
                pending: HashMap::new(),
                exited: HashMap::new(),
                exit_waiters: HashMap::new(),
                hello: Some(hello_tx),
            }),
            next_seq: AtomicU32::new(1),
            reader: Mutex::new(None),
        });

        let reader_handle = tokio::spawn(read_loop(read_half, Arc::clone(&inner)));
        if let Ok(mut slot) = inner.reader.lock() {
            *slot = Some(reader_handle);
        }

        let transport = Self { inner };

        time::timeout_at(deadline, hello_rx)
            .await
            .map_err(|_| VsockError::Timeout)?
            .map_err(|_| VsockError::Closed)?;

        // Ping/pong verifies the host→guest direction before handing the
        // transport to callers.
        let resp = transport
            .request(Kind::Ping, &[], CONTROL_TIMEOUT)
            .await?;
        if resp.kind != Kind::Pong {
            transport.close().await;
            return Err(VsockError::Protocol(format!(
                "expected pong, got {:?}",
                resp.kind
            )));
        }

        Ok(transport)
    }

    fn next_seq(&self) -> u32 {
        // Wraps past u32::MAX, skipping 0 (reserved for unsolicited frames).
        loop {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Send one request frame and wait for the response with its sequence
    /// number. Concurrent callers interleave freely.
    async fn request(&self, kind: Kind, payload: &[u8], timeout: Duration) -> Result<Frame> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();

        {
            let mut shared = lock(&self.inner.shared)?;
            if shared.closed {
                return Err(VsockError::Closed);
            }
            shared.pending.insert(seq, tx);
        }

        let bytes = vsock_proto::frame(kind, seq, payload)
            .map_err(|e| VsockError::Protocol(e.to_string()))?;

        {
            let mut writer = self.inner.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                let _ = lock(&self.inner.shared).map(|mut s| s.pending.remove(&seq));
                return Err(VsockError::Closed);
            };
            if let Err(e) = w.write_all(&bytes).await {
                let _ = lock(&self.inner.shared).map(|mut s| s.pending.remove(&seq));
                return Err(VsockError::Io(e));
            }
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(VsockError::Closed),
            Err(_) => {
                let _ = lock(&self.inner.shared).map(|mut s| s.pending.remove(&seq));
                Err(VsockError::Timeout)
            }
        }
    }

    /// Run a command in the guest and wait for its result.
    pub async fn exec(&self, cmd: &str, guest_timeout_ms: u32) -> Result<GuestExec> {
        let payload = CommandPayload {
            timeout_ms: guest_timeout_ms,
            cmd,
        }
        .encode();
        let wait = Duration::from_millis(u64::from(guest_timeout_ms)) + GUEST_REPLY_SLACK;
        let resp = self.request(Kind::Exec, &payload, wait).await?;

        match resp.kind {
            Kind::ExecResult => {
                let r = ExecResultPayload::decode(&resp.payload)
                    .map_err(|e| VsockError::Protocol(e.to_string()))?;
                Ok(GuestExec {
                    exit_code: r.exit_code,
                    stdout: r.stdout.to_vec(),
                    stderr: r.stderr.to_vec(),
                })
            }
            Kind::Error => {
                let msg = vsock_proto::decode_error(&resp.payload)
                    .map_err(|e| VsockError::Protocol(e.to_string()))?;
                // A guest-side spawn failure is a result, not a transport error.
                Ok(GuestExec {
                    exit_code: 1,
                    stdout: Vec::new(),
                    stderr: msg.as_bytes().to_vec(),
                })
            }
            other => Err(VsockError::Protocol(format!(
                "unexpected exec response {other:?}"
            ))),
        }
    }

    /// Write a file into the guest, creating parent directories.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let payload = WriteFilePayload { path, content }
            .encode()
            .map_err(|e| VsockError::Protocol(e.to_string()))?;
        let resp = self
            .request(Kind::WriteFile, &payload, WRITE_FILE_TIMEOUT)
            .await?;

        match resp.kind {
            Kind::WriteFileResult => {
                let (ok, err) = vsock_proto::decode_write_result(&resp.payload)
                    .map_err(|e| VsockError::Protocol(e.to_string()))?;
                if ok {
                    Ok(())
                } else {
                    Err(VsockError::Remote(err.to_string()))
                }
            }
            Kind::Error => {
                let msg = vsock_proto::decode_error(&resp.payload)
                    .map_err(|e| VsockError::Protocol(e.to_string()))?;
                Err(VsockError::Remote(msg.to_string()))
            }
            other => Err(VsockError::Protocol(format!(
                "unexpected write_file response {other:?}"
            ))),
        }
    }

    /// Start a guest process and return immediately with its pid. The guest
    /// emits an `exit` event when it terminates.
    pub async fn spawn_watch(&self, cmd: &str, guest_timeout_ms: u32) -> Result<u32> {
        let payload = CommandPayload {
            timeout_ms: guest_timeout_ms,
            cmd,
        }
        .encode();
        let resp = self.request(Kind::Spawn, &payload, CONTROL_TIMEOUT).await?;

        match resp.kind {
            Kind::SpawnResult => vsock_proto::decode_spawn_result(&resp.payload)
                .map_err(|e| VsockError::Protocol(e.to_string())),
            Kind::Error => {
                let msg = vsock_proto::decode_error(&resp.payload)
                    .map_err(|e| VsockError::Protocol(e.to_string()))?;
                Err(VsockError::Remote(msg.to_string()))
            }
            other => Err(VsockError::Protocol(format!(
                "unexpected spawn response {other:?}"
            ))),
        }
    }

    /// Wait for the exit event of a spawned pid. Returns immediately if the
    /// event already arrived.
    pub async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> Result<GuestExit> {
        let rx = {
            let mut shared = lock(&self.inner.shared)?;
            if let Some(event) = shared.exited.remove(&pid) {
                return Ok(event);
            }
            if shared.closed {
                return Err(VsockError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            shared.exit_waiters.insert(pid, tx);
            rx
        };

        match time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(VsockError::Closed),
            Err(_) => {
                let _ = lock(&self.inner.shared).map(|mut s| s.exit_waiters.remove(&pid));
                Err(VsockError::Timeout)
            }
        }
    }

    /// Ask the guest to shut itself down. Returns `true` if acknowledged
    /// within the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        matches!(
            self.request(Kind::Shutdown, &[], timeout).await,
            Ok(ref frame) if frame.kind == Kind::ShutdownAck
        )
    }

    /// Close the transport. All outstanding operations fail with `Closed`.
    pub async fn close(&self) {
        if let Ok(mut shared) = self.inner.shared.lock() {
            shared.poison();
        }
        self.inner.writer.lock().await.take();
        if let Ok(mut reader) = self.inner.reader.lock()
            && let Some(handle) = reader.take()
        {
            handle.abort();
        }
    }

    /// Whether the connection is still usable.
    pub fn is_open(&self) -> bool {
        lock(&self.inner.shared).map(|s| !s.closed).unwrap_or(false)
    }
}

/// Lock a std mutex, recovering from poisoning (waiters must still fail
/// cleanly if a task panicked while holding the lock).
fn lock(m: &Mutex<Shared>) -> Result<std::sync::MutexGuard<'_, Shared>> {
    Ok(m.lock().unwrap_or_else(|e| e.into_inner()))
}

/// Reader task: decode frames and wake the matching waiter.
///
/// Frames are dispatched in arrival order, so exit events reach waiters in
/// emit order, and a response for request N observes every frame the guest
/// sent before it.
async fn read_loop(mut read_half: tokio::net::unix::OwnedReadHalf, inner: Arc<Inner>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_LEN];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "vsock read failed");
                break;
            }
        };

        let frames = match decoder.push(buf.get(..n).unwrap_or_default()) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "vsock framing error, closing");
                break;
            }
        };

        for frame in frames {
            dispatch(&inner, frame);
        }
    }

    match inner.shared.lock() {
        Ok(mut shared) => shared.poison(),
        Err(poisoned) => poisoned.into_inner().poison(),
    }
}

fn dispatch(inner: &Arc<Inner>, frame: Frame) {
    let Ok(mut shared) = lock(&inner.shared) else {
        return;
    };

    match frame.kind {
        Kind::Hello => {
            if let Some(tx) = shared.hello.take() {
                let _ = tx.send(());
            }
        }
        Kind::Exit if frame.seq == 0 => match ExitPayload::decode(&frame.payload) {
            Ok(exit) => {
                let event = GuestExit {
                    pid: exit.pid,
                    exit_code: exit.exit_code,
                    stderr: exit.stderr.to_vec(),
                };
                if let Some(tx) = shared.exit_waiters.remove(&event.pid) {
                    let _ = tx.send(event);
                } else {
                    shared.exited.insert(event.pid, event);
                }
            }
            Err(e) => warn!(error = %e, "malformed exit event dropped"),
        },
        _ if frame.seq != 0 => {
            if let Some(tx) = shared.pending.remove(&frame.seq) {
                let _ = tx.send(frame);
            } else {
                debug!(seq = frame.seq, kind = ?frame.kind, "response with no waiter");
            }
        }
        other => debug!(kind = ?other, "unexpected unsolicited frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mock guest half: answer the handshake, then hand the stream back.
    async fn guest_handshake(stream: &mut UnixStream, decoder: &mut FrameDecoder) {
        let hello = vsock_proto::frame(Kind::Hello, 0, &[]).unwrap();
        stream.write_all(&hello).await.unwrap();

        let mut buf = [0u8; 1024];
        let ping = loop {
            let n = stream.read(&mut buf).await.unwrap();
            let frames = decoder.push(&buf[..n]).unwrap();
            if let Some(f) = frames.into_iter().find(|f| f.kind == Kind::Ping) {
                break f;
            }
        };
        let pong = vsock_proto::frame(Kind::Pong, ping.seq, &[]).unwrap();
        stream.write_all(&pong).await.unwrap();
    }

    async fn read_one(stream: &mut UnixStream, decoder: &mut FrameDecoder) -> Frame {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed unexpectedly");
            let mut frames = decoder.push(&buf[..n]).unwrap();
            if !frames.is_empty() {
                return frames.remove(0);
            }
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn handshake_then_exec() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        let guest_task = tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;

            let req = read_one(&mut guest, &mut dec).await;
            assert_eq!(req.kind, Kind::Exec);
            let cmd = CommandPayload::decode(&req.payload).unwrap();
            assert_eq!(cmd.cmd, "echo hi");

            let payload = ExecResultPayload {
                exit_code: 0,
                stdout: b"hi\n",
                stderr: b"",
            }
            .encode();
            let resp = vsock_proto::frame(Kind::ExecResult, req.seq, &payload).unwrap();
            guest.write_all(&resp).await.unwrap();
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let result = transport.exec("echo hi", 5000).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hi\n");
        guest_task.await.unwrap();
    }

    #[tokio::test]
    async fn guest_error_becomes_exec_failure_result() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;
            let req = read_one(&mut guest, &mut dec).await;
            let payload = vsock_proto::encode_error("command not found");
            let resp = vsock_proto::frame(Kind::Error, req.seq, &payload).unwrap();
            guest.write_all(&resp).await.unwrap();
            // Hold the stream open until the host is done.
            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let result = transport.exec("nope", 5000).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, b"command not found");
    }

    #[tokio::test]
    async fn concurrent_requests_demux_out_of_order() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;

            // Both requests may arrive in a single read since the client
            // writes them back-to-back; collect two frames regardless of
            // how many reads that takes.
            let mut buf = [0u8; 64 * 1024];
            let mut frames: Vec<Frame> = Vec::new();
            while frames.len() < 2 {
                let n = guest.read(&mut buf).await.unwrap();
                assert!(n > 0, "host closed unexpectedly");
                frames.extend(dec.push(&buf[..n]).unwrap());
            }
            let first = frames.remove(0);
            let second = frames.remove(0);

            // Answer in reverse order; each waiter must still get its own.
            for req in [second, first] {
                let cmd = CommandPayload::decode(&req.payload).unwrap();
                let payload = ExecResultPayload {
                    exit_code: 0,
                    stdout: cmd.cmd.as_bytes(),
                    stderr: b"",
                }
                .encode();
                let resp = vsock_proto::frame(Kind::ExecResult, req.seq, &payload).unwrap();
                guest.write_all(&resp).await.unwrap();
            }
            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let (a, b) = tokio::join!(transport.exec("first", 5000), transport.exec("second", 5000));
        assert_eq!(a.unwrap().stdout, b"first");
        assert_eq!(b.unwrap().stdout, b"second");
    }

    #[tokio::test]
    async fn spawn_then_wait_for_exit() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;

            let req = read_one(&mut guest, &mut dec).await;
            assert_eq!(req.kind, Kind::Spawn);
            let resp =
                vsock_proto::frame(Kind::SpawnResult, req.seq, &vsock_proto::encode_spawn_result(42))
                    .unwrap();
            guest.write_all(&resp).await.unwrap();

            let exit = ExitPayload {
                pid: 42,
                exit_code: 0,
                stderr: b"",
            }
            .encode();
            let event = vsock_proto::frame(Kind::Exit, 0, &exit).unwrap();
            guest.write_all(&event).await.unwrap();

            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let pid = transport.spawn_watch("sleep 1", 0).await.unwrap();
        assert_eq!(pid, 42);
        let exit = transport
            .wait_for_exit(pid, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(exit.exit_code, 0);
    }

    #[tokio::test]
    async fn exit_event_before_wait_is_cached() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;

            let req = read_one(&mut guest, &mut dec).await;
            // spawn_result and exit event in one write.
            let mut bytes =
                vsock_proto::frame(Kind::SpawnResult, req.seq, &vsock_proto::encode_spawn_result(7))
                    .unwrap();
            let exit = ExitPayload {
                pid: 7,
                exit_code: 3,
                stderr: b"boom",
            }
            .encode();
            bytes.extend(vsock_proto::frame(Kind::Exit, 0, &exit).unwrap());
            guest.write_all(&bytes).await.unwrap();

            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let pid = transport.spawn_watch("false", 0).await.unwrap();
        // Give the reader task a chance to cache the event first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let exit = transport
            .wait_for_exit(pid, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(exit.exit_code, 3);
        assert_eq!(exit.stderr, b"boom");
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;
            // Swallow the request, never answer.
            let _ = read_one(&mut guest, &mut dec).await;
            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let pending = {
            let t = transport.clone();
            tokio::spawn(async move { t.exec("hang", 60_000).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(VsockError::Closed)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn guest_disconnect_fails_exit_waiters() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        let guest_task = tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;
            let req = read_one(&mut guest, &mut dec).await;
            let resp =
                vsock_proto::frame(Kind::SpawnResult, req.seq, &vsock_proto::encode_spawn_result(9))
                    .unwrap();
            guest.write_all(&resp).await.unwrap();
            // Drop the connection with the process still "running".
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let pid = transport.spawn_watch("sleep 999", 0).await.unwrap();
        guest_task.await.unwrap();

        let result = transport.wait_for_exit(pid, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(VsockError::Closed)));
    }

    #[tokio::test]
    async fn wait_for_exit_times_out() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;
            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        let result = transport
            .wait_for_exit(1234, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(VsockError::Timeout)));
    }

    #[tokio::test]
    async fn shutdown_acknowledged() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;
            let req = read_one(&mut guest, &mut dec).await;
            assert_eq!(req.kind, Kind::Shutdown);
            let ack = vsock_proto::frame(Kind::ShutdownAck, req.seq, &[]).unwrap();
            guest.write_all(&ack).await.unwrap();
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        assert!(transport.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn shutdown_timeout_returns_false() {
        let (host_side, mut guest) = UnixStream::pair().unwrap();

        tokio::spawn(async move {
            let mut dec = FrameDecoder::new();
            guest_handshake(&mut guest, &mut dec).await;
            let _ = read_one(&mut guest, &mut dec).await;
            let mut b = [0u8; 1];
            let _ = guest.read(&mut b).await;
        });

        let transport = VsockTransport::establish(host_side, deadline()).await.unwrap();
        assert!(!transport.shutdown(Duration::from_millis(100)).await);
    }
}
