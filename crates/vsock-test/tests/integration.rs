#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

//! End-to-end transport tests: the real host transport against the real
//! guest handler, joined by a Unix socket instead of Firecracker's vsock.
//!
//! The host binds `{path}_{port}` exactly as it does for a VM; the guest
//! shim connects to that path via its test entrypoint and serves real
//! commands on this machine.

use std::time::Duration;

use vsock_host::{VsockError, VsockTransport};

/// Spawn the guest shim in a background thread, connecting to the host's
/// listener path with a retry loop (the host may not have bound yet).
fn spawn_guest(listener_path: String) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for _ in 0..100 {
            match std::os::unix::net::UnixStream::connect(&listener_path) {
                Ok(stream) => {
                    let _ = vsock_guest::serve_connection(stream);
                    return;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        panic!("guest never connected to {listener_path}");
    })
}

struct Pair {
    transport: VsockTransport,
    guest: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

async fn connect_pair() -> Pair {
    let dir = tempfile::tempdir().unwrap();
    let vsock_path = dir.path().join("vsock.sock").display().to_string();
    let listener_path = format!("{vsock_path}_{}", vsock_proto::CONTROL_PORT);

    let guest = spawn_guest(listener_path);
    let transport = VsockTransport::wait_for_guest(&vsock_path, Duration::from_secs(5))
        .await
        .unwrap();

    Pair {
        transport,
        guest: Some(guest),
        _dir: dir,
    }
}

impl Pair {
    async fn finish(mut self) {
        self.transport.close().await;
        if let Some(guest) = self.guest.take() {
            let _ = guest.join();
        }
    }
}

#[tokio::test]
async fn exec_runs_real_commands() {
    let pair = connect_pair().await;

    let result = pair
        .transport
        .exec("echo out; echo err >&2; exit 4", 5000)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 4);
    assert_eq!(result.stdout, b"out\n");
    assert_eq!(result.stderr, b"err\n");

    pair.finish().await;
}

#[tokio::test]
async fn write_file_lands_on_disk_with_parents() {
    let pair = connect_pair().await;

    let target_dir = tempfile::tempdir().unwrap();
    let target = target_dir.path().join("nested/deep/env.json");
    pair.transport
        .write_file(target.to_str().unwrap(), b"{\"ok\":true}")
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"{\"ok\":true}");

    pair.finish().await;
}

#[tokio::test]
async fn spawn_watch_delivers_exit_event() {
    let pair = connect_pair().await;

    let pid = pair
        .transport
        .spawn_watch("sh -c 'exit 7'", 10_000)
        .await
        .unwrap();
    assert!(pid > 0);

    let exit = pair
        .transport
        .wait_for_exit(pid, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(exit.pid, pid);
    assert_eq!(exit.exit_code, 7);

    pair.finish().await;
}

#[tokio::test]
async fn guest_timeout_reports_exit_124() {
    let pair = connect_pair().await;

    let pid = pair.transport.spawn_watch("sleep 30", 300).await.unwrap();
    let exit = pair
        .transport
        .wait_for_exit(pid, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(exit.exit_code, 124);
    assert_eq!(exit.stderr, b"Timeout");

    pair.finish().await;
}

#[tokio::test]
async fn concurrent_ops_share_one_connection() {
    let pair = connect_pair().await;

    let t1 = pair.transport.clone();
    let t2 = pair.transport.clone();
    let (slow, fast) = tokio::join!(
        t1.exec("sleep 0.2; echo slow", 5000),
        t2.exec("echo fast", 5000),
    );
    assert_eq!(slow.unwrap().stdout, b"slow\n");
    assert_eq!(fast.unwrap().stdout, b"fast\n");

    pair.finish().await;
}

#[tokio::test]
async fn shutdown_is_acknowledged() {
    let pair = connect_pair().await;
    assert!(pair.transport.shutdown(Duration::from_secs(2)).await);
    pair.finish().await;
}

#[tokio::test]
async fn operations_after_close_fail_fast() {
    let pair = connect_pair().await;

    pair.transport.close().await;
    let err = pair.transport.exec("echo hi", 1000).await.unwrap_err();
    assert!(matches!(err, VsockError::Closed));

    if let Pair { guest: Some(guest), .. } = pair {
        let _ = guest.join();
    }
}
