//! Host-wide egress proxy.
//!
//! Every firewall-enabled VM has its HTTP/HTTPS egress REDIRECTed here by
//! iptables. Per connection:
//!
//! 1. identify the VM by source IP against the registry (unknown ⇒ deny),
//! 2. recover the original destination (`SO_ORIGINAL_DST`),
//! 3. peek for a TLS ClientHello and its SNI,
//! 4. evaluate the VM's firewall policy first-match (plus the hard guard
//!    against loopback/metadata/`.internal` targets),
//! 5. forward: opaque byte passthrough in SNI mode, or full HTTP handling
//!    (with sealed-token rewriting) for plaintext HTTP and MITM'd HTTPS,
//! 6. append exactly one NetworkLogRecord when the connection completes.
//!
//! Forwarded requests are pinned to `Connection: close`, so every request
//! crosses the header-scanning path and one connection maps to one record.

pub mod firewall;
pub mod log;
pub mod mitm;
pub mod sni;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::registry::{VmRegistry, VmRegistryEntry};
use crate::seal::Sealer;
use firewall::Decision;
use log::NetworkLogRecord;
use mitm::ProxyCa;

/// Copy window for streamed bodies (SSE, chunked), the only buffering
/// between the two sides.
const COPY_BUF_LEN: usize = 16 * 1024;

/// Upper bound on a request head.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Budget for the ClientHello to arrive in the peek buffer.
const SNIFF_BUDGET: Duration = Duration::from_millis(250);

pub struct ProxyConfig {
    /// Listen port; 0 picks an ephemeral one.
    pub port: u16,
    pub registry: Arc<VmRegistry>,
    pub sealer: Option<Arc<Sealer>>,
    pub ca: Option<Arc<ProxyCa>>,
}

struct ConnContext {
    registry: Arc<VmRegistry>,
    sealer: Option<Arc<Sealer>>,
    ca: Option<Arc<ProxyCa>>,
    upstream_tls: Option<Arc<rustls::ClientConfig>>,
}

/// Handle to the running proxy.
pub struct EgressProxy {
    port: u16,
    accept_task: tokio::task::JoinHandle<()>,
}

impl EgressProxy {
    pub async fn start(config: ProxyConfig) -> RunnerResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| RunnerError::Internal(format!("proxy bind: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| RunnerError::Internal(format!("proxy addr: {e}")))?
            .port();

        let upstream_tls = match &config.ca {
            Some(_) => Some(mitm::upstream_client_config()?),
            None => None,
        };
        let ctx = Arc::new(ConnContext {
            registry: config.registry,
            sealer: config.sealer,
            ca: config.ca,
            upstream_tls,
        });

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "proxy accept failed");
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        debug!(peer = %peer, error = %e, "proxy connection ended with error");
                    }
                });
            }
        });

        info!(port, "egress proxy listening");
        Ok(Self { port, accept_task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for EgressProxy {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnContext>,
) -> std::io::Result<()> {
    let peer_ip = peer.ip().to_string();
    let Some(entry) = ctx.registry.lookup(&peer_ip) else {
        // Not a registered VM: deny by dropping the connection.
        debug!(peer = %peer_ip, "connection from unregistered source");
        return Ok(());
    };

    let original = original_dst(&stream);
    let dst_ip = original.map(|sa| sa.ip());
    let sniffed = peek_client_hello(&mut stream).await?;

    if sni::looks_like_tls(&sniffed) {
        let port = original.map(|sa| sa.port()).unwrap_or(443);
        let host = sni::client_hello_sni(&sniffed);
        handle_tls(stream, &entry, &ctx, host, dst_ip, port, original).await
    } else {
        let port = original.map(|sa| sa.port()).unwrap_or(80);
        handle_http(stream, &entry, &ctx, dst_ip, port, original).await
    }
}

/// Peek the first bytes without consuming them, giving the ClientHello a
/// short window to arrive in full.
async fn peek_client_hello(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    let deadline = Instant::now() + SNIFF_BUDGET;
    let mut last_len = 0usize;

    loop {
        let n = stream.peek(&mut buf).await?;
        let data = buf.get(..n).unwrap_or_default();

        if !sni::looks_like_tls(data) || sni::client_hello_sni(data).is_some() {
            return Ok(data.to_vec());
        }
        if Instant::now() >= deadline || (n == last_len && n > 0 && n == buf.len()) {
            return Ok(data.to_vec());
        }
        last_len = n;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn handle_tls(
    stream: TcpStream,
    entry: &VmRegistryEntry,
    ctx: &ConnContext,
    host: Option<String>,
    dst_ip: Option<IpAddr>,
    port: u16,
    original: Option<SocketAddr>,
) -> std::io::Result<()> {
    let display_host = host
        .clone()
        .or_else(|| dst_ip.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    if firewall::is_forbidden_target(host.as_deref(), dst_ip) {
        let record = NetworkLogRecord::connection(
            "sni",
            "DENY",
            &display_host,
            port,
            Some("forbidden-target"),
        );
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    }

    let decision = firewall::evaluate(&entry.firewall_rules, host.as_deref(), dst_ip, port);
    if !decision.is_allow() {
        let record =
            NetworkLogRecord::connection("sni", "DENY", &display_host, port, decision.rule());
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    }

    let mitm_ready = entry.mitm_enabled && ctx.ca.is_some() && ctx.upstream_tls.is_some();
    if mitm_ready && let Some(sni_host) = host {
        return mitm_flow(stream, entry, ctx, &sni_host, port, original, decision).await;
    }

    // SNI-only: blind byte forwarding after the policy decision.
    let Some(target) = original else {
        let record = NetworkLogRecord::connection(
            "sni",
            "DENY",
            &display_host,
            port,
            Some("no-destination"),
        );
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    };

    let mut upstream = TcpStream::connect(target).await?;
    let mut client = stream;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;

    let record =
        NetworkLogRecord::connection("sni", "ALLOW", &display_host, port, decision.rule());
    log::append(&entry.network_log_path, &record).await;
    Ok(())
}

async fn mitm_flow(
    stream: TcpStream,
    entry: &VmRegistryEntry,
    ctx: &ConnContext,
    host: &str,
    port: u16,
    original: Option<SocketAddr>,
    decision: Decision,
) -> std::io::Result<()> {
    let (Some(ca), Some(upstream_tls)) = (&ctx.ca, &ctx.upstream_tls) else {
        return Ok(());
    };

    let server_config = ca
        .server_config(host)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
    let mut client = acceptor.accept(stream).await?;

    let (mut head, leftover) = match read_request_head(&mut client).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let record = NetworkLogRecord::connection("mitm", "DENY", host, port, Some("bad-request"));
            log::append(&entry.network_log_path, &record).await;
            return Err(e);
        }
    };

    if entry.seal_secrets_enabled
        && let Some(sealer) = &ctx.sealer
        && let Err(e) = rewrite_sealed_headers(&mut head, sealer, &entry.run_id)
    {
        let _ = write_simple_response(&mut client, 401, "sealed secret rejected").await;
        let mut record =
            NetworkLogRecord::connection("mitm", "DENY", host, port, Some("sealed-token"));
        record.method = Some(head.method.clone());
        record.url = Some(format!("https://{host}{}", head.target));
        debug!(host, error = %e, "sealed token rejected");
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    }

    // Connect by original destination to avoid a second resolution; the TLS
    // server name still pins the certificate to the requested host.
    let upstream_tcp = match original {
        Some(addr) => TcpStream::connect(addr).await?,
        None => TcpStream::connect((host, port)).await?,
    };
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| std::io::Error::other("invalid upstream server name"))?;
    let connector = tokio_rustls::TlsConnector::from(Arc::clone(upstream_tls));
    let upstream = connector.connect(server_name, upstream_tcp).await?;

    let outcome = forward_http(client, upstream, &head, leftover).await?;

    let mut record = NetworkLogRecord::connection("mitm", "ALLOW", host, port, decision.rule());
    record.method = Some(head.method.clone());
    record.url = Some(format!("https://{host}{}", head.target));
    record.status = outcome.status;
    record.latency_ms = Some(outcome.latency_ms);
    record.request_size = Some(outcome.request_size);
    record.response_size = Some(outcome.response_size);
    log::append(&entry.network_log_path, &record).await;
    Ok(())
}

async fn handle_http(
    mut stream: TcpStream,
    entry: &VmRegistryEntry,
    ctx: &ConnContext,
    dst_ip: Option<IpAddr>,
    port: u16,
    original: Option<SocketAddr>,
) -> std::io::Result<()> {
    let (mut head, leftover) = read_request_head(&mut stream).await?;
    let host = head
        .host_header()
        .or_else(|| dst_ip.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    if firewall::is_forbidden_target(Some(&host), dst_ip) {
        let _ = write_simple_response(&mut stream, 403, "forbidden target").await;
        let record =
            NetworkLogRecord::connection("mitm", "DENY", &host, port, Some("forbidden-target"));
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    }

    let decision = firewall::evaluate(&entry.firewall_rules, Some(&host), dst_ip, port);
    if !decision.is_allow() {
        let _ = write_simple_response(&mut stream, 403, "blocked by firewall policy").await;
        let mut record = NetworkLogRecord::connection("mitm", "DENY", &host, port, decision.rule());
        record.method = Some(head.method.clone());
        record.url = Some(format!("http://{host}{}", head.target));
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    }

    if entry.seal_secrets_enabled
        && let Some(sealer) = &ctx.sealer
        && let Err(e) = rewrite_sealed_headers(&mut head, sealer, &entry.run_id)
    {
        let _ = write_simple_response(&mut stream, 401, "sealed secret rejected").await;
        let record =
            NetworkLogRecord::connection("mitm", "DENY", &host, port, Some("sealed-token"));
        debug!(host, error = %e, "sealed token rejected");
        log::append(&entry.network_log_path, &record).await;
        return Ok(());
    }

    let upstream = match original {
        Some(addr) => TcpStream::connect(addr).await?,
        None => TcpStream::connect((host.as_str(), port)).await?,
    };

    let outcome = forward_http(stream, upstream, &head, leftover).await?;

    let mut record = NetworkLogRecord::connection("mitm", "ALLOW", &host, port, decision.rule());
    record.method = Some(head.method.clone());
    record.url = Some(format!("http://{host}{}", head.target));
    record.status = outcome.status;
    record.latency_ms = Some(outcome.latency_ms);
    record.request_size = Some(outcome.request_size);
    record.response_size = Some(outcome.response_size);
    log::append(&entry.network_log_path, &record).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn host_header(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| {
                value
                    .rsplit_once(':')
                    .filter(|(_, p)| p.chars().all(|c| c.is_ascii_digit()))
                    .map(|(h, _)| h.to_string())
                    .unwrap_or_else(|| value.clone())
            })
    }

    /// Serialise with hop-by-hop connection headers pinned to `close`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("proxy-connection")
                || name.eq_ignore_ascii_case("keep-alive")
            {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }
}

/// Read and parse one request head; returns any body bytes that arrived
/// with it.
pub(crate) async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<(RequestHead, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let head_bytes = buf.get(..end).unwrap_or_default();
            let head = parse_head(head_bytes)?;
            let leftover = buf.get(end + 4..).unwrap_or_default().to_vec();
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(chunk.get(..n).unwrap_or_default());
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(bytes: &[u8]) -> std::io::Result<RequestHead> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 head"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty head"))?;
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed request line",
            ));
        }
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed header line",
            ));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

fn rewrite_sealed_headers(
    head: &mut RequestHead,
    sealer: &Sealer,
    run_id: &str,
) -> Result<(), crate::seal::SealError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    for (_, value) in &mut head.headers {
        if let Some(rewritten) = sealer.rewrite_value(value, run_id, now_ms)? {
            *value = rewritten;
        }
    }
    Ok(())
}

async fn write_simple_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: u16,
    body: &str,
) -> std::io::Result<()> {
    let reason = match status {
        401 => "Unauthorized",
        403 => "Forbidden",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

pub(crate) struct ForwardOutcome {
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub request_size: u64,
    pub response_size: u64,
}

/// Forward one request (head already parsed and rewritten) and stream the
/// rest of the connection byte-for-byte in both directions.
async fn forward_http<C, U>(
    client: C,
    upstream: U,
    head: &RequestHead,
    leftover: Vec<u8>,
) -> std::io::Result<ForwardOutcome>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    upstream_write.write_all(&head.to_bytes()).await?;
    upstream_write.write_all(&leftover).await?;
    let start = Instant::now();

    let request_size = Arc::new(AtomicU64::new(leftover.len() as u64));
    let request_counter = Arc::clone(&request_size);
    let uplink = tokio::spawn(async move {
        let mut client_read = client_read;
        let _ = copy_counted(&mut client_read, &mut upstream_write, &request_counter).await;
    });

    // First response chunk carries the status line.
    let mut first = vec![0u8; COPY_BUF_LEN];
    let n = upstream_read.read(&mut first).await?;
    let latency_ms = start.elapsed().as_millis() as u64;
    let first_chunk = first.get(..n).unwrap_or_default();
    let status = parse_status_code(first_chunk);

    let mut response_size = n as u64;
    client_write.write_all(first_chunk).await?;

    let counter = Arc::new(AtomicU64::new(0));
    let copy_result = copy_counted(&mut upstream_read, &mut client_write, &counter).await;
    response_size += counter.load(Ordering::Relaxed);

    // Response finished (or failed); the remaining uplink is useless under
    // Connection: close. A torn-down copy still yields a record with
    // whatever was observed.
    uplink.abort();
    let _ = copy_result;

    Ok(ForwardOutcome {
        status,
        latency_ms,
        request_size: request_size.load(Ordering::Relaxed),
        response_size,
    })
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &Arc<AtomicU64>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(buf.get(..n).unwrap_or_default()).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

fn parse_status_code(response: &[u8]) -> Option<u16> {
    let line_end = response.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(response.get(..line_end)?).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Original pre-REDIRECT destination of a transparently proxied connection.
fn original_dst(stream: &TcpStream) -> Option<SocketAddr> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    // SAFETY: zeroed sockaddr_in is a valid getsockopt output buffer; len is
    // set to its exact size and the fd is a live socket.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            std::ptr::from_mut(&mut addr).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head_extracts_request_line_and_headers() {
        let raw = b"POST /v1 HTTP/1.1\r\nHost: api.example.com\r\nX-Api-Key: k\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/v1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.host_header().as_deref(), Some("api.example.com"));
        assert_eq!(head.headers.len(), 2);
    }

    #[test]
    fn host_header_strips_port() {
        let raw = b"GET / HTTP/1.1\r\nHost: api.example.com:8443\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.host_header().as_deref(), Some("api.example.com"));
    }

    #[test]
    fn to_bytes_pins_connection_close() {
        let head = RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Host".into(), "x.example.com".into()),
                ("Connection".into(), "keep-alive".into()),
            ],
        };
        let text = String::from_utf8(head.to_bytes()).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn read_request_head_returns_leftover_body() {
        let raw = b"POST /v1 HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let (head, leftover) = read_request_head(&mut reader).await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(leftover, b"body");
    }

    #[tokio::test]
    async fn read_request_head_rejects_oversized() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_HEAD_LEN + 16));
        let mut reader = std::io::Cursor::new(raw);
        let err = read_request_head(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn parse_status_code_reads_status_line() {
        assert_eq!(parse_status_code(b"HTTP/1.1 200 OK\r\n..."), Some(200));
        assert_eq!(parse_status_code(b"HTTP/1.1 404 Not Found\r\n"), Some(404));
        assert_eq!(parse_status_code(b"garbage"), None);
    }

    #[test]
    fn rewrite_sealed_headers_replaces_tokens() {
        let sealer = Sealer::from_master(b"master");
        let now = chrono::Utc::now().timestamp_millis();
        let token = sealer
            .seal("run-1", "user-1", "API_KEY", "plain-secret", now, 60_000)
            .unwrap();
        let mut head = RequestHead {
            method: "POST".into(),
            target: "/v1".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Host".into(), "api.example.com".into()),
                ("X-Api-Key".into(), token),
            ],
        };
        rewrite_sealed_headers(&mut head, &sealer, "run-1").unwrap();
        assert_eq!(head.headers[1].1, "plain-secret");
        // Untouched headers stay as they were.
        assert_eq!(head.headers[0].1, "api.example.com");
    }

    #[test]
    fn rewrite_sealed_headers_rejects_foreign_run() {
        let sealer = Sealer::from_master(b"master");
        let now = chrono::Utc::now().timestamp_millis();
        let token = sealer
            .seal("run-1", "user-1", "API_KEY", "x", now, 60_000)
            .unwrap();
        let mut head = RequestHead {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("X-Api-Key".into(), token)],
        };
        let err = rewrite_sealed_headers(&mut head, &sealer, "run-2").unwrap_err();
        assert_eq!(err, crate::seal::SealError::RunMismatch);
    }

    #[tokio::test]
    async fn forward_http_proxies_request_and_response() {
        let (client_side, mut agent_side) = tokio::io::duplex(64 * 1024);
        let (upstream_side, mut server_side) = tokio::io::duplex(64 * 1024);

        let head = RequestHead {
            method: "POST".into(),
            target: "/v1".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), "api.example.com".into())],
        };

        // Mock origin server: read the request, answer, close.
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server_side.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server_side
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
            drop(server_side);
            request
        });

        let forward = tokio::spawn(async move {
            forward_http(client_side, upstream_side, &head, b"body".to_vec()).await
        });

        // The in-guest client reads the response then closes.
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match agent_side.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
        drop(agent_side);

        let outcome = forward.await.unwrap().unwrap();
        assert_eq!(outcome.status, Some(201));
        assert_eq!(outcome.request_size, 4);
        assert!(outcome.response_size > 0);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1 HTTP/1.1\r\n"));
        assert!(request.contains("Connection: close"));
        assert!(request.ends_with("body"));

        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 201 Created"));
        assert!(text.ends_with("ok"));
    }
}
