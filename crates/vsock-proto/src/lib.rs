//! Binary control protocol spoken between the host and the in-guest agent
//! shim over a single vsock connection.
//!
//! ## Framing
//!
//! ```text
//! [4-byte body length][1-byte kind][4-byte seq][payload]
//! ```
//!
//! All integers are big-endian. `length` covers kind + seq + payload.
//! Requests carry a per-connection monotonically increasing `seq`; the
//! matching response echoes it. Unsolicited guest messages (the `hello`
//! handshake and `exit` notifications) use `seq = 0`.
//!
//! ## Messages
//!
//! | Kind | Dir | Name          | Payload |
//! |------|-----|---------------|---------|
//! | 0x00 | G→H | hello         | (empty, sent once after connect) |
//! | 0x01 | H→G | ping          | (empty) |
//! | 0x02 | G→H | pong          | (empty) |
//! | 0x10 | H→G | exec          | `[4B timeout_ms][4B cmd_len][cmd]` |
//! | 0x11 | G→H | exec_result   | `[4B exit_code][4B stdout_len][stdout][4B stderr_len][stderr]` |
//! | 0x12 | H→G | write_file    | `[2B path_len][path][4B content_len][content]` |
//! | 0x13 | G→H | write_result  | `[1B ok][2B err_len][err]` |
//! | 0x14 | H→G | spawn         | `[4B timeout_ms][4B cmd_len][cmd]` |
//! | 0x15 | G→H | spawn_result  | `[4B pid]` |
//! | 0x16 | H→G | shutdown      | (empty) |
//! | 0x17 | G→H | shutdown_ack  | (empty) |
//! | 0x20 | G→H | exit          | `[4B pid][4B exit_code][4B stderr_len][stderr]` |
//! | 0x7F | G→H | error         | `[2B msg_len][msg]` |
//!
//! Explicit length prefixes (rather than a line-delimited encoding) remove
//! partial-read ambiguity and allow arbitrary byte payloads for file writes.

/// Vsock port the guest agent connects to on the host CID.
pub const CONTROL_PORT: u32 = 1024;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// kind (1) + seq (4).
pub const MIN_BODY_LEN: usize = 5;

/// Hard cap on a single frame body (16 MiB); bounds file-write payloads.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Message kinds. Stored as the raw `u8` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Hello = 0x00,
    Ping = 0x01,
    Pong = 0x02,
    Exec = 0x10,
    ExecResult = 0x11,
    WriteFile = 0x12,
    WriteFileResult = 0x13,
    Spawn = 0x14,
    SpawnResult = 0x15,
    Shutdown = 0x16,
    ShutdownAck = 0x17,
    Exit = 0x20,
    Error = 0x7F,
}

impl Kind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Hello,
            0x01 => Self::Ping,
            0x02 => Self::Pong,
            0x10 => Self::Exec,
            0x11 => Self::ExecResult,
            0x12 => Self::WriteFile,
            0x13 => Self::WriteFileResult,
            0x14 => Self::Spawn,
            0x15 => Self::SpawnResult,
            0x16 => Self::Shutdown,
            0x17 => Self::ShutdownAck,
            0x20 => Self::Exit,
            0x7F => Self::Error,
            _ => return None,
        })
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: Kind,
    pub seq: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum ProtoError {
    BodyTooLarge(usize),
    BodyTooSmall(usize),
    UnknownKind(u8),
    Truncated(&'static str),
    FieldTooLarge(&'static str, usize),
    BadUtf8(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BodyTooLarge(n) => write!(f, "frame body too large: {n} bytes"),
            Self::BodyTooSmall(n) => write!(f, "frame body too small: {n} bytes"),
            Self::UnknownKind(k) => write!(f, "unknown message kind 0x{k:02X}"),
            Self::Truncated(what) => write!(f, "truncated payload: {what}"),
            Self::FieldTooLarge(field, n) => write!(f, "field too large: {field} ({n} bytes)"),
            Self::BadUtf8(what) => write!(f, "invalid UTF-8 in {what}"),
        }
    }
}

impl std::error::Error for ProtoError {}

type Result<T> = std::result::Result<T, ProtoError>;

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

fn get_u8(data: &[u8], at: usize) -> Option<u8> {
    data.get(at).copied()
}

fn get_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(at..at + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn get_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn get_i32(data: &[u8], at: usize) -> Option<i32> {
    let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

fn put_bytes_u32(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

// ---------------------------------------------------------------------------
// Frame encoding
// ---------------------------------------------------------------------------

/// Encode a complete frame ready to write to the stream.
pub fn frame(kind: Kind, seq: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let body_len = MIN_BODY_LEN + payload.len();
    if body_len > MAX_BODY_LEN {
        return Err(ProtoError::BodyTooLarge(body_len));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Payload codecs
// ---------------------------------------------------------------------------

/// `exec` / `spawn` payload: a shell command plus a guest-side timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPayload<'a> {
    pub timeout_ms: u32,
    pub cmd: &'a str,
}

impl<'a> CommandPayload<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.cmd.len());
        out.extend_from_slice(&self.timeout_ms.to_be_bytes());
        put_bytes_u32(&mut out, self.cmd.as_bytes());
        out
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let timeout_ms = get_u32(payload, 0).ok_or(ProtoError::Truncated("command header"))?;
        let cmd_len = get_u32(payload, 4).ok_or(ProtoError::Truncated("command header"))? as usize;
        let cmd = payload
            .get(8..8 + cmd_len)
            .ok_or(ProtoError::Truncated("command text"))?;
        let cmd = std::str::from_utf8(cmd).map_err(|_| ProtoError::BadUtf8("command"))?;
        Ok(Self { timeout_ms, cmd })
    }
}

/// `exec_result` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResultPayload<'a> {
    pub exit_code: i32,
    pub stdout: &'a [u8],
    pub stderr: &'a [u8],
}

impl<'a> ExecResultPayload<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.exit_code.to_be_bytes());
        put_bytes_u32(&mut out, self.stdout);
        put_bytes_u32(&mut out, self.stderr);
        out
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let exit_code = get_i32(payload, 0).ok_or(ProtoError::Truncated("exec_result header"))?;
        let stdout_len =
            get_u32(payload, 4).ok_or(ProtoError::Truncated("exec_result header"))? as usize;
        let stdout = payload
            .get(8..8 + stdout_len)
            .ok_or(ProtoError::Truncated("exec_result stdout"))?;
        let stderr_at = 8 + stdout_len;
        let stderr_len =
            get_u32(payload, stderr_at).ok_or(ProtoError::Truncated("exec_result header"))? as usize;
        let stderr = payload
            .get(stderr_at + 4..stderr_at + 4 + stderr_len)
            .ok_or(ProtoError::Truncated("exec_result stderr"))?;
        Ok(Self {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// `write_file` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFilePayload<'a> {
    pub path: &'a str,
    pub content: &'a [u8],
}

impl<'a> WriteFilePayload<'a> {
    /// Fails if the path exceeds the u16 length field. Overall frame size is
    /// enforced by [`frame`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.path.as_bytes();
        if path.len() > u16::MAX as usize {
            return Err(ProtoError::FieldTooLarge("path", path.len()));
        }
        let mut out = Vec::with_capacity(6 + path.len() + self.content.len());
        out.extend_from_slice(&(path.len() as u16).to_be_bytes());
        out.extend_from_slice(path);
        put_bytes_u32(&mut out, self.content);
        Ok(out)
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let path_len = get_u16(payload, 0).ok_or(ProtoError::Truncated("write_file header"))? as usize;
        let path = payload
            .get(2..2 + path_len)
            .ok_or(ProtoError::Truncated("write_file path"))?;
        let path = std::str::from_utf8(path).map_err(|_| ProtoError::BadUtf8("path"))?;
        let content_at = 2 + path_len;
        let content_len =
            get_u32(payload, content_at).ok_or(ProtoError::Truncated("write_file header"))? as usize;
        let content = payload
            .get(content_at + 4..content_at + 4 + content_len)
            .ok_or(ProtoError::Truncated("write_file content"))?;
        Ok(Self { path, content })
    }
}

/// `write_result` payload. The error text is truncated to the u16 field.
pub fn encode_write_result(ok: bool, error: &str) -> Vec<u8> {
    let err = error.as_bytes();
    let err_len = err.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(3 + err_len);
    out.push(u8::from(ok));
    out.extend_from_slice(&(err_len as u16).to_be_bytes());
    out.extend_from_slice(err.get(..err_len).unwrap_or(err));
    out
}

/// Decode `write_result`. Returns `(ok, error)`.
pub fn decode_write_result(payload: &[u8]) -> Result<(bool, &str)> {
    let ok = get_u8(payload, 0).ok_or(ProtoError::Truncated("write_result header"))? == 1;
    let err_len = get_u16(payload, 1).ok_or(ProtoError::Truncated("write_result header"))? as usize;
    let err = payload
        .get(3..3 + err_len)
        .ok_or(ProtoError::Truncated("write_result error"))?;
    let err = std::str::from_utf8(err).map_err(|_| ProtoError::BadUtf8("write_result error"))?;
    Ok((ok, err))
}

/// `spawn_result` payload.
pub fn encode_spawn_result(pid: u32) -> Vec<u8> {
    pid.to_be_bytes().to_vec()
}

pub fn decode_spawn_result(payload: &[u8]) -> Result<u32> {
    get_u32(payload, 0).ok_or(ProtoError::Truncated("spawn_result"))
}

/// `exit` event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPayload<'a> {
    pub pid: u32,
    pub exit_code: i32,
    pub stderr: &'a [u8],
}

impl<'a> ExitPayload<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.stderr.len());
        out.extend_from_slice(&self.pid.to_be_bytes());
        out.extend_from_slice(&self.exit_code.to_be_bytes());
        put_bytes_u32(&mut out, self.stderr);
        out
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let pid = get_u32(payload, 0).ok_or(ProtoError::Truncated("exit header"))?;
        let exit_code = get_i32(payload, 4).ok_or(ProtoError::Truncated("exit header"))?;
        let stderr_len = get_u32(payload, 8).ok_or(ProtoError::Truncated("exit header"))? as usize;
        let stderr = payload
            .get(12..12 + stderr_len)
            .ok_or(ProtoError::Truncated("exit stderr"))?;
        Ok(Self {
            pid,
            exit_code,
            stderr,
        })
    }
}

/// `error` payload. The message is truncated to the u16 field.
pub fn encode_error(message: &str) -> Vec<u8> {
    let msg = message.as_bytes();
    let msg_len = msg.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(2 + msg_len);
    out.extend_from_slice(&(msg_len as u16).to_be_bytes());
    out.extend_from_slice(msg.get(..msg_len).unwrap_or(msg));
    out
}

pub fn decode_error(payload: &[u8]) -> Result<&str> {
    let msg_len = get_u16(payload, 0).ok_or(ProtoError::Truncated("error header"))? as usize;
    let msg = payload
        .get(2..2 + msg_len)
        .ok_or(ProtoError::Truncated("error message"))?;
    std::str::from_utf8(msg).map_err(|_| ProtoError::BadUtf8("error message"))
}

// ---------------------------------------------------------------------------
// Streaming decoder
// ---------------------------------------------------------------------------

/// Accumulates stream bytes and yields complete frames.
///
/// Unknown kinds and malformed headers poison the connection (the buffer is
/// cleared and an error returned): there is no way to resynchronise a
/// length-prefixed stream after a framing error.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Feed raw bytes; returns every frame completed by this chunk.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0;

        while let Some(body_len) = get_u32(&self.buf, consumed) {
            let body_len = body_len as usize;
            if body_len > MAX_BODY_LEN {
                self.buf.clear();
                return Err(ProtoError::BodyTooLarge(body_len));
            }
            if body_len < MIN_BODY_LEN {
                self.buf.clear();
                return Err(ProtoError::BodyTooSmall(body_len));
            }
            let total = HEADER_LEN + body_len;
            if self.buf.len() < consumed + total {
                break;
            }

            let kind_byte = get_u8(&self.buf, consumed + HEADER_LEN).unwrap_or(0);
            let Some(kind) = Kind::from_u8(kind_byte) else {
                self.buf.clear();
                return Err(ProtoError::UnknownKind(kind_byte));
            };
            let seq = get_u32(&self.buf, consumed + HEADER_LEN + 1).unwrap_or(0);
            let payload = self
                .buf
                .get(consumed + HEADER_LEN + MIN_BODY_LEN..consumed + total)
                .unwrap_or_default()
                .to_vec();

            frames.push(Frame { kind, seq, payload });
            consumed += total;
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_empty_payload() {
        let bytes = frame(Kind::Hello, 0, &[]).unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, Kind::Hello);
        assert_eq!(frames[0].seq, 0);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn frame_roundtrip_with_payload() {
        let bytes = frame(Kind::Exec, 7, b"payload").unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes).unwrap();
        assert_eq!(frames[0].kind, Kind::Exec);
        assert_eq!(frames[0].seq, 7);
        assert_eq!(frames[0].payload, b"payload");
    }

    #[test]
    fn decoder_accepts_split_frames() {
        let bytes = frame(Kind::Pong, 3, &[]).unwrap();
        let mut dec = FrameDecoder::new();
        assert!(dec.push(&bytes[..6]).unwrap().is_empty());
        let frames = dec.push(&bytes[6..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 3);
    }

    #[test]
    fn decoder_accepts_byte_by_byte() {
        let bytes = frame(Kind::Ping, 1, &[]).unwrap();
        let mut dec = FrameDecoder::new();
        for (i, b) in bytes.iter().enumerate() {
            let frames = dec.push(&[*b]).unwrap();
            if i + 1 == bytes.len() {
                assert_eq!(frames.len(), 1);
            } else {
                assert!(frames.is_empty());
            }
        }
    }

    #[test]
    fn decoder_yields_multiple_frames_from_one_chunk() {
        let mut bytes = frame(Kind::Ping, 1, &[]).unwrap();
        bytes.extend(frame(Kind::Pong, 1, &[]).unwrap());
        bytes.extend(frame(Kind::Hello, 0, &[]).unwrap());
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes).unwrap();
        let kinds: Vec<Kind> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![Kind::Ping, Kind::Pong, Kind::Hello]);
    }

    #[test]
    fn decoder_rejects_oversized_body() {
        let mut dec = FrameDecoder::new();
        let header = ((MAX_BODY_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(
            dec.push(&header),
            Err(ProtoError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn decoder_rejects_undersized_body() {
        let mut dec = FrameDecoder::new();
        let header = 2u32.to_be_bytes();
        assert!(matches!(dec.push(&header), Err(ProtoError::BodyTooSmall(2))));
    }

    #[test]
    fn decoder_rejects_unknown_kind() {
        let mut bytes = frame(Kind::Ping, 1, &[]).unwrap();
        bytes[HEADER_LEN] = 0x42;
        let mut dec = FrameDecoder::new();
        assert!(matches!(dec.push(&bytes), Err(ProtoError::UnknownKind(0x42))));
    }

    #[test]
    fn oversized_frame_refused_at_encode() {
        let payload = vec![0u8; MAX_BODY_LEN];
        assert!(matches!(
            frame(Kind::WriteFile, 1, &payload),
            Err(ProtoError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn command_payload_roundtrip() {
        let p = CommandPayload {
            timeout_ms: 5000,
            cmd: "echo hello",
        };
        let bytes = p.encode();
        assert_eq!(CommandPayload::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn command_payload_truncated() {
        assert!(CommandPayload::decode(&[0; 7]).is_err());
        let p = CommandPayload {
            timeout_ms: 1,
            cmd: "ls",
        };
        let bytes = p.encode();
        assert!(CommandPayload::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn exec_result_roundtrip() {
        let p = ExecResultPayload {
            exit_code: -1,
            stdout: b"out",
            stderr: b"err",
        };
        let bytes = p.encode();
        assert_eq!(ExecResultPayload::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn exec_result_empty_streams() {
        let p = ExecResultPayload {
            exit_code: 137,
            stdout: b"",
            stderr: b"",
        };
        let bytes = p.encode();
        let decoded = ExecResultPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.exit_code, 137);
        assert!(decoded.stdout.is_empty());
        assert!(decoded.stderr.is_empty());
    }

    #[test]
    fn write_file_roundtrip() {
        let p = WriteFilePayload {
            path: "/tmp/env.json",
            content: b"{\"a\":1}",
        };
        let bytes = p.encode().unwrap();
        assert_eq!(WriteFilePayload::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn write_file_rejects_long_path() {
        let long = "p".repeat(u16::MAX as usize + 1);
        let p = WriteFilePayload {
            path: &long,
            content: b"",
        };
        assert!(matches!(
            p.encode(),
            Err(ProtoError::FieldTooLarge("path", _))
        ));
    }

    #[test]
    fn write_result_roundtrip() {
        let bytes = encode_write_result(false, "permission denied");
        let (ok, err) = decode_write_result(&bytes).unwrap();
        assert!(!ok);
        assert_eq!(err, "permission denied");

        let bytes = encode_write_result(true, "");
        let (ok, err) = decode_write_result(&bytes).unwrap();
        assert!(ok);
        assert!(err.is_empty());
    }

    #[test]
    fn spawn_result_roundtrip() {
        let bytes = encode_spawn_result(4242);
        assert_eq!(decode_spawn_result(&bytes).unwrap(), 4242);
    }

    #[test]
    fn exit_payload_roundtrip() {
        let p = ExitPayload {
            pid: 99,
            exit_code: 137,
            stderr: b"killed",
        };
        let bytes = p.encode();
        assert_eq!(ExitPayload::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn error_payload_roundtrip() {
        let bytes = encode_error("spawn failed");
        assert_eq!(decode_error(&bytes).unwrap(), "spawn failed");
    }

    #[test]
    fn full_exec_frame_roundtrip() {
        let payload = CommandPayload {
            timeout_ms: 10_000,
            cmd: "ls -la",
        }
        .encode();
        let bytes = frame(Kind::Exec, 5, &payload).unwrap();

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes).unwrap();
        assert_eq!(frames[0].kind, Kind::Exec);
        let decoded = CommandPayload::decode(&frames[0].payload).unwrap();
        assert_eq!(decoded.timeout_ms, 10_000);
        assert_eq!(decoded.cmd, "ls -la");
    }
}
