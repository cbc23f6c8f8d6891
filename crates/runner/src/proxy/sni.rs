//! SNI extraction from a peeked TLS ClientHello.
//!
//! The proxy never consumes these bytes. They are `peek`ed so the intact
//! stream can still be handed to the TLS acceptor in MITM mode or copied
//! verbatim in passthrough mode.

/// Whether the first bytes look like a TLS handshake record.
pub fn looks_like_tls(data: &[u8]) -> bool {
    data.first() == Some(&0x16)
}

/// Extract the SNI hostname from a ClientHello, normalised to lowercase
/// without a trailing dot. `None` when the data is not a ClientHello, is
/// truncated, or carries no SNI extension.
pub fn client_hello_sni(data: &[u8]) -> Option<String> {
    // record header (5) + handshake type (1) + length (3)
    if !looks_like_tls(data) || data.len() < 9 {
        return None;
    }

    let handshake = data.get(5..)?;
    if *handshake.first()? != 0x01 {
        return None; // not a ClientHello
    }

    // client version (2) + random (32)
    let hello = handshake.get(4..)?;
    let mut at = 34usize;

    let session_id_len = usize::from(*hello.get(at)?);
    at += 1 + session_id_len;

    let cipher_suites_len = read_u16(hello, at)? as usize;
    at += 2 + cipher_suites_len;

    let compression_len = usize::from(*hello.get(at)?);
    at += 1 + compression_len;

    let extensions_len = read_u16(hello, at)? as usize;
    at += 2;
    let extensions_end = (at + extensions_len).min(hello.len());

    while at + 4 <= extensions_end {
        let ext_type = read_u16(hello, at)?;
        let ext_len = read_u16(hello, at + 2)? as usize;
        at += 4;

        if ext_type == 0x0000 {
            let ext = hello.get(at..(at + ext_len).min(hello.len()))?;
            return server_name(ext);
        }
        at += ext_len;
    }
    None
}

/// Parse the server_name extension body: a list of typed names, where type 0
/// is a hostname.
fn server_name(ext: &[u8]) -> Option<String> {
    let list_len = read_u16(ext, 0)? as usize;
    let mut at = 2usize;

    while at + 3 <= 2 + list_len {
        let name_type = *ext.get(at)?;
        let name_len = read_u16(ext, at + 1)? as usize;
        at += 3;

        if name_type == 0 {
            let raw = ext.get(at..at + name_len)?;
            let name = std::str::from_utf8(raw).ok()?;
            return Some(name.to_lowercase().trim_end_matches('.').to_string());
        }
        at += name_len;
    }
    None
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(at..at + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal TLS 1.2 ClientHello carrying SNI "example.com".
    const CLIENT_HELLO: &[u8] = &[
        0x16, // handshake record
        0x03, 0x01, // TLS 1.0 compat version
        0x00, 0x5f, // record length
        0x01, // ClientHello
        0x00, 0x00, 0x5b, // handshake length
        0x03, 0x03, // client version
        // random
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, //
        0x00, // session id length
        0x00, 0x02, // cipher suites length
        0x00, 0x2f, // one suite
        0x01, 0x00, // null compression
        0x00, 0x28, // extensions length
        0x00, 0x00, // ext: server_name
        0x00, 0x10, // ext length
        0x00, 0x0e, // list length
        0x00, // name type: hostname
        0x00, 0x0b, // name length
        b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm', //
        0x00, 0x15, // ext: padding
        0x00, 0x10, // length
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    #[test]
    fn extracts_sni() {
        assert_eq!(client_hello_sni(CLIENT_HELLO).as_deref(), Some("example.com"));
    }

    #[test]
    fn http_bytes_are_not_tls() {
        let http = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(!looks_like_tls(http));
        assert_eq!(client_hello_sni(http), None);
    }

    #[test]
    fn truncated_hello_yields_none() {
        assert_eq!(client_hello_sni(&CLIENT_HELLO[..20]), None);
        assert_eq!(client_hello_sni(&[0x16, 0x03, 0x01]), None);
    }

    #[test]
    fn uppercase_and_trailing_dot_normalised() {
        let mut hello = CLIENT_HELLO.to_vec();
        // Rewrite "example.com" -> "EXAMPLE.COM" in place.
        let at = hello.windows(11).position(|w| w == b"example.com").unwrap();
        hello[at..at + 11].copy_from_slice(b"EXAMPLE.COM");
        assert_eq!(client_hello_sni(&hello).as_deref(), Some("example.com"));
    }
}
