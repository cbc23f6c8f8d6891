//! Sealed secret tokens.
//!
//! When seal-secrets is on, the platform replaces each secret value with an
//! opaque token before the job reaches the guest. The only place a token
//! turns back into plaintext is the egress proxy, while rewriting outbound
//! request headers; the guest never sees the real value.
//!
//! Wire format: `vm0_enc_<base64url(json)>`. The body binds the run id,
//! user id, and secret name, carries an AES-256-GCM ciphertext and an
//! explicit HMAC-SHA256 tag over all bound fields, and expires at an
//! absolute timestamp. Verification order mirrors the rejection rules:
//! integrity, run binding, TTL, then decryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed platform token prefix.
pub const TOKEN_PREFIX: &str = "vm0_enc_";

const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("sealed token is malformed")]
    Malformed,

    #[error("sealed token failed integrity check")]
    IntegrityFailure,

    #[error("sealed token is bound to a different run")]
    RunMismatch,

    #[error("sealed token is expired")]
    Expired,

    #[error("sealed token failed to decrypt")]
    DecryptFailed,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    v: u8,
    run_id: String,
    user_id: String,
    name: String,
    /// Epoch milliseconds.
    expires_at: i64,
    nonce: String,
    ciphertext: String,
    mac: String,
}

/// Seals and unseals tokens with keys derived from one master secret.
pub struct Sealer {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl Sealer {
    pub fn from_master(master: &[u8]) -> Self {
        Self {
            enc_key: derive_key(master, b"seal-enc-v1"),
            mac_key: derive_key(master, b"seal-mac-v1"),
        }
    }

    /// Produce a token for `secret`, bound to a run/user/name and expiring
    /// `ttl_ms` after `now_ms`.
    pub fn seal(
        &self,
        run_id: &str,
        user_id: &str,
        name: &str,
        secret: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<String, SealError> {
        let expires_at = now_ms + ttl_ms;
        let binding = binding_bytes(run_id, user_id, name, expires_at);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let cipher =
            Aes256Gcm::new_from_slice(&self.enc_key).map_err(|_| SealError::DecryptFailed)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: secret.as_bytes(),
                    aad: &binding,
                },
            )
            .map_err(|_| SealError::DecryptFailed)?;

        let mac = self.compute_mac(&binding, &nonce_bytes, &ciphertext)?;

        let body = TokenBody {
            v: 1,
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            expires_at,
            nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
            ciphertext: URL_SAFE_NO_PAD.encode(&ciphertext),
            mac: URL_SAFE_NO_PAD.encode(mac),
        };
        let json = serde_json::to_vec(&body).map_err(|_| SealError::Malformed)?;
        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }

    /// Recover the plaintext from a token bound to `expected_run_id`.
    pub fn unseal(
        &self,
        token: &str,
        expected_run_id: &str,
        now_ms: i64,
    ) -> Result<String, SealError> {
        let encoded = token.strip_prefix(TOKEN_PREFIX).ok_or(SealError::Malformed)?;
        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| SealError::Malformed)?;
        let body: TokenBody = serde_json::from_slice(&json).map_err(|_| SealError::Malformed)?;

        let nonce = URL_SAFE_NO_PAD
            .decode(&body.nonce)
            .map_err(|_| SealError::Malformed)?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&body.ciphertext)
            .map_err(|_| SealError::Malformed)?;
        let mac = URL_SAFE_NO_PAD
            .decode(&body.mac)
            .map_err(|_| SealError::Malformed)?;
        if nonce.len() != NONCE_LEN {
            return Err(SealError::Malformed);
        }

        let binding = binding_bytes(&body.run_id, &body.user_id, &body.name, body.expires_at);

        let mut verifier = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|_| SealError::IntegrityFailure)?;
        verifier.update(&binding);
        verifier.update(&nonce);
        verifier.update(&ciphertext);
        verifier
            .verify_slice(&mac)
            .map_err(|_| SealError::IntegrityFailure)?;

        if body.run_id != expected_run_id {
            return Err(SealError::RunMismatch);
        }
        if now_ms >= body.expires_at {
            return Err(SealError::Expired);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.enc_key).map_err(|_| SealError::DecryptFailed)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &binding,
                },
            )
            .map_err(|_| SealError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| SealError::DecryptFailed)
    }

    /// Replace every sealed token embedded in a header value with its
    /// plaintext. `Ok(None)` when the value carries no token; any invalid
    /// token fails the whole value.
    pub fn rewrite_value(
        &self,
        value: &str,
        expected_run_id: &str,
        now_ms: i64,
    ) -> Result<Option<String>, SealError> {
        if !value.contains(TOKEN_PREFIX) {
            return Ok(None);
        }

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(at) = rest.find(TOKEN_PREFIX) {
            let (before, from_token) = rest.split_at(at);
            out.push_str(before);

            let body_start = TOKEN_PREFIX.len();
            let tail = from_token.get(body_start..).unwrap_or_default();
            let body_len = tail
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
                .unwrap_or(tail.len());
            let (token, after) = from_token.split_at(body_start + body_len);

            out.push_str(&self.unseal(token, expected_run_id, now_ms)?);
            rest = after;
        }
        out.push_str(rest);
        Ok(Some(out))
    }

    fn compute_mac(
        &self,
        binding: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SealError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.mac_key).map_err(|_| SealError::IntegrityFailure)?;
        mac.update(binding);
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn derive_key(master: &[u8], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(label);
    hasher.finalize().into()
}

fn binding_bytes(run_id: &str, user_id: &str, name: &str, expires_at: i64) -> Vec<u8> {
    format!("{run_id}|{user_id}|{name}|{expires_at}").into_bytes()
}
