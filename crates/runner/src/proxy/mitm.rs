//! Proxy CA and per-host leaf certificates for TLS interception.
//!
//! The CA pair lives in the configured directory (`ca.pem` + `ca.key`); the
//! certificate half is baked into the guest rootfs trust store, which is
//! what makes interception possible. Leaf certificates are minted on first
//! use per hostname and cached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

use crate::error::{RunnerError, RunnerResult};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key";

pub struct ProxyCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    leaf_cache: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl ProxyCa {
    /// Load the CA pair from `dir`, generating and persisting a fresh one
    /// when absent. Regeneration invalidates existing guest images, so the
    /// pair is only created when neither file exists.
    pub fn load_or_generate(dir: &Path) -> RunnerResult<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let ca_key = KeyPair::from_pem(&key_pem)
                .map_err(|e| RunnerError::Config(format!("proxy CA key: {e}")))?;
            // Rebuilding from the stored PEM keeps subject and key identical;
            // leaves validate against the installed certificate either way.
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| RunnerError::Config(format!("proxy CA cert: {e}")))?;
            let ca_cert = params
                .self_signed(&ca_key)
                .map_err(|e| RunnerError::Config(format!("proxy CA rebuild: {e}")))?;
            info!(dir = %dir.display(), "proxy CA loaded");
            return Ok(Self {
                ca_cert,
                ca_key,
                leaf_cache: Mutex::new(HashMap::new()),
            });
        }

        std::fs::create_dir_all(dir)?;
        let ca_key = KeyPair::generate()
            .map_err(|e| RunnerError::Config(format!("proxy CA keygen: {e}")))?;
        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| RunnerError::Config(format!("proxy CA params: {e}")))?;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Skiff Egress Proxy CA");
        params.distinguished_name = dn;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| RunnerError::Config(format!("proxy CA sign: {e}")))?;

        std::fs::write(&cert_path, ca_cert.pem())?;
        std::fs::write(&key_path, ca_key.serialize_pem())?;
        info!(dir = %dir.display(), "proxy CA generated");

        Ok(Self {
            ca_cert,
            ca_key,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// TLS server config presenting a leaf for `host`, minted under the
    /// proxy CA and cached per hostname.
    pub fn server_config(&self, host: &str) -> RunnerResult<Arc<rustls::ServerConfig>> {
        {
            let cache = self.lock_cache();
            if let Some(config) = cache.get(host) {
                return Ok(Arc::clone(config));
            }
        }

        let leaf_key = KeyPair::generate()
            .map_err(|e| RunnerError::Internal(format!("leaf keygen: {e}")))?;
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| RunnerError::Internal(format!("leaf params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| RunnerError::Internal(format!("leaf sign: {e}")))?;

        let cert_der = CertificateDer::from(leaf.der().to_vec());
        let key_der: PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into();

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| RunnerError::Internal(format!("leaf tls config: {e}")))?;
        let config = Arc::new(config);

        self.lock_cache()
            .insert(host.to_string(), Arc::clone(&config));
        Ok(config)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<rustls::ServerConfig>>> {
        self.leaf_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// TLS client config for upstream connections, trusting the host's native
/// roots.
pub fn upstream_client_config() -> RunnerResult<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err(RunnerError::Config(
            "no native TLS roots available for upstream connections".into(),
        ));
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
