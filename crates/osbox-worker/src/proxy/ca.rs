use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

use crate::error::WorkerError;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "osbox egress proxy CA";

const CA_KEY_BITS: usize = 4096;
const LEAF_KEY_BITS: usize = 2048;
const CA_VALID_DAYS: i64 = 3650;
const LEAF_VALID_HOURS: i64 = 24;

/// The worker's persistent signing CA plus a per-host leaf cache.
///
/// Persistence matters: VM images have this CA baked into their trust store,
/// so the root must never be regenerated while those images exist. Leaf
/// certificates are cheap and cached only for the lifetime of the process.
pub struct CertAuthority {
    ca_cert_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    leaf_cache: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl CertAuthority {
    /// Read `ca.crt`/`ca.key` from `dir` if present; otherwise generate a
    /// fresh 4096-bit RSA root valid 10 years and persist it.
    pub fn load_or_create(dir: &Path) -> Result<Self, WorkerError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .map_err(|e| WorkerError::io("reading ca.crt", e))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .map_err(|e| WorkerError::io("reading ca.key", e))?;
            let ca = Self::from_pem(cert_pem, &key_pem)?;
            info!(path = %cert_path.display(), "loaded proxy CA from disk");
            return Ok(ca);
        }

        Self::create(dir, CA_KEY_BITS)
    }

    /// Generate and persist a fresh root. `bits` is parameterized so tests
    /// can use a smaller key; production always passes 4096.
    pub(crate) fn create(dir: &Path, bits: usize) -> Result<Self, WorkerError> {
        info!(bits, "generating proxy CA root");

        let key_pem = generate_rsa_key_pem(bits)?;
        let ca_key = rsa_key_pair(&key_pem)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::days(1);
        params.not_after = now + TimeDuration::days(CA_VALID_DAYS);

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| WorkerError::ProxyTlsError(format!("signing CA root: {}", e)))?;
        let cert_pem = ca_cert.pem();

        std::fs::create_dir_all(dir).map_err(|e| WorkerError::io("creating CA dir", e))?;
        std::fs::write(dir.join(CA_CERT_FILE), &cert_pem)
            .map_err(|e| WorkerError::io("writing ca.crt", e))?;
        std::fs::write(dir.join(CA_KEY_FILE), &key_pem)
            .map_err(|e| WorkerError::io("writing ca.key", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                dir.join(CA_KEY_FILE),
                std::fs::Permissions::from_mode(0o600),
            );
        }

        Ok(Self {
            ca_cert_pem: cert_pem,
            ca_cert,
            ca_key,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    fn from_pem(cert_pem: String, key_pem: &str) -> Result<Self, WorkerError> {
        let ca_key = rsa_key_pair(key_pem)?;
        // Rebuild the issuer from the persisted certificate so leaves carry
        // the exact issuer DN the guest images trust.
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| WorkerError::ProxyTlsError(format!("parsing ca.crt: {}", e)))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| WorkerError::ProxyTlsError(format!("rebuilding CA issuer: {}", e)))?;

        Ok(Self {
            ca_cert_pem: cert_pem,
            ca_cert,
            ca_key,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// The PEM bytes as written on disk; injected into guest trust stores.
    pub fn ca_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// rustls server config presenting a leaf for `host`, signing one if the
    /// cache has none. Eviction would only cost a re-sign; correctness never
    /// depends on a cache hit because the root key stays loaded.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<rustls::ServerConfig>, WorkerError> {
        if let Some(config) = self.leaf_cache.lock().unwrap().get(host) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(self.sign_leaf(host)?);
        self.leaf_cache
            .lock()
            .unwrap()
            .insert(host.to_string(), Arc::clone(&config));
        Ok(config)
    }

    /// Sign a 2048-bit, 24-hour leaf for `host` (CN + single SAN DNS entry).
    fn sign_leaf(&self, host: &str) -> Result<rustls::ServerConfig, WorkerError> {
        let key_pem = generate_rsa_key_pem(LEAF_KEY_BITS)?;
        let leaf_key = rsa_key_pair(&key_pem)?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| WorkerError::ProxyTlsError(format!("leaf params for {}: {}", host, e)))?;
        params.distinguished_name.push(DnType::CommonName, host);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + TimeDuration::hours(LEAF_VALID_HOURS);

        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| WorkerError::ProxyTlsError(format!("signing leaf for {}: {}", host, e)))?;

        let chain = vec![leaf.der().clone(), self.ca_cert.der().clone()];
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der.into())
            .map_err(|e| WorkerError::ProxyTlsError(format!("server config for {}: {}", host, e)))
    }
}

fn generate_rsa_key_pem(bits: usize) -> Result<String, WorkerError> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| WorkerError::ProxyTlsError(format!("RSA keygen: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| WorkerError::ProxyTlsError(format!("encoding RSA key: {}", e)))?;
    Ok(pem.to_string())
}

fn rsa_key_pair(pem: &str) -> Result<KeyPair, WorkerError> {
    KeyPair::from_pem_and_sign_algo(pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| WorkerError::ProxyTlsError(format!("loading RSA key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT_CRYPTO: Once = Once::new();

    fn init_crypto_provider() {
        INIT_CRYPTO.call_once(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .ok();
        });
    }

    // 2048-bit roots keep test keygen tolerable; the production path only
    // differs in key size.
    fn test_ca(dir: &Path) -> CertAuthority {
        CertAuthority::create(dir, 2048).unwrap()
    }

    #[test]
    fn create_persists_cert_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca(dir.path());

        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
        assert!(ca.ca_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn reload_returns_byte_identical_pem() {
        let dir = tempfile::tempdir().unwrap();
        let created = test_ca(dir.path());
        let created_pem = created.ca_pem().to_string();
        let disk_pem = std::fs::read_to_string(dir.path().join("ca.crt")).unwrap();
        assert_eq!(created_pem, disk_pem);

        let reloaded = CertAuthority::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.ca_pem(), created_pem);

        let disk_key_before = std::fs::read(dir.path().join("ca.key")).unwrap();
        let _ = CertAuthority::load_or_create(dir.path()).unwrap();
        let disk_key_after = std::fs::read(dir.path().join("ca.key")).unwrap();
        assert_eq!(disk_key_before, disk_key_after);
    }

    #[test]
    fn leaf_signing_is_cached_per_host() {
        init_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca(dir.path());

        let first = ca.server_config_for("httpbin.org").unwrap();
        let second = ca.server_config_for("httpbin.org").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.server_config_for("example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn leaf_chains_to_reloaded_root() {
        init_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let _ = test_ca(dir.path());

        // A fresh leaf signed after reload must chain to the same root the
        // guests trust; signing succeeding from reloaded material is the
        // contract.
        let reloaded = CertAuthority::load_or_create(dir.path()).unwrap();
        assert!(reloaded.server_config_for("api.example.com").is_ok());
    }
}
