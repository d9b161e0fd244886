//! TLS CA Manager: mints a local CA on first run and issues per-SNI leaf
//! certificates on demand for the MITM tunnel. Grounded in the same
//! `rcgen` + `rustls::pki_types` pattern used for local-trust interception
//! proxies elsewhere in this corpus: a self-signed CA persisted to disk,
//! leaf certs signed by that CA and cached in memory for the process
//! lifetime. Both the CA and leaf keys are RSA-2048, generated with the
//! `rsa` crate (rcgen itself only signs with RSA, it does not generate
//! RSA key material) and random 128-bit serial numbers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::fs;

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const RSA_KEY_BITS: usize = 2048;

/// Owns the process CA and an in-memory, per-host cache of signed server
/// configs. There is no on-disk leaf cache: leaves are cheap to re-mint and
/// the spec requires they live only for the process lifetime.
pub struct CaManager {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    leaves: DashMap<String, Arc<ServerConfig>>,
}

impl CaManager {
    /// Loads `ca.crt`/`ca.key` from `certs_dir` if present, otherwise mints
    /// and persists a fresh CA (files written with 0600 permissions).
    pub async fn init(certs_dir: impl AsRef<Path>) -> Result<Self> {
        let certs_dir = certs_dir.as_ref();
        let cert_path = certs_dir.join(CA_CERT_FILE);
        let key_path = certs_dir.join(CA_KEY_FILE);

        let (ca_cert, ca_key) = if fs::metadata(&cert_path).await.is_ok()
            && fs::metadata(&key_path).await.is_ok()
        {
            let cert_pem = fs::read_to_string(&cert_path).await?;
            let key_pem = fs::read_to_string(&key_path).await?;
            let ca_key = KeyPair::from_pem(&key_pem)
                .map_err(|e| Error::Config(format!("failed to parse CA key: {e}")))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| Error::Config(format!("invalid CA certificate PEM: {e}")))?;
            let ca_cert = params
                .self_signed(&ca_key)
                .map_err(|e| Error::Config(format!("failed to reconstruct CA: {e}")))?;
            (ca_cert, ca_key)
        } else {
            let (ca_cert, ca_key) = generate_root()?;
            fs::create_dir_all(certs_dir).await?;
            fs::write(&cert_path, ca_cert.pem()).await?;
            fs::write(&key_path, ca_key.serialize_pem()).await?;
            set_permissions(&cert_path, 0o600).await?;
            set_permissions(&key_path, 0o600).await?;
            (ca_cert, ca_key)
        };

        let ca_chain = vec![ca_cert.der().clone()];

        Ok(Self {
            ca_cert,
            ca_key,
            ca_chain,
            leaves: DashMap::new(),
        })
    }

    /// Returns a cached TLS server config for `host`, minting and signing a
    /// fresh leaf certificate on first use.
    pub fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let cache_key = host.to_ascii_lowercase();
        if let Some(cfg) = self.leaves.get(&cache_key) {
            return Ok(cfg.clone());
        }

        let (chain, key) = self.issue_leaf(host)?;

        let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::TlsHandshake(format!("failed to build server config: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.leaves.insert(cache_key, config.clone());
        Ok(config)
    }

    fn issue_leaf(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            host.try_into()
                .map_err(|_| Error::TlsHandshake(format!("invalid SNI host: {host}")))?,
        )];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial_number());

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(TimeDuration::hours(1)).unwrap_or(now);
        params.not_after = now
            .checked_add(TimeDuration::days(LEAF_VALIDITY_DAYS))
            .unwrap_or(now);

        let key_pair = generate_rsa_key_pair()
            .map_err(|e| Error::TlsHandshake(format!("failed to generate leaf key: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::TlsHandshake(format!("failed to sign leaf cert: {e}")))?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }
}

fn generate_root() -> Result<(Certificate, KeyPair)> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "nc-http-proxy CA");
    dn.push(DnType::OrganizationName, "nc-http-proxy");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial_number());

    let now = OffsetDateTime::now_utc();
    params.not_before = now.checked_sub(TimeDuration::hours(1)).unwrap_or(now);
    params.not_after = now
        .checked_add(TimeDuration::days(CA_VALIDITY_DAYS))
        .unwrap_or(now);

    let key_pair =
        generate_rsa_key_pair().map_err(|e| Error::Config(format!("failed to generate CA key: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Config(format!("failed to self-sign CA: {e}")))?;
    Ok((cert, key_pair))
}

/// Generates a fresh RSA-2048 key pair via the `rsa` crate (rcgen has no
/// RSA key generator of its own) and hands the PKCS#8 DER encoding to
/// rcgen, which detects the RSA algorithm from the key material.
fn generate_rsa_key_pair() -> Result<KeyPair> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::TlsHandshake(format!("failed to generate RSA key: {e}")))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| Error::TlsHandshake(format!("failed to encode RSA key: {e}")))?;
    KeyPair::try_from(der.as_bytes())
        .map_err(|e| Error::TlsHandshake(format!("rcgen rejected generated RSA key: {e}")))
}

/// A cryptographically random 128-bit serial number, per the documented CA
/// and leaf certificate invariant. The top bit of the first byte is
/// cleared so the DER INTEGER encoding is always non-negative.
fn random_serial_number() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

#[cfg(unix)]
async fn set_permissions(path: &PathBuf, mode: u32) -> Result<()> {
    let perms = std::fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_permissions(_path: &PathBuf, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_ca_files_on_first_run() {
        let dir = tempdir().unwrap();
        let manager = CaManager::init(dir.path()).await.unwrap();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(!manager.ca_chain.is_empty());
    }

    #[tokio::test]
    async fn init_reuses_existing_ca_rather_than_minting_a_new_one() {
        let dir = tempdir().unwrap();
        let first = CaManager::init(dir.path()).await.unwrap();
        let first_der = first.ca_cert.der().clone();

        let second = CaManager::init(dir.path()).await.unwrap();
        let second_der = second.ca_cert.der().clone();

        assert_eq!(first_der, second_der);
    }

    #[tokio::test]
    async fn leaf_for_host_is_cached_across_calls() {
        let dir = tempdir().unwrap();
        let manager = CaManager::init(dir.path()).await.unwrap();

        let first = manager.server_config_for_host("example.com").unwrap();
        let second = manager.server_config_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn leaf_for_different_hosts_are_distinct_configs() {
        let dir = tempdir().unwrap();
        let manager = CaManager::init(dir.path()).await.unwrap();

        let a = manager.server_config_for_host("a.example.com").unwrap();
        let b = manager.server_config_for_host("b.example.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    const RSA_ENCRYPTION_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

    fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn generated_key_pairs_carry_the_rsa_algorithm_oid() {
        let key_pair = generate_rsa_key_pair().unwrap();
        assert!(contains_subsequence(&key_pair.serialize_der(), RSA_ENCRYPTION_OID));
    }

    #[test]
    fn serial_numbers_are_random_and_non_negative() {
        let a = random_serial_number();
        let b = random_serial_number();
        assert_ne!(a, b);
        assert_eq!(a.as_ref().len(), 16);
        assert_eq!(a.as_ref()[0] & 0x80, 0);
    }

    #[tokio::test]
    async fn root_and_leaf_certificates_use_rsa_keys() {
        let dir = tempdir().unwrap();
        let manager = CaManager::init(dir.path()).await.unwrap();
        assert!(contains_subsequence(
            &manager.ca_key.serialize_der(),
            RSA_ENCRYPTION_OID
        ));

        let (_, leaf_key) = manager.issue_leaf("example.com").unwrap();
        let leaf_der = match &leaf_key {
            PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der(),
            _ => panic!("expected a PKCS#8-encoded leaf key"),
        };
        assert!(contains_subsequence(leaf_der, RSA_ENCRYPTION_OID));
    }
}
