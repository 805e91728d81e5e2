//! The on-demand TLS certificate authority. Leaf certificates are minted per
//! hostname, signed by the configured root CA, and cached for the lifetime of
//! the process. A per-hostname lock makes sure two concurrent handshakes for
//! the same new SNI generate the certificate exactly once.

use std::{
    collections::HashMap,
    fmt::Debug,
    io::Cursor,
    sync::{Arc, Mutex, Once, RwLock},
    time::Duration,
};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::{
    crypto::ring::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::common::url::hostname_matches_any;

#[derive(Error, Debug)]
pub enum Error {
    #[error("CA certificate error: {0}")]
    CaCertificateError(String),
    #[error("cannot generate certificate: {0}")]
    GenerateCertificateError(String),
    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),
}

static INSTALL_PROVIDER: Once = Once::new();

/// Installs the ring crypto provider as the process default, once.
pub(crate) fn ensure_crypto_provider() {
    INSTALL_PROVIDER.call_once(|| {
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
    });
}

/// TLS protocol versions selectable for the terminating endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

/// CA inputs and leaf parameters.
#[derive(Debug, Clone)]
pub struct CertificateAuthorityConfig {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    /// Hostname used when a client sends no SNI.
    pub default_domain: Option<String>,
    pub organization: Option<String>,
    pub locality: Option<String>,
    /// Validity window of minted leaves.
    pub leaf_validity: Duration,
}

impl CertificateAuthorityConfig {
    pub fn new(ca_cert_pem: impl Into<String>, ca_key_pem: impl Into<String>) -> Self {
        CertificateAuthorityConfig {
            ca_cert_pem: ca_cert_pem.into(),
            ca_key_pem: ca_key_pem.into(),
            default_domain: None,
            organization: None,
            locality: None,
            leaf_validity: Duration::from_secs(60 * 60 * 24 * 365),
        }
    }
}

struct CaShared {
    config: CertificateAuthorityConfig,
    certificates: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl Debug for CaShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaShared")
            .field("certificates", &self.certificates.read().unwrap().keys())
            .finish()
    }
}

/// A root-signed certificate issuer with a per-hostname cache.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    state: Arc<CaShared>,
}

impl CertificateAuthority {
    /// Validates the CA material eagerly so bad input fails at startup.
    pub fn new(config: CertificateAuthorityConfig) -> Result<Self, Error> {
        ensure_crypto_provider();

        KeyPair::from_pem(&config.ca_key_pem).map_err(|err| {
            Error::CaCertificateError(format!("CA key is not valid PEM: {:?}", err))
        })?;
        CertificateParams::from_ca_cert_pem(&config.ca_cert_pem).map_err(|err| {
            Error::CaCertificateError(format!("CA certificate is not valid PEM: {:?}", err))
        })?;

        Ok(Self {
            state: Arc::new(CaShared {
                config,
                certificates: RwLock::new(HashMap::new()),
                locks: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Generates a fresh self-signed CA, for servers started without one.
    pub fn generate_ephemeral_ca() -> Result<(String, String), Error> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|err| {
            Error::GenerateCertificateError(format!("cannot generate CA key pair: {:?}", err))
        })?;

        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "intermock testing CA");
        params.distinguished_name = dn;

        let cert = params.self_signed(&key_pair).map_err(|err| {
            Error::GenerateCertificateError(format!("cannot self-sign CA: {:?}", err))
        })?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.state.config.ca_cert_pem
    }

    pub fn default_domain(&self) -> Option<&str> {
        self.state.config.default_domain.as_deref()
    }

    /// Returns the cached leaf for `hostname`, minting it on first use.
    pub fn generate(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        let hostname = hostname.to_ascii_lowercase();
        let hostname = hostname.trim_end_matches('.');

        {
            let certs = self.state.certificates.read().unwrap();
            if let Some(existing) = certs.get(hostname) {
                return Ok(existing.clone());
            }
        }

        let lock = self.lock_for_hostname(hostname);
        let _guard = lock.lock().unwrap();
        {
            let certs = self.state.certificates.read().unwrap();
            if let Some(existing) = certs.get(hostname) {
                return Ok(existing.clone());
            }
        }

        let minted = self.mint(hostname)?;
        self.state
            .certificates
            .write()
            .unwrap()
            .insert(hostname.to_string(), minted.clone());

        debug!(hostname, "minted new leaf certificate");
        Ok(minted)
    }

    fn lock_for_hostname(&self, hostname: &str) -> Arc<Mutex<()>> {
        let mut locks = self.state.locks.write().unwrap();
        locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn mint(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        let config = &self.state.config;

        let ca_key = KeyPair::from_pem(&config.ca_key_pem).map_err(|err| {
            Error::CaCertificateError(format!(
                "cannot parse CA key (host {}): {:?}",
                hostname, err
            ))
        })?;

        // IP literals go into IP SANs; everything else is a DNS name.
        let mut params = if let Ok(ip) = hostname.parse::<std::net::IpAddr>() {
            let mut p = CertificateParams::default();
            if !ip.is_unspecified() {
                p.subject_alt_names.push(SanType::IpAddress(ip));
            }
            p
        } else {
            CertificateParams::new(vec![hostname.to_owned()]).map_err(|err| {
                Error::GenerateCertificateError(format!(
                    "cannot build certificate params (host {}): {:?}",
                    hostname, err
                ))
            })?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        if let Some(org) = &config.organization {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        if let Some(locality) = &config.locality {
            dn.push(DnType::LocalityName, locality.as_str());
        }
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::seconds(config.leaf_validity.as_secs() as i64);

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|err| {
            Error::GenerateCertificateError(format!(
                "cannot generate leaf key pair (host {}): {:?}",
                hostname, err
            ))
        })?;
        let serialized_key_pair = key_pair.serialize_pem();

        let ca_params = CertificateParams::from_ca_cert_pem(&config.ca_cert_pem).map_err(|err| {
            Error::GenerateCertificateError(format!(
                "cannot parse CA certificate (host {}): {:?}",
                hostname, err
            ))
        })?;
        let ca_cert = ca_params.self_signed(&ca_key).map_err(|err| {
            Error::GenerateCertificateError(format!(
                "cannot reconstruct CA certificate (host {}): {:?}",
                hostname, err
            ))
        })?;

        let leaf = params
            .signed_by(&key_pair, &ca_cert, &ca_key)
            .map_err(|err| {
                Error::GenerateCertificateError(format!(
                    "cannot sign leaf certificate (host {}): {:?}",
                    hostname, err
                ))
            })?;

        let private_key = load_private_key(serialized_key_pair)?;
        let certificates = load_certificates(leaf.pem())?;

        let signing_key = any_supported_type(&private_key).map_err(|err| {
            Error::GenerateCertificateError(format!(
                "cannot convert leaf key to signing key (host {}): {:?}",
                hostname, err
            ))
        })?;

        Ok(Arc::new(CertifiedKey::new(certificates, signing_key)))
    }
}

fn load_certificates(cert_pem: String) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = Cursor::new(cert_pem.into_bytes());
    let mut certificates = Vec::new();
    for cert_result in rustls_pemfile::certs(&mut reader) {
        let cert = cert_result.map_err(|err| {
            Error::GenerateCertificateError(format!("cannot use generated certificate: {:?}", err))
        })?;
        certificates.push(cert);
    }
    Ok(certificates)
}

fn load_private_key(key_pem: String) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = Cursor::new(key_pem.into_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| {
            Error::GenerateCertificateError(format!("cannot use generated private key: {:?}", err))
        })?
        .ok_or_else(|| Error::GenerateCertificateError("invalid generated private key".to_string()))
}

/// The SNI callback used during TLS handshakes: resolves leaves for
/// `sni || default_domain || authority-derived address || "localhost"`.
#[derive(Debug)]
pub struct SniCertResolver {
    ca: CertificateAuthority,
    /// The tunnel target when we are terminating inside a CONNECT or SOCKS
    /// envelope; used when the client sends no SNI.
    authority: Option<String>,
}

impl SniCertResolver {
    pub fn new(ca: CertificateAuthority, authority: Option<String>) -> Self {
        SniCertResolver { ca, authority }
    }

    fn fallback_hostname(&self) -> String {
        if let Some(domain) = self.ca.default_domain() {
            return domain.to_string();
        }
        if let Some(authority) = &self.authority {
            let host = match authority.matches(':').count() {
                1 => authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority),
                _ => authority.as_str(),
            };
            if !host.is_empty() {
                return host.to_string();
            }
        }
        "localhost".to_string()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let hostname = match client_hello.server_name() {
            Some(sni) => sni.to_string(),
            // Clients may omit the SNI extension (RFC 6066 section 3);
            // fall back to the configured default or the tunnel target.
            None => self.fallback_hostname(),
        };

        match self.ca.generate(&hostname) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(hostname, "cannot mint certificate: {}", err);
                None
            }
        }
    }
}

/// Which TLS connections are terminated versus tunneled untouched.
#[derive(Debug, Clone, Default)]
pub struct TlsInterceptionPolicy {
    /// Hostname patterns whose TLS is never terminated.
    pub passthrough: Vec<String>,
    /// When configured, only matching hostnames are terminated.
    pub intercept_only: Option<Vec<String>>,
}

impl TlsInterceptionPolicy {
    pub fn should_intercept(&self, sni: Option<&str>) -> bool {
        let hostname = match sni {
            Some(h) => h,
            // Without an SNI there is nothing to match against; intercept.
            None => return true,
        };

        if hostname_matches_any(&self.passthrough, hostname) {
            return false;
        }

        match &self.intercept_only {
            Some(patterns) => hostname_matches_any(patterns, hostname),
            None => true,
        }
    }
}

/// Builds the rustls server configuration for one terminated connection.
pub(crate) fn server_tls_config(
    ca: &CertificateAuthority,
    authority: Option<String>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
) -> Result<Arc<ServerConfig>, Error> {
    ensure_crypto_provider();

    let min = min_version.unwrap_or(TlsVersion::V1_2);
    let max = max_version.unwrap_or(TlsVersion::V1_3);
    if min > max {
        return Err(Error::ConfigurationError(format!(
            "minimum TLS version {:?} is above maximum {:?}",
            min, max
        )));
    }

    let mut versions: Vec<&'static rustls::SupportedProtocolVersion> = Vec::new();
    if min <= TlsVersion::V1_2 && max >= TlsVersion::V1_2 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= TlsVersion::V1_3 {
        versions.push(&rustls::version::TLS13);
    }

    let resolver = Arc::new(SniCertResolver::new(ca.clone(), authority));
    let mut config = ServerConfig::builder_with_protocol_versions(&versions)
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_ca() -> CertificateAuthority {
        let (cert, key) = CertificateAuthority::generate_ephemeral_ca().unwrap();
        CertificateAuthority::new(CertificateAuthorityConfig::new(cert, key)).unwrap()
    }

    #[test]
    fn invalid_ca_input_fails_at_startup() {
        let result = CertificateAuthority::new(CertificateAuthorityConfig::new(
            "not a certificate",
            "not a key",
        ));
        assert!(result.is_err());
    }

    #[test]
    fn repeat_generation_returns_the_cached_leaf() {
        let ca = test_ca();
        let first = ca.generate("example.com").unwrap();
        let second = ca.generate("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn hostname_is_normalised_before_caching() {
        let ca = test_ca();
        let first = ca.generate("Example.COM.").unwrap();
        let second = ca.generate("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn ip_literals_are_accepted() {
        let ca = test_ca();
        assert!(ca.generate("127.0.0.1").is_ok());
        assert!(ca.generate("::1").is_ok());
    }

    #[test]
    fn concurrent_first_requests_mint_once() {
        let ca = test_ca();
        let mut threads = Vec::new();
        for _ in 0..4 {
            let ca = ca.clone();
            threads.push(std::thread::spawn(move || ca.generate("race.test").unwrap()));
        }
        let keys: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        for key in &keys[1..] {
            assert!(Arc::ptr_eq(&keys[0], key));
        }
    }

    #[test]
    fn interception_policy_passthrough_list() {
        let policy = TlsInterceptionPolicy {
            passthrough: vec!["*.example.com".to_string()],
            intercept_only: None,
        };
        assert!(!policy.should_intercept(Some("api.example.com")));
        assert!(policy.should_intercept(Some("example.org")));
        assert!(policy.should_intercept(None));
    }

    #[test]
    fn interception_policy_intercept_only_list() {
        let policy = TlsInterceptionPolicy {
            passthrough: Vec::new(),
            intercept_only: Some(vec!["*.intercept.me".to_string()]),
        };
        assert!(policy.should_intercept(Some("a.intercept.me")));
        assert!(!policy.should_intercept(Some("other.example")));
    }

    #[test]
    fn bad_version_bounds_are_rejected() {
        let ca = test_ca();
        let result = server_tls_config(
            &ca,
            None,
            Some(TlsVersion::V1_3),
            Some(TlsVersion::V1_2),
        );
        assert!(result.is_err());
    }
}
