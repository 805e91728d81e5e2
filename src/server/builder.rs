//! The builder consolidates configuration parameters, fallback mechanisms
//! and defaults into a single point of management: ports, CA material, TLS
//! interception policy, SOCKS and unknown-protocol passthrough.

use std::{path::PathBuf, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::server::{
    server,
    tls::{CertificateAuthority, CertificateAuthorityConfig, TlsInterceptionPolicy, TlsVersion},
    CoreConfig, ProxyCore, ProxyServer,
};

const DEFAULT_PORT_RANGE: (u16, u16) = (8000, 9000);

#[derive(Error, Debug)]
pub enum Error {
    #[error("CA configuration error: {0}")]
    Ca(#[from] crate::server::tls::Error),
    #[error("cannot read CA file: {0}")]
    CaFile(std::io::Error),
    #[error("conflicting CA configuration: {0}")]
    CaConflict(String),
    #[error("cannot start server: {0}")]
    Bind(#[from] server::Error),
    #[error("cannot obtain local address: {0}")]
    LocalAddr(std::io::Error),
}

/// Configures and starts a [`ProxyServer`].
pub struct ProxyServerBuilder {
    port: Option<u16>,
    port_range: (u16, u16),
    expose: bool,
    ca_cert_pem: Option<String>,
    ca_key_pem: Option<String>,
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    default_domain: Option<String>,
    organization: Option<String>,
    locality: Option<String>,
    leaf_validity: Option<Duration>,
    tls_passthrough: Vec<String>,
    tls_intercept_only: Option<Vec<String>>,
    min_tls_version: Option<TlsVersion>,
    max_tls_version: Option<TlsVersion>,
    socks_enabled: bool,
    unknown_protocol_passthrough: bool,
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyServerBuilder {
    pub fn new() -> Self {
        ProxyServerBuilder {
            port: None,
            port_range: DEFAULT_PORT_RANGE,
            expose: false,
            ca_cert_pem: None,
            ca_key_pem: None,
            ca_cert_path: None,
            ca_key_path: None,
            default_domain: None,
            organization: None,
            locality: None,
            leaf_validity: None,
            tls_passthrough: Vec::new(),
            tls_intercept_only: None,
            min_tls_version: None,
            max_tls_version: None,
            socks_enabled: false,
            unknown_protocol_passthrough: false,
        }
    }

    /// Requests a specific port; startup fails when it is unavailable.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The range scanned when no explicit port is given.
    pub fn port_range(mut self, from: u16, to: u16) -> Self {
        self.port_range = (from, to);
        self
    }

    /// Listen on all interfaces instead of loopback only.
    pub fn expose(mut self, expose: bool) -> Self {
        self.expose = expose;
        self
    }

    /// Sets the CA certificate and private key as PEM strings.
    pub fn ca_key_pair<IntoString: Into<String>>(
        mut self,
        cert_pem: IntoString,
        key_pem: IntoString,
    ) -> Self {
        self.ca_cert_pem = Some(cert_pem.into());
        self.ca_key_pem = Some(key_pem.into());
        self
    }

    /// Sets paths the CA certificate and private key are read from at
    /// startup.
    pub fn ca_key_pair_files<P: Into<PathBuf>>(mut self, cert_path: P, key_path: P) -> Self {
        self.ca_cert_path = Some(cert_path.into());
        self.ca_key_path = Some(key_path.into());
        self
    }

    /// Hostname used for certificates when a client sends no SNI.
    pub fn default_domain(mut self, domain: impl Into<String>) -> Self {
        self.default_domain = Some(domain.into());
        self
    }

    pub fn certificate_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn certificate_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    /// Validity window for minted leaf certificates.
    pub fn leaf_validity(mut self, validity: Duration) -> Self {
        self.leaf_validity = Some(validity);
        self
    }

    /// Hostname patterns whose TLS is tunneled untouched instead of
    /// terminated (`*.example.com` style wildcards allowed).
    pub fn tls_passthrough(mut self, patterns: Vec<String>) -> Self {
        self.tls_passthrough = patterns;
        self
    }

    /// When set, only matching hostnames are TLS-terminated.
    pub fn tls_intercept_only(mut self, patterns: Vec<String>) -> Self {
        self.tls_intercept_only = Some(patterns);
        self
    }

    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.min_tls_version = Some(version);
        self
    }

    pub fn max_tls_version(mut self, version: TlsVersion) -> Self {
        self.max_tls_version = Some(version);
        self
    }

    /// Accept SOCKSv4/4a/5 handshakes on the listening port.
    pub fn socks(mut self, enabled: bool) -> Self {
        self.socks_enabled = enabled;
        self
    }

    /// Tunnel unrecognised protocols to the tunnel target instead of
    /// answering 400.
    pub fn unknown_protocol_passthrough(mut self, enabled: bool) -> Self {
        self.unknown_protocol_passthrough = enabled;
        self
    }

    /// Binds the listening socket and starts the accept loop.
    pub async fn start(self) -> Result<ProxyServer, Error> {
        let ca = self.build_ca()?;

        let config = CoreConfig {
            socks_enabled: self.socks_enabled,
            unknown_protocol_passthrough: self.unknown_protocol_passthrough,
            tls_policy: TlsInterceptionPolicy {
                passthrough: self.tls_passthrough.clone(),
                intercept_only: self.tls_intercept_only.clone(),
            },
            min_tls_version: self.min_tls_version,
            max_tls_version: self.max_tls_version,
        };

        let core = Arc::new(ProxyCore::new(config, ca));

        let listener = server::bind(self.port, self.port_range, self.expose).await?;
        let addr = listener.local_addr().map_err(Error::LocalAddr)?;
        core.set_local_addr(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(server::run(core.clone(), listener, shutdown_rx));

        Ok(ProxyServer::new(core, addr, shutdown_tx))
    }

    fn build_ca(&self) -> Result<CertificateAuthority, Error> {
        let has_pems = self.ca_cert_pem.is_some() || self.ca_key_pem.is_some();
        let has_paths = self.ca_cert_path.is_some() || self.ca_key_path.is_some();
        if has_pems && has_paths {
            return Err(Error::CaConflict(
                "both CA PEM strings and CA file paths were configured; use only one".to_string(),
            ));
        }

        let (cert_pem, key_pem) = match (
            &self.ca_cert_pem,
            &self.ca_key_pem,
            &self.ca_cert_path,
            &self.ca_key_path,
        ) {
            (Some(cert), Some(key), _, _) => (cert.clone(), key.clone()),
            (_, _, Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read_to_string(cert_path).map_err(Error::CaFile)?;
                let key = std::fs::read_to_string(key_path).map_err(Error::CaFile)?;
                (cert, key)
            }
            (None, None, None, None) => CertificateAuthority::generate_ephemeral_ca()?,
            _ => {
                return Err(Error::CaConflict(
                    "a CA certificate and its key must be configured together".to_string(),
                ))
            }
        };

        let mut config = CertificateAuthorityConfig::new(cert_pem, key_pem);
        config.default_domain = self.default_domain.clone();
        config.organization = self.organization.clone();
        config.locality = self.locality.clone();
        if let Some(validity) = self.leaf_validity {
            config.leaf_validity = validity;
        }

        Ok(CertificateAuthority::new(config)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conflicting_ca_inputs_are_rejected() {
        let builder = ProxyServerBuilder::new()
            .ca_key_pair("cert", "key")
            .ca_key_pair_files("/a", "/b");

        assert!(matches!(builder.build_ca(), Err(Error::CaConflict(_))));
    }

    #[test]
    fn half_configured_ca_is_rejected() {
        let mut builder = ProxyServerBuilder::new();
        builder.ca_cert_pem = Some("cert".to_string());

        assert!(matches!(builder.build_ca(), Err(Error::CaConflict(_))));
    }

    #[test]
    fn missing_ca_defaults_to_an_ephemeral_one() {
        let builder = ProxyServerBuilder::new();
        assert!(builder.build_ca().is_ok());
    }

    #[test]
    fn invalid_ca_material_fails() {
        let builder = ProxyServerBuilder::new().ca_key_pair("nonsense", "also nonsense");
        assert!(matches!(builder.build_ca(), Err(Error::Ca(_))));
    }

    #[tokio::test]
    async fn start_binds_a_port_in_the_default_range() {
        let server = ProxyServerBuilder::new().start().await.unwrap();
        let port = server.port();
        assert!((8000..=9000).contains(&port));
    }

    #[tokio::test]
    async fn parallel_starts_get_distinct_ports() {
        let a = ProxyServerBuilder::new().start().await.unwrap();
        let b = ProxyServerBuilder::new().start().await.unwrap();
        assert_ne!(a.port(), b.port());
    }
}
