//! The upstream HTTP client used by passthrough and forwarding steps.
//!
//! Unlike a pooled general-purpose client, every upstream request builds its
//! own connection so that proxy chaining (HTTP, HTTPS or SOCKS), per-host
//! TLS trust decisions and ALPN-driven protocol selection stay under the
//! pipeline's control.

use std::{io::Cursor, sync::Arc};

use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::ConfigBuilderExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use url::Url;

use crate::{
    common::{
        data::{OutboundRequest, OutboundResponse, ProxySetting, UpstreamProxy, UpstreamTlsConfig},
        url::matches_no_proxy,
    },
    server::{socks, tls::ensure_crypto_provider, Io},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot connect to upstream: {0}")]
    ConnectError(std::io::Error),
    #[error("upstream TLS error: {0}")]
    TlsError(String),
    #[error("upstream proxy error: {0}")]
    ProxyError(String),
    #[error("SOCKS proxy error: {0}")]
    SocksProxyError(#[from] socks::Error),
    #[error("upstream protocol error: {0}")]
    HttpError(#[from] hyper::Error),
    #[error("invalid upstream request: {0}")]
    RequestError(String),
}

/// Where and how to connect for one upstream request.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Offer `h2` during ALPN. Only set when the downstream request arrived
    /// over HTTP/2, so the upstream protocol never upgrades past the client.
    pub prefer_h2: bool,
}

impl ConnectTarget {
    pub fn from_url(url: &str, prefer_h2: bool) -> Result<Self, Error> {
        let parsed = Url::parse(url).map_err(|e| Error::RequestError(e.to_string()))?;
        let tls = matches!(parsed.scheme(), "https" | "wss");
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::RequestError(format!("no host in {}", url)))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        Ok(ConnectTarget {
            host,
            port,
            tls,
            prefer_h2,
        })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The transport negotiated by [`open_stream`].
pub(crate) struct UpstreamStream {
    pub stream: Box<dyn Io>,
    /// ALPN selected `h2`.
    pub is_h2: bool,
    /// The stream talks to an HTTP proxy in plaintext; requests must use
    /// absolute-form.
    pub via_http_proxy: bool,
}

/// Resolves the effective proxy for a destination, honouring `no_proxy`.
pub(crate) fn resolve_proxy(
    setting: Option<&ProxySetting>,
    host: &str,
    port: u16,
) -> Option<UpstreamProxy> {
    let proxy = setting?.resolve(host)?;
    if matches_no_proxy(host, port, &proxy.no_proxy) {
        debug!(host, "destination in no-proxy set, connecting directly");
        return None;
    }
    Some(proxy)
}

/// Opens a (possibly proxied, possibly TLS) byte stream to the target.
pub(crate) async fn open_stream(
    target: &ConnectTarget,
    tls_config: &UpstreamTlsConfig,
    proxy: Option<UpstreamProxy>,
) -> Result<UpstreamStream, Error> {
    let (stream, via_http_proxy): (Box<dyn Io>, bool) = match proxy {
        None => {
            trace!(authority = target.authority(), "connecting directly");
            let tcp = TcpStream::connect((target.host.as_str(), target.port))
                .await
                .map_err(Error::ConnectError)?;
            (Box::new(tcp), false)
        }
        Some(proxy) => connect_via_proxy(&proxy, target).await?,
    };

    if target.tls {
        let connector = TlsConnector::from(client_tls_config(target, tls_config)?);
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| Error::TlsError(format!("invalid server name: {}", e)))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::TlsError(e.to_string()))?;

        let is_h2 = tls_stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| p == b"h2")
            .unwrap_or(false);

        return Ok(UpstreamStream {
            stream: Box::new(tls_stream),
            is_h2,
            via_http_proxy: false,
        });
    }

    Ok(UpstreamStream {
        stream,
        is_h2: false,
        via_http_proxy,
    })
}

async fn connect_via_proxy(
    proxy: &UpstreamProxy,
    target: &ConnectTarget,
) -> Result<(Box<dyn Io>, bool), Error> {
    let url = Url::parse(&proxy.url)
        .map_err(|e| Error::ProxyError(format!("invalid proxy url {}: {}", proxy.url, e)))?;
    let proxy_host = url
        .host_str()
        .ok_or_else(|| Error::ProxyError(format!("no host in proxy url {}", proxy.url)))?
        .to_string();
    let proxy_tls = url.scheme() == "https";
    let proxy_port = url.port_or_known_default().unwrap_or(match url.scheme() {
        "https" => 443,
        "socks" | "socks5" | "socks5h" => 1080,
        _ => 8080,
    });

    trace!(
        proxy = format!("{}://{}:{}", url.scheme(), proxy_host, proxy_port),
        "chaining through upstream proxy"
    );

    let tcp = TcpStream::connect((proxy_host.as_str(), proxy_port))
        .await
        .map_err(Error::ConnectError)?;

    match url.scheme() {
        "socks" | "socks5" | "socks5h" => {
            let mut stream: Box<dyn Io> = Box::new(tcp);
            socks::connect(&mut stream, &target.host, target.port).await?;
            Ok((stream, false))
        }
        "http" | "https" => {
            let mut stream: Box<dyn Io> = if proxy_tls {
                ensure_crypto_provider();
                let config = rustls::ClientConfig::builder()
                    .with_native_roots()
                    .map_err(|e| Error::TlsError(e.to_string()))?
                    .with_no_client_auth();
                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::try_from(proxy_host.clone())
                    .map_err(|e| Error::TlsError(format!("invalid proxy name: {}", e)))?;
                Box::new(
                    connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| Error::TlsError(e.to_string()))?,
                )
            } else {
                Box::new(tcp)
            };

            if target.tls {
                establish_connect_tunnel(&mut stream, &target.authority()).await?;
                Ok((stream, false))
            } else {
                // Plain HTTP through an HTTP proxy: no tunnel, absolute-form
                // requests on the proxy connection.
                Ok((stream, true))
            }
        }
        other => Err(Error::ProxyError(format!(
            "unsupported proxy scheme: {}",
            other
        ))),
    }
}

async fn establish_connect_tunnel(stream: &mut Box<dyn Io>, authority: &str) -> Result<(), Error> {
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n",
        authority = authority
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(Error::ConnectError)?;

    // Read the proxy's reply head.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.map_err(Error::ConnectError)?;
        if n == 0 {
            return Err(Error::ProxyError(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return Err(Error::ProxyError("oversized CONNECT response".to_string()));
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .parse::<u16>()
        .unwrap_or(0);
    if !(200..300).contains(&status) {
        return Err(Error::ProxyError(format!(
            "proxy refused CONNECT with status {}",
            status
        )));
    }

    Ok(())
}

fn client_tls_config(
    target: &ConnectTarget,
    tls: &UpstreamTlsConfig,
) -> Result<Arc<rustls::ClientConfig>, Error> {
    ensure_crypto_provider();

    let builder = rustls::ClientConfig::builder();

    let with_roots = if tls.trusted_ca_pems.is_empty() {
        builder
            .with_native_roots()
            .map_err(|e| Error::TlsError(e.to_string()))?
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for pem in &tls.trusted_ca_pems {
            let mut reader = Cursor::new(pem.as_bytes().to_vec());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| Error::TlsError(e.to_string()))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::TlsError(e.to_string()))?;
            }
        }
        builder.with_root_certificates(roots)
    };

    let mut config = match &tls.client_certificate {
        Some(client_cert) => {
            let mut cert_reader = Cursor::new(client_cert.cert_pem.as_bytes().to_vec());
            let certs = rustls_pemfile::certs(&mut cert_reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::TlsError(e.to_string()))?;
            let mut key_reader = Cursor::new(client_cert.key_pem.as_bytes().to_vec());
            let key = rustls_pemfile::private_key(&mut key_reader)
                .map_err(|e| Error::TlsError(e.to_string()))?
                .ok_or_else(|| Error::TlsError("invalid client key".to_string()))?;
            with_roots
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::TlsError(e.to_string()))?
        }
        None => with_roots.with_no_client_auth(),
    };

    if crate::common::url::hostname_matches_any(
        &tls.ignore_host_certificate_errors,
        &target.host,
    ) {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification::new()));
    }

    config.alpn_protocols = if target.prefer_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(Arc::new(config))
}

/// Accepts any server certificate; used for hosts listed in
/// `ignore_host_certificate_errors`. Signatures are still verified so the
/// handshake itself stays well-formed.
#[derive(Debug)]
struct NoCertificateVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl NoCertificateVerification {
    fn new() -> Self {
        NoCertificateVerification {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Sends the request over an established stream and buffers the response.
pub(crate) async fn send_request(
    upstream: UpstreamStream,
    req: &OutboundRequest,
) -> Result<OutboundResponse, Error> {
    let uri: Uri = req
        .url
        .parse()
        .map_err(|e| Error::RequestError(format!("invalid url {}: {}", req.url, e)))?;

    if upstream.is_h2 {
        send_h2(upstream, req, uri).await
    } else {
        send_h1(upstream, req, uri).await
    }
}

async fn send_h1(
    upstream: UpstreamStream,
    req: &OutboundRequest,
    uri: Uri,
) -> Result<OutboundResponse, Error> {
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake::<_, Full<Bytes>>(TokioIo::new(upstream.stream))
        .await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("upstream connection ended: {:?}", err);
        }
    });

    // Origin servers expect origin-form; only plaintext HTTP proxies get
    // the absolute URL on the request line.
    let request_uri: Uri = if upstream.via_http_proxy {
        uri.clone()
    } else {
        uri.path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|_| Error::RequestError("invalid path".to_string()))?
    };

    let mut builder = Request::builder().method(req.method.as_str()).uri(request_uri);

    let mut has_host = false;
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_host {
        if let Some(authority) = uri.authority() {
            builder = builder.header("host", authority.as_str());
        }
    }

    let request = builder
        .body(Full::new(req.body.clone()))
        .map_err(|e| Error::RequestError(e.to_string()))?;

    let response = sender.send_request(request).await?;
    buffer_response(response).await
}

async fn send_h2(
    upstream: UpstreamStream,
    req: &OutboundRequest,
    uri: Uri,
) -> Result<OutboundResponse, Error> {
    let (mut sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .handshake::<_, Full<Bytes>>(TokioIo::new(upstream.stream))
        .await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("upstream h2 connection ended: {:?}", err);
        }
    });

    let mut builder = Request::builder().method(req.method.as_str()).uri(uri);

    for (name, value) in &req.headers {
        // Connection-level headers do not exist on h2; the authority pseudo
        // header replaces Host.
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let request = builder
        .body(Full::new(req.body.clone()))
        .map_err(|e| Error::RequestError(e.to_string()))?;

    let response = sender.send_request(request).await?;
    buffer_response(response).await
}

async fn buffer_response(
    response: http::Response<hyper::body::Incoming>,
) -> Result<OutboundResponse, Error> {
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect();

    let body = response.into_body().collect().await?.to_bytes();

    Ok(OutboundResponse {
        status,
        status_message: None,
        headers,
        body,
    })
}
