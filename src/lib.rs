//! Programmable HTTP/HTTPS/WebSocket/SOCKS intercepting proxy and mock
//! server.
//!
//! A controlling process declares rules that match incoming requests (or
//! tunneled upstream connections) and specify a response action: synthesise
//! a reply, forward or rewrite to an upstream, pass through with
//! transformation, delay, reset, time out, or stream. A single listening
//! port accepts plaintext HTTP/1.1 and HTTP/2, upgrades TLS on demand by
//! minting per-hostname certificates from a configured root CA, acts as an
//! HTTP CONNECT or SOCKSv4/4a/5 proxy, and publishes a rich event stream
//! for external observers.
//!
//! # Getting started
//!
//! ```no_run
//! use intermock::{
//!     ProxyServerBuilder, RequestMatcher, RequestRule, RequestStep,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ProxyServerBuilder::new().start().await?;
//!
//!     server.add_request_rules(vec![RequestRule::new(
//!         vec![
//!             RequestMatcher::Method("GET".to_string()),
//!             RequestMatcher::PathPrefix("/hello".to_string()),
//!         ],
//!         RequestStep::json(200, &json!({"hello": "world"})),
//!     )])?;
//!
//!     let response = reqwest::get(server.url("/hello")).await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```
//!
//! # Proxying and interception
//!
//! Point a client's proxy settings at the server (see
//! [`ProxyServer::proxy_env`]) and register passthrough rules to observe or
//! rewrite live traffic:
//!
//! ```no_run
//! use intermock::{
//!     MatchReplace, PassThroughSpec, ProxyServerBuilder, RequestMatcher,
//!     RequestRule, RequestStep, RequestTransform,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = ProxyServerBuilder::new().start().await?;
//!
//! let transform = RequestTransform {
//!     match_replace_path: vec![MatchReplace::literal("v1", "v2")],
//!     ..Default::default()
//! };
//!
//! server.add_request_rules(vec![RequestRule::new(
//!     vec![RequestMatcher::Wildcard],
//!     RequestStep::PassThrough(PassThroughSpec {
//!         transform_request: Some(transform),
//!         ..Default::default()
//!     }),
//! )])?;
//! # Ok(())
//! # }
//! ```
//!
//! TLS interception mints leaf certificates on demand from the configured
//! CA (or from a generated ephemeral CA when none is given); clients that
//! trust [`ProxyServer::ca_cert_pem`] can be intercepted transparently,
//! including inside CONNECT and SOCKS tunnels.
//!
//! # Events
//!
//! Observers subscribe per event kind and receive request/response
//! snapshots, websocket message traffic, TLS and client errors, raw
//! passthrough accounting and fine-grained passthrough progress:
//!
//! ```no_run
//! # use intermock::{EventKind, ProxyEvent, ProxyServerBuilder};
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = ProxyServerBuilder::new().start().await?;
//! server.on(
//!     EventKind::Response,
//!     Arc::new(|event| {
//!         if let ProxyEvent::Response(response) = event {
//!             println!("{} -> {}", response.request_id(), response.status());
//!         }
//!     }),
//! );
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod server;

pub use common::data::{
    BodySource, ClientCertificate, Completion, EventKind, HostHeaderPolicy, HttpVersion,
    InterceptedRequest, InterceptedResponse, MultipartPart, OutboundRequest, OutboundResponse,
    ProxyEvent, ProxySetting, RequestRule, ResponseSpec, RuleEvent, TimingMarks, UpstreamProxy,
    UpstreamTlsConfig, WebSocketRule,
};
pub use common::url::matches_no_proxy;
pub use server::{
    builder::ProxyServerBuilder,
    events::{EventCallback, SubscriptionId},
    matchers::RequestMatcher,
    proxy::transform::{MatchReplace, ReplaceHost, RequestTransform, ResponseTransform},
    state::MockedEndpoint,
    steps::{ForwardToSpec, PassThroughSpec, RequestStep, WebSocketStep},
    tls::{CertificateAuthority, CertificateAuthorityConfig, TlsInterceptionPolicy, TlsVersion},
    ProxyServer,
};

/// Re-export of the regex type used by matchers and transforms.
pub use regex::Regex;
