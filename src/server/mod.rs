//! The proxy server core: one listening endpoint that dispatches every
//! accepted connection to the right protocol handler, backed by the rule
//! engine, the on-demand CA and the event bus.

use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::debug;

pub mod builder;
pub mod dispatch;
pub mod events;
pub mod handler;
pub mod matchers;
pub mod proxy;
pub mod server;
pub mod sniff;
pub mod socks;
pub mod state;
pub mod steps;
pub mod tls;
pub mod ws;

use crate::common::data::{EventKind, RequestRule, WebSocketRule};
use events::{EventBus, EventCallback, SubscriptionId};
use state::{MockedEndpoint, RuleStore};
use tls::{CertificateAuthority, TlsInterceptionPolicy, TlsVersion};

/// Object-safe alias for the byte streams the dispatcher shuttles around.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Static configuration shared by every connection.
pub(crate) struct CoreConfig {
    pub socks_enabled: bool,
    pub unknown_protocol_passthrough: bool,
    pub tls_policy: TlsInterceptionPolicy,
    pub min_tls_version: Option<TlsVersion>,
    pub max_tls_version: Option<TlsVersion>,
}

/// Everything a connection task needs, shared behind one `Arc`.
pub(crate) struct ProxyCore {
    pub config: CoreConfig,
    pub ca: CertificateAuthority,
    pub rules: RuleStore,
    pub bus: EventBus,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl ProxyCore {
    pub(crate) fn new(config: CoreConfig, ca: CertificateAuthority) -> Self {
        ProxyCore {
            config,
            ca,
            rules: RuleStore::new(),
            bus: EventBus::new(),
            local_addr: RwLock::new(None),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.write().unwrap() = Some(addr);
    }
}

/// A running proxy/mock server.
///
/// Dropping the handle shuts the server down. Rules are administered through
/// the `add_*`/`set_*`/`reset` methods and observed through [`ProxyServer::on`].
pub struct ProxyServer {
    core: Arc<ProxyCore>,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ProxyServer {
    pub(crate) fn new(
        core: Arc<ProxyCore>,
        addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        ProxyServer {
            core,
            addr,
            shutdown: Some(shutdown),
        }
    }

    /// The address the server is listening on.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// An absolute `http` URL pointing at this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// The PEM of the CA certificate used for TLS interception; clients must
    /// trust this to connect without certificate errors.
    pub fn ca_cert_pem(&self) -> &str {
        self.core.ca.ca_cert_pem()
    }

    // *******************************************************************************************
    // Rule administration
    // *******************************************************************************************

    pub fn add_request_rules(
        &self,
        rules: Vec<RequestRule>,
    ) -> Result<Vec<MockedEndpoint>, state::Error> {
        self.core.rules.add_request_rules(rules)
    }

    /// Replaces all request rules.
    pub fn set_request_rules(
        &self,
        rules: Vec<RequestRule>,
    ) -> Result<Vec<MockedEndpoint>, state::Error> {
        self.core.rules.set_request_rules(rules)
    }

    pub fn add_websocket_rules(
        &self,
        rules: Vec<WebSocketRule>,
    ) -> Result<Vec<String>, state::Error> {
        self.core.rules.add_websocket_rules(rules)
    }

    pub fn set_websocket_rules(
        &self,
        rules: Vec<WebSocketRule>,
    ) -> Result<Vec<String>, state::Error> {
        self.core.rules.set_websocket_rules(rules)
    }

    /// Drops all rules and recorded traffic.
    pub fn reset(&self) {
        self.core.rules.reset();
    }

    pub fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
        self.core.rules.mocked_endpoints()
    }

    // *******************************************************************************************
    // Events
    // *******************************************************************************************

    pub fn on(&self, kind: EventKind, callback: EventCallback) -> SubscriptionId {
        self.core.bus.subscribe(kind, callback)
    }

    pub fn off(&self, subscription: SubscriptionId) {
        self.core.bus.unsubscribe(subscription)
    }

    // *******************************************************************************************
    // Environment helpers
    // *******************************************************************************************

    /// The standard proxy environment variables pointing at this server.
    pub fn proxy_env(&self) -> Vec<(String, String)> {
        let url = format!("http://{}", self.addr);
        vec![
            ("HTTP_PROXY".to_string(), url.clone()),
            ("HTTPS_PROXY".to_string(), url),
            ("NO_PROXY".to_string(), String::new()),
        ]
    }

    /// Stops the accept loop. In-flight connections finish on their own.
    pub fn shutdown(mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            debug!("shutting down proxy server on {}", self.addr);
            let _ = sender.send(());
        }
    }
}
