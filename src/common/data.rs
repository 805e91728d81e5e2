//! The unified data model shared by every protocol adapter: request and
//! response snapshots, rule definitions, completion predicates, body sources
//! and the event envelopes published on the bus.

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    common::{encoding, url as url_util, util::BodyBytes},
    server::{
        matchers::RequestMatcher,
        steps::{RequestStep, WebSocketStep},
    },
};

pub(crate) fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// The wire protocol a request arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpVersion {
    Http1,
    Http2,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpVersion::Http1 => write!(f, "http/1.1"),
            HttpVersion::Http2 => write!(f, "h2"),
        }
    }
}

/// Milestones of a request lifecycle in unix epoch milliseconds.
#[derive(Debug, Clone, Default)]
pub struct TimingMarks {
    pub start: u128,
    pub body_received: Option<u128>,
    pub headers_sent: Option<u128>,
    pub response_sent: Option<u128>,
    pub aborted: Option<u128>,
}

/// An immutable snapshot of a parsed HTTP request.
///
/// The body is buffered; the decoded views (`body_text`, `body_json`, `form`,
/// `multipart`) honour the request's `Content-Encoding` stack and return
/// `None` when decoding is impossible rather than failing.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    id: String,
    version: HttpVersion,
    scheme: String,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    trailers: Option<Vec<(String, String)>>,
    body: BodyBytes,
    tags: Vec<String>,
    timings: Arc<Mutex<TimingMarks>>,
    matched_rule: Arc<OnceLock<String>>,
}

impl InterceptedRequest {
    pub(crate) fn new(
        version: HttpVersion,
        scheme: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        trailers: Option<Vec<(String, String)>>,
        body: BodyBytes,
    ) -> Self {
        let start = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version,
            scheme,
            method,
            url,
            headers,
            trailers,
            body,
            tags: Vec::new(),
            timings: Arc::new(Mutex::new(TimingMarks {
                start,
                body_received: Some(start),
                ..Default::default()
            })),
            matched_rule: Arc::new(OnceLock::new()),
        }
    }

    /// The stable id of this request, unique per server run.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The absolute URL of the request.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn uri(&self) -> http::Uri {
        self.url.parse().unwrap_or_else(|_| http::Uri::from_static("/"))
    }

    pub fn host(&self) -> Option<String> {
        self.uri().host().map(|h| h.to_string())
    }

    pub fn port(&self) -> u16 {
        let uri = self.uri();
        uri.port_u16().unwrap_or(match self.scheme.as_str() {
            "https" | "wss" => 443,
            _ => 80,
        })
    }

    pub fn path(&self) -> String {
        self.uri().path().to_string()
    }

    pub fn query(&self) -> Option<String> {
        self.uri().query().map(|q| q.to_string())
    }

    /// Query parameters in order of appearance.
    pub fn query_params(&self) -> Vec<(String, String)> {
        match self.query() {
            Some(q) => form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The ordered raw header list, preserving case and duplicates.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// A normalised lowercase header multimap.
    pub fn headers_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in &self.headers {
            map.entry(k.to_ascii_lowercase()).or_default().push(v.clone());
        }
        map
    }

    /// The first value of the named header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        crate::common::util::find_header(&self.headers, name)
    }

    pub fn trailers(&self) -> Option<&[(String, String)]> {
        self.trailers.as_deref()
    }

    /// Cookie pairs from all `Cookie` headers, in order.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for value in crate::common::util::find_headers(&self.headers, "cookie") {
            for pair in value.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    out.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
        }
        out
    }

    /// The raw (possibly encoded) body bytes.
    pub fn body(&self) -> &BodyBytes {
        &self.body
    }

    /// The body after undoing the request's `Content-Encoding` stack.
    /// `None` when the stack contains an unknown coding or decoding fails.
    pub fn decoded_body(&self) -> Option<Bytes> {
        match self.header("content-encoding") {
            None => Some(self.body.to_bytes()),
            Some(stack) => encoding::decode(stack, self.body.as_ref()).ok(),
        }
    }

    pub fn body_text(&self) -> Option<String> {
        String::from_utf8(self.decoded_body()?.to_vec()).ok()
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.decoded_body()?).ok()
    }

    /// The body parsed as a `application/x-www-form-urlencoded` form.
    pub fn form(&self) -> Option<Vec<(String, String)>> {
        let body = self.decoded_body()?;
        if body.is_empty() {
            return Some(Vec::new());
        }
        Some(
            form_urlencoded::parse(&body)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// The body parsed as `multipart/form-data`, or `None` when the content
    /// type carries no boundary or the body does not follow it.
    pub fn multipart(&self) -> Option<Vec<MultipartPart>> {
        let content_type = self.header("content-type")?;
        let boundary = content_type
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("boundary="))
            .next()?
            .trim_matches('"')
            .to_string();
        parse_multipart(&self.decoded_body()?, &boundary)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// The id of the rule that matched this request, set after matching.
    pub fn matched_rule(&self) -> Option<&str> {
        self.matched_rule.get().map(|s| s.as_str())
    }

    pub(crate) fn set_matched_rule(&self, rule_id: &str) {
        let _ = self.matched_rule.set(rule_id.to_string());
    }

    pub fn timings(&self) -> TimingMarks {
        self.timings.lock().unwrap().clone()
    }

    pub(crate) fn mark(&self, f: impl FnOnce(&mut TimingMarks)) {
        if let Ok(mut t) = self.timings.lock() {
            f(&mut t);
        }
    }

    /// The request URL in the normalised form used by URL matchers.
    pub fn normalized_url(&self) -> String {
        url_util::normalize_url(&self.url)
    }
}

/// A single decoded part of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

fn parse_multipart(body: &[u8], boundary: &str) -> Option<Vec<MultipartPart>> {
    let delimiter = format!("--{}", boundary);
    let text_safe = String::from_utf8_lossy(body);
    let mut parts = Vec::new();

    for raw in text_safe.split(delimiter.as_str()).skip(1) {
        let raw = raw.strip_prefix("\r\n").unwrap_or(raw);
        if raw.starts_with("--") {
            break;
        }
        let (head, data) = raw.split_once("\r\n\r\n")?;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in head.split("\r\n") {
            let (key, value) = match line.split_once(':') {
                Some(kv) => kv,
                None => continue,
            };
            if key.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            } else if key.eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';') {
                    let param = param.trim();
                    if let Some(v) = param.strip_prefix("name=") {
                        name = Some(v.trim_matches('"').to_string());
                    } else if let Some(v) = param.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            }
        }

        let data = data.strip_suffix("\r\n").unwrap_or(data);
        parts.push(MultipartPart {
            name,
            filename,
            content_type,
            data: Bytes::from(data.as_bytes().to_vec()),
        });
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// A snapshot of a response as sent to a client.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    request_id: String,
    status: u16,
    status_message: Option<String>,
    headers: Vec<(String, String)>,
    trailers: Option<Vec<(String, String)>>,
    body: BodyBytes,
    tags: Vec<String>,
    timings: TimingMarks,
}

impl InterceptedResponse {
    pub(crate) fn new(
        request_id: String,
        status: u16,
        status_message: Option<String>,
        headers: Vec<(String, String)>,
        trailers: Option<Vec<(String, String)>>,
        body: BodyBytes,
        timings: TimingMarks,
    ) -> Self {
        Self {
            request_id,
            status,
            status_message,
            headers,
            trailers,
            body,
            tags: Vec::new(),
            timings,
        }
    }

    /// The id of the request this response answers.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// The status message, falling back to the canonical reason phrase.
    pub fn status_message(&self) -> String {
        self.status_message.clone().unwrap_or_else(|| {
            http::StatusCode::from_u16(self.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("")
                .to_string()
        })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::common::util::find_header(&self.headers, name)
    }

    pub fn trailers(&self) -> Option<&[(String, String)]> {
        self.trailers.as_deref()
    }

    pub fn body(&self) -> &BodyBytes {
        &self.body
    }

    /// The body after undoing the response's `Content-Encoding` stack.
    pub fn decoded_body(&self) -> Option<Bytes> {
        match self.header("content-encoding") {
            None => Some(self.body.to_bytes()),
            Some(stack) => encoding::decode(stack, self.body.as_ref()).ok(),
        }
    }

    pub fn body_text(&self) -> Option<String> {
        String::from_utf8(self.decoded_body()?.to_vec()).ok()
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.decoded_body()?).ok()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn timings(&self) -> &TimingMarks {
        &self.timings
    }
}

/// How often a rule may be used before it stops matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Completion {
    #[default]
    Once,
    Twice,
    Thrice,
    Times(u64),
    Always,
}

impl Completion {
    /// The maximum number of requests this predicate admits.
    pub fn limit(&self) -> Option<u64> {
        match self {
            Completion::Once => Some(1),
            Completion::Twice => Some(2),
            Completion::Thrice => Some(3),
            Completion::Times(n) => Some(*n),
            Completion::Always => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Completion::Once => "once".to_string(),
            Completion::Twice => "twice".to_string(),
            Completion::Thrice => "thrice".to_string(),
            Completion::Times(n) => format!("{} times", n),
            Completion::Always => "always".to_string(),
        }
    }
}

/// Where the bytes of a synthetic response body come from.
///
/// The `Stream` variant is one-shot: the stream is taken on first use, and a
/// rule firing a second time fails with a distinct error instead of silently
/// producing an empty body.
#[derive(Clone)]
pub enum BodySource {
    Bytes(Bytes),
    Text(String),
    File(PathBuf),
    Stream(Arc<Mutex<Option<BoxStream<'static, Bytes>>>>),
}

impl BodySource {
    pub fn stream(s: BoxStream<'static, Bytes>) -> Self {
        BodySource::Stream(Arc::new(Mutex::new(Some(s))))
    }

    pub fn describe(&self) -> String {
        match self {
            BodySource::Bytes(b) => format!("{} bytes", b.len()),
            BodySource::Text(t) => format!("{:?}", t),
            BodySource::File(p) => format!("file {}", p.display()),
            BodySource::Stream(_) => "a stream".to_string(),
        }
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            BodySource::Text(t) => f.debug_tuple("Text").field(t).finish(),
            BodySource::File(p) => f.debug_tuple("File").field(p).finish(),
            BodySource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<&str> for BodySource {
    fn from(value: &str) -> Self {
        BodySource::Text(value.to_string())
    }
}

impl From<String> for BodySource {
    fn from(value: String) -> Self {
        BodySource::Text(value)
    }
}

impl From<Bytes> for BodySource {
    fn from(value: Bytes) -> Self {
        BodySource::Bytes(value)
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(value: Vec<u8>) -> Self {
        BodySource::Bytes(Bytes::from(value))
    }
}

/// The full description of a synthetic response.
#[derive(Debug, Clone, Default)]
pub struct ResponseSpec {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub trailers: Option<Vec<(String, String)>>,
    pub body: Option<BodySource>,
}

impl ResponseSpec {
    pub fn new(status: u16) -> Self {
        ResponseSpec {
            status,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<BodySource>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((name.to_string(), value.to_string()));
        self
    }

    /// A JSON reply: serialises the value and sets `Content-Type` and
    /// `Content-Length` explicitly.
    pub fn json(status: u16, value: &Value) -> Self {
        let body = value.to_string();
        ResponseSpec {
            status,
            status_message: None,
            headers: Some(vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ]),
            trailers: None,
            body: Some(BodySource::Text(body)),
        }
    }
}

/// An ordered matcher+step rule for HTTP requests.
#[derive(Clone)]
pub struct RequestRule {
    /// Caller-supplied id; a unique one is generated when absent.
    pub id: Option<String>,
    /// Higher priorities match first; insertion order breaks ties.
    pub priority: i32,
    pub matchers: Vec<RequestMatcher>,
    pub step: RequestStep,
    pub completion: Completion,
    /// Optional artificial latency applied before the step executes.
    pub delay: Option<Duration>,
}

impl RequestRule {
    pub fn new(matchers: Vec<RequestMatcher>, step: RequestStep) -> Self {
        RequestRule {
            id: None,
            priority: 0,
            matchers,
            step,
            completion: Completion::default(),
            delay: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl fmt::Debug for RequestRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("matchers", &self.matchers.len())
            .field("completion", &self.completion)
            .finish()
    }
}

/// A rule for WebSocket upgrade requests.
#[derive(Clone)]
pub struct WebSocketRule {
    pub id: Option<String>,
    pub priority: i32,
    pub matchers: Vec<RequestMatcher>,
    pub step: WebSocketStep,
    pub completion: Completion,
}

impl WebSocketRule {
    pub fn new(matchers: Vec<RequestMatcher>, step: WebSocketStep) -> Self {
        WebSocketRule {
            id: None,
            priority: 0,
            matchers,
            step,
            completion: Completion::Always,
        }
    }
}

// ===============================================================================================
// Events
// ===============================================================================================

/// Everything an external observer can subscribe to.
#[derive(Clone)]
pub enum ProxyEvent {
    Request(Arc<InterceptedRequest>),
    Response(Arc<InterceptedResponse>),
    Abort {
        request: Arc<InterceptedRequest>,
        reason: String,
    },
    WebSocketRequest(Arc<InterceptedRequest>),
    WebSocketAccepted(Arc<InterceptedRequest>),
    WebSocketMessageReceived {
        request_id: String,
        data: Bytes,
        is_text: bool,
    },
    WebSocketMessageSent {
        request_id: String,
        data: Bytes,
        is_text: bool,
    },
    WebSocketClose {
        request_id: String,
        code: Option<u16>,
        reason: String,
    },
    TlsClientError {
        sni: Option<String>,
        error: String,
    },
    ClientError {
        error: String,
        raw_head: Option<Bytes>,
    },
    RawPassthroughOpened {
        connection_id: String,
        destination: String,
    },
    RawPassthroughClosed {
        connection_id: String,
        destination: String,
        bytes_up: u64,
        bytes_down: u64,
        elapsed: Duration,
    },
    RuleEvent {
        request_id: String,
        rule_id: String,
        event: RuleEvent,
    },
}

/// Fine-grained passthrough progress, published as `rule-event`s.
#[derive(Clone, Debug)]
pub enum RuleEvent {
    PassthroughRequestHead {
        method: String,
        url: String,
        headers: Vec<(String, String)>,
    },
    PassthroughRequestBody {
        overridden: bool,
        raw_body: Option<Bytes>,
    },
    PassthroughResponseHead {
        status: u16,
        headers: Vec<(String, String)>,
    },
    PassthroughResponseBody {
        overridden: bool,
        raw_body: Option<Bytes>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Request,
    Response,
    Abort,
    WebSocketRequest,
    WebSocketAccepted,
    WebSocketMessageReceived,
    WebSocketMessageSent,
    WebSocketClose,
    TlsClientError,
    ClientError,
    RawPassthroughOpened,
    RawPassthroughClosed,
    RuleEvent,
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Request(_) => EventKind::Request,
            ProxyEvent::Response(_) => EventKind::Response,
            ProxyEvent::Abort { .. } => EventKind::Abort,
            ProxyEvent::WebSocketRequest(_) => EventKind::WebSocketRequest,
            ProxyEvent::WebSocketAccepted(_) => EventKind::WebSocketAccepted,
            ProxyEvent::WebSocketMessageReceived { .. } => EventKind::WebSocketMessageReceived,
            ProxyEvent::WebSocketMessageSent { .. } => EventKind::WebSocketMessageSent,
            ProxyEvent::WebSocketClose { .. } => EventKind::WebSocketClose,
            ProxyEvent::TlsClientError { .. } => EventKind::TlsClientError,
            ProxyEvent::ClientError { .. } => EventKind::ClientError,
            ProxyEvent::RawPassthroughOpened { .. } => EventKind::RawPassthroughOpened,
            ProxyEvent::RawPassthroughClosed { .. } => EventKind::RawPassthroughClosed,
            ProxyEvent::RuleEvent { .. } => EventKind::RuleEvent,
        }
    }
}

// ===============================================================================================
// Upstream / passthrough configuration
// ===============================================================================================

/// A request about to be sent upstream; hooks and transforms mutate this.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// An upstream response before it is relayed downstream.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub type RequestHook = Arc<dyn Fn(&mut OutboundRequest) + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&mut OutboundResponse) + Send + Sync>;
pub type CallbackResponder =
    Arc<dyn Fn(&InterceptedRequest) -> Result<ResponseSpec, String> + Send + Sync>;
pub type ProxyConfigCallback = Arc<dyn Fn(&str) -> Option<UpstreamProxy> + Send + Sync>;

/// An upstream proxy to chain through: `http://`, `https://` or `socks5://`.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    pub url: String,
    /// Hosts that bypass the proxy, per the no-proxy matching rules.
    pub no_proxy: Vec<String>,
}

impl UpstreamProxy {
    pub fn new(url: impl Into<String>) -> Self {
        UpstreamProxy {
            url: url.into(),
            no_proxy: Vec::new(),
        }
    }
}

/// How to decide on an upstream proxy: a fixed record, a per-hostname
/// callback, or an ordered list of either where the first non-`None` answer
/// wins and the remaining entries are skipped.
#[derive(Clone)]
pub enum ProxySetting {
    Fixed(UpstreamProxy),
    Callback(ProxyConfigCallback),
    List(Vec<ProxySetting>),
}

impl ProxySetting {
    pub fn resolve(&self, hostname: &str) -> Option<UpstreamProxy> {
        match self {
            ProxySetting::Fixed(proxy) => Some(proxy.clone()),
            ProxySetting::Callback(f) => f(hostname),
            ProxySetting::List(settings) => {
                settings.iter().find_map(|s| s.resolve(hostname))
            }
        }
    }
}

impl fmt::Debug for ProxySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxySetting::Fixed(p) => f.debug_tuple("Fixed").field(p).finish(),
            ProxySetting::Callback(_) => f.write_str("Callback(..)"),
            ProxySetting::List(l) => f.debug_tuple("List").field(&l.len()).finish(),
        }
    }
}

/// A client certificate presented to upstreams that request one.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// TLS trust options for upstream connections.
#[derive(Debug, Clone, Default)]
pub struct UpstreamTlsConfig {
    /// Extra root certificates (PEM) trusted in addition to the system roots.
    pub trusted_ca_pems: Vec<String>,
    /// Hosts whose certificate errors are ignored entirely.
    pub ignore_host_certificate_errors: Vec<String>,
    pub client_certificate: Option<ClientCertificate>,
}

/// How the `Host` header is rewritten when the authority changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostHeaderPolicy {
    /// Set the host header to the new target authority.
    #[default]
    Update,
    /// Leave the original host header untouched.
    Preserve,
    /// Set the host header to an arbitrary value.
    Custom(String),
}
