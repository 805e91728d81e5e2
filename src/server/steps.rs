//! Step variants (the terminal action of a rule) and execution of the
//! synthetic ones. Passthrough and forwarding steps are executed by the
//! pipeline in `server::proxy`.

use std::fmt;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tracing::debug;

use crate::{
    common::data::{
        BodySource, CallbackResponder, HostHeaderPolicy, InterceptedRequest, ProxySetting,
        RequestHook, ResponseHook, ResponseSpec, UpstreamTlsConfig,
    },
    server::proxy::transform::{RequestTransform, ResponseTransform},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read body file {path}: {source}")]
    BodyFileError {
        path: String,
        source: std::io::Error,
    },
    #[error("stream step called more than once")]
    StreamExhausted,
    #[error("pseudo-header {0} cannot be set through a rule")]
    PseudoHeader(String),
    #[error("response callback failed: {0}")]
    CallbackFailed(String),
    // Control-flow marker: the connection must be dropped without a response.
    #[error("connection closed by rule")]
    CloseConnection,
}

/// Options shared by passthrough and forwarding steps.
#[derive(Clone, Default)]
pub struct PassThroughSpec {
    pub transform_request: Option<RequestTransform>,
    pub transform_response: Option<ResponseTransform>,
    pub proxy: Option<ProxySetting>,
    pub tls: UpstreamTlsConfig,
    /// Runs after transforms, immediately before the request goes upstream.
    pub before_request: Option<RequestHook>,
    /// Runs after response transforms, before the response goes downstream.
    pub before_response: Option<ResponseHook>,
}

impl fmt::Debug for PassThroughSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassThroughSpec")
            .field("transform_request", &self.transform_request.is_some())
            .field("transform_response", &self.transform_response.is_some())
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Redirection of a request to a different origin, preserving path and query.
#[derive(Debug, Clone)]
pub struct ForwardToSpec {
    /// Target origin, e.g. `https://example.com` or `http://localhost:3000`.
    pub target: String,
    pub host_header: HostHeaderPolicy,
    pub options: PassThroughSpec,
}

/// The terminal action a matched rule performs.
#[derive(Clone)]
pub enum RequestStep {
    /// Reply with a fixed, synthesised response.
    Fixed(ResponseSpec),
    /// Compute the response dynamically from the request.
    Callback(CallbackResponder),
    /// Rewrite host and scheme, then send upstream.
    ForwardTo(ForwardToSpec),
    /// Forward to the original destination, optionally transforming.
    PassThrough(PassThroughSpec),
    /// Drop the TCP connection without writing anything.
    CloseConnection,
    /// Hold the connection open and never respond.
    Timeout,
}

impl RequestStep {
    /// Convenience constructor for a JSON reply.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        RequestStep::Fixed(ResponseSpec::json(status, value))
    }

    /// Convenience constructor for a one-shot streaming response.
    pub fn stream(status: u16, stream: BoxStream<'static, Bytes>) -> Self {
        RequestStep::Fixed(ResponseSpec {
            status,
            body: Some(BodySource::stream(stream)),
            ..Default::default()
        })
    }

    pub fn describe(&self) -> String {
        match self {
            RequestStep::Fixed(spec) => match &spec.body {
                Some(body) => format!("respond with status {} and body {}", spec.status, body.describe()),
                None => format!("respond with status {}", spec.status),
            },
            RequestStep::Callback(_) => "respond using a callback".to_string(),
            RequestStep::ForwardTo(spec) => format!("forward the request to {}", spec.target),
            RequestStep::PassThrough(_) => "pass the request through to the target host".to_string(),
            RequestStep::CloseConnection => "close the connection".to_string(),
            RequestStep::Timeout => "time out (never respond)".to_string(),
        }
    }
}

impl fmt::Debug for RequestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// The terminal action of a matched WebSocket rule.
#[derive(Clone)]
pub enum WebSocketStep {
    /// Accept the upgrade and echo every message back.
    Echo,
    /// Accept the upgrade and consume messages without replying.
    Listen,
    /// Forward the connection upstream, optionally to a rewritten target.
    PassThrough {
        /// Replacement origin (`ws://…` / `wss://…`); the original target
        /// is used when absent.
        target: Option<String>,
        proxy: Option<ProxySetting>,
        tls: UpstreamTlsConfig,
    },
    /// Refuse the upgrade with a synthetic HTTP response.
    Reject(ResponseSpec),
    /// Complete the handshake, then close immediately.
    AcceptAndClose,
}

impl WebSocketStep {
    pub fn describe(&self) -> String {
        match self {
            WebSocketStep::Echo => "echo all websocket messages".to_string(),
            WebSocketStep::Listen => "accept the websocket and listen silently".to_string(),
            WebSocketStep::PassThrough { target, .. } => match target {
                Some(t) => format!("forward the websocket to {}", t),
                None => "pass the websocket through to the target host".to_string(),
            },
            WebSocketStep::Reject(spec) => {
                format!("reject the websocket with status {}", spec.status)
            }
            WebSocketStep::AcceptAndClose => {
                "accept the websocket and close it immediately".to_string()
            }
        }
    }
}

impl fmt::Debug for WebSocketStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// A fully resolved synthetic response, ready to hand to the HTTP adapter.
pub(crate) struct StepOutput {
    pub status: u16,
    pub status_message: Option<String>,
    /// `None` means "the step supplied no headers; inject defaults".
    pub headers: Option<Vec<(String, String)>>,
    pub trailers: Option<Vec<(String, String)>>,
    pub body: StepBody,
}

impl std::fmt::Debug for StepOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepOutput")
            .field("status", &self.status)
            .field("status_message", &self.status_message)
            .field("headers", &self.headers)
            .field("trailers", &self.trailers)
            .field("body", &self.body)
            .finish()
    }
}

pub(crate) enum StepBody {
    Full(Bytes),
    Stream(BoxStream<'static, Bytes>),
}

impl std::fmt::Debug for StepBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            StepBody::Stream(_) => f.debug_tuple("Stream").field(&"<stream>").finish(),
        }
    }
}

/// Executes a synthetic (non-upstream) step. `ForwardTo` and `PassThrough`
/// are routed to the pipeline by the caller and never reach this function.
pub(crate) async fn execute_synthetic(
    step: &RequestStep,
    req: &InterceptedRequest,
) -> Result<StepOutput, Error> {
    match step {
        RequestStep::Fixed(spec) => resolve_response(spec.clone()).await,
        RequestStep::Callback(callback) => {
            let spec = callback(req).map_err(Error::CallbackFailed)?;
            resolve_response(spec).await
        }
        RequestStep::CloseConnection => Err(Error::CloseConnection),
        RequestStep::Timeout => {
            debug!(request_id = req.id(), "holding connection open (timeout step)");
            futures_util::future::pending::<()>().await;
            unreachable!("pending() never resolves")
        }
        RequestStep::ForwardTo(_) | RequestStep::PassThrough(_) => {
            unreachable!("upstream steps are executed by the passthrough pipeline")
        }
    }
}

async fn resolve_response(spec: ResponseSpec) -> Result<StepOutput, Error> {
    if let Some(headers) = &spec.headers {
        if let Some((name, _)) = headers.iter().find(|(name, _)| name.starts_with(':')) {
            return Err(Error::PseudoHeader(name.clone()));
        }
    }

    let body = match spec.body {
        None => StepBody::Full(Bytes::new()),
        Some(BodySource::Bytes(bytes)) => StepBody::Full(bytes),
        Some(BodySource::Text(text)) => StepBody::Full(Bytes::from(text)),
        Some(BodySource::File(path)) => {
            let contents =
                tokio::fs::read(&path)
                    .await
                    .map_err(|source| Error::BodyFileError {
                        path: path.display().to_string(),
                        source,
                    })?;
            StepBody::Full(Bytes::from(contents))
        }
        Some(BodySource::Stream(slot)) => {
            let stream = slot.lock().unwrap().take().ok_or(Error::StreamExhausted)?;
            StepBody::Stream(stream)
        }
    };

    Ok(StepOutput {
        status: spec.status,
        status_message: spec.status_message,
        headers: spec.headers,
        trailers: spec.trailers,
        body,
    })
}
