//! The hyper service shared by the HTTP/1.1 and HTTP/2 adapters: buffers the
//! request, builds the unified request snapshot, runs the rule engine and
//! converts step output back into a wire response. CONNECT tunnels re-enter
//! the dispatcher; WebSocket upgrades are routed to the websocket handler.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    common::{
        data::{
            now_millis, HttpVersion, InterceptedRequest, InterceptedResponse, OutboundResponse,
            ProxyEvent,
        },
        util::BodyBytes,
    },
    server::{
        dispatch::{dispatch, ConnectionContext},
        proxy,
        steps::{self, RequestStep, StepBody, StepOutput},
        ws, Io, ProxyCore,
    },
};

pub(crate) type OutBody = UnsyncBoxBody<Bytes, hyper::Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP protocol error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("cannot build response: {0}")]
    Http(#[from] http::Error),
    #[error("missing authority: request has no absolute URI, Host header or tunnel target")]
    MissingAuthority,
    // Control-flow: a rule asked for the connection to be dropped.
    #[error("connection closed by rule")]
    ConnectionClosedByRule,
    #[error("connection error: {0}")]
    Connection(Box<dyn std::error::Error + Send + Sync>),
}

/// Serves buffered HTTP/1.1 and HTTP/2 on one stream, with upgrade support.
pub(crate) async fn serve_http(
    core: Arc<ProxyCore>,
    stream: Box<dyn Io>,
    ctx: ConnectionContext,
) -> Result<(), Error> {
    let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2();

    let result = builder
        .serve_connection_with_upgrades(
            TokioIo::new(stream),
            service_fn(move |req| {
                let core = core.clone();
                let ctx = ctx.clone();
                async move { service(core, ctx, req).await }
            }),
        )
        .await;

    if let Err(err) = result {
        // Connections dropped by close-connection rules and mid-request
        // client disconnects both surface here.
        trace!("connection ended with error: {:?}", err);
    }

    Ok(())
}

async fn service(
    core: Arc<ProxyCore>,
    ctx: ConnectionContext,
    req: Request<Incoming>,
) -> Result<Response<OutBody>, Error> {
    trace!(uri = %req.uri(), method = %req.method(), "request received");

    if req.method() == Method::CONNECT {
        return handle_connect(core, req);
    }

    if ws::is_upgrade_request(&req) {
        return ws::handle_upgrade(core, ctx, req).await;
    }

    let (parts, body) = req.into_parts();
    let collected = body.collect().await?;
    let trailers = collected.trailers().cloned();
    let body_bytes = collected.to_bytes();

    let request = match build_request(&ctx, &parts, body_bytes, trailers) {
        Ok(request) => Arc::new(request),
        Err(err) => {
            core.bus.emit(ProxyEvent::ClientError {
                error: err.to_string(),
                raw_head: None,
            });
            return diagnostic_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    core.bus.emit(ProxyEvent::Request(request.clone()));

    let mut guard = AbortGuard::new(core.clone(), request.clone());

    let matched = core.rules.match_request(&request);

    let rule = match matched {
        Some(rule) => rule,
        None => {
            let body = core.rules.explain_unmatched(&request);
            let response = explanatory_response(StatusCode::SERVICE_UNAVAILABLE, &body)?;
            emit_response(&core, &request, StatusCode::SERVICE_UNAVAILABLE.as_u16(), &body);
            guard.complete();
            return Ok(response);
        }
    };

    if let Some(delay) = rule.definition.delay {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let result = match &rule.definition.step {
        RequestStep::ForwardTo(spec) => {
            run_upstream(&core, &request, rule.id(), Some(spec), &spec.options).await
        }
        RequestStep::PassThrough(spec) => {
            run_upstream(&core, &request, rule.id(), None, spec).await
        }
        step => run_synthetic(step, &request).await,
    };

    match result {
        Ok((response, snapshot)) => {
            request.mark(|t| {
                t.headers_sent = Some(now_millis());
                t.response_sent = Some(now_millis());
            });
            core.bus.emit(ProxyEvent::Response(Arc::new(snapshot)));
            guard.complete();
            Ok(response)
        }
        Err(Error::ConnectionClosedByRule) => {
            // The guard stays incomplete: dropping the connection without a
            // response is an abort.
            Err(Error::ConnectionClosedByRule)
        }
        Err(err) => Err(err),
    }
}

fn handle_connect(
    core: Arc<ProxyCore>,
    req: Request<Incoming>,
) -> Result<Response<OutBody>, Error> {
    let authority = req.uri().authority().map(|a| a.to_string());
    debug!(authority = authority.as_deref().unwrap_or("<none>"), "CONNECT tunnel requested");

    // The upgrade only completes after the 200 response is flushed, so the
    // tunnel handling must be detached from this request future.
    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let next = ConnectionContext {
                    tls: false,
                    default_authority: authority,
                    inside_tunnel: true,
                };
                if let Err(err) = dispatch(core, Box::new(TokioIo::new(upgraded)), next).await {
                    debug!("CONNECT tunnel ended: {:?}", err);
                }
            }
            Err(err) => {
                warn!("CONNECT upgrade failed: {:?}", err);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty())?)
}

/// Builds the unified request snapshot from buffered hyper parts.
fn build_request(
    ctx: &ConnectionContext,
    parts: &http::request::Parts,
    body: Bytes,
    trailers: Option<HeaderMap>,
) -> Result<InterceptedRequest, Error> {
    let version = match parts.version {
        Version::HTTP_2 => HttpVersion::Http2,
        _ => HttpVersion::Http1,
    };

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect();

    let trailers = trailers.map(|map| {
        map.iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect::<Vec<_>>()
    });

    // Normalise to absolute-form so matchers can rely on scheme and
    // authority regardless of how the client spoke to us.
    let url = if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        parts.uri.to_string()
    } else {
        let authority = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            })
            .or_else(|| ctx.default_authority.clone())
            .ok_or(Error::MissingAuthority)?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}://{}{}", ctx.scheme(), authority, path_and_query)
    };

    Ok(InterceptedRequest::new(
        version,
        ctx.scheme().to_string(),
        parts.method.as_str().to_string(),
        url,
        headers,
        trailers,
        BodyBytes(body),
    ))
}

async fn run_synthetic(
    step: &RequestStep,
    request: &Arc<InterceptedRequest>,
) -> Result<(Response<OutBody>, InterceptedResponse), Error> {
    match steps::execute_synthetic(step, request).await {
        Ok(output) => build_step_response(request, output),
        Err(steps::Error::CloseConnection) => Err(Error::ConnectionClosedByRule),
        Err(err) => {
            let message = err.to_string();
            let response = explanatory_response(StatusCode::INTERNAL_SERVER_ERROR, &message)?;
            Ok((
                response,
                snapshot(request, 500, explanatory_headers(&message), &message),
            ))
        }
    }
}

async fn run_upstream(
    core: &Arc<ProxyCore>,
    request: &Arc<InterceptedRequest>,
    rule_id: &str,
    forward_to: Option<&steps::ForwardToSpec>,
    spec: &steps::PassThroughSpec,
) -> Result<(Response<OutBody>, InterceptedResponse), Error> {
    match proxy::execute(request, rule_id, forward_to, spec, &core.bus, core.local_addr()).await {
        Ok(upstream) => build_upstream_response(request, upstream),
        Err(err) => {
            let message = err.to_string();
            let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_GATEWAY);
            warn!(request_id = request.id(), "passthrough failed: {}", message);
            let response = explanatory_response(status, &message)?;
            Ok((
                response,
                snapshot(request, status.as_u16(), explanatory_headers(&message), &message),
            ))
        }
    }
}

pub(crate) fn build_step_response(
    request: &Arc<InterceptedRequest>,
    output: StepOutput,
) -> Result<(Response<OutBody>, InterceptedResponse), Error> {
    let mut builder = Response::builder().status(output.status);

    let supplied_headers = output.headers.is_some();
    let mut snapshot_headers: Vec<(String, String)> = Vec::new();

    if let Some(headers) = &output.headers {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
            snapshot_headers.push((name.clone(), value.clone()));
        }
    }

    let (body, snapshot_body): (OutBody, Bytes) = match output.body {
        StepBody::Full(bytes) => {
            let snapshot_body = bytes.clone();
            match &output.trailers {
                Some(trailers) => (body_with_trailers(bytes, trailers), snapshot_body),
                None => (full(bytes), snapshot_body),
            }
        }
        StepBody::Stream(stream) => {
            let body = BodyExt::boxed_unsync(StreamBody::new(stream.map(|chunk| Ok(Frame::data(chunk)))));
            (body, Bytes::new())
        }
    };

    let mut response = builder.body(body)?;

    if !supplied_headers {
        // No explicit headers on the step: inject the defaults.
        response
            .headers_mut()
            .typed_insert(headers::Date::from(std::time::SystemTime::now()));
        response.headers_mut().insert(
            http::header::TRANSFER_ENCODING,
            http::HeaderValue::from_static("chunked"),
        );
        snapshot_headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
    }

    let snapshot = InterceptedResponse::new(
        request.id().to_string(),
        output.status,
        output.status_message,
        snapshot_headers,
        output.trailers,
        BodyBytes(snapshot_body),
        request.timings(),
    );

    Ok((response, snapshot))
}

fn build_upstream_response(
    request: &Arc<InterceptedRequest>,
    upstream: OutboundResponse,
) -> Result<(Response<OutBody>, InterceptedResponse), Error> {
    let mut builder = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        // hyper re-frames the body itself.
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.body(full(upstream.body.clone()))?;

    let snapshot = InterceptedResponse::new(
        request.id().to_string(),
        upstream.status,
        upstream.status_message,
        upstream.headers,
        None,
        BodyBytes(upstream.body),
        request.timings(),
    );

    Ok((response, snapshot))
}

fn body_with_trailers(bytes: Bytes, trailers: &[(String, String)]) -> OutBody {
    let mut trailer_map = HeaderMap::new();
    for (name, value) in trailers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::try_from(value.as_str()),
        ) {
            trailer_map.append(name, value);
        }
    }

    let frames: Vec<Result<Frame<Bytes>, hyper::Error>> =
        vec![Ok(Frame::data(bytes)), Ok(Frame::trailers(trailer_map))];
    BodyExt::boxed_unsync(StreamBody::new(futures_util::stream::iter(frames)))
}

fn explanatory_headers(body: &str) -> Vec<(String, String)> {
    vec![
        ("content-type".to_string(), "text/plain".to_string()),
        ("content-length".to_string(), body.len().to_string()),
    ]
}

fn explanatory_response(status: StatusCode, body: &str) -> Result<Response<OutBody>, Error> {
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(full(Bytes::from(body.to_string())))?)
}

fn diagnostic_response(status: StatusCode, body: &str) -> Result<Response<OutBody>, Error> {
    explanatory_response(status, body)
}

fn snapshot(
    request: &Arc<InterceptedRequest>,
    status: u16,
    headers: Vec<(String, String)>,
    body: &str,
) -> InterceptedResponse {
    InterceptedResponse::new(
        request.id().to_string(),
        status,
        None,
        headers,
        None,
        BodyBytes::from(body.to_string()),
        request.timings(),
    )
}

fn emit_response(core: &Arc<ProxyCore>, request: &Arc<InterceptedRequest>, status: u16, body: &str) {
    let snap = snapshot(request, status, explanatory_headers(body), body);
    core.bus.emit(ProxyEvent::Response(Arc::new(snap)));
}

pub(crate) fn full(bytes: Bytes) -> OutBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

pub(crate) fn empty() -> OutBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Emits an `abort` event on drop unless the response completed. Holding it
/// across every await point means a client disconnect (which cancels the
/// service future) is observed exactly once.
struct AbortGuard {
    core: Arc<ProxyCore>,
    request: Arc<InterceptedRequest>,
    completed: bool,
}

impl AbortGuard {
    fn new(core: Arc<ProxyCore>, request: Arc<InterceptedRequest>) -> Self {
        AbortGuard {
            core,
            request,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.request.mark(|t| t.aborted = Some(now_millis()));
            self.core.bus.emit(ProxyEvent::Abort {
                request: self.request.clone(),
                reason: "request aborted before a response was sent".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parts_for(uri: &str, host_header: Option<&str>) -> http::request::Parts {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(host) = host_header {
            builder = builder.header("host", host);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn origin_form_requests_get_absolute_urls_from_host_header() {
        let ctx = ConnectionContext::default();
        let parts = parts_for("/path?x=1", Some("example.com:8080"));

        let request = build_request(&ctx, &parts, Bytes::new(), None).unwrap();
        assert_eq!(request.url(), "http://example.com:8080/path?x=1");
        assert_eq!(request.scheme(), "http");
    }

    #[test]
    fn tunneled_requests_fall_back_to_the_tunnel_target() {
        let ctx = ConnectionContext {
            tls: true,
            default_authority: Some("tunnel.test:443".to_string()),
            inside_tunnel: true,
        };
        let parts = parts_for("/inner", None);

        let request = build_request(&ctx, &parts, Bytes::new(), None).unwrap();
        assert_eq!(request.url(), "https://tunnel.test:443/inner");
        assert_eq!(request.scheme(), "https");
    }

    #[test]
    fn absolute_form_requests_keep_their_url() {
        let ctx = ConnectionContext::default();
        let parts = parts_for("http://absolute.test/x", None);

        let request = build_request(&ctx, &parts, Bytes::new(), None).unwrap();
        assert_eq!(request.url(), "http://absolute.test/x");
    }

    #[test]
    fn requests_without_any_authority_are_rejected() {
        let ctx = ConnectionContext::default();
        let parts = parts_for("/nowhere", None);

        let err = build_request(&ctx, &parts, Bytes::new(), None).unwrap_err();
        assert!(matches!(err, Error::MissingAuthority));
    }

    #[test]
    fn header_order_and_duplicates_survive() {
        let (parts, _) = Request::builder()
            .method("GET")
            .uri("/x")
            .header("host", "h.test")
            .header("x-dup", "one")
            .header("x-dup", "two")
            .body(())
            .unwrap()
            .into_parts();

        let ctx = ConnectionContext::default();
        let request = build_request(&ctx, &parts, Bytes::new(), None).unwrap();

        let dups: Vec<&str> = request
            .headers()
            .iter()
            .filter(|(k, _)| k == "x-dup")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(dups, vec!["one", "two"]);
    }
}
