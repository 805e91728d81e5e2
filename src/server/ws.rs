//! WebSocket upgrade handling and step execution: echo, listen, forward,
//! reject and accept-and-close, with message-level events on the bus.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::{
    tungstenite::{
        handshake::derive_accept_key,
        protocol::{Message, Role},
    },
    WebSocketStream,
};
use tracing::{debug, trace, warn};

use crate::{
    common::{
        data::{HttpVersion, InterceptedRequest, ProxyEvent},
        util::BodyBytes,
    },
    server::{
        dispatch::ConnectionContext,
        handler::{self, full, OutBody},
        proxy::client::{self, ConnectTarget},
        steps::{self, RequestStep, WebSocketStep},
        ProxyCore,
    },
};

/// Whether a request asks for a websocket upgrade.
pub(crate) fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let upgrade_header = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let connection_header = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    upgrade_header && connection_header
}

/// Handles a websocket upgrade request end to end: match a rule, then either
/// reject with a synthetic response or complete the handshake and run the
/// step against the upgraded stream.
pub(crate) async fn handle_upgrade(
    core: Arc<ProxyCore>,
    ctx: ConnectionContext,
    req: Request<Incoming>,
) -> Result<Response<OutBody>, handler::Error> {
    let ws_scheme = if ctx.tls { "wss" } else { "ws" };

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect();

    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .or_else(|| ctx.default_authority.clone());

    let authority = match authority {
        Some(authority) => authority,
        None => {
            core.bus.emit(ProxyEvent::ClientError {
                error: "websocket upgrade without authority".to_string(),
                raw_head: None,
            });
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full(Bytes::from_static(b"missing authority")))?);
        }
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}://{}{}", ws_scheme, authority, path_and_query);

    let version = match req.version() {
        http::Version::HTTP_2 => HttpVersion::Http2,
        _ => HttpVersion::Http1,
    };

    let request = Arc::new(InterceptedRequest::new(
        version,
        ws_scheme.to_string(),
        req.method().as_str().to_string(),
        url.clone(),
        headers,
        None,
        BodyBytes::default(),
    ));

    core.bus.emit(ProxyEvent::WebSocketRequest(request.clone()));

    let rule = match core.rules.match_websocket(&request) {
        Some(rule) => rule,
        None => {
            debug!(url, "no websocket rule matched");
            let body = format!(
                "No websocket rules were found matching this request.\nThis request was: {} {}\n",
                request.method(),
                request.url()
            );
            return Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(http::header::CONTENT_TYPE, "text/plain")
                .body(full(Bytes::from(body)))?);
        }
    };

    if let WebSocketStep::Reject(spec) = &rule.definition.step {
        let output =
            match steps::execute_synthetic(&RequestStep::Fixed(spec.clone()), &request).await {
                Ok(output) => output,
                Err(err) => {
                    return Ok(Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(full(Bytes::from(err.to_string())))?)
                }
            };
        let (response, _snapshot) = handler::build_step_response(&request, output)?;
        return Ok(response);
    }

    let key = match req
        .headers()
        .get("sec-websocket-key")
        .map(|v| derive_accept_key(v.as_bytes()))
    {
        Some(key) => key,
        None => {
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full(Bytes::from_static(b"missing sec-websocket-key")))?)
        }
    };

    // For passthrough, the upstream handshake happens before we accept the
    // downstream upgrade so a refusing upstream is mirrored faithfully.
    let upstream = match &rule.definition.step {
        WebSocketStep::PassThrough { target, proxy, tls } => {
            let upstream_url = target.clone().unwrap_or_else(|| url.clone());
            match connect_upstream(&upstream_url, proxy.as_ref(), tls).await {
                Ok(ws) => Some(ws),
                Err(err) => {
                    warn!(upstream_url, "websocket passthrough failed: {}", err);
                    return Ok(Response::builder()
                        .status(StatusCode::BAD_GATEWAY)
                        .header(http::header::CONTENT_TYPE, "text/plain")
                        .body(full(Bytes::from(err)))?);
                }
            }
        }
        _ => None,
    };

    let on_upgrade = hyper::upgrade::on(req);
    let step = rule.definition.step.clone();
    let core_for_task = core.clone();
    let request_for_task = request.clone();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;

                core_for_task
                    .bus
                    .emit(ProxyEvent::WebSocketAccepted(request_for_task.clone()));

                run_step(core_for_task, request_for_task, step, ws, upstream).await;
            }
            Err(err) => {
                warn!("websocket upgrade failed: {:?}", err);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::UPGRADE, "websocket")
        .header(http::header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", key)
        .body(handler::empty())?)
}

type ServerWs = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;
type ClientWs = WebSocketStream<Box<dyn crate::server::Io>>;

async fn connect_upstream(
    url: &str,
    proxy: Option<&crate::common::data::ProxySetting>,
    tls: &crate::common::data::UpstreamTlsConfig,
) -> Result<ClientWs, String> {
    let target = ConnectTarget::from_url(url, false).map_err(|e| e.to_string())?;
    let proxy = client::resolve_proxy(proxy, &target.host, target.port);
    let stream = client::open_stream(&target, tls, proxy)
        .await
        .map_err(|e| e.to_string())?;

    let (ws, response) = tokio_tungstenite::client_async(url, stream.stream)
        .await
        .map_err(|e| e.to_string())?;

    trace!(status = response.status().as_u16(), "upstream websocket accepted");
    Ok(ws)
}

async fn run_step(
    core: Arc<ProxyCore>,
    request: Arc<InterceptedRequest>,
    step: WebSocketStep,
    mut downstream: ServerWs,
    upstream: Option<ClientWs>,
) {
    match step {
        WebSocketStep::Echo => {
            while let Some(Ok(message)) = downstream.next().await {
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        emit_message(&core, &request, &message, true);
                        emit_message(&core, &request, &message, false);
                        if downstream.send(message).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        emit_close(&core, &request, frame.as_ref());
                        return;
                    }
                    // Pings are answered by the protocol layer.
                    _ => {}
                }
            }
            emit_close(&core, &request, None);
        }
        WebSocketStep::Listen => {
            while let Some(Ok(message)) = downstream.next().await {
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        emit_message(&core, &request, &message, true);
                    }
                    Message::Close(frame) => {
                        emit_close(&core, &request, frame.as_ref());
                        return;
                    }
                    _ => {}
                }
            }
            emit_close(&core, &request, None);
        }
        WebSocketStep::AcceptAndClose => {
            let _ = downstream.close(None).await;
            emit_close(&core, &request, None);
        }
        WebSocketStep::PassThrough { .. } => {
            let upstream = match upstream {
                Some(upstream) => upstream,
                // The upstream handshake happened before the 101; missing it
                // here means the step changed under us.
                None => {
                    let _ = downstream.close(None).await;
                    return;
                }
            };
            relay(core, request, downstream, upstream).await;
        }
        WebSocketStep::Reject(_) => {
            unreachable!("reject is handled before the upgrade")
        }
    }
}

async fn relay(
    core: Arc<ProxyCore>,
    request: Arc<InterceptedRequest>,
    downstream: ServerWs,
    upstream: ClientWs,
) {
    let (mut down_tx, mut down_rx) = downstream.split();
    let (mut up_tx, mut up_rx) = upstream.split();

    loop {
        tokio::select! {
            from_client = down_rx.next() => {
                match from_client {
                    Some(Ok(message)) => {
                        if matches!(message, Message::Text(_) | Message::Binary(_)) {
                            emit_message(&core, &request, &message, true);
                        }
                        if let Message::Close(frame) = &message {
                            emit_close(&core, &request, frame.as_ref());
                            let _ = up_tx.send(message).await;
                            return;
                        }
                        if up_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    _ => {
                        emit_close(&core, &request, None);
                        let _ = up_tx.close().await;
                        return;
                    }
                }
            }
            from_upstream = up_rx.next() => {
                match from_upstream {
                    Some(Ok(message)) => {
                        if matches!(message, Message::Text(_) | Message::Binary(_)) {
                            emit_message(&core, &request, &message, false);
                        }
                        if let Message::Close(frame) = &message {
                            emit_close(&core, &request, frame.as_ref());
                            let _ = down_tx.send(message).await;
                            return;
                        }
                        if down_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    _ => {
                        emit_close(&core, &request, None);
                        let _ = down_tx.close().await;
                        return;
                    }
                }
            }
        }
    }
}

fn emit_message(
    core: &Arc<ProxyCore>,
    request: &Arc<InterceptedRequest>,
    message: &Message,
    received: bool,
) {
    let is_text = message.is_text();
    let data: Bytes = match message {
        Message::Text(text) => Bytes::from(text.to_string()),
        Message::Binary(data) => data.clone(),
        _ => return,
    };

    let event = if received {
        ProxyEvent::WebSocketMessageReceived {
            request_id: request.id().to_string(),
            data,
            is_text,
        }
    } else {
        ProxyEvent::WebSocketMessageSent {
            request_id: request.id().to_string(),
            data,
            is_text,
        }
    };
    core.bus.emit(event);
}

fn emit_close(
    core: &Arc<ProxyCore>,
    request: &Arc<InterceptedRequest>,
    frame: Option<&tokio_tungstenite::tungstenite::protocol::CloseFrame>,
) {
    let (code, reason) = match frame {
        Some(frame) => (
            Some(u16::from(frame.code)),
            frame.reason.to_string(),
        ),
        None => (None, String::new()),
    };

    core.bus.emit(ProxyEvent::WebSocketClose {
        request_id: request.id().to_string(),
        code,
        reason,
    });
}
