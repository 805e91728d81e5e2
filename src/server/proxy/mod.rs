//! The passthrough/transform pipeline: forwards a matched request upstream
//! with optional request/response mutation, publishing fine-grained rule
//! events along the way.

pub mod client;
pub mod transform;

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
    common::data::{
        HostHeaderPolicy, HttpVersion, InterceptedRequest, OutboundRequest, OutboundResponse,
        ProxyEvent, RuleEvent,
    },
    server::{
        events::EventBus,
        steps::{ForwardToSpec, PassThroughSpec},
    },
};

#[derive(Error, Debug)]
pub enum Error {
    /// Upstream connection, DNS, TLS or protocol failure; surfaces as 502.
    #[error("{0}")]
    UpstreamError(#[from] client::Error),
    /// Transform failure; surfaces as 500.
    #[error("{0}")]
    TransformError(#[from] transform::Error),
    /// The passthrough destination is this server itself; surfaces as 500.
    #[error("passthrough loop detected: request to {destination} would be routed back to this server")]
    LoopDetected { destination: String },
    #[error("invalid forwarding target: {0}")]
    InvalidTarget(String),
}

impl Error {
    /// The downstream status this failure maps to.
    pub fn status(&self) -> u16 {
        match self {
            Error::UpstreamError(_) => 502,
            Error::TransformError(_) | Error::LoopDetected { .. } | Error::InvalidTarget(_) => 500,
        }
    }
}

/// Executes a `PassThrough` or `ForwardTo` step for `req` and returns the
/// (already response-transformed) upstream response.
pub(crate) async fn execute(
    req: &Arc<InterceptedRequest>,
    rule_id: &str,
    forward_to: Option<&ForwardToSpec>,
    spec: &PassThroughSpec,
    bus: &EventBus,
    local_addr: Option<SocketAddr>,
) -> Result<OutboundResponse, Error> {
    let mut outbound = OutboundRequest {
        method: req.method().to_string(),
        url: req.url().to_string(),
        headers: req.headers().to_vec(),
        body: req.body().to_bytes(),
    };

    if let Some(forward) = forward_to {
        rewrite_origin(&mut outbound, forward)?;
    }

    // Transforms run before the user hook so the hook sees the final URL.
    let mut body_overridden = match &spec.transform_request {
        Some(transform) => transform::apply_request(transform, &mut outbound).await?,
        None => false,
    };

    if let Some(hook) = &spec.before_request {
        let body_before = outbound.body.clone();
        hook(&mut outbound);
        body_overridden = body_overridden || outbound.body != body_before;
    }

    let destination = ConnectInfo::from_url(&outbound.url)?;

    // Forward-proxy requests pointed straight back at us would recurse
    // until the connection pool drains; refuse them instead.
    if forward_to.is_none() {
        if let Some(local) = local_addr {
            if is_loop(&destination, local) {
                return Err(Error::LoopDetected {
                    destination: destination.authority(),
                });
            }
        }
    }

    bus.emit(ProxyEvent::RuleEvent {
        request_id: req.id().to_string(),
        rule_id: rule_id.to_string(),
        event: RuleEvent::PassthroughRequestHead {
            method: outbound.method.clone(),
            url: outbound.url.clone(),
            headers: outbound.headers.clone(),
        },
    });
    bus.emit(ProxyEvent::RuleEvent {
        request_id: req.id().to_string(),
        rule_id: rule_id.to_string(),
        event: RuleEvent::PassthroughRequestBody {
            overridden: body_overridden,
            raw_body: body_overridden.then(|| outbound.body.clone()),
        },
    });

    let prefer_h2 = req.version() == HttpVersion::Http2;
    let target = client::ConnectTarget::from_url(&outbound.url, prefer_h2)?;
    let proxy = client::resolve_proxy(spec.proxy.as_ref(), &target.host, target.port);

    debug!(
        request_id = req.id(),
        url = outbound.url,
        proxied = proxy.is_some(),
        "sending request upstream"
    );

    let stream = client::open_stream(&target, &spec.tls, proxy).await?;
    let mut response = client::send_request(stream, &outbound).await?;

    // Upstream-perspective events fire before response transforms touch
    // anything.
    bus.emit(ProxyEvent::RuleEvent {
        request_id: req.id().to_string(),
        rule_id: rule_id.to_string(),
        event: RuleEvent::PassthroughResponseHead {
            status: response.status,
            headers: response.headers.clone(),
        },
    });
    let upstream_body = response.body.clone();

    let mut response_overridden = match &spec.transform_response {
        Some(transform) => transform::apply_response(transform, &mut response).await?,
        None => false,
    };

    if let Some(hook) = &spec.before_response {
        let body_before = response.body.clone();
        hook(&mut response);
        response_overridden = response_overridden || response.body != body_before;
    }

    bus.emit(ProxyEvent::RuleEvent {
        request_id: req.id().to_string(),
        rule_id: rule_id.to_string(),
        event: RuleEvent::PassthroughResponseBody {
            overridden: response_overridden,
            raw_body: Some(upstream_body),
        },
    });

    Ok(response)
}

struct ConnectInfo {
    host: String,
    port: u16,
}

impl ConnectInfo {
    fn from_url(url: &str) -> Result<Self, Error> {
        let parsed = Url::parse(url).map_err(|e| Error::InvalidTarget(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidTarget(format!("no host in {}", url)))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });
        Ok(ConnectInfo { host, port })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn is_loop(destination: &ConnectInfo, local: SocketAddr) -> bool {
    if destination.port != local.port() {
        return false;
    }

    if let Ok(ip) = destination.host.parse::<std::net::IpAddr>() {
        return ip == local.ip() || (ip.is_loopback() && local.ip().is_loopback())
            || local.ip().is_unspecified();
    }

    destination.host.eq_ignore_ascii_case("localhost")
        && (local.ip().is_loopback() || local.ip().is_unspecified())
}

/// Rewrites scheme and authority to the forwarding target, preserving path
/// and query, and applies the configured host-header policy.
fn rewrite_origin(outbound: &mut OutboundRequest, forward: &ForwardToSpec) -> Result<(), Error> {
    let target = Url::parse(&forward.target)
        .map_err(|e| Error::InvalidTarget(format!("{}: {}", forward.target, e)))?;
    let mut url =
        Url::parse(&outbound.url).map_err(|e| Error::InvalidTarget(e.to_string()))?;

    let scheme = target.scheme().to_string();
    let host = target
        .host_str()
        .ok_or_else(|| Error::InvalidTarget(format!("no host in {}", forward.target)))?
        .to_string();

    url.set_scheme(&scheme)
        .map_err(|_| Error::InvalidTarget(format!("cannot use scheme {}", scheme)))?;
    url.set_host(Some(&host))
        .map_err(|e| Error::InvalidTarget(e.to_string()))?;
    url.set_port(target.port())
        .map_err(|_| Error::InvalidTarget("cannot set port".to_string()))?;

    outbound.url = url.to_string();

    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    };
    match &forward.host_header {
        HostHeaderPolicy::Update => {
            crate::common::util::set_header(&mut outbound.headers, "host", &authority)
        }
        HostHeaderPolicy::Preserve => {}
        HostHeaderPolicy::Custom(value) => {
            crate::common::util::set_header(&mut outbound.headers, "host", value)
        }
    }

    Ok(())
}
