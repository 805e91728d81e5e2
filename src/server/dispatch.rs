//! The multi-protocol connection dispatcher. Takes an abstract byte stream
//! plus its tunnel context, peeks at the first bytes without consuming them,
//! and routes the stream to the SOCKS, TLS, HTTP or raw-passthrough handler.
//! Tunnels re-enter the dispatcher, so arbitrarily nested envelopes
//! (SOCKS-over-TLS-over-CONNECT) unwrap naturally.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::{
    common::data::ProxyEvent,
    server::{handler, sniff, socks, tls, Io, ProxyCore},
};

// Cap on how much of a ClientHello we buffer while hunting for the SNI.
const MAX_PEEK: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS accept error: {0}")]
    TlsAccept(String),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] tls::Error),
    #[error("SOCKS handshake error: {0}")]
    Socks(#[from] socks::Error),
    #[error("HTTP handling error: {0}")]
    Handler(#[from] handler::Error),
}

/// What the dispatcher knows about the envelope a stream arrived in.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionContext {
    /// `https` once a TLS layer has been unwrapped.
    pub tls: bool,
    /// The destination negotiated by the enclosing CONNECT or SOCKS
    /// handshake, used as the default authority for origin-form requests
    /// and as the raw-passthrough target.
    pub default_authority: Option<String>,
    pub inside_tunnel: bool,
}

impl ConnectionContext {
    pub(crate) fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}

/// Dispatches one stream. Boxed so tunnel unwrapping can recurse.
pub(crate) fn dispatch(
    core: Arc<ProxyCore>,
    stream: Box<dyn Io>,
    ctx: ConnectionContext,
) -> BoxFuture<'static, Result<(), Error>> {
    async move {
        let mut stream = stream;
        let mut peeked = Vec::with_capacity(1024);

        // First read: enough to classify.
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            trace!("connection closed before any bytes arrived");
            return Ok(());
        }
        peeked.extend_from_slice(&chunk[..n]);

        let protocol = sniff::classify(&peeked, core.config.socks_enabled);
        trace!(?protocol, peeked = peeked.len(), "classified connection");

        match protocol {
            sniff::Protocol::Socks4 | sniff::Protocol::Socks5 => {
                let mut unwrapped = PrefixedStream::new(Bytes::from(peeked), stream);
                match socks::accept(&mut unwrapped).await {
                    Ok(destination) => {
                        debug!(authority = destination.authority(), "SOCKS tunnel opened");
                        let next = ConnectionContext {
                            tls: ctx.tls,
                            default_authority: Some(destination.authority()),
                            inside_tunnel: true,
                        };
                        dispatch(core, Box::new(unwrapped), next).await
                    }
                    Err(err) => {
                        core.bus.emit(ProxyEvent::ClientError {
                            error: format!("SOCKS handshake failed: {}", err),
                            raw_head: None,
                        });
                        Err(err.into())
                    }
                }
            }
            sniff::Protocol::Tls => {
                // Buffer the whole first record so the SNI is visible.
                while let Some(record_len) = sniff::tls_record_len(&peeked) {
                    if peeked.len() >= record_len || peeked.len() >= MAX_PEEK {
                        break;
                    }
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    peeked.extend_from_slice(&chunk[..n]);
                }

                let sni = sniff::client_hello_sni(&peeked);
                let unwrapped = PrefixedStream::new(Bytes::from(peeked), stream);

                if !core.config.tls_policy.should_intercept(sni.as_deref()) {
                    let destination = ctx
                        .default_authority
                        .clone()
                        .or_else(|| sni.as_ref().map(|s| format!("{}:443", s)));
                    return match destination {
                        Some(destination) => {
                            debug!(destination, "TLS passthrough, tunneling raw bytes");
                            raw_tunnel(core, Box::new(unwrapped), destination).await
                        }
                        None => Ok(()),
                    };
                }

                let config = tls::server_tls_config(
                    &core.ca,
                    ctx.default_authority.clone(),
                    core.config.min_tls_version,
                    core.config.max_tls_version,
                )?;

                match TlsAcceptor::from(config).accept(unwrapped).await {
                    Ok(tls_stream) => {
                        let next = ConnectionContext {
                            tls: true,
                            default_authority: ctx.default_authority.clone(),
                            inside_tunnel: ctx.inside_tunnel,
                        };
                        dispatch(core, Box::new(tls_stream), next).await
                    }
                    Err(err) => {
                        core.bus.emit(ProxyEvent::TlsClientError {
                            sni,
                            error: err.to_string(),
                        });
                        Err(Error::TlsAccept(err.to_string()))
                    }
                }
            }
            sniff::Protocol::Http => {
                let unwrapped = PrefixedStream::new(Bytes::from(peeked), stream);
                handler::serve_http(core, Box::new(unwrapped), ctx).await?;
                Ok(())
            }
            sniff::Protocol::Unknown => {
                if core.config.unknown_protocol_passthrough && ctx.inside_tunnel {
                    if let Some(destination) = ctx.default_authority.clone() {
                        let unwrapped = PrefixedStream::new(Bytes::from(peeked), stream);
                        return raw_tunnel(core, Box::new(unwrapped), destination).await;
                    }
                }

                core.bus.emit(ProxyEvent::ClientError {
                    error: "unrecognised protocol".to_string(),
                    raw_head: Some(Bytes::from(peeked)),
                });
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = stream.shutdown().await;
                Ok(())
            }
        }
    }
    .boxed()
}

/// Unbuffered bidirectional byte copy to `destination`, with open/close
/// events carrying byte counts and elapsed time.
async fn raw_tunnel(
    core: Arc<ProxyCore>,
    mut stream: Box<dyn Io>,
    destination: String,
) -> Result<(), Error> {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();

    let mut upstream = match TcpStream::connect(&destination).await {
        Ok(s) => s,
        Err(err) => {
            warn!(destination, "raw passthrough connect failed: {}", err);
            let _ = stream.shutdown().await;
            return Err(err.into());
        }
    };

    core.bus.emit(ProxyEvent::RawPassthroughOpened {
        connection_id: connection_id.clone(),
        destination: destination.clone(),
    });

    let result = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;

    let (bytes_up, bytes_down) = result.unwrap_or((0, 0));
    core.bus.emit(ProxyEvent::RawPassthroughClosed {
        connection_id,
        destination,
        bytes_up,
        bytes_down,
        elapsed: started.elapsed(),
    });

    Ok(())
}

/// Replays an already-read prefix before reading from the inner stream.
/// Writes go straight through.
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        PrefixedStream {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            this.offset += to_copy;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
