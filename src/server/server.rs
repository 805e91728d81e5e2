//! TCP listener setup and the accept loop. Every accepted connection is
//! handed to the dispatcher on its own task.

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot, task::spawn};
use tracing::{error, info, trace};

use crate::server::{
    dispatch::{dispatch, ConnectionContext},
    ProxyCore,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to socket addr {0}: {1}")]
    SocketBindError(SocketAddr, std::io::Error),
    #[error("no free port in range {0}-{1}")]
    NoFreePort(u16, u16),
    #[error("cannot parse socket address: {0}")]
    SocketAddrParseError(#[from] std::net::AddrParseError),
    #[error("cannot obtain local address: {0}")]
    LocalSocketAddrError(std::io::Error),
}

/// Binds the listening socket. An explicit port must be available or the
/// call fails; otherwise the configured range is scanned, skipping ports
/// that are already in use so many parallel starts all succeed.
pub(crate) async fn bind(
    port: Option<u16>,
    port_range: (u16, u16),
    expose: bool,
) -> Result<TcpListener, Error> {
    let host = if expose { "0.0.0.0" } else { "127.0.0.1" };

    if let Some(port) = port {
        let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
        return TcpListener::bind(addr)
            .await
            .map_err(|e| Error::SocketBindError(addr, e));
    }

    let (from, to) = port_range;
    for candidate in from..=to {
        let addr: SocketAddr = format!("{}:{}", host, candidate).parse()?;
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                trace!(port = candidate, "port in use, trying the next one");
                continue;
            }
            Err(err) => return Err(Error::SocketBindError(addr, err)),
        }
    }

    Err(Error::NoFreePort(from, to))
}

/// Runs the accept loop until the shutdown signal fires.
pub(crate) async fn run(
    core: Arc<ProxyCore>,
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp_stream, remote_address)) => {
                        trace!(%remote_address, "new TCP connection");
                        let core = core.clone();
                        spawn(async move {
                            let ctx = ConnectionContext::default();
                            if let Err(err) = dispatch(core, Box::new(tcp_stream), ctx).await {
                                trace!("connection ended with error: {:?}", err);
                            }
                        });
                    }
                    Err(err) => {
                        error!("TCP accept error: {:?}", err);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn explicit_port_that_is_taken_fails_startup() {
        let first = bind(None, (8000, 9000), false).await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let result = bind(Some(taken), (8000, 9000), false).await;
        assert!(matches!(result, Err(Error::SocketBindError(_, _))));
    }

    #[tokio::test]
    async fn range_scan_skips_ports_in_use() {
        // Occupy a port, then ask for a range starting at it.
        let first = bind(None, (18200, 18300), false).await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let second = bind(None, (taken, taken + 50), false).await.unwrap();
        assert_ne!(second.local_addr().unwrap().port(), taken);
    }

    #[tokio::test]
    async fn many_parallel_binds_all_succeed() {
        let mut tasks = Vec::new();
        for _ in 0..10 {
            tasks.push(tokio::spawn(bind(None, (18400, 18600), false)));
        }

        let mut ports = Vec::new();
        let mut held = Vec::new();
        for task in tasks {
            let listener = task.await.unwrap().unwrap();
            ports.push(listener.local_addr().unwrap().port());
            // Keep listeners alive so ports stay taken.
            held.push(listener);
        }

        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 10);
    }
}
