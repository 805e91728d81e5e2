//! SOCKS v4/4a/5 support: the server-side handshake that unwraps inbound
//! proxy connections, and the client-side v5 CONNECT used when chaining
//! upstream requests through a SOCKS proxy.
//!
//! v5 and v5h share the wire protocol; v5h simply means the client sent a
//! hostname (ATYP 3) instead of resolving locally. Only the CONNECT command
//! is supported; BIND and UDP ASSOCIATE are answered with "command not
//! supported".

use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum Error {
    #[error("SOCKS I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported SOCKS command: {0}")]
    UnsupportedCommand(u8),
    #[error("malformed SOCKS request: {0}")]
    Malformed(String),
    #[error("no acceptable authentication method")]
    NoAcceptableAuth,
    #[error("SOCKS proxy refused the connection (code {0})")]
    Refused(u8),
}

/// The destination negotiated during a server-side handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksDestination {
    pub host: String,
    pub port: u16,
}

impl SocksDestination {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Runs the server side of a SOCKS handshake. On success the stream is
/// positioned at the first byte of the tunneled payload and the negotiated
/// destination is returned for use as the default authority.
pub async fn accept<S>(stream: &mut S) -> Result<SocksDestination, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    match version {
        0x04 => accept_v4(stream).await,
        0x05 => accept_v5(stream).await,
        other => Err(Error::UnsupportedVersion(other)),
    }
}

async fn accept_v4<S>(stream: &mut S) -> Result<SocksDestination, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;

    // USERID, null-terminated.
    read_null_terminated(stream).await?;

    if command != 0x01 {
        // 91: request rejected or failed.
        stream.write_all(&[0x00, 0x5b, 0, 0, 0, 0, 0, 0]).await?;
        return Err(Error::UnsupportedCommand(command));
    }

    // SOCKSv4a marks a hostname destination with 0.0.0.x (x != 0).
    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let name = read_null_terminated(stream).await?;
        String::from_utf8(name).map_err(|_| Error::Malformed("hostname is not UTF-8".into()))?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    // 90: request granted.
    stream.write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0]).await?;

    debug!(host, port, "SOCKSv4 connect accepted");
    Ok(SocksDestination { host, port })
}

async fn accept_v5<S>(stream: &mut S) -> Result<SocksDestination, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method_count = stream.read_u8().await?;
    let mut methods = vec![0u8; method_count as usize];
    stream.read_exact(&mut methods).await?;

    // Only NOAUTH is advertised.
    if !methods.contains(&0x00) {
        stream.write_all(&[0x05, 0xff]).await?;
        return Err(Error::NoAcceptableAuth);
    }
    stream.write_all(&[0x05, 0x00]).await?;

    let version = stream.read_u8().await?;
    if version != 0x05 {
        return Err(Error::UnsupportedVersion(version));
    }
    let command = stream.read_u8().await?;
    let _reserved = stream.read_u8().await?;
    let address_type = stream.read_u8().await?;

    let host = match address_type {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| Error::Malformed("hostname is not UTF-8".into()))?
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            IpAddr::from(ip).to_string()
        }
        other => return Err(Error::Malformed(format!("unknown address type {}", other))),
    };
    let port = stream.read_u16().await?;

    if command != 0x01 {
        // 7: command not supported.
        stream
            .write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Err(Error::UnsupportedCommand(command));
    }

    // Success, bound address left as 0.0.0.0:0.
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;

    debug!(host, port, "SOCKSv5 connect accepted");
    Ok(SocksDestination { host, port })
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let b = stream.read_u8().await?;
        if b == 0 {
            return Ok(out);
        }
        if out.len() > 512 {
            return Err(Error::Malformed("unterminated SOCKS field".into()));
        }
        out.push(b);
    }
}

/// Client side of a SOCKSv5 CONNECT, used for upstream proxy chaining.
/// The destination hostname is sent as-is (v5h style); the proxy resolves it.
pub async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!(host, port, "negotiating SOCKSv5 with upstream proxy");

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(Error::NoAcceptableAuth);
    }

    let mut request = vec![0x05, 0x01, 0x00];
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        request.push(0x01);
        request.extend_from_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            return Err(Error::Malformed("hostname too long".into()));
        }
        request.push(0x03);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(Error::Refused(head[1]));
    }

    // Consume the bound address.
    match head[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut rest = vec![0u8; len + 2];
            stream.read_exact(&mut rest).await?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
        }
        other => return Err(Error::Malformed(format!("unknown address type {}", other))),
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn socks4_ip_destination() {
        let (mut client, mut server) = duplex(1024);

        let handshake = tokio::spawn(async move { accept(&mut server).await });

        // VN=4, CD=1, port 443, 192.0.2.10, empty userid.
        client
            .write_all(&[0x04, 0x01, 0x01, 0xbb, 192, 0, 2, 10, 0x00])
            .await
            .unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x00);
        assert_eq!(reply[1], 0x5a);

        let destination = handshake.await.unwrap().unwrap();
        assert_eq!(destination.host, "192.0.2.10");
        assert_eq!(destination.port, 443);
    }

    #[tokio::test]
    async fn socks4a_hostname_destination() {
        let (mut client, mut server) = duplex(1024);
        let handshake = tokio::spawn(async move { accept(&mut server).await });

        let mut req = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        req.extend_from_slice(b"user\0");
        req.extend_from_slice(b"example.com\0");
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5a);

        let destination = handshake.await.unwrap().unwrap();
        assert_eq!(destination.host, "example.com");
        assert_eq!(destination.port, 80);
    }

    #[tokio::test]
    async fn socks5_hostname_destination() {
        let (mut client, mut server) = duplex(1024);
        let handshake = tokio::spawn(async move { accept(&mut server).await });

        // Greeting offering NOAUTH.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        let destination = handshake.await.unwrap().unwrap();
        assert_eq!(destination.host, "example.com");
        assert_eq!(destination.port, 8080);
    }

    #[tokio::test]
    async fn socks5_bind_is_refused_as_unsupported() {
        let (mut client, mut server) = duplex(1024);
        let handshake = tokio::spawn(async move { accept(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // CMD=2 (BIND)
        let mut req = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);

        assert!(matches!(
            handshake.await.unwrap(),
            Err(Error::UnsupportedCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn client_connect_round_trips_against_our_server() {
        let (mut client, mut server) = duplex(1024);
        let handshake = tokio::spawn(async move { accept(&mut server).await });

        connect(&mut client, "ws.example", 443).await.unwrap();

        let destination = handshake.await.unwrap().unwrap();
        assert_eq!(destination.host, "ws.example");
        assert_eq!(destination.port, 443);
    }
}
