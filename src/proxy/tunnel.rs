//! CONNECT tunnel routing and byte relay

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Port whose tunnels are terminated by the TLS front-end
pub const HTTPS_PORT: u16 = 443;

/// Decides where a CONNECT tunnel lands and relays its bytes.
///
/// Routing goes by target port only: 443 reaches the TLS front-end, every
/// other port reaches the plain front-end. TLS on a non-standard port is
/// therefore not intercepted.
#[derive(Debug, Clone)]
pub struct TunnelRouter {
    plain_addr: SocketAddr,
    tls_addr: SocketAddr,
    idle_timeout: Option<Duration>,
}

impl TunnelRouter {
    pub fn new(plain_addr: SocketAddr, tls_addr: SocketAddr) -> Self {
        Self {
            plain_addr,
            tls_addr,
            idle_timeout: None,
        }
    }

    /// Close both legs after this long without traffic in either direction
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Loopback listener for a CONNECT target port
    pub fn route(&self, port: u16) -> SocketAddr {
        if port == HTTPS_PORT {
            self.tls_addr
        } else {
            self.plain_addr
        }
    }

    /// Relay `client` to the listener chosen for `port` until either side closes
    pub async fn run<S>(&self, mut client: S, host: &str, port: u16) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = self.route(port);
        let mut loopback = TcpStream::connect(target).await.map_err(|e| {
            Error::proxy(format!("Failed to reach local listener {}: {}", target, e))
        })?;

        tracing::debug!(host = %host, port = %port, target = %target, "Tunnel established");

        let (to_target, to_client) = match self.idle_timeout {
            Some(idle) => relay_with_idle_timeout(&mut client, &mut loopback, idle).await?,
            None => tokio::io::copy_bidirectional(&mut client, &mut loopback).await?,
        };

        tracing::debug!(
            host = %host,
            sent = to_target,
            received = to_client,
            "Tunnel closed"
        );
        Ok(())
    }
}

/// Copy in both directions, giving up once neither side has sent anything for `idle`
async fn relay_with_idle_timeout<A, B>(
    a: &mut A,
    b: &mut B,
    idle: Duration,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    enum Read {
        FromA(usize),
        FromB(usize),
    }

    let mut buf_a = vec![0u8; 16 * 1024];
    let mut buf_b = vec![0u8; 16 * 1024];
    let (mut a_to_b, mut b_to_a) = (0u64, 0u64);

    loop {
        let read = tokio::time::timeout(idle, async {
            tokio::select! {
                n = a.read(&mut buf_a) => n.map(Read::FromA),
                n = b.read(&mut buf_b) => n.map(Read::FromB),
            }
        })
        .await;

        match read {
            Err(_) => {
                tracing::debug!(idle = ?idle, "Tunnel idle, closing");
                break;
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Read::FromA(0))) | Ok(Ok(Read::FromB(0))) => break,
            Ok(Ok(Read::FromA(n))) => {
                b.write_all(&buf_a[..n]).await?;
                a_to_b += n as u64;
            }
            Ok(Ok(Read::FromB(n))) => {
                a.write_all(&buf_b[..n]).await?;
                b_to_a += n as u64;
            }
        }
    }

    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn router() -> TunnelRouter {
        TunnelRouter::new(
            "127.0.0.1:3344".parse().unwrap(),
            "127.0.0.1:3355".parse().unwrap(),
        )
    }

    #[test]
    fn test_https_port_routes_to_tls_listener() {
        assert_eq!(router().route(443), "127.0.0.1:3355".parse().unwrap());
    }

    #[test]
    fn test_other_ports_route_to_plain_listener() {
        let router = router();
        for port in [80, 8080, 8443, 3000] {
            assert_eq!(router.route(port), "127.0.0.1:3344".parse().unwrap());
        }
    }

    async fn echo_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_moves_bytes_both_ways() {
        let echo = echo_listener().await;
        let router = TunnelRouter::new(echo, echo);

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move { router.run(proxy_side, "echo.test", 80).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        let finished = tokio::time::timeout(Duration::from_secs(2), relay).await;
        assert!(finished.is_ok(), "tunnel outlived its client");
    }

    #[tokio::test]
    async fn test_idle_tunnel_is_closed() {
        let echo = echo_listener().await;
        let router =
            TunnelRouter::new(echo, echo).with_idle_timeout(Some(Duration::from_millis(50)));

        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move { router.run(proxy_side, "idle.test", 443).await });

        let finished = tokio::time::timeout(Duration::from_secs(2), relay).await;
        assert!(finished.is_ok(), "idle tunnel was not closed");

        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unreachable_listener_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let router = TunnelRouter::new(addr, addr);
        let (_client, proxy_side) = tokio::io::duplex(64);
        assert!(router.run(proxy_side, "gone.test", 80).await.is_err());
    }
}
