//! TLS front-end: per-connection certificate selection from SNI

use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;

use super::handler::ProxyHandler;
use super::server::serve_http;
use crate::error::{Error, Result};
use crate::tls::{CertificateStore, DEFAULT_SERVER_NAME};

/// Complete a TLS handshake using the certificate for the client's SNI.
///
/// The ClientHello is read before any certificate is chosen, so a slow
/// generation only stalls this connection.
pub async fn accept_tls(
    stream: TcpStream,
    store: &CertificateStore,
) -> Result<(tokio_rustls::server::TlsStream<TcpStream>, String)> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(|e| Error::tls(format!("Failed to read ClientHello: {}", e)))?;

    let hostname = start
        .client_hello()
        .server_name()
        .unwrap_or(DEFAULT_SERVER_NAME)
        .to_string();

    let config = store.server_config_for_host(&hostname).await?;

    let tls = start
        .into_stream(config)
        .await
        .map_err(|e| Error::tls(format!("Failed to accept TLS from client: {}", e)))?;

    Ok((tls, hostname))
}

/// Serve one connection accepted by the TLS listener
pub async fn serve_tls_connection(
    stream: TcpStream,
    client_addr: String,
    store: Arc<CertificateStore>,
    handler: ProxyHandler,
) {
    let (tls, hostname) = match accept_tls(stream, &store).await {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    tracing::debug!(host = %hostname, "TLS handshake with client complete");
    serve_http(TokioIo::new(tls), client_addr, handler).await;
}
