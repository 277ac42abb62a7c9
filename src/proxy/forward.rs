//! Upstream request relay

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::response::ProxyBody;
use crate::error::{Error, Result};
use crate::hooks::{RawRequest, HOP_BY_HOP_HEADERS};

/// Sends intercepted requests to their origin over HTTP/1.1
#[derive(Clone)]
pub struct Forwarder {
    tls_config: Arc<ClientConfig>,
    connect_timeout: Option<Duration>,
    upstream_host_override: Option<String>,
    upstream_port_override: Option<u16>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("connect_timeout", &self.connect_timeout)
            .field("upstream_host_override", &self.upstream_host_override)
            .field("upstream_port_override", &self.upstream_port_override)
            .finish()
    }
}

impl Forwarder {
    pub fn new(tls_config: Arc<ClientConfig>) -> Self {
        Self {
            tls_config,
            connect_timeout: None,
            upstream_host_override: None,
            upstream_port_override: None,
        }
    }

    /// Use a specific TLS config for upstream connections
    pub fn with_tls_config(mut self, tls_config: Arc<ClientConfig>) -> Self {
        self.tls_config = tls_config;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the host for TCP connections (for testing with non-resolvable hostnames).
    /// The original hostname is still used for TLS SNI and the Host header.
    pub fn with_upstream_host_override(mut self, host: String) -> Self {
        self.upstream_host_override = Some(host);
        self
    }

    /// Override the upstream port for all forwarded connections (for testing).
    pub fn with_upstream_port_override(mut self, port: u16) -> Self {
        self.upstream_port_override = Some(port);
        self
    }

    /// Send `request` to the host named in its URI and return the streaming response
    pub async fn forward(&self, request: &RawRequest) -> Result<Response<ProxyBody>> {
        let host = request
            .uri
            .host()
            .ok_or_else(|| Error::invalid_url(format!("{}: missing host", request.uri)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let is_https = request.scheme == "https";
        let port = request
            .uri
            .port_u16()
            .unwrap_or(if is_https { 443 } else { 80 });

        let connect_host = self.upstream_host_override.as_deref().unwrap_or(&host);
        let connect_port = self.upstream_port_override.unwrap_or(port);
        let tcp = self.connect(connect_host, connect_port).await?;

        let upstream_request = build_upstream_request(request, &host, port, is_https)?;

        if is_https {
            let connector = TlsConnector::from(self.tls_config.clone());
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| Error::proxy(format!("Invalid server name '{}': {}", host, e)))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", host, e)))?;
            tracing::debug!(host = %host, "Upstream TLS handshake complete");
            send(tls, upstream_request).await
        } else {
            send(tcp, upstream_request).await
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let connecting = TcpStream::connect(addr.clone());

        let result = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| Error::timeout(format!("connecting to {} after {:?}", addr, limit)))?,
            None => connecting.await,
        };

        result.map_err(|e| Error::proxy(format!("Failed to connect to {}: {}", addr, e)))
    }
}

async fn send<S>(io: S, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| Error::proxy(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                tracing::debug!(error = %e, "Upstream connection error");
            }
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::proxy(format!("Request failed: {}", e)))?;

    Ok(response.map(|body| body.boxed()))
}

/// Rebuild request: relative URI, strip hop-by-hop headers, ensure Host header
fn build_upstream_request(
    request: &RawRequest,
    host: &str,
    port: u16,
    is_https: bool,
) -> Result<Request<Full<Bytes>>> {
    let path_and_query = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder()
        .method(request.method.clone())
        .uri(path_and_query);

    for (name, value) in &request.headers {
        let name_lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_lower) || name == CONTENT_LENGTH || name == HOST {
            continue;
        }
        builder = builder.header(name, value);
    }

    let default_port = if is_https { 443 } else { 80 };
    let authority = match (host.contains(':'), port == default_port) {
        (true, true) => format!("[{}]", host),
        (true, false) => format!("[{}]:{}", host, port),
        (false, true) => host.to_string(),
        (false, false) => format!("{}:{}", host, port),
    };
    let host_value = HeaderValue::from_str(&authority)
        .map_err(|e| Error::proxy(format!("Invalid host '{}': {}", authority, e)))?;
    builder = builder.header(HOST, host_value);

    // hyper adds Content-Length from the body; a rewritten body has no stale one
    builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| Error::proxy(format!("Failed to build request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderMap;
    use hyper::Method;

    fn raw(url: &str, headers: &[(&'static str, &'static str)]) -> RawRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(*value));
        }
        let uri: hyper::Uri = url.parse().unwrap();
        RawRequest {
            scheme: uri.scheme_str().unwrap_or("http").to_string(),
            method: Method::GET,
            uri,
            headers: map,
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_upstream_request_is_origin_form() {
        let request = raw(
            "https://example.com/api/user?id=1",
            &[
                ("host", "example.com"),
                ("proxy-connection", "keep-alive"),
                ("connection", "keep-alive"),
                ("accept", "application/json"),
            ],
        );

        let upstream = build_upstream_request(&request, "example.com", 443, true).unwrap();
        assert_eq!(upstream.uri(), "/api/user?id=1");
        assert_eq!(upstream.headers()[HOST], "example.com");
        assert_eq!(upstream.headers()["accept"], "application/json");
        assert!(upstream.headers().get("proxy-connection").is_none());
        assert!(upstream.headers().get("connection").is_none());
    }

    #[test]
    fn test_host_header_carries_non_default_port() {
        let request = raw("http://localhost:8080/", &[]);
        let upstream = build_upstream_request(&request, "localhost", 8080, false).unwrap();
        assert_eq!(upstream.headers()[HOST], "localhost:8080");
    }

    #[test]
    fn test_stale_content_length_is_dropped() {
        let mut request = raw("http://example.com/", &[("content-length", "100")]);
        request.body = Bytes::from_static(b"short");

        let upstream = build_upstream_request(&request, "example.com", 80, false).unwrap();
        assert!(upstream.headers().get(CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = Forwarder::new(crate::tls::insecure_client_config().unwrap())
            .with_connect_timeout(Some(Duration::from_secs(5)));
        let request = raw(&format!("http://127.0.0.1:{}/", port), &[]);

        let err = forwarder.forward(&request).await.unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));
    }
}
