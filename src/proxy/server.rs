//! Main proxy server

use hyper::rt::{Read, Write};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;

use super::forward::Forwarder;
use super::handler::{FrontEnd, ProxyHandler};
use super::tls_listener::serve_tls_connection;
use super::tunnel::TunnelRouter;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hooks::HookPipeline;
use crate::tls::{insecure_client_config, CertificateAuthority, CertificateStore};

/// The addresses the two front-ends are listening on after bind()
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddresses {
    pub plain: SocketAddr,
    pub tls: SocketAddr,
}

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    store: Arc<CertificateStore>,
    pipeline: Arc<HookPipeline>,
    forwarder: Forwarder,
    listeners: Option<(TcpListener, TcpListener)>,
    addresses: Option<BoundAddresses>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration.
    ///
    /// Fails if the root CA cannot be read from `proxy.ca_dir`.
    pub fn new(config: Config) -> Result<Self> {
        let ca = CertificateAuthority::from_files(
            config.proxy.ca_cert_path(),
            config.proxy.ca_key_path(),
        )?;
        let store = Arc::new(CertificateStore::with_cache(
            ca,
            config.certificates.cache_capacity,
            config.certificates.cache_ttl(),
            config.certificates.leaf_validity_days,
        ));

        Self::with_components(config, store, HookPipeline::default())
    }

    /// Create a server with an existing certificate store and hook pipeline
    pub fn with_components(
        config: Config,
        store: Arc<CertificateStore>,
        pipeline: HookPipeline,
    ) -> Result<Self> {
        let pipeline = pipeline.with_breakpoint_timeout(config.timeouts.breakpoint());
        let forwarder = Forwarder::new(insecure_client_config()?)
            .with_connect_timeout(config.timeouts.upstream_connect());

        Ok(Self {
            config,
            store,
            pipeline: Arc::new(pipeline),
            forwarder,
            listeners: None,
            addresses: None,
        })
    }

    /// Replace the hook pipeline (middlewares, record builder, breakpoint engine)
    pub fn with_pipeline(mut self, pipeline: HookPipeline) -> Self {
        let timeout = self.config.timeouts.breakpoint();
        self.pipeline = Arc::new(pipeline.with_breakpoint_timeout(timeout));
        self
    }

    /// Override the upstream port for all forwarded connections (for testing).
    pub fn with_upstream_port_override(mut self, port: u16) -> Self {
        self.forwarder = self.forwarder.with_upstream_port_override(port);
        self
    }

    /// Override the upstream host for TCP connections (for testing with non-resolvable hostnames).
    /// The original hostname is still used for TLS SNI.
    pub fn with_upstream_host_override(mut self, host: String) -> Self {
        self.forwarder = self.forwarder.with_upstream_host_override(host);
        self
    }

    /// Use a specific TLS config for upstream connections
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.forwarder = self.forwarder.with_tls_config(config);
        self
    }

    pub fn certificate_store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let addresses = self.bind().await?;
        tracing::info!(
            plain = %addresses.plain,
            tls = %addresses.tls,
            "Proxy server listening"
        );
        self.serve(shutdown).await
    }

    /// Bind both listeners and return their addresses.
    ///
    /// Useful when binding to port 0 to discover the assigned ports.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<BoundAddresses> {
        let host = self.config.proxy.bind_host.clone();
        let plain = bind_listener(&host, self.config.proxy.http_port).await?;
        let tls = bind_listener(&host, self.config.proxy.https_port).await?;

        let addresses = BoundAddresses {
            plain: local_addr(&plain)?,
            tls: local_addr(&tls)?,
        };

        self.listeners = Some((plain, tls));
        self.addresses = Some(addresses);
        Ok(addresses)
    }

    /// Serve connections using the previously bound listeners, with graceful shutdown
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let (plain_listener, tls_listener) = self
            .listeners
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;
        let addresses = self
            .addresses
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;

        let router = TunnelRouter::new(loopback(addresses.plain), loopback(addresses.tls))
            .with_idle_timeout(self.config.timeouts.tunnel_idle());

        let handler = ProxyHandler::new(
            self.pipeline.clone(),
            Arc::new(self.forwarder.clone()),
            Arc::new(router),
        )
        .with_traffic_logging(
            self.config.logging.log_requests,
            self.config.logging.log_responses,
        );
        let tls_handler = handler.clone().for_front_end(FrontEnd::Tls);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = plain_listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    let handler = handler.clone();
                    tokio::spawn(serve_http(
                        TokioIo::new(stream),
                        client_addr.to_string(),
                        handler,
                    ));
                }
                result = tls_listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept TLS connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New TLS connection");
                    tokio::spawn(serve_tls_connection(
                        stream,
                        client_addr.to_string(),
                        self.store.clone(),
                        tls_handler.clone(),
                    ));
                }
            }
        }
    }
}

/// Serve HTTP/1.1 on one connection until it closes
pub(crate) async fn serve_http<I>(io: I, client_addr: String, handler: ProxyHandler)
where
    I: Read + Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.handle(req).await }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        let err_str = e.to_string();
        if !err_str.contains("connection closed") && !err_str.contains("early eof") {
            tracing::debug!(client = %client_addr, error = %e, "Connection error");
        }
    }
}

async fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| Error::proxy(format!("Failed to bind to {}:{}: {}", host, port, e)))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))
}

/// Address tunnels use to reach a listener bound to `addr`
fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_replaces_wildcard() {
        assert_eq!(
            loopback("0.0.0.0:3344".parse().unwrap()),
            "127.0.0.1:3344".parse().unwrap()
        );
        assert_eq!(
            loopback("[::]:3355".parse().unwrap()),
            "[::1]:3355".parse().unwrap()
        );
        assert_eq!(
            loopback("192.168.1.5:3344".parse().unwrap()),
            "192.168.1.5:3344".parse().unwrap()
        );
    }

    #[test]
    fn test_missing_ca_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::minimal(dir.path().to_string_lossy().to_string());
        let err = ProxyServer::new(config).err().unwrap();
        assert!(err.to_string().contains("erra.crt.pem"));
    }
}
