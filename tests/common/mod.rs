//! Test infrastructure for end-to-end proxy tests.
#![allow(dead_code)]

use bytes::Bytes;
use erra::hooks::{HookFuture, HookPipeline};
use erra::tls::{CertificateAuthority, GeneratedCa};
use erra::{ApiRecord, Breakpoint, BreakpointError, CertificateStore, Config, ProxyServer};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A root CA saved into a tempdir the proxy can load from.
pub struct TestCa {
    pub ca: CertificateAuthority,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub dir: TempDir,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        generated.save_to_dir(dir.path()).unwrap();

        let ca = CertificateAuthority::from_dir(dir.path()).unwrap();
        let cert_der = ca.cert_der().clone();

        Self {
            ca,
            cert_pem: generated.cert_pem,
            cert_der,
            dir,
        }
    }

    pub fn ca_dir(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    /// A ServerConfig for `hostname` signed by this CA, HTTP/1.1 only.
    pub fn server_tls_config(&self, hostname: &str) -> Arc<ServerConfig> {
        let leaf = self.ca.issue_leaf(hostname, 30).unwrap();
        let cert_chain = vec![leaf.cert_der.clone(), self.cert_der.clone()];
        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(cert_chain, leaf.private_key_der())
        .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

// ---------------------------------------------------------------------------
// TestUpstream: a tiny HTTPS server
// ---------------------------------------------------------------------------

pub type UpstreamHandler =
    Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync + 'static>;

pub type UpstreamResponse = std::pin::Pin<
    Box<
        dyn std::future::Future<
                Output = std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>,
            > + Send,
    >,
>;

/// A test HTTPS upstream server.
pub struct TestUpstream {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    /// Start an upstream presenting a certificate for `hostname`.
    pub async fn start_for_host(ca: &TestCa, hostname: &str, handler: UpstreamHandler) -> Self {
        let acceptor = TlsAcceptor::from(ca.server_tls_config(hostname));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };

                        let acceptor = acceptor.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(_) => return,
                            };
                            let service = service_fn(move |req: Request<Incoming>| {
                                let handler = handler.clone();
                                handler(req)
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(tls_stream), service)
                                .await;
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn boxed(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

/// An upstream handler that always answers 200 with the given body and content type.
pub fn static_handler(content_type: &'static str, body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type)
                .header("X-Upstream", "yes")
                .body(boxed(body))
                .unwrap())
        })
    })
}

/// An upstream handler that echoes the request line, headers and body back.
pub fn echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let method = req.method().to_string();
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();

            let mut header_lines = Vec::new();
            for (name, value) in req.headers().iter() {
                header_lines.push(format!("{}: {}", name, value.to_str().unwrap_or("?")));
            }

            let body = req.into_body().collect().await?.to_bytes();

            let text = format!(
                "method={}\npath={}\n{}\n\n{}",
                method,
                path,
                header_lines.join("\n"),
                String::from_utf8_lossy(&body)
            );

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(boxed(text))
                .unwrap())
        })
    })
}

// ---------------------------------------------------------------------------
// ScriptedBreakpoint: a breakpoint driven by closures
// ---------------------------------------------------------------------------

pub type RecordEdit =
    Arc<dyn Fn(ApiRecord) -> Result<ApiRecord, BreakpointError> + Send + Sync + 'static>;

/// Breakpoint that applies closures to records and counts its invocations.
#[derive(Clone)]
pub struct ScriptedBreakpoint {
    on_request: RecordEdit,
    on_response: RecordEdit,
    delay: Duration,
    pub request_calls: Arc<AtomicUsize>,
    pub response_calls: Arc<AtomicUsize>,
}

impl ScriptedBreakpoint {
    pub fn pass_through() -> Self {
        Self {
            on_request: Arc::new(Ok::<ApiRecord, BreakpointError>),
            on_response: Arc::new(Ok::<ApiRecord, BreakpointError>),
            delay: Duration::ZERO,
            request_calls: Arc::new(AtomicUsize::new(0)),
            response_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_request(
        mut self,
        edit: impl Fn(ApiRecord) -> Result<ApiRecord, BreakpointError> + Send + Sync + 'static,
    ) -> Self {
        self.on_request = Arc::new(edit);
        self
    }

    pub fn on_response(
        mut self,
        edit: impl Fn(ApiRecord) -> Result<ApiRecord, BreakpointError> + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Arc::new(edit);
        self
    }

    /// Sleep this long before answering each response breakpoint.
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests_seen(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn responses_seen(&self) -> usize {
        self.response_calls.load(Ordering::SeqCst)
    }

    pub fn pipeline(&self) -> HookPipeline {
        HookPipeline::default().with_breakpoint(Arc::new(self.clone()))
    }
}

impl Breakpoint for ScriptedBreakpoint {
    fn apply_request_breakpoint(
        &self,
        record: ApiRecord,
    ) -> HookFuture<'static, Result<ApiRecord, BreakpointError>> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.on_request)(record);
        Box::pin(async move { result })
    }

    fn apply_response_breakpoint(
        &self,
        record: ApiRecord,
    ) -> HookFuture<'static, Result<ApiRecord, BreakpointError>> {
        self.response_calls.fetch_add(1, Ordering::SeqCst);
        let edit = self.on_response.clone();
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            edit(record)
        })
    }
}

// ---------------------------------------------------------------------------
// TestProxy: wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub plain: SocketAddr,
    pub tls: SocketAddr,
    pub store: Arc<CertificateStore>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

/// How the proxy reaches upstream servers in a test
#[derive(Debug, Clone, Default)]
pub struct UpstreamTarget {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl UpstreamTarget {
    /// Send every forwarded connection to 127.0.0.1:`port`, whatever the URL says.
    pub fn loopback(port: u16) -> Self {
        Self {
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
        }
    }

    /// Connect to the real host and port of each URL.
    pub fn direct() -> Self {
        Self::default()
    }
}

impl TestProxy {
    pub async fn start(ca: &TestCa, pipeline: HookPipeline, upstream: UpstreamTarget) -> Self {
        Self::start_with_config(Config::minimal(ca.ca_dir()), pipeline, upstream).await
    }

    pub async fn start_with_config(
        mut config: Config,
        pipeline: HookPipeline,
        upstream: UpstreamTarget,
    ) -> Self {
        config.logging.log_requests = false;

        let mut server = ProxyServer::new(config).unwrap().with_pipeline(pipeline);
        if let Some(host) = upstream.host {
            server = server.with_upstream_host_override(host);
        }
        if let Some(port) = upstream.port {
            server = server.with_upstream_port_override(port);
        }

        let store = server.certificate_store().clone();
        let addresses = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self {
            plain: addresses.plain,
            tls: addresses.tls,
            store,
            shutdown_tx,
        }
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// test_client: reqwest client that uses the proxy and trusts the test CA
// ---------------------------------------------------------------------------

/// A reqwest client that routes every request through the proxy's plain
/// front-end and trusts the test CA.
pub fn test_client(proxy: &TestProxy, ca: &TestCa) -> reqwest::Client {
    let proxy_url = format!("http://{}", proxy.plain);
    let proxy = reqwest::Proxy::all(&proxy_url).unwrap();

    let ca_cert = reqwest::tls::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap();

    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_cert)
        .http1_only()
        .build()
        .unwrap()
}
