//! HTTP request handler for the proxy

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::HOST;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;

use super::forward::Forwarder;
use super::response::{
    bad_request, connect_established, error_response, finished_response,
    processing_failure_response, ProxyBody,
};
use super::tunnel::TunnelRouter;
use crate::error::{Error, Result};
use crate::hooks::{HookPipeline, RawRequest, RequestOutcome};

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontEnd {
    Plain,
    Tls,
}

/// Main proxy request handler, cloned into every connection
#[derive(Clone)]
pub struct ProxyHandler {
    pipeline: Arc<HookPipeline>,
    forwarder: Arc<Forwarder>,
    router: Arc<TunnelRouter>,
    front_end: FrontEnd,
    log_requests: bool,
    log_responses: bool,
}

impl ProxyHandler {
    pub fn new(
        pipeline: Arc<HookPipeline>,
        forwarder: Arc<Forwarder>,
        router: Arc<TunnelRouter>,
    ) -> Self {
        Self {
            pipeline,
            forwarder,
            router,
            front_end: FrontEnd::Plain,
            log_requests: true,
            log_responses: true,
        }
    }

    pub fn for_front_end(mut self, front_end: FrontEnd) -> Self {
        self.front_end = front_end;
        self
    }

    pub fn with_traffic_logging(mut self, log_requests: bool, log_responses: bool) -> Self {
        self.log_requests = log_requests;
        self.log_responses = log_responses;
        self
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
        // Handle CONNECT requests (tunneling)
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }

        Ok(self.intercept(req).await)
    }

    fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let host = req.uri().host().map(str::to_string);
        let port = req.uri().port_u16();

        let (host, port) = match (host, port) {
            (Some(host), Some(port)) => (host, port),
            _ => {
                tracing::warn!(uri = %req.uri(), "CONNECT without host:port");
                return bad_request("CONNECT target must be host:port");
            }
        };

        tracing::debug!(host = %host, port = %port, "CONNECT request");

        // Get the upgrade future before we move the request
        let upgrade = hyper::upgrade::on(req);
        let router = self.router.clone();

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(host = %host, error = %e, "Failed to upgrade connection");
                    return;
                }
            };

            if let Err(e) = router.run(TokioIo::new(upgraded), &host, port).await {
                // Don't log connection closed errors
                let err_str = e.to_string();
                if err_str.contains("connection closed") || err_str.contains("reset") {
                    tracing::debug!(host = %host, error = %e, "Tunnel ended");
                } else {
                    tracing::error!(host = %host, error = %e, "Tunnel error");
                }
            }
        });

        connect_established()
    }

    async fn intercept(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let request = match buffer_request(req, self.front_end).await {
            Ok(request) => request,
            Err(e @ Error::InvalidUrl(_)) => return bad_request(&e.to_string()),
            Err(e) => return error_response(&e.to_string()),
        };

        let method = request.method.clone();
        let url = request.url();
        if self.log_requests {
            tracing::info!(method = %method, url = %url, "Request");
        }

        let request = match self.pipeline.process_request(request).await {
            Ok(RequestOutcome::Forward(request)) => request,
            Ok(RequestOutcome::Respond(response)) => {
                if self.log_responses {
                    tracing::info!(
                        method = %method,
                        url = %url,
                        status = response.status().as_u16(),
                        "Answered by middleware"
                    );
                }
                return finished_response(response);
            }
            Err(e) => {
                tracing::warn!(method = %method, url = %url, error = %e, "Request rejected");
                return error_response(&e.to_string());
            }
        };

        let upstream = match self.forwarder.forward(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(url = %request.uri, error = %e, "Forwarding error");
                return error_response(&e.to_string());
            }
        };

        match self.pipeline.process_response(upstream, &request).await {
            Ok(response) => {
                if self.log_responses {
                    tracing::info!(
                        method = %method,
                        url = %url,
                        status = response.status().as_u16(),
                        "Response"
                    );
                }
                response
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Response processing failed");
                processing_failure_response(&e)
            }
        }
    }
}

/// Buffer a request and resolve its absolute URL.
///
/// The TLS front-end always yields `https`. On the plain front-end an
/// absolute request URI keeps its scheme; origin-form requests arriving
/// through a tunnel are `http`.
pub async fn buffer_request<B>(req: Request<B>, front_end: FrontEnd) -> Result<RawRequest>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();

    let scheme = match front_end {
        FrontEnd::Tls => "https".to_string(),
        FrontEnd::Plain => parts.uri.scheme_str().unwrap_or("http").to_string(),
    };

    let authority = match parts.uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_url(format!("{}: no host", parts.uri)))?,
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri: Uri = format!("{}://{}{}", scheme, authority, path_and_query)
        .parse()
        .map_err(|e| Error::invalid_url(format!("{}{}: {}", authority, path_and_query, e)))?;

    let body = body
        .collect()
        .await
        .map_err(|e| Error::proxy(format!("Failed to read request body: {}", e)))?
        .to_bytes();

    Ok(RawRequest {
        scheme,
        method: parts.method,
        uri,
        headers: parts.headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn request(uri: &str, host: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(Full::new(Bytes::from_static(b"payload"))).unwrap()
    }

    #[tokio::test]
    async fn test_tls_front_end_is_https() {
        let raw = buffer_request(request("/api/user", Some("example.com")), FrontEnd::Tls)
            .await
            .unwrap();
        assert_eq!(raw.scheme, "https");
        assert_eq!(raw.url(), "https://example.com/api/user");
        assert_eq!(raw.body, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_absolute_uri_keeps_scheme() {
        let raw = buffer_request(
            request("http://example.com:8080/path?q=1", None),
            FrontEnd::Plain,
        )
        .await
        .unwrap();
        assert_eq!(raw.scheme, "http");
        assert_eq!(raw.url(), "http://example.com:8080/path?q=1");
    }

    #[tokio::test]
    async fn test_tunneled_plain_request_is_http() {
        let raw = buffer_request(request("/", Some("localhost:3000")), FrontEnd::Plain)
            .await
            .unwrap();
        assert_eq!(raw.url(), "http://localhost:3000/");
    }

    #[tokio::test]
    async fn test_missing_host_is_invalid() {
        let err = buffer_request(request("/", None), FrontEnd::Plain)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }
}
