//! Ordered request and response processing

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::response::Parts;
use hyper::{Method, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;

use super::context::ProxyContext;
use super::defaults::{DefaultRecordBuilder, PassThroughBreakpoint};
use super::record::{
    body_to_bytes, merge_headers, ApiRecord, RawRequest, RawResponse, RecordHeaders,
    RecordRequest, RecordResponse,
};
use super::{is_text_body, Breakpoint, BreakpointError, HookFuture, Middleware, RecordBuilder};
use crate::error::{Error, Result};
use crate::proxy::{full_body, ProxyBody};

/// What to do with a request once the request phase is over
#[derive(Debug)]
pub enum RequestOutcome {
    /// Send this request upstream
    Forward(RawRequest),
    /// A middleware answered; nothing goes upstream
    Respond(Response<Bytes>),
}

/// The hook pipeline shared by every connection
pub struct HookPipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    records: Arc<dyn RecordBuilder>,
    breakpoint: Arc<dyn Breakpoint>,
    breakpoint_timeout: Option<Duration>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("middlewares", &self.middlewares.len())
            .field("breakpoint_timeout", &self.breakpoint_timeout)
            .finish()
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new(Arc::new(DefaultRecordBuilder), Arc::new(PassThroughBreakpoint))
    }
}

impl HookPipeline {
    pub fn new(records: Arc<dyn RecordBuilder>, breakpoint: Arc<dyn Breakpoint>) -> Self {
        Self {
            middlewares: Vec::new(),
            records,
            breakpoint,
            breakpoint_timeout: None,
        }
    }

    /// Append a middleware; middlewares run in the order they were registered
    pub fn register(&mut self, middleware: impl Middleware) {
        self.middlewares.push(Arc::new(middleware));
    }

    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.register(middleware);
        self
    }

    pub fn with_breakpoint(mut self, breakpoint: Arc<dyn Breakpoint>) -> Self {
        self.breakpoint = breakpoint;
        self
    }

    pub fn with_record_builder(mut self, records: Arc<dyn RecordBuilder>) -> Self {
        self.records = records;
        self
    }

    /// Give up on a breakpoint after `timeout`. Timing out counts as a rejection.
    pub fn with_breakpoint_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.breakpoint_timeout = timeout;
        self
    }

    pub fn middleware_count(&self) -> usize {
        self.middlewares.len()
    }

    /// Run middlewares, then the request record and breakpoint.
    ///
    /// Errors are middleware failures or breakpoint rejections; callers answer
    /// them with a 502.
    pub async fn process_request(&self, request: RawRequest) -> Result<RequestOutcome> {
        let mut ctx = ProxyContext::new(request);

        for middleware in &self.middlewares {
            middleware.handle(&mut ctx).await.map_err(|e| match e {
                Error::Middleware(_) => e,
                other => Error::middleware(other.to_string()),
            })?;
            if ctx.is_finished() {
                break;
            }
        }

        let (request, finished) = ctx.into_parts();
        if let Some(response) = finished {
            tracing::debug!(url = %request.uri, "Request finished by middleware");
            return Ok(RequestOutcome::Respond(response));
        }

        if request.is_sourcemap() {
            tracing::debug!(url = %request.uri, "Sourcemap request, skipping breakpoint");
            return Ok(RequestOutcome::Forward(request));
        }

        let Some(record) = self.records.build_request_record(&request) else {
            return Ok(RequestOutcome::Forward(request));
        };

        let returned = self
            .await_breakpoint("request", self.breakpoint.apply_request_breakpoint(record.clone()))
            .await?;

        let request = apply_request_record(request, &record.request, &returned.request)?;
        Ok(RequestOutcome::Forward(request))
    }

    /// Run the response record and breakpoint over an upstream response.
    ///
    /// Text bodies are buffered and may be replaced. Binary bodies stream
    /// through untouched, but the head is only released once the breakpoint
    /// has answered. An error means the response must be replaced by a
    /// failure response.
    pub async fn process_response(
        &self,
        response: Response<ProxyBody>,
        request: &RawRequest,
    ) -> Result<Response<ProxyBody>> {
        if request.is_sourcemap() {
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();

        if !is_text_body(&parts.headers) {
            let raw = RawResponse {
                status: parts.status,
                headers: parts.headers.clone(),
                body: None,
            };
            if let Some(record) = self.records.build_response_record(&raw, request) {
                let returned = self
                    .await_breakpoint(
                        "response",
                        self.breakpoint.apply_response_breakpoint(record.clone()),
                    )
                    .await?;
                apply_response_head(
                    &mut parts,
                    record.response.as_ref(),
                    returned.response.as_ref(),
                )?;
            }
            return Ok(Response::from_parts(parts, body));
        }

        let buffered = body
            .collect()
            .await
            .map_err(|e| Error::proxy(format!("Failed to read upstream body: {}", e)))?
            .to_bytes();

        let raw = RawResponse {
            status: parts.status,
            headers: parts.headers.clone(),
            body: Some(buffered.clone()),
        };

        let mut body = buffered;
        if let Some(record) = self.records.build_response_record(&raw, request) {
            let returned = self
                .await_breakpoint(
                    "response",
                    self.breakpoint.apply_response_breakpoint(record.clone()),
                )
                .await?;

            let before = record.response.as_ref();
            let after = returned.response.as_ref();
            apply_response_head(&mut parts, before, after)?;

            if let Some(after) = after {
                if before.map(|b| &b.body) != Some(&after.body) {
                    body = body_to_bytes(&after.body)?;
                    parts.headers.remove(CONTENT_LENGTH);
                }
            }
        }

        // The body is whole now; hyper derives the length from it
        parts.headers.remove(TRANSFER_ENCODING);

        Ok(Response::from_parts(parts, full_body(body)))
    }

    async fn await_breakpoint(
        &self,
        phase: &str,
        decision: HookFuture<'static, std::result::Result<ApiRecord, BreakpointError>>,
    ) -> Result<ApiRecord> {
        let outcome = match self.breakpoint_timeout {
            Some(limit) => match tokio::time::timeout(limit, decision).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(phase = %phase, timeout = ?limit, "Breakpoint timed out");
                    Err(BreakpointError::new(format!(
                        "{} breakpoint timed out after {:?}",
                        phase, limit
                    )))
                }
            },
            None => decision.await,
        };

        outcome.map_err(|e| Error::breakpoint(e.message()))
    }
}

fn apply_request_record(
    mut request: RawRequest,
    before: &RecordRequest,
    after: &RecordRequest,
) -> Result<RawRequest> {
    if after.method != before.method {
        request.method = Method::from_bytes(after.method.as_bytes())
            .map_err(|e| Error::proxy(format!("Invalid method '{}': {}", after.method, e)))?;
    }

    if after.url != before.url {
        let uri: Uri = after
            .url
            .parse()
            .map_err(|e| Error::invalid_url(format!("{}: {}", after.url, e)))?;
        if uri.authority().is_none() {
            return Err(Error::invalid_url(format!("{}: missing host", after.url)));
        }
        request.scheme = uri.scheme_str().unwrap_or(&request.scheme).to_string();
        request.uri = uri;
    }

    merge_headers(&mut request.headers, &before.headers, &after.headers)?;

    if after.body != before.body {
        request.body = body_to_bytes(&after.body)?;
        request.headers.remove(CONTENT_LENGTH);
    }

    Ok(request)
}

fn apply_response_head(
    parts: &mut Parts,
    before: Option<&RecordResponse>,
    after: Option<&RecordResponse>,
) -> Result<()> {
    let Some(after) = after else {
        return Ok(());
    };

    if after.status != parts.status.as_u16() {
        parts.status = StatusCode::from_u16(after.status)
            .map_err(|e| Error::proxy(format!("Invalid status {}: {}", after.status, e)))?;
    }

    let empty = RecordHeaders::new();
    let before_headers = before.map(|b| &b.headers).unwrap_or(&empty);
    merge_headers(&mut parts.headers, before_headers, &after.headers)
}
