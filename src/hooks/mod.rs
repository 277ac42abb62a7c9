//! Interception hooks: middlewares, record building and breakpoints
//!
//! Each intercepted request passes through registered [`Middleware`]s in
//! order, then is turned into an [`ApiRecord`] by the [`RecordBuilder`] and
//! handed to the [`Breakpoint`] engine. Whatever record comes back is what
//! gets forwarded. Responses take the same route on the way back.

mod context;
mod defaults;
mod pipeline;
mod record;

use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use std::future::Future;
use std::pin::Pin;

pub use context::ProxyContext;
pub use defaults::{DefaultRecordBuilder, PassThroughBreakpoint};
pub use pipeline::{HookPipeline, RequestOutcome};
pub use record::{
    body_to_bytes, headers_to_record, is_managed_header, merge_headers, ApiRecord, RawRequest,
    RawResponse, RecordHeaders, RecordRequest, RecordResponse, HOP_BY_HOP_HEADERS,
};

/// Boxed future returned by hook trait methods
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Rejection raised by a breakpoint. Its display text is what a client sees
/// when a response breakpoint fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BreakpointError {
    message: String,
}

impl BreakpointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Async request middleware, run in registration order
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut ProxyContext) -> HookFuture<'a, crate::Result<()>>;
}

/// Turns raw traffic into records. Returning `None` leaves the traffic untouched.
pub trait RecordBuilder: Send + Sync + 'static {
    fn build_request_record(&self, request: &RawRequest) -> Option<ApiRecord>;

    fn build_response_record(
        &self,
        response: &RawResponse,
        request: &RawRequest,
    ) -> Option<ApiRecord>;
}

/// Decision point that may inspect, rewrite, delay or reject a record
pub trait Breakpoint: Send + Sync + 'static {
    fn apply_request_breakpoint(
        &self,
        record: ApiRecord,
    ) -> HookFuture<'static, Result<ApiRecord, BreakpointError>>;

    fn apply_response_breakpoint(
        &self,
        record: ApiRecord,
    ) -> HookFuture<'static, Result<ApiRecord, BreakpointError>>;
}

const TEXT_CONTENT_TYPES: &[&str] = &[
    "json",
    "javascript",
    "xml",
    "x-www-form-urlencoded",
];

/// Whether a body with these headers is treated as text.
///
/// Text means a textual content type and no content coding; compressed or
/// untyped bodies are binary.
pub fn is_text_body(headers: &HeaderMap) -> bool {
    let encoded = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim();
            !v.is_empty() && !v.eq_ignore_ascii_case("identity")
        })
        .unwrap_or(false);
    if encoded {
        return false;
    }

    let content_type = match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) => ct.to_ascii_lowercase(),
        None => return false,
    };
    let mime = content_type.split(';').next().unwrap_or("").trim();

    mime.starts_with("text/") || TEXT_CONTENT_TYPES.iter().any(|t| mime.contains(t))
}
