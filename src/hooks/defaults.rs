//! Built-in collaborators used when nothing else is plugged in

use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use serde_json::Value;

use super::record::{
    headers_to_record, ApiRecord, RawRequest, RawResponse, RecordRequest, RecordResponse,
};
use super::{is_text_body, Breakpoint, BreakpointError, HookFuture, RecordBuilder};

/// Maps traffic to records: JSON bodies parsed, other text kept as strings.
///
/// Requests with a non-text body, and any body that is not valid UTF-8, get no
/// record and pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRecordBuilder;

impl DefaultRecordBuilder {
    fn record_request(request: &RawRequest) -> Option<RecordRequest> {
        let body = if request.body.is_empty() {
            Value::Null
        } else if is_text_body(&request.headers) {
            body_value(&request.headers, &request.body)?
        } else {
            return None;
        };

        Some(RecordRequest {
            method: request.method.to_string(),
            url: request.url(),
            headers: headers_to_record(&request.headers),
            body,
        })
    }
}

impl RecordBuilder for DefaultRecordBuilder {
    fn build_request_record(&self, request: &RawRequest) -> Option<ApiRecord> {
        Some(ApiRecord {
            request: Self::record_request(request)?,
            response: None,
        })
    }

    fn build_response_record(
        &self,
        response: &RawResponse,
        request: &RawRequest,
    ) -> Option<ApiRecord> {
        let body = match &response.body {
            Some(bytes) if !bytes.is_empty() => body_value(&response.headers, bytes)?,
            _ => Value::Null,
        };

        // A binary request still gets a response record, just without its body
        let record_request = Self::record_request(request).unwrap_or_else(|| RecordRequest {
            method: request.method.to_string(),
            url: request.url(),
            headers: headers_to_record(&request.headers),
            body: Value::Null,
        });

        Some(ApiRecord {
            request: record_request,
            response: Some(RecordResponse {
                status: response.status.as_u16(),
                headers: headers_to_record(&response.headers),
                body,
            }),
        })
    }
}

fn body_value(headers: &HeaderMap, body: &Bytes) -> Option<Value> {
    let text = std::str::from_utf8(body).ok()?;

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);

    if is_json {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            // Strings would be re-sent unquoted, so keep the raw text for them
            if !value.is_string() && !value.is_null() {
                return Some(value);
            }
        }
    }

    Some(Value::String(text.to_string()))
}

/// Returns every record unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughBreakpoint;

impl Breakpoint for PassThroughBreakpoint {
    fn apply_request_breakpoint(
        &self,
        record: ApiRecord,
    ) -> HookFuture<'static, Result<ApiRecord, BreakpointError>> {
        Box::pin(async move { Ok(record) })
    }

    fn apply_response_breakpoint(
        &self,
        record: ApiRecord,
    ) -> HookFuture<'static, Result<ApiRecord, BreakpointError>> {
        Box::pin(async move { Ok(record) })
    }
}
