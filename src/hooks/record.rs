//! Records exchanged with the record builder and breakpoint engine

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Header names keyed lowercase; repeated headers are joined with ", "
pub type RecordHeaders = BTreeMap<String, String>;

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// True for headers the proxy owns: message framing and hop-by-hop
pub fn is_managed_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || HOP_BY_HOP_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
}

/// A fully buffered request as seen by the interception pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// `http` or `https`
    pub scheme: String,
    pub method: Method,
    /// Absolute URI including scheme and authority
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawRequest {
    /// The absolute URL as a string
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// Source map fetches are never intercepted
    pub fn is_sourcemap(&self) -> bool {
        self.uri.path().ends_with(".map")
    }
}

/// An upstream response head, plus the body on the text path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `None` when the body is streamed
    pub body: Option<Bytes>,
}

/// The request half of an [`ApiRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: RecordHeaders,
    #[serde(default)]
    pub body: Value,
}

/// The response half of an [`ApiRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: RecordHeaders,
    #[serde(default)]
    pub body: Value,
}

/// Normalized view of one API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRecord {
    pub request: RecordRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordResponse>,
}

/// Collapse a header map into record form
pub fn headers_to_record(headers: &HeaderMap) -> RecordHeaders {
    let mut out = RecordHeaders::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Apply headers returned by a breakpoint over `target`.
///
/// Only headers whose value differs from `before` are written, so an
/// untouched multi-valued header keeps its separate lines. Managed headers
/// are never taken from a record.
pub fn merge_headers(
    target: &mut HeaderMap,
    before: &RecordHeaders,
    after: &RecordHeaders,
) -> Result<()> {
    for (name, value) in after {
        if is_managed_header(name) || before.get(name) == Some(value) {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::proxy(format!("Invalid header name '{}': {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| Error::proxy(format!("Invalid value for header '{}': {}", name, e)))?;
        target.insert(header_name, header_value);
    }
    Ok(())
}

/// Body bytes for a record body: strings verbatim, null as empty, anything else as JSON
pub fn body_to_bytes(body: &Value) -> Result<Bytes> {
    match body {
        Value::Null => Ok(Bytes::new()),
        Value::String(s) => Ok(Bytes::from(s.clone())),
        other => serde_json::to_vec(other)
            .map(Bytes::from)
            .map_err(|e| Error::proxy(format!("Failed to serialize record body: {}", e))),
    }
}
