//! Shared HTTP response helpers

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};

use crate::error::Error;

/// Body type of every response the proxy writes
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

fn plain_text(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create an HTTP 502 Bad Gateway error response
pub fn error_response(message: &str) -> Response<ProxyBody> {
    plain_text(StatusCode::BAD_GATEWAY, format!("Proxy error: {}\n", message))
}

/// Create an HTTP 400 response for requests the proxy cannot route
pub fn bad_request(message: &str) -> Response<ProxyBody> {
    plain_text(StatusCode::BAD_REQUEST, format!("Bad request: {}\n", message))
}

/// 500 with the failure text as the whole body; the connection closes after it
pub fn processing_failure_response(error: &Error) -> Response<ProxyBody> {
    let text = match error {
        Error::Breakpoint(message) => message.clone(),
        other => other.to_string(),
    };

    let mut response = plain_text(StatusCode::INTERNAL_SERVER_ERROR, text);
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// `200 Connection Established` for an accepted CONNECT
pub fn connect_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Box a response produced by a middleware
pub fn finished_response(response: Response<Bytes>) -> Response<ProxyBody> {
    response.map(full_body)
}
