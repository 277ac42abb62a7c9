//! Per-request state shared with middlewares

use bytes::Bytes;
use hyper::Response;

use super::record::RawRequest;

/// Transient state for one intercepted request.
///
/// Middlewares may rewrite the request in place, or call [`finish`](Self::finish)
/// to answer it themselves. A finished context stops the middleware chain and
/// the request is never forwarded.
#[derive(Debug)]
pub struct ProxyContext {
    request: RawRequest,
    response: Option<Response<Bytes>>,
}

impl ProxyContext {
    pub fn new(request: RawRequest) -> Self {
        Self {
            request,
            response: None,
        }
    }

    pub fn request(&self) -> &RawRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RawRequest {
        &mut self.request
    }

    /// Answer the request with `response`
    pub fn finish(&mut self, response: Response<Bytes>) {
        self.response = Some(response);
    }

    pub fn is_finished(&self) -> bool {
        self.response.is_some()
    }

    /// Split into the (possibly rewritten) request and the finishing response, if any
    pub fn into_parts(self) -> (RawRequest, Option<Response<Bytes>>) {
        (self.request, self.response)
    }
}
