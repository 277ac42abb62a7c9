//! HTTP proxy server implementation

mod forward;
mod handler;
mod response;
mod server;
mod tls_listener;
mod tunnel;

pub use forward::Forwarder;
pub use handler::{buffer_request, FrontEnd, ProxyHandler};
pub use response::{
    bad_request, connect_established, empty_body, error_response, finished_response, full_body,
    processing_failure_response, ProxyBody,
};
pub use server::{BoundAddresses, ProxyServer};
pub use tls_listener::accept_tls;
pub use tunnel::{TunnelRouter, HTTPS_PORT};
