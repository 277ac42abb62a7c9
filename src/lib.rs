//! Erra - An interactive HTTPS intercepting proxy
//!
//! Erra terminates TLS with certificates forged on the fly from an
//! operator-installed root CA, and exposes every request and response to
//! pluggable rewriting logic ("breakpoints") before it continues.
//!
//! # Features
//!
//! - **Two front-ends**: a plain HTTP/CONNECT listener and an SNI-driven TLS listener
//! - **Certificate store**: per-host leaves in a TTL-bounded LRU, generation coalesced per host
//! - **Hook pipeline**: ordered middlewares, record builder and breakpoint engine
//! - **Framing-safe rewrites**: text bodies are replaced whole, binary bodies stream
//!   only after the breakpoint has answered
//!
//! # Example
//!
//! ```no_run
//! use erra::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("erra.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod proxy;
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use hooks::{
    ApiRecord, Breakpoint, BreakpointError, HookPipeline, Middleware, ProxyContext, RecordBuilder,
};
pub use proxy::{BoundAddresses, ProxyServer};
pub use tls::{CertificateAuthority, CertificateStore, GeneratedCa};
