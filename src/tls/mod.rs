//! TLS and certificate management

mod ca;
mod cache;
mod store;
mod upstream;

pub use ca::{CertificateAuthority, GeneratedCa, LeafCertificate, RootCertificate};
pub use cache::CertificateCache;
pub use store::{normalize_hostname, CertificateStore, DEFAULT_SERVER_NAME};
pub use upstream::{insecure_client_config, NoVerifier};
