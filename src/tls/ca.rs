//! Root certificate authority and leaf issuance

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use crate::config::{ROOT_CERT_FILE, ROOT_KEY_FILE};
use crate::error::{Error, Result};

/// A generated CA certificate and key pair
pub struct GeneratedCa {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

impl GeneratedCa {
    /// Generate a new CA certificate
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();

        params
            .distinguished_name
            .push(DnType::CommonName, "Erra Proxy CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Erra");

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // Valid for 10 years
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Write `erra.crt.pem` and `erra.key.pem` into `dir`, creating it if needed
    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::certificate(format!(
                "Failed to create CA directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        self.save(dir.join(ROOT_CERT_FILE), dir.join(ROOT_KEY_FILE))
    }

    /// Save the certificate and key to files
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path.as_ref(), &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        std::fs::write(key_path.as_ref(), &self.key_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write key to '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path.as_ref())?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path.as_ref(), perms)?;
        }

        Ok(())
    }
}

/// The operator's root certificate as read from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A forged certificate for one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    /// PKCS#8 DER of the leaf key
    pub key_der: Vec<u8>,
}

impl LeafCertificate {
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// A loaded Certificate Authority for signing leaf certificates
pub struct CertificateAuthority {
    root: RootCertificate,
    key_pair: KeyPair,
    /// Issuer rebuilt from the root's own parameters so leaves carry its exact subject
    issuer: Certificate,
    cert_der: CertificateDer<'static>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Load a CA from PEM-encoded certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;

        let mut cert_reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = rustls_pemfile::certs(&mut cert_reader)
            .filter_map(|r| r.ok())
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in PEM"))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;
        let issuer = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("Failed to prepare CA for signing: {}", e)))?;

        Ok(Self {
            root: RootCertificate {
                cert_pem: cert_pem.to_string(),
                key_pem: key_pem.to_string(),
            },
            key_pair,
            issuer,
            cert_der,
        })
    }

    /// Load a CA from files
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA key '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Load `erra.crt.pem` / `erra.key.pem` from a directory
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::from_files(dir.join(ROOT_CERT_FILE), dir.join(ROOT_KEY_FILE))
    }

    /// Issue a certificate whose subject and only SAN are `hostname`
    pub fn issue_leaf(&self, hostname: &str, validity_days: i64) -> Result<LeafCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, hostname);

        let san = match hostname.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(hostname.try_into().map_err(|e| {
                Error::certificate(format!("Invalid hostname '{}': {}", hostname, e))
            })?),
        };
        params.subject_alt_names = vec![san];

        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(validity_days);

        let leaf_key = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer, &self.key_pair)
            .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
            key_der: leaf_key.serialize_der(),
        })
    }

    /// The root as loaded from disk
    pub fn root(&self) -> &RootCertificate {
        &self.root
    }

    /// Get the CA certificate in DER format
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}
