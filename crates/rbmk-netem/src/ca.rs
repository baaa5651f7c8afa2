//! Embedded certificate authority issuing server certificates for simulated hosts.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

pub const CA_CERT_FILE: &str = "ca.pem";

/// ALPN offered by HTTPS and DNS-over-HTTPS endpoints.
pub const HTTP_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];
pub const HTTP1_ALPN: &[&[u8]] = &[b"http/1.1"];
/// ALPN offered by DNS-over-TLS endpoints (RFC 7858).
pub const DOT_ALPN: &[&[u8]] = &[b"dot"];

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate needs at least one name or address")]
    NoSubjects,
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Crypto provider shared by every TLS endpoint in the simulation.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Self-signed root plus the directory its PEM material is written to.
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    dir: PathBuf,
}

impl CertificateAuthority {
    /// Generate a fresh root and write it to `dir/ca.pem`, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CaError> {
        let dir = dir.into();
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "rbmk-qa simulation root");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "rbmk-qa");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        fs::create_dir_all(&dir).map_err(|source| CaError::Write {
            path: dir.clone(),
            source,
        })?;
        write_file(&dir.join(CA_CERT_FILE), cert.pem())?;
        tracing::debug!(dir = %dir.display(), "created certificate authority");

        Ok(Self { cert, key, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Trust anchors containing only this root.
    pub fn root_store(&self) -> Result<RootCertStore, CaError> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der())?;
        Ok(roots)
    }

    /// Client configuration trusting this root, with the given ALPN protocols.
    pub fn client_config(&self, alpn: &[&[u8]]) -> Result<ClientConfig, CaError> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
        Ok(config)
    }

    /// Issue a server certificate covering `names` and `addrs`.
    ///
    /// The leaf and its key are written to `<dir>/<first subject>.pem` and
    /// `<dir>/<first subject>-key.pem`.
    pub fn issue(&self, names: &[String], addrs: &[IpAddr]) -> Result<IssuedCert, CaError> {
        let subject = names
            .first()
            .cloned()
            .or_else(|| addrs.first().map(IpAddr::to_string))
            .ok_or(CaError::NoSubjects)?;

        let mut params = CertificateParams::new(names.to_vec())?;
        params.distinguished_name.push(DnType::CommonName, subject.as_str());
        params
            .subject_alt_names
            .extend(addrs.iter().copied().map(SanType::IpAddress));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;

        let stem = subject.replace(':', "_");
        write_file(&self.dir.join(format!("{stem}.pem")), cert.pem())?;
        write_file(&self.dir.join(format!("{stem}-key.pem")), key.serialize_pem())?;
        tracing::debug!(%subject, names = names.len(), addrs = addrs.len(), "issued certificate");

        Ok(IssuedCert {
            chain: vec![cert.der().clone(), self.cert_der()],
            key: key.serialize_der(),
            subject,
        })
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// A leaf certificate chain and its PKCS#8 key.
#[derive(Clone)]
pub struct IssuedCert {
    chain: Vec<CertificateDer<'static>>,
    key: Vec<u8>,
    subject: String,
}

impl IssuedCert {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Server configuration presenting this certificate and offering `alpn`.
    pub fn server_config(&self, alpn: &[&[u8]]) -> Result<Arc<ServerConfig>, CaError> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone()));
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), key)?;
        config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

fn write_file(path: &Path, contents: String) -> Result<(), CaError> {
    fs::write(path, contents).map_err(|source| CaError::Write {
        path: path.to_path_buf(),
        source,
    })
}
