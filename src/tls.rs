//! TLS setup for the secure PVA port
//!
//! The server certificate chain and private key are read from one PEM "keychain"
//! file. Client certificates are optional; when a CA bundle is configured they are
//! verified against it and become the basis of "x509" authentication.

use std::{fs::File, io, io::BufReader, path::Path, sync::Arc};

use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};
use x509_parser::{extensions::GeneralName, prelude::X509Certificate};

/// Certificate extension naming the PV that publishes the certificate's status
pub const STATUS_PV_EXTENSION_OID: &str = "1.3.6.1.4.1.37427.1";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Could not read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("No certificate found in {0}")]
    NoCertificate(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("Cannot verify client certificates: {0}")]
    Verifier(String),
}

/// What the TLS handshake told us about the client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsHandshakeInfo {
    /// Common name of the validated client certificate
    pub principal: Option<String>,
    /// Host name from the certificate's subject alternative names
    pub hostname: Option<String>,
    /// PV that publishes the validity of the client certificate
    pub status_pv: Option<String>,
}

impl TlsHandshakeInfo {
    /// Extract the details of a client certificate
    pub fn from_certificate(der: &[u8]) -> Option<TlsHandshakeInfo> {
        let (_, cert) = match x509_parser::parse_x509_certificate(der) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Cannot decode client certificate: {e}");
                return None;
            }
        };
        Some(TlsHandshakeInfo {
            principal: common_name(&cert),
            hostname: dns_name(&cert),
            status_pv: status_pv(&cert),
        })
    }

    /// Details of the session's client certificate, if the client sent one
    pub fn from_session(session: &rustls::ServerConnection) -> TlsHandshakeInfo {
        session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|cert| TlsHandshakeInfo::from_certificate(cert.as_ref()))
            .unwrap_or_default()
    }
}

fn common_name(cert: &X509Certificate) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn dns_name(cert: &X509Certificate) -> Option<String> {
    let names = cert.subject_alternative_name().ok()??;
    names.value.general_names.iter().find_map(|name| match name {
        GeneralName::DNSName(dns) => Some(dns.to_string()),
        _ => None,
    })
}

fn status_pv(cert: &X509Certificate) -> Option<String> {
    let ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == STATUS_PV_EXTENSION_OID)?;
    let raw = ext.value;
    // Expect a DER string, but accept a bare one
    let text = match raw {
        [0x0C | 0x13 | 0x16, len, rest @ ..] if (*len as usize) == rest.len() => rest,
        _ => raw,
    };
    let name = String::from_utf8_lossy(text).trim().to_string();
    debug!("Certificate status is published as '{name}'");
    (!name.is_empty()).then_some(name)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Build the acceptor for the TLS port
///
/// `keychain` holds the server's certificate chain and private key. With a
/// `client_ca` bundle, clients may present certificates signed by it; clients
/// without a certificate are still accepted.
pub fn load_acceptor(keychain: &Path, client_ca: Option<&Path>) -> Result<TlsAcceptor, TlsError> {
    let chain = read_certificates(keychain)?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificate(keychain.display().to_string()));
    }
    let key = read_private_key(keychain)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = match client_ca {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for ca in read_certificates(ca_path)? {
                roots.add(ca)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(chain, key)?,
    };
    Ok(TlsAcceptor::from(Arc::new(config)))
}
