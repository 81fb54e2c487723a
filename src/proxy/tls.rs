//! Server-side mTLS configuration: loads the client CA pool and the server's
//! own certificate/key, and builds a `rustls::ServerConfig` that requires and
//! verifies the client certificate (TLS 1.3 only).

use std::io::Cursor;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};

use crate::error::ProxyError;

/// Extracts `Subject.CommonName` from the first peer certificate of a
/// completed handshake. Fails if no certificate is present or it carries no
/// Common Name, either of which leaves identity extraction without a client
/// id to authenticate against.
pub fn client_common_name(peer_certs: &[Certificate]) -> Result<String, ProxyError> {
    let leaf = peer_certs
        .first()
        .ok_or_else(|| ProxyError::HandshakeFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no peer certificate presented",
        )))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(&leaf.0).map_err(|e| {
        ProxyError::HandshakeFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("could not parse peer certificate: {e}"),
        ))
    })?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| ProxyError::HandshakeFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "peer certificate has no Subject Common Name",
        )))?;

    Ok(cn.to_string())
}

pub fn build_server_config(
    client_ca_cert_path: &str,
    server_cert_path: &str,
    server_key_path: &str,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let root_store = load_root_store(client_ca_cert_path)?;
    let cert_chain = load_certs(server_cert_path)?;
    let private_key = load_private_key(server_key_path)?;

    let verifier = Arc::new(AllowAnyAuthenticatedClient::new(root_store));

    let config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProxyError::CertLoadFailed(format!("unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| ProxyError::CertLoadFailed(format!("invalid server certificate/key: {e}")))?;

    Ok(Arc::new(config))
}

fn read_pem(path: &str) -> Result<Vec<u8>, ProxyError> {
    std::fs::read(path).map_err(|e| ProxyError::CertLoadFailed(format!("reading '{path}': {e}")))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>, ProxyError> {
    let bytes = read_pem(path)?;
    let mut cursor = Cursor::new(bytes);
    let raw = rustls_pemfile::certs(&mut cursor)
        .map_err(|e| ProxyError::CertLoadFailed(format!("parsing certs in '{path}': {e}")))?;
    if raw.is_empty() {
        return Err(ProxyError::CertLoadFailed(format!("no certificates found in '{path}'")));
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_root_store(path: &str) -> Result<RootCertStore, ProxyError> {
    let certs = load_certs(path)?;
    let mut store = RootCertStore::empty();
    for cert in &certs {
        store
            .add(cert)
            .map_err(|e| ProxyError::CertLoadFailed(format!("adding CA cert from '{path}': {e}")))?;
    }
    Ok(store)
}

fn load_private_key(path: &str) -> Result<PrivateKey, ProxyError> {
    let bytes = read_pem(path)?;

    let mut cursor = Cursor::new(&bytes);
    if let Ok(mut keys) = rustls_pemfile::pkcs8_private_keys(&mut cursor) {
        if keys.len() == 1 {
            return Ok(PrivateKey(keys.pop().unwrap()));
        }
    }

    cursor.set_position(0);
    if let Ok(mut keys) = rustls_pemfile::rsa_private_keys(&mut cursor) {
        if keys.len() == 1 {
            return Ok(PrivateKey(keys.pop().unwrap()));
        }
    }

    Err(ProxyError::CertLoadFailed(format!(
        "could not find exactly one supported private key in '{path}'"
    )))
}
