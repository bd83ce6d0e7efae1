//! PEM loading for certificate chains and private keys

use std::{fs, io::BufReader, path::Path};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    RootCertStore,
};
use rustls_pemfile::{certs, private_key};

use crate::error::{Result, TransportError};

pub fn read_pem_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        TransportError::TlsContextError(format!("failed to read {}: {e}", path.display()))
    })
}

/// Parses every certificate in `pem`; an input without any is an error
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let chain = certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsContextError(format!("malformed certificate PEM: {e}")))?;

    if chain.is_empty() {
        return Err(TransportError::TlsContextError(
            "no certificate found in PEM data".into(),
        ));
    }
    Ok(chain)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    private_key(&mut BufReader::new(pem))
        .map_err(|e| TransportError::TlsContextError(format!("malformed private key PEM: {e}")))?
        .ok_or_else(|| TransportError::TlsContextError("no private key found".into()))
}

pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    tracing::debug!("Loading certificates from {:?}", path);
    parse_certificates(&read_pem_file(path)?)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    tracing::debug!("Loading private key from {:?}", path);
    parse_private_key(&read_pem_file(path)?)
}

/// Builds a root store from a PEM bundle, skipping certificates rustls
/// cannot use as trust anchors
pub fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(parse_certificates(pem)?);
    if ignored > 0 {
        tracing::warn!("Ignored {} unparsable CA certificate(s)", ignored);
    }
    if added == 0 {
        return Err(TransportError::TlsContextError(
            "no valid CA certificates found".into(),
        ));
    }
    Ok(root_store)
}

/// Installs the process crypto provider; later calls are no-ops
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_parses() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let chain = parse_certificates(cert.pem().as_bytes()).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(parse_private_key(key.serialize_pem().as_bytes()).is_ok());
        assert!(root_store_from_pem(cert.pem().as_bytes()).is_ok());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_certificates(b"not a certificate"),
            Err(TransportError::TlsContextError(_))
        ));
        assert!(matches!(
            parse_private_key(b""),
            Err(TransportError::TlsContextError(_))
        ));
    }

    #[test]
    fn missing_file_is_a_context_error() {
        let err = load_certificates(Path::new("/nonexistent/conduit/server.pem")).unwrap_err();
        assert!(matches!(err, TransportError::TlsContextError(_)));
    }
}
