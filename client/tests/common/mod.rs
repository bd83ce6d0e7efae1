#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::{self, JoinHandle},
};

use conduit_common::{pem, TlsSession};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

pub const SERVER_SUBJECT: &str = "conduit-test-server";
pub const CA_SUBJECT: &str = "Conduit Test CA";

/// A throwaway CA and a server certificate it signed, valid for
/// `localhost` and `127.0.0.1`
pub struct TestPki {
    pub ca_pem:    String,
    /// Server certificate followed by the CA certificate
    pub chain_pem: String,
    pub key_pem:   String,
}

pub fn test_pki() -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_SUBJECT);
    dn.push(DnType::OrganizationName, "Conduit");
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let ca_cert = ca_params.clone().self_signed(&ca_key).unwrap();

    let key = KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, SERVER_SUBJECT);
    params.distinguished_name = dn;

    let issuer = Issuer::from_params(&ca_params, &ca_key);
    let cert = params.signed_by(&key, &issuer).unwrap();

    TestPki {
        ca_pem:    ca_cert.pem(),
        chain_pem: cert.pem() + &ca_cert.pem(),
        key_pem:   key.serialize_pem(),
    }
}

pub fn server_config(pki: &TestPki) -> Arc<rustls::ServerConfig> {
    pem::install_crypto_provider();
    let chain = pem::parse_certificates(pki.chain_pem.as_bytes()).unwrap();
    let key = pem::parse_private_key(pki.key_pem.as_bytes()).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    Arc::new(config)
}

fn echo<S: Read + Write>(stream: &mut S) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() || stream.flush().is_err() {
                    break;
                }
            }
        }
    }
}

/// Plain echo server serving `connections` clients, one thread each
pub fn plain_echo_server(connections: usize) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let workers: Vec<_> = (0..connections)
            .map(|_| {
                let (mut socket, _) = listener.accept().unwrap();
                thread::spawn(move || echo(&mut socket))
            })
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
    });
    (addr, handle)
}

/// TLS echo server presenting the `pki` chain to a single client. The
/// handshake result is returned from the join handle.
pub fn tls_echo_server(pki: &TestPki) -> (SocketAddr, JoinHandle<conduit_common::Result<()>>) {
    let config = server_config(pki);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        let mut session = TlsSession::accept(socket, config)?;
        echo(&mut session);
        session.close();
        Ok(())
    });
    (addr, handle)
}
