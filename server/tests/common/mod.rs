#![allow(dead_code)]

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

pub const SERVER_SUBJECT: &str = "conduit-test-server";
pub const CLIENT_SUBJECT: &str = "conduit-test-client";

/// A PEM certificate chain with its private key
pub struct Identity {
    pub chain_pem: String,
    pub key_pem:   String,
}

/// A throwaway CA plus a server and a client identity it signed
pub struct TestPki {
    pub ca_pem: String,
    pub server: Identity,
    pub client: Identity,
}

fn leaf(
    common_name: &str,
    ca_params: &CertificateParams,
    ca_key: &KeyPair,
    ca_pem: &str,
) -> Identity {
    let key = KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let issuer = Issuer::from_params(ca_params, ca_key);
    let cert = params.signed_by(&key, &issuer).unwrap();
    Identity {
        chain_pem: cert.pem() + ca_pem,
        key_pem:   key.serialize_pem(),
    }
}

pub fn test_pki() -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Conduit Test CA");
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let ca_pem = ca_params.clone().self_signed(&ca_key).unwrap().pem();

    TestPki {
        server: leaf(SERVER_SUBJECT, &ca_params, &ca_key, &ca_pem),
        client: leaf(CLIENT_SUBJECT, &ca_params, &ca_key, &ca_pem),
        ca_pem,
    }
}
