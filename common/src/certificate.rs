//! Access to the peer certificate chain captured at handshake time.
//!
//! Index 1 is the peer's own certificate; higher indices walk toward the
//! root CA. A certificate comes back either as text (subject and issuer
//! lines followed by a PEM block) or as a name/value tree for callers that
//! want individual fields.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::{
    der_parser::oid::Oid,
    objects::{oid2abbrev, oid2sn, oid_registry},
    parse_x509_certificate,
    x509::X509Name,
};

use crate::{
    dispatch::Transport,
    error::{Result, TransportError},
    registry::StreamHandle,
};

pub type CertificateText = String;

const PEM_LINE_WIDTH: usize = 64;

/// One node of a decomposed certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateNode {
    pub name:     Option<String>,
    pub data:     Option<String>,
    pub critical: bool,
    pub children: Vec<CertificateNode>,
}

impl CertificateNode {
    fn leaf(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Self::default()
        }
    }

    fn branch(name: impl Into<String>, children: Vec<CertificateNode>) -> Self {
        Self {
            name: Some(name.into()),
            children,
            ..Self::default()
        }
    }

    /// First direct child called `name`
    pub fn child(&self, name: &str) -> Option<&CertificateNode> {
        self.children
            .iter()
            .find(|child| child.name.as_deref() == Some(name))
    }

    /// Follows `path` one child name at a time, e.g. `["subject", "CN"]`
    pub fn find(&self, path: &[&str]) -> Option<&CertificateNode> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Depth-first walk over this node and everything below it
    pub fn iter(&self) -> impl Iterator<Item = &CertificateNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:width$}", "", width = depth * 2)?;
        write!(f, "{}", self.name.as_deref().unwrap_or("-"))?;
        if let Some(data) = &self.data {
            write!(f, ": {data}")?;
        }
        if self.critical {
            write!(f, " (critical)")?;
        }
        writeln!(f)?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for CertificateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

fn parse_error(e: impl fmt::Display) -> TransportError {
    TransportError::TlsCertificateUnavailable(format!("unparsable certificate: {e}"))
}

fn oid_name(oid: &Oid) -> String {
    oid2sn(oid, oid_registry())
        .map(str::to_string)
        .unwrap_or_else(|_| oid.to_id_string())
}

/// Short attribute names as used in distinguished names (`CN`, `O`, ...)
fn attribute_name(oid: &Oid) -> String {
    oid2abbrev(oid, oid_registry())
        .map(str::to_string)
        .unwrap_or_else(|_| oid_name(oid))
}

fn name_node(label: &str, name: &X509Name) -> CertificateNode {
    let children = name
        .iter_attributes()
        .map(|attr| {
            let value = attr
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|_| hex::encode(attr.attr_value().as_bytes()));
            CertificateNode::leaf(attribute_name(attr.attr_type()), value)
        })
        .collect();
    CertificateNode {
        data: Some(name.to_string()),
        ..CertificateNode::branch(label, children)
    }
}

/// `subject=` and `issuer=` lines followed by the PEM encoding
pub fn certificate_text(der: &CertificateDer<'_>) -> Result<CertificateText> {
    let (_, cert) = parse_x509_certificate(der.as_ref()).map_err(parse_error)?;

    let encoded = STANDARD.encode(der.as_ref());
    let mut text = format!("subject={}\nissuer={}\n", cert.subject(), cert.issuer());
    text.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(PEM_LINE_WIDTH) {
        // base64 output is ASCII
        text.push_str(&String::from_utf8_lossy(line));
        text.push('\n');
    }
    text.push_str("-----END CERTIFICATE-----\n");
    Ok(text)
}

/// Decomposes a certificate into a name/value tree
pub fn certificate_tree(der: &CertificateDer<'_>) -> Result<CertificateNode> {
    let (_, cert) = parse_x509_certificate(der.as_ref()).map_err(parse_error)?;
    let validity = cert.validity();

    let extensions = cert
        .extensions()
        .iter()
        .map(|ext| CertificateNode {
            critical: ext.critical,
            ..CertificateNode::leaf(oid_name(&ext.oid), hex::encode(ext.value))
        })
        .collect();

    let children = vec![
        CertificateNode::leaf("version", (cert.version().0 + 1).to_string()),
        CertificateNode::leaf("serialNumber", cert.raw_serial_as_string()),
        CertificateNode::leaf(
            "signatureAlgorithm",
            oid_name(&cert.signature_algorithm.algorithm),
        ),
        name_node("issuer", cert.issuer()),
        CertificateNode::branch(
            "validity",
            vec![
                CertificateNode::leaf("notBefore", validity.not_before.to_string()),
                CertificateNode::leaf("notAfter", validity.not_after.to_string()),
            ],
        ),
        name_node("subject", cert.subject()),
        CertificateNode::branch(
            "subjectPublicKeyInfo",
            vec![CertificateNode::leaf(
                "algorithm",
                oid_name(&cert.public_key().algorithm.algorithm),
            )],
        ),
        CertificateNode::branch("extensions", extensions),
        CertificateNode::leaf("fingerprint", hex::encode(Sha256::digest(der.as_ref()))),
    ];

    Ok(CertificateNode::branch("certificate", children))
}

impl Transport {
    fn chain_entry(
        &self,
        handle: StreamHandle,
        index: usize,
    ) -> Result<Option<CertificateDer<'static>>> {
        let chain = self.peer_certificates(handle)?;
        Ok(index
            .checked_sub(1)
            .and_then(|i| chain.into_iter().nth(i)))
    }

    /// The `index`-th certificate of the peer chain (1 = peer) as text, or
    /// `None` past the end of the chain
    pub fn get_certificate(
        &self,
        handle: StreamHandle,
        index: usize,
    ) -> Result<Option<CertificateText>> {
        self.chain_entry(handle, index)?
            .map(|der| certificate_text(&der))
            .transpose()
    }

    pub fn get_certificate_tree(
        &self,
        handle: StreamHandle,
        index: usize,
    ) -> Result<Option<CertificateNode>> {
        self.chain_entry(handle, index)?
            .map(|der| certificate_tree(&der))
            .transpose()
    }

    /// Copies the certificate text into `buf` and returns its full length,
    /// which exceeds `buf.len()` when the copy was truncated. Returns 0 past
    /// the end of the chain.
    pub fn read_certificate(
        &self,
        handle: StreamHandle,
        index: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        let Some(text) = self.get_certificate(handle, index)? else {
            return Ok(0);
        };
        let n = text.len().min(buf.len());
        buf[..n].copy_from_slice(&text.as_bytes()[..n]);
        Ok(text.len())
    }
}
