use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{registry::StreamHandle, resolver::AddressFamily};

/// Result alias used throughout the transport crates
pub type Result<T> = std::result::Result<T, TransportError>;

/// Every way a transport operation can fail
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handle is out of range, stale, or already closed
    #[error("invalid stream handle {0}")]
    InvalidHandle(StreamHandle),

    /// Resolution succeeded but yielded no address of the requested family
    #[error("no {family} address found for '{name}'")]
    NoAddressFound {
        name:   String,
        family: AddressFamily,
    },

    /// The system resolver reported an error
    #[error("failed to resolve '{name}': {reason}")]
    ResolutionError { name: String, reason: String },

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr:   SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Bind, listen or accept failed on the server side
    #[error("failed to accept on port {port}: {source}")]
    AcceptFailed {
        port:   u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS context error: {0}")]
    TlsContextError(String),

    #[error("TLS handshake with {peer} failed: {reason}")]
    TlsHandshakeFailed { peer: SocketAddr, reason: String },

    #[error("peer certificate unavailable: {0}")]
    TlsCertificateUnavailable(String),

    /// The engine rejected traffic on an established session
    #[error("TLS session error: {0}")]
    TlsProtocol(#[from] rustls::Error),

    #[error("failed to duplicate socket handle: {0}")]
    DuplicateHandleFailed(#[source] io::Error),

    #[error("stream registry is full ({capacity} records)")]
    OutOfMemory { capacity: usize },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("transport consistency error: {0}")]
    ConsistencyError(String),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Fatal errors leave the process-wide registry in an unknown state and
    /// should end the process. Everything else is scoped to one connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyError(_) | Self::OutOfMemory { .. })
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        if let TransportError::Io(e) = err {
            return e;
        }
        let kind = match &err {
            TransportError::InvalidHandle(_) => io::ErrorKind::NotConnected,
            TransportError::ConnectFailed { source, .. }
            | TransportError::AcceptFailed { source, .. }
            | TransportError::DuplicateHandleFailed(source) => source.kind(),
            TransportError::TlsProtocol(_) | TransportError::TlsHandshakeFailed { .. } => {
                io::ErrorKind::InvalidData
            }
            TransportError::MessageTooLarge { .. } | TransportError::Config(_) => {
                io::ErrorKind::InvalidInput
            }
            TransportError::NotImplemented(_) => io::ErrorKind::Unsupported,
            TransportError::OutOfMemory { .. } => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
