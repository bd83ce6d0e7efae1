//! Conduit Common Library
//!
//! This crate holds the transport core shared by the Conduit client and
//! server. It includes:
//!
//! - A generation-checked registry of every open stream
//! - The `Stream` enum over plain files, plain sockets and TLS sockets
//! - TLS sessions driven over blocking sockets with rustls
//! - `Transport`, the one place reads, writes and closes are dispatched
//! - Name resolution, datagram messages and peer certificate access
//!
//! # Features
//!
//! - **Transparent TLS**: a secure connection reads and writes exactly like
//!   a plain one
//! - **Stale handle detection**: a closed handle can never reach the record
//!   that later reuses its slot
//! - **Recoverable errors**: only registry corruption is process-fatal

/// Peer certificate chain access, as text or as a name/value tree
pub mod certificate;

/// Certificate locations and socket settings
pub mod config;

/// Owned byte stream over a registered handle
pub mod connection;

/// Read/write/close dispatch through the registry
pub mod dispatch;

pub mod error;

/// Best-effort datagram messages
pub mod message;

pub mod pem;

/// Hostname to IPv4/IPv6 resolution
pub mod resolver;

pub mod registry;

pub mod stream;

/// TLS session bound to a blocking socket
pub mod tls_session;

// Re-export commonly used types for convenience
pub use certificate::{CertificateNode, CertificateText};
pub use config::{ClientCertPath, ServerCertPath, TransportConfig};
pub use connection::Connection;
pub use dispatch::Transport;
pub use error::{Result, TransportError};
pub use message::{is_reliable, max_message_size, MessageHandle};
pub use registry::{RecordInfo, StreamHandle};
pub use resolver::{resolve, resolve_v4, resolve_v6, AddressFamily, AddressTarget};
pub use stream::{PlainStream, Stream, StreamKind};
pub use tls_session::{TlsRole, TlsSession};
