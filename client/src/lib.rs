//! Conduit Client Library
//!
//! Client connect for the Conduit transport. A connection is opened as a
//! plain TCP stream or, with `secure = true`, wrapped in a TLS session; both
//! come back as a [`Connection`] that reads and writes the same way.
//!
//! # Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//!
//! use conduit_client::{resolve_v4, ClientCertPath, ClientTlsContext, TransportClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let tls = ClientTlsContext::load(&ClientCertPath::new())?;
//! let client = TransportClient::installed(Some(tls))?;
//!
//! let addr = resolve_v4("localhost")?;
//! let mut conn = client.open(addr, 9000, true)?;
//! conn.write_all(b"hello")?;
//!
//! let mut reply = [0u8; 5];
//! conn.read_exact(&mut reply)?;
//! println!("peer certificate:\n{}", conn.certificate(1)?.unwrap_or_default());
//!
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from conduit-common for convenience
pub use conduit_common::{
    is_reliable, max_message_size, resolve_v4, resolve_v6, AddressTarget, ClientCertPath,
    Connection, Transport, TransportConfig, TransportError,
};
