use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use crate::{
    certificate::{CertificateNode, CertificateText},
    dispatch::Transport,
    error::{Result, TransportError},
    registry::{RecordInfo, StreamHandle},
};

/// An open stream handed out by connect and accept.
///
/// Reads and writes go through the owning `Transport`, so the same code
/// serves plain and TLS sockets. Dropping the connection closes it.
pub struct Connection {
    transport: Arc<Transport>,
    handle:    StreamHandle,
    owned:     bool,
}

impl Connection {
    pub fn new(transport: Arc<Transport>, handle: StreamHandle) -> Self {
        Self {
            transport,
            handle,
            owned: true,
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn info(&self) -> Result<RecordInfo> {
        self.transport.record(self.handle)
    }

    pub fn is_secure(&self) -> bool {
        self.info().map(|info| info.is_secure).unwrap_or(false)
    }

    /// The `index`-th certificate of the peer chain (1 = peer) as text
    pub fn certificate(&self, index: usize) -> Result<Option<CertificateText>> {
        self.transport.get_certificate(self.handle, index)
    }

    pub fn certificate_tree(&self, index: usize) -> Result<Option<CertificateNode>> {
        self.transport.get_certificate_tree(self.handle, index)
    }

    pub fn close(mut self) -> Result<()> {
        self.owned = false;
        self.transport.close(self.handle)
    }

    /// Gives up ownership without closing; the caller must close the handle
    pub fn into_handle(mut self) -> StreamHandle {
        self.owned = false;
        self.handle
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.transport.read(self.handle, buf)?)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.transport.write(self.handle, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.transport.flush(self.handle)?)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match self.transport.close(self.handle) {
            Ok(()) | Err(TransportError::InvalidHandle(_)) => {}
            Err(e) => tracing::warn!("Failed to close stream {}: {}", self.handle, e),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("handle", &self.handle).finish()
    }
}
