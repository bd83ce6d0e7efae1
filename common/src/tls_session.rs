use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
};

use rustls::{
    pki_types::{CertificateDer, ServerName},
    ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection,
};

use crate::error::{Result, TransportError};

/// Which side of the handshake this session played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// One rustls session bound to the socket it encrypts.
///
/// All TLS records for the connection pass through `socket`; plaintext only
/// ever appears on the `encrypt_write` / `decrypt_read` side.
pub struct TlsSession {
    socket: TcpStream,
    tls:    Connection,
    peer:   SocketAddr,
}

impl TlsSession {
    /// Run the client handshake over `socket` and require a server certificate
    pub fn connect(
        socket: TcpStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let peer = socket.peer_addr()?;
        let conn = ClientConnection::new(config, server_name.clone()).map_err(|e| {
            TransportError::TlsHandshakeFailed {
                peer,
                reason: e.to_string(),
            }
        })?;

        let mut session = Self {
            socket,
            tls: Connection::Client(conn),
            peer,
        };
        session.complete_handshake()?;

        if session.peer_certificates().is_empty() {
            return Err(TransportError::TlsCertificateUnavailable(format!(
                "{peer} ({server_name:?}) presented no certificate"
            )));
        }
        Ok(session)
    }

    /// Run the server handshake over an accepted `socket`
    pub fn accept(socket: TcpStream, config: Arc<ServerConfig>) -> Result<Self> {
        let peer = socket.peer_addr()?;
        let conn = ServerConnection::new(config).map_err(|e| TransportError::TlsHandshakeFailed {
            peer,
            reason: e.to_string(),
        })?;

        let mut session = Self {
            socket,
            tls: Connection::Server(conn),
            peer,
        };
        session.complete_handshake()?;
        Ok(session)
    }

    /// Complete the TLS handshake
    fn complete_handshake(&mut self) -> Result<()> {
        let peer = self.peer;
        let fail = |reason: String| TransportError::TlsHandshakeFailed { peer, reason };

        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls
                    .write_tls(&mut self.socket)
                    .map_err(|e| fail(e.to_string()))?;
                continue;
            }
            if self.tls.wants_read() {
                let n = self
                    .tls
                    .read_tls(&mut self.socket)
                    .map_err(|e| fail(e.to_string()))?;
                if n == 0 {
                    return Err(fail("connection closed during handshake".into()));
                }
                if let Err(e) = self.tls.process_new_packets() {
                    // Let the peer see the alert before we give up
                    let _ = self.tls.write_tls(&mut self.socket);
                    return Err(fail(e.to_string()));
                }
            }
        }

        // Flush the final flight (client Finished, session tickets)
        while self.tls.wants_write() {
            self.tls
                .write_tls(&mut self.socket)
                .map_err(|e| fail(e.to_string()))?;
        }

        tracing::debug!(
            "TLS handshake with {} complete ({:?}, {:?})",
            self.peer,
            self.protocol_version(),
            self.cipher_suite()
        );
        Ok(())
    }

    pub fn role(&self) -> TlsRole {
        match self.tls {
            Connection::Client(_) => TlsRole::Client,
            Connection::Server(_) => TlsRole::Server,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The underlying socket carrying TLS records
    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    /// Peer certificate chain, leaf first; empty for anonymous clients
    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        let chain = match &self.tls {
            Connection::Client(conn) => conn.peer_certificates(),
            Connection::Server(conn) => conn.peer_certificates(),
        };
        chain.map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.tls.protocol_version()
    }

    pub fn cipher_suite(&self) -> Option<rustls::CipherSuite> {
        self.tls.negotiated_cipher_suite().map(|suite| suite.suite())
    }

    /// Encrypt `bytes` and push the resulting records to the socket
    pub fn encrypt_write(&mut self, bytes: &[u8]) -> Result<usize> {
        let written = self.tls.writer().write(bytes)?;
        self.flush_records()?;
        Ok(written)
    }

    pub fn encrypt_write_all(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let written = self.encrypt_write(bytes)?;
            if written == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            bytes = &bytes[written..];
        }
        Ok(())
    }

    /// Push any buffered plaintext and pending records to the socket
    pub fn flush_session(&mut self) -> Result<()> {
        self.tls.writer().flush()?;
        self.flush_records()?;
        self.socket.flush()?;
        Ok(())
    }

    /// Read plaintext, pulling TLS records from the socket as needed.
    /// Returns 0 once the peer closed the connection.
    pub fn decrypt_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e.into()),
            }

            if self.tls.read_tls(&mut self.socket)? == 0 {
                return Ok(0);
            }
            let state = self.tls.process_new_packets()?;
            // Key updates and alerts may need an answer before more data arrives
            if state.tls_bytes_to_write() > 0 {
                self.flush_records()?;
            }
        }
    }

    fn flush_records(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        Ok(())
    }

    /// Send close_notify and release the socket
    pub fn close(self) {
        drop(self.finish());
    }

    /// Send close_notify and hand back the still open socket
    pub fn finish(mut self) -> TcpStream {
        self.tls.send_close_notify();
        if let Err(e) = self.flush_records() {
            tracing::debug!("close_notify to {} not delivered: {}", self.peer, e);
        }
        self.socket
    }
}

impl Read for TlsSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.decrypt_read(buf)?)
    }
}

impl Write for TlsSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.encrypt_write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_session()?)
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("peer", &self.peer)
            .field("role", &self.role())
            .field("protocol", &self.protocol_version())
            .finish()
    }
}
