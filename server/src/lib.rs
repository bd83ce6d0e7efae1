//! Conduit Server Library
//!
//! Listen and accept for the Conduit transport. Each accepted socket is
//! registered with the shared `Transport` and, for secure connections, goes
//! through a server-side TLS handshake before it is handed to the caller.
//!
//! A failed accept or handshake only costs the one connection: `serve`
//! logs it and keeps listening. Errors that leave the registry in doubt
//! end the loop.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use conduit_common::{
    config::{ServerCertPath, TransportConfig},
    pem::{
        install_crypto_provider, parse_certificates, parse_private_key, read_pem_file,
        root_store_from_pem,
    },
    Connection, Result, TlsSession, Transport, TransportError,
};
use rustls::{server::WebPkiClientVerifier, ServerConfig};
use socket2::{Domain, Protocol, Socket, Type};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Server certificate and key, loaded once at start-up
#[derive(Clone)]
pub struct ServerTlsContext {
    tls_config: Arc<ServerConfig>,
}

impl ServerTlsContext {
    /// Loads the server identity and, when `ca_path` is set, requires client
    /// certificates signed by that CA. A missing or malformed file is a
    /// `TlsContextError`.
    pub fn load(paths: &ServerCertPath) -> Result<Self> {
        tracing::info!("Creating server TLS context with certificates:");
        tracing::info!("  - Server cert: {:?}", paths.cert_path);
        tracing::info!("  - Server key: {:?}", paths.key_path);
        let cert_pem = read_pem_file(&paths.cert_path)?;
        let key_pem = read_pem_file(&paths.key_path)?;

        let ca_pem = match &paths.ca_path {
            Some(ca_path) => {
                tracing::info!("  - Client CA cert: {:?}", ca_path);
                Some(read_pem_file(ca_path)?)
            }
            None => None,
        };

        Self::from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
    }

    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        client_ca_pem: Option<&[u8]>,
    ) -> Result<Self> {
        install_crypto_provider();

        let cert_chain = parse_certificates(cert_pem)?;
        let private_key = parse_private_key(key_pem)?;
        let builder = match client_ca_pem {
            Some(ca_pem) => {
                let root_store = root_store_from_pem(ca_pem)?;
                let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                    .build()
                    .map_err(|e| TransportError::TlsContextError(e.to_string()))?;
                ServerConfig::builder().with_client_cert_verifier(client_verifier)
            }
            None => ServerConfig::builder().with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TransportError::TlsContextError(e.to_string()))?;

        Ok(Self {
            tls_config: Arc::new(config),
        })
    }

    pub fn tls_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.tls_config)
    }
}

impl std::fmt::Debug for ServerTlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTlsContext").finish_non_exhaustive()
    }
}

/// A listening TCP socket with address (and port) reuse enabled
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    port:  u16,
}

impl Listener {
    /// Binds `0.0.0.0:port` and starts listening with the configured backlog.
    /// Port 0 picks an ephemeral port; see [`Listener::port`].
    pub fn bind(port: u16, config: &TransportConfig) -> Result<Self> {
        let accept_failed = |source: io::Error| TransportError::AcceptFailed { port, source };
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(accept_failed)?;
        socket.set_reuse_address(true).map_err(accept_failed)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if config.reuse_port {
            socket.set_reuse_port(true).map_err(accept_failed)?;
        }
        socket.bind(&addr.into()).map_err(accept_failed)?;
        socket.listen(config.backlog).map_err(accept_failed)?;

        let inner: TcpListener = socket.into();
        let port = inner.local_addr().map_err(accept_failed)?.port();
        tracing::info!(
            "Listening on {}:{} (backlog {})",
            Ipv4Addr::UNSPECIFIED,
            port,
            config.backlog
        );
        Ok(Self { inner, port })
    }

    /// The bound port, resolved when bound to port 0
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner
            .set_nonblocking(nonblocking)
            .map_err(|source| TransportError::AcceptFailed {
                port: self.port,
                source,
            })
    }

    /// Blocks until a client connects
    fn accept_socket(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (socket, peer) = self.inner.accept()?;
        // Some platforms hand out sockets inheriting the listener's mode
        socket.set_nonblocking(false)?;
        Ok((socket, peer))
    }
}

/// Accepts plain and TLS connections into a `Transport`
#[derive(Debug)]
pub struct TransportServer {
    transport: Arc<Transport>,
    tls:       Option<ServerTlsContext>,
}

impl TransportServer {
    pub fn new(transport: Arc<Transport>, tls: Option<ServerTlsContext>) -> Self {
        Self { transport, tls }
    }

    /// A server on the process-wide transport
    pub fn installed(tls: Option<ServerTlsContext>) -> Result<Self> {
        Ok(Self::new(Transport::install()?, tls))
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn bind(&self, port: u16) -> Result<Listener> {
        Listener::bind(port, self.transport.config())
    }

    /// Listens on `port`, accepts exactly one connection and closes the
    /// listening socket again. Call it in a loop to serve more.
    pub fn wait_for_connection(&self, port: u16, secure: bool) -> Result<Connection> {
        let listener = self.bind(port)?;
        let conn = self.accept(&listener, secure);
        drop(listener);
        tracing::debug!("Listener on port {} closed", port);
        conn
    }

    /// Accepts one connection from `listener` and registers it, running the
    /// server handshake first when `secure` is set
    pub fn accept(&self, listener: &Listener, secure: bool) -> Result<Connection> {
        let (socket, peer) = listener
            .accept_socket()
            .map_err(|source| TransportError::AcceptFailed {
                port: listener.port,
                source,
            })?;
        tracing::info!("New connection from {}", peer);
        self.register(socket, secure)
    }

    fn register(&self, socket: TcpStream, secure: bool) -> Result<Connection> {
        let config = self.transport.config();
        socket.set_read_timeout(config.read_timeout())?;
        socket.set_write_timeout(config.write_timeout())?;

        let handle = if secure {
            let tls = self.tls.as_ref().ok_or_else(|| {
                TransportError::TlsContextError(
                    "secure connection requested without a server TLS context".into(),
                )
            })?;
            let session = TlsSession::accept(socket, tls.tls_config())?;
            let client_auth = !session.peer_certificates().is_empty();
            tracing::info!(
                "✓ TLS connection with {} established ({:?}, client certificate: {})",
                session.peer_addr(),
                session.protocol_version(),
                client_auth
            );
            self.transport.register_tls(session)?
        } else {
            self.transport.register_socket(socket)?
        };

        Ok(Connection::new(Arc::clone(&self.transport), handle))
    }

    /// Serves connections on one persistent listener until `running` is
    /// cleared. Connections are handled one at a time on this thread.
    ///
    /// A failed accept or handshake is logged and the loop moves on. A fatal
    /// error from accepting or from `handler` ends the loop and is returned.
    pub fn serve<F>(
        &self,
        port: u16,
        secure: bool,
        running: Arc<AtomicBool>,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(Connection) -> Result<()>,
    {
        let listener = self.bind(port)?;
        // Non-blocking accept so the shutdown flag is noticed
        listener.set_nonblocking(true)?;
        tracing::info!("Serving on port {} (secure: {})", listener.port(), secure);

        while running.load(Ordering::SeqCst) {
            let Some((socket, peer)) = Self::poll_accept(&listener) else {
                continue;
            };

            tracing::info!("New connection from {}", peer);
            let outcome = self
                .register(socket, secure)
                .and_then(|conn| handler(conn));

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("Fatal transport error, stopping: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::error!("Connection from {} failed: {}", peer, e),
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        Ok(())
    }

    /// One accept attempt on a non-blocking listener. When nothing was
    /// accepted it sleeps a poll interval before returning `None`, failed
    /// accepts included, so a persistent error like `EMFILE` cannot spin.
    fn poll_accept(listener: &Listener) -> Option<(TcpStream, SocketAddr)> {
        match listener.accept_socket() {
            Ok(accepted) => return Some(accepted),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(source) => tracing::error!(
                "{}",
                TransportError::AcceptFailed {
                    port: listener.port,
                    source
                }
            ),
        }
        std::thread::sleep(ACCEPT_POLL_INTERVAL);
        None
    }
}
