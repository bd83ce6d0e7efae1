use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream},
    sync::Arc,
};

use conduit_common::{
    config::ClientCertPath,
    pem::{
        install_crypto_provider, parse_certificates, parse_private_key, read_pem_file,
        root_store_from_pem,
    },
    resolver::{resolve, AddressFamily, AddressTarget},
    Connection, Result, TlsSession, Transport, TransportError,
};
use rustls::{pki_types::ServerName, ClientConfig as RustlsClientConfig};

/// Client side TLS settings: trusted roots, an optional client identity and
/// an optional fixed server name for verification
#[derive(Clone)]
pub struct ClientTlsContext {
    tls_config:  Arc<RustlsClientConfig>,
    server_name: Option<ServerName<'static>>,
}

impl ClientTlsContext {
    /// Loads the CA bundle (and client identity, when configured) from disk
    pub fn load(paths: &ClientCertPath) -> Result<Self> {
        tracing::info!("Loading client TLS context:");
        tracing::info!("  - CA cert: {:?}", paths.ca_path);
        let ca_pem = read_pem_file(&paths.ca_path)?;

        let identity = match (&paths.cert_path, &paths.key_path) {
            (Some(cert_path), Some(key_path)) => {
                tracing::info!("  - Client cert: {:?}", cert_path);
                tracing::info!("  - Client key: {:?}", key_path);
                Some((read_pem_file(cert_path)?, read_pem_file(key_path)?))
            }
            _ => None,
        };

        Self::from_pem(
            &ca_pem,
            identity
                .as_ref()
                .map(|(cert, key)| (cert.as_slice(), key.as_slice())),
        )
    }

    /// Builds a context from PEM data. `identity` is a certificate chain and
    /// private key presented when the server asks for a client certificate.
    pub fn from_pem(ca_pem: &[u8], identity: Option<(&[u8], &[u8])>) -> Result<Self> {
        install_crypto_provider();

        let root_store = root_store_from_pem(ca_pem)?;
        let builder = RustlsClientConfig::builder().with_root_certificates(root_store);

        let tls_config = match identity {
            Some((cert_pem, key_pem)) => {
                let cert_chain = parse_certificates(cert_pem)?;
                let private_key = parse_private_key(key_pem)?;
                builder
                    .with_client_auth_cert(cert_chain, private_key)
                    .map_err(|e| {
                        TransportError::TlsContextError(format!(
                            "failed to build TLS client configuration: {e}"
                        ))
                    })?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            tls_config:  Arc::new(tls_config),
            server_name: None,
        })
    }

    /// Verify every server against `name` instead of the connect target
    pub fn with_server_name(mut self, name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(name.to_string()).map_err(|e| {
            TransportError::TlsContextError(format!("invalid server name '{name}': {e}"))
        })?;
        self.server_name = Some(server_name);
        Ok(self)
    }

    pub fn tls_config(&self) -> Arc<RustlsClientConfig> {
        Arc::clone(&self.tls_config)
    }
}

impl std::fmt::Debug for ClientTlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Opens plain and TLS connections whose streams live in a `Transport`
pub struct TransportClient {
    transport: Arc<Transport>,
    tls:       Option<ClientTlsContext>,
}

impl TransportClient {
    pub fn new(transport: Arc<Transport>, tls: Option<ClientTlsContext>) -> Self {
        Self { transport, tls }
    }

    /// A client on the process-wide transport
    pub fn installed(tls: Option<ClientTlsContext>) -> Result<Self> {
        Ok(Self::new(Transport::install()?, tls))
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Connects to the IPv4 address `addr` (as returned by `resolve_v4`)
    pub fn open(&self, addr: u32, port: u16, secure: bool) -> Result<Connection> {
        self.open_target(AddressTarget::V4(addr), port, secure)
    }

    /// Connects to the IPv6 address `addr` (as returned by `resolve_v6`)
    pub fn open_v6(&self, addr: u128, port: u16, secure: bool) -> Result<Connection> {
        self.open_target(AddressTarget::V6(addr), port, secure)
    }

    pub fn open_target(&self, target: AddressTarget, port: u16, secure: bool) -> Result<Connection> {
        self.establish(target.socket_addr(port), None, secure)
    }

    /// Resolves `name` to an IPv4 address and connects, verifying a TLS peer
    /// against `name`
    pub fn open_host(&self, name: &str, port: u16, secure: bool) -> Result<Connection> {
        let target = resolve(name, AddressFamily::V4)?;
        let server_name = ServerName::try_from(name.to_string()).ok();
        self.establish(target.socket_addr(port), server_name, secure)
    }

    fn connect_socket(&self, peer: SocketAddr) -> Result<TcpStream> {
        let config = self.transport.config();
        let connected = match config.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&peer, timeout),
            None => TcpStream::connect(peer),
        };
        let socket = connected.map_err(|source| TransportError::ConnectFailed { addr: peer, source })?;

        socket.set_read_timeout(config.read_timeout())?;
        socket.set_write_timeout(config.write_timeout())?;
        Ok(socket)
    }

    fn establish(
        &self,
        peer: SocketAddr,
        server_name: Option<ServerName<'static>>,
        secure: bool,
    ) -> Result<Connection> {
        tracing::debug!("Connecting to {} (secure: {})", peer, secure);
        let tls = match (secure, &self.tls) {
            (false, _) => None,
            (true, Some(tls)) => Some(tls),
            (true, None) => {
                return Err(TransportError::TlsContextError(
                    "secure connection requested without a client TLS context".into(),
                ))
            }
        };
        let socket = self.connect_socket(peer)?;

        let handle = if let Some(tls) = tls {
            let server_name = tls
                .server_name
                .clone()
                .or(server_name)
                .unwrap_or_else(|| ServerName::from(peer.ip()));

            let session = TlsSession::connect(socket, tls.tls_config(), server_name)?;
            tracing::info!(
                "✓ TLS connection to {} established ({:?})",
                peer,
                session.protocol_version()
            );
            self.transport.register_tls(session)?
        } else {
            self.transport.register_socket(socket)?
        };

        Ok(Connection::new(Arc::clone(&self.transport), handle))
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("transport", &self.transport)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Loopback addresses in the raw form `open` and `open_v6` take
pub const LOCALHOST_V4: u32 = u32::from_be_bytes(Ipv4Addr::LOCALHOST.octets());
pub const LOCALHOST_V6: u128 = u128::from_be_bytes(Ipv6Addr::LOCALHOST.octets());
