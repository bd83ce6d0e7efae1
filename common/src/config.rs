use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::{Result, TransportError};

const CERTS_DIR_ENV: &str = "CONDUIT_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const SERVER_CERTS_SUBDIR: &str = "server";
const CLIENT_CERTS_SUBDIR: &str = "client";

/// Listen backlog used by `wait_for_connection`
pub const DEFAULT_BACKLOG: i32 = 3;

/// Default upper bound on simultaneously registered streams
pub const DEFAULT_MAX_STREAMS: usize = 4096;

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Server certificate paths, loaded once when the server TLS context is built
#[derive(Debug, Clone)]
pub struct ServerCertPath {
    /// Path to the server certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Path to the server private key (PEM)
    pub key_path:  PathBuf,
    /// CA used to verify client certificates; `None` accepts anonymous clients
    pub ca_path:   Option<PathBuf>,
}

impl ServerCertPath {
    /// Creates ServerCertPath with default certificate locations under
    /// `$CONDUIT_CERTS_DIR/server`
    pub fn new() -> Self {
        let base = get_certs_dir().join(SERVER_CERTS_SUBDIR);
        Self {
            cert_path: base.join("server.pem"),
            key_path:  base.join("server.key.pem"),
            ca_path:   None,
        }
    }

    /// Require client certificates signed by the CA at `ca_path`
    pub fn with_client_ca(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }
}

impl Default for ServerCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate paths for the client side of a TLS connection
#[derive(Debug, Clone)]
pub struct ClientCertPath {
    /// CA bundle trusted for server certificates
    pub ca_path:   PathBuf,
    /// Client certificate presented when the server asks for one
    pub cert_path: Option<PathBuf>,
    /// Private key matching `cert_path`
    pub key_path:  Option<PathBuf>,
}

impl ClientCertPath {
    /// Creates ClientCertPath with default certificate locations. The client
    /// identity is only used if both files exist.
    pub fn new() -> Self {
        let base = get_certs_dir().join(CLIENT_CERTS_SUBDIR);
        let cert_path = base.join("client.pem");
        let key_path = base.join("client.key.pem");
        let has_identity = cert_path.exists() && key_path.exists();
        Self {
            ca_path:   get_certs_dir().join("root-ca.pem"),
            cert_path: has_identity.then_some(cert_path),
            key_path:  has_identity.then_some(key_path),
        }
    }

    /// Trust only the given CA bundle, without a client identity
    pub fn with_ca(ca_path: impl Into<PathBuf>) -> Self {
        Self {
            ca_path:   ca_path.into(),
            cert_path: None,
            key_path:  None,
        }
    }
}

impl Default for ClientCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Socket-level settings shared by clients and servers.
///
/// No timeout is imposed unless one is configured; blocking calls then wait
/// as long as the OS lets them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Listen backlog for server sockets
    pub backlog:            i32,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms:    Option<u64>,
    pub write_timeout_ms:   Option<u64>,
    /// Maximum number of live records in the stream registry
    pub max_streams:        usize,
    /// Set `SO_REUSEPORT` in addition to `SO_REUSEADDR` on unix listeners
    pub reuse_port:         bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backlog:            DEFAULT_BACKLOG,
            connect_timeout_ms: None,
            read_timeout_ms:    None,
            write_timeout_ms:   None,
            max_streams:        DEFAULT_MAX_STREAMS,
            reuse_port:         true,
        }
    }
}

impl TransportConfig {
    /// Loads settings from a JSON file; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            TransportError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TransportError::Config(e.to_string()))
    }

    /// Overlays `CONDUIT_*` environment variables on top of `self`
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(v) = env_parse::<i32>("CONDUIT_BACKLOG")? {
            self.backlog = v;
        }
        if let Some(v) = env_parse::<usize>("CONDUIT_MAX_STREAMS")? {
            self.max_streams = v;
        }
        if let Some(v) = env_parse::<u64>("CONDUIT_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse::<u64>("CONDUIT_READ_TIMEOUT_MS")? {
            self.read_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse::<u64>("CONDUIT_WRITE_TIMEOUT_MS")? {
            self.write_timeout_ms = Some(v);
        }
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TransportError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}
