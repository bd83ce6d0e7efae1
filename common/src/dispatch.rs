//! The single path every read, write and close goes through.
//!
//! A `Transport` owns the stream registry. Each call looks its handle up,
//! checks the record is still open, then forwards to the `Stream` variant:
//! straight to the OS for files and plain sockets, through the TLS session
//! for secure sockets. No registry lock is held while the I/O runs, and
//! plain streams are not locked at all, so reads and writes on one handle
//! proceed in parallel.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, UdpSocket},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, TryLockError,
    },
};

use rustls::pki_types::CertificateDer;

use crate::{
    config::TransportConfig,
    error::{Result, TransportError},
    registry::{Entry, RecordInfo, Registry, StreamHandle, StreamRecord},
    stream::{os_handle, PlainStream, Stream, StreamKind},
    tls_session::TlsSession,
};

static GLOBAL: OnceLock<Arc<Transport>> = OnceLock::new();

#[derive(Debug)]
pub struct Transport {
    registry:  Registry,
    config:    TransportConfig,
    installed: AtomicBool,
}

impl Transport {
    /// An isolated transport with its own registry
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(config.max_streams),
            config,
            installed: AtomicBool::new(true),
        })
    }

    /// The process-wide transport. The first call creates it from the
    /// environment; later calls return the same instance.
    pub fn install() -> Result<Arc<Self>> {
        if let Some(transport) = GLOBAL.get() {
            return Ok(Arc::clone(transport));
        }
        let config = TransportConfig::default().from_env()?;
        let transport = GLOBAL.get_or_init(|| {
            tracing::info!("Installing process transport (max {} streams)", config.max_streams);
            Self::new(config)
        });
        Ok(Arc::clone(transport))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn ensure_installed(&self) -> Result<()> {
        if self.installed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ConsistencyError(
                "transport used after teardown".into(),
            ))
        }
    }

    fn register(&self, record: StreamRecord, stream: Stream) -> Result<StreamHandle> {
        self.ensure_installed()?;
        let kind = record.kind;
        let handle = self.registry.insert(record, stream)?;
        tracing::debug!("Registered {:?} stream {}", kind, handle);
        Ok(handle)
    }

    /// Record for a network socket, with its shadow duplicate attached
    fn socket_record(kind: StreamKind, socket: &TcpStream) -> Result<StreamRecord> {
        let shadow = socket
            .try_clone()
            .map_err(TransportError::DuplicateHandleFailed)?;
        let mut record = StreamRecord::new(kind);
        record.peer_addr = socket.peer_addr().ok();
        record.os_handle = Some(os_handle(socket));
        record.shadow = Some(shadow);
        Ok(record)
    }

    pub fn register_file(&self, file: File) -> Result<StreamHandle> {
        self.register(StreamRecord::new(StreamKind::PlainFile), Stream::file(file))
    }

    pub fn open_file(&self, path: impl AsRef<Path>, options: &OpenOptions) -> Result<StreamHandle> {
        let file = options.open(path)?;
        self.register_file(file)
    }

    pub fn register_socket(&self, socket: TcpStream) -> Result<StreamHandle> {
        let record = Self::socket_record(StreamKind::PlainSocket, &socket)?;
        self.register(record, Stream::socket(socket))
    }

    /// Registers an established TLS session together with its peer chain
    pub fn register_tls(&self, session: TlsSession) -> Result<StreamHandle> {
        let mut record = Self::socket_record(StreamKind::TlsSocket, session.socket())?;
        record.peer_certificates = session.peer_certificates();
        self.register(record, Stream::TlsSocket(Box::new(session)))
    }

    pub fn register_datagram(&self, socket: UdpSocket) -> Result<StreamHandle> {
        let mut record = StreamRecord::new(StreamKind::Datagram);
        record.peer_addr = socket.peer_addr().ok();
        self.register(record, Stream::datagram(socket))
    }

    /// Looks up an entry whose record is still open
    fn open_entry(&self, handle: StreamHandle) -> Result<Arc<Entry>> {
        let entry = self.registry.lookup(handle)?;
        if !entry.record().is_open {
            return Err(TransportError::InvalidHandle(handle));
        }
        Ok(entry)
    }

    /// Runs one I/O operation on `handle`. Plain streams are cloned out of
    /// the entry and used after the stream lock is released, so a pending
    /// read never holds up a write. A TLS session keeps the lock for the
    /// whole call since its state is shared by both directions.
    fn with_stream<A, T>(
        &self,
        handle: StreamHandle,
        arg: A,
        plain: impl FnOnce(&mut PlainStream, A) -> io::Result<T>,
        tls: impl FnOnce(&mut TlsSession, A) -> Result<T>,
    ) -> Result<T> {
        let entry = self.open_entry(handle)?;
        let mut guard = entry.stream();
        let mut shared = match guard.as_mut() {
            Some(Stream::TlsSocket(session)) => return tls(&mut **session, arg),
            Some(stream) => stream.plain(),
            None => None,
        }
        .ok_or(TransportError::InvalidHandle(handle))?;
        drop(guard);
        drop(entry);
        Ok(plain(&mut shared, arg)?)
    }

    pub fn read(&self, handle: StreamHandle, buf: &mut [u8]) -> Result<usize> {
        self.with_stream(
            handle,
            buf,
            |stream, buf| stream.read(buf),
            |session, buf| session.decrypt_read(buf),
        )
    }

    pub fn write(&self, handle: StreamHandle, bytes: &[u8]) -> Result<usize> {
        self.with_stream(
            handle,
            bytes,
            |stream, bytes| stream.write(bytes),
            |session, bytes| session.encrypt_write(bytes),
        )
    }

    pub fn write_all(&self, handle: StreamHandle, bytes: &[u8]) -> Result<()> {
        self.with_stream(
            handle,
            bytes,
            |stream, bytes| stream.write_all(bytes),
            |session, bytes| session.encrypt_write_all(bytes),
        )
    }

    pub fn flush(&self, handle: StreamHandle) -> Result<()> {
        self.with_stream(
            handle,
            (),
            |stream, ()| stream.flush(),
            |session, ()| session.flush_session(),
        )
    }

    /// Closes `handle`. Closing an already closed handle returns
    /// `InvalidHandle` and leaves the registry untouched.
    pub fn close(&self, handle: StreamHandle) -> Result<()> {
        let entry = self.registry.remove(handle)?;
        Self::teardown_entry(handle, &entry);
        Ok(())
    }

    fn teardown_entry(handle: StreamHandle, entry: &Entry) {
        let (shadow, kind) = {
            let mut record = entry.record();
            let kind = record.kind;
            (record.release(), kind)
        };

        // Another thread may be blocked in read or write on this stream;
        // shutting the socket down through the shadow wakes it up.
        let mut guard = match entry.stream.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                if let Some(shadow) = &shadow {
                    let _ = shadow.shutdown(Shutdown::Both);
                }
                entry.stream()
            }
        };

        let stream = guard.take();
        drop(guard);
        match stream {
            // close_notify goes out before either descriptor is released
            Some(Stream::TlsSocket(session)) => {
                let socket = session.finish();
                drop(shadow);
                drop(socket);
            }
            Some(stream) => {
                drop(shadow);
                stream.close();
            }
            None => drop(shadow),
        }
        tracing::debug!("Closed {:?} stream {}", kind, handle);
    }

    /// Closes every live stream and uninstalls the transport.
    ///
    /// Must run after application threads stopped issuing I/O. Fails with
    /// `ConsistencyError` when called twice or when the registry's live
    /// count disagrees with what was actually removed.
    pub fn teardown(&self) -> Result<usize> {
        if !self.installed.swap(false, Ordering::SeqCst) {
            return Err(TransportError::ConsistencyError(
                "transport torn down twice".into(),
            ));
        }

        let drained = self.registry.drain();
        for (handle, entry) in &drained {
            Self::teardown_entry(*handle, entry);
        }

        let expected = self.registry.forget_drained(drained.len());
        if expected != drained.len() {
            return Err(TransportError::ConsistencyError(format!(
                "registry tracked {} live streams but {} were removed",
                expected,
                drained.len()
            )));
        }

        tracing::info!("Transport torn down, {} stream(s) closed", drained.len());
        Ok(drained.len())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.registry.live_count()
    }

    pub fn handles(&self) -> Vec<StreamHandle> {
        self.registry.handles()
    }

    pub fn record(&self, handle: StreamHandle) -> Result<RecordInfo> {
        self.registry.info(handle)
    }

    /// Peer certificate chain captured at handshake time, leaf first
    pub fn peer_certificates(&self, handle: StreamHandle) -> Result<Vec<CertificateDer<'static>>> {
        let entry = self.open_entry(handle)?;
        let record = entry.record();
        Ok(record.peer_certificates.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;

    fn transport() -> Arc<Transport> {
        Transport::new(TransportConfig::default())
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("conduit-{}-{}", std::process::id(), name))
    }

    /// Connected socket pair, the far end echoing everything back
    fn echo_pair() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match peer.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if peer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        TcpStream::connect(addr).unwrap()
    }

    #[test]
    fn file_streams_pass_straight_through() {
        let transport = transport();
        let path = temp_path("file-stream");

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let handle = transport.open_file(&path, &options).unwrap();
        transport.write_all(handle, b"plain bytes").unwrap();
        transport.close(handle).unwrap();

        let handle = transport.open_file(&path, OpenOptions::new().read(true)).unwrap();
        let info = transport.record(handle).unwrap();
        assert!(!info.is_network);
        assert!(!info.has_shadow);

        let mut buf = [0u8; 32];
        let n = transport.read(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"plain bytes");
        transport.close(handle).unwrap();
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn socket_has_distinct_unregistered_shadow() {
        let transport = transport();
        let handle = transport.register_socket(echo_pair()).unwrap();
        let info = transport.record(handle).unwrap();

        assert!(info.is_network);
        assert!(!info.is_secure);
        assert!(info.has_shadow);
        assert_ne!(info.shadow_os_handle, info.os_handle);
        assert_eq!(transport.handles(), vec![handle]);
        transport.close(handle).unwrap();
    }

    #[test]
    fn plain_socket_echo() {
        let transport = transport();
        let handle = transport.register_socket(echo_pair()).unwrap();

        transport.write_all(handle, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            read += transport.read(handle, &mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"hello");
        transport.close(handle).unwrap();
    }

    #[test]
    fn read_and_write_on_one_handle_run_in_parallel() {
        let transport = transport();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        let handle = transport.register_socket(client).unwrap();

        // The peer only answers once it has seen the request
        let responder = thread::spawn(move || {
            let mut request = [0u8; 4];
            peer.read_exact(&mut request).unwrap();
            assert_eq!(&request, b"ping");
            peer.write_all(b"pong").unwrap();
        });

        let reader = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let mut reply = [0u8; 4];
                let n = transport.read(handle, &mut reply)?;
                Ok::<_, TransportError>(reply[..n].to_vec())
            })
        };
        thread::sleep(std::time::Duration::from_millis(100));

        transport.write_all(handle, b"ping").unwrap();
        responder.join().unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), b"pong");
        transport.close(handle).unwrap();
    }

    #[test]
    fn second_close_is_invalid_handle() {
        let transport = transport();
        let handle = transport.register_socket(echo_pair()).unwrap();
        transport.close(handle).unwrap();

        assert!(matches!(transport.close(handle), Err(TransportError::InvalidHandle(_))));
        assert!(matches!(
            transport.read(handle, &mut [0u8; 1]),
            Err(TransportError::InvalidHandle(_))
        ));
        assert_eq!(transport.live_count(), 0);

        // The registry still works afterwards
        let again = transport.register_socket(echo_pair()).unwrap();
        assert_ne!(again, handle);
        transport.close(again).unwrap();
    }

    #[test]
    fn close_unblocks_pending_read() {
        let transport = transport();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_silent_peer, _) = listener.accept().unwrap();
        let handle = transport.register_socket(client).unwrap();

        let reader = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.read(handle, &mut [0u8; 16]))
        };
        thread::sleep(std::time::Duration::from_millis(100));
        transport.close(handle).unwrap();

        // Either the shutdown surfaced as EOF/error, or the read lost the race
        // to close and saw an invalid handle; it must not hang.
        match reader.join().unwrap() {
            Ok(n) => assert_eq!(n, 0),
            Err(_) => {}
        }
    }

    #[test]
    fn teardown_closes_everything_once() {
        let transport = transport();
        for _ in 0..3 {
            transport.register_socket(echo_pair()).unwrap();
        }
        assert_eq!(transport.teardown().unwrap(), 3);
        assert_eq!(transport.live_count(), 0);
        assert!(!transport.is_installed());

        assert!(matches!(transport.teardown(), Err(TransportError::ConsistencyError(_))));
        assert!(matches!(
            transport.register_socket(echo_pair()),
            Err(TransportError::ConsistencyError(_))
        ));
    }

    #[test]
    fn install_is_idempotent() {
        let first = Transport::install().unwrap();
        let second = Transport::install().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
