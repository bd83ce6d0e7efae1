use std::{
    fs::File,
    io::{self, Read, Write},
    net::{TcpStream, UdpSocket},
    sync::Arc,
};

use crate::tls_session::TlsSession;

/// What kind of object a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    PlainFile,
    PlainSocket,
    TlsSocket,
    Datagram,
}

impl StreamKind {
    pub fn is_network(self) -> bool {
        !matches!(self, StreamKind::PlainFile)
    }

    pub fn is_secure(self) -> bool {
        matches!(self, StreamKind::TlsSocket)
    }
}

/// A registered stream. Plain variants are shared so I/O on them can run
/// without holding the stream lock; the TLS variant routes every byte
/// through its session and is used under that lock.
pub enum Stream {
    PlainFile(Arc<File>),
    PlainSocket(Arc<TcpStream>),
    TlsSocket(Box<TlsSession>),
    Datagram(Arc<UdpSocket>),
}

impl Stream {
    pub fn file(file: File) -> Self {
        Stream::PlainFile(Arc::new(file))
    }

    pub fn socket(socket: TcpStream) -> Self {
        Stream::PlainSocket(Arc::new(socket))
    }

    pub fn datagram(socket: UdpSocket) -> Self {
        Stream::Datagram(Arc::new(socket))
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Stream::PlainFile(_) => StreamKind::PlainFile,
            Stream::PlainSocket(_) => StreamKind::PlainSocket,
            Stream::TlsSocket(_) => StreamKind::TlsSocket,
            Stream::Datagram(_) => StreamKind::Datagram,
        }
    }

    /// A second reference to the OS object of a plain stream; `None` for TLS
    pub fn plain(&self) -> Option<PlainStream> {
        match self {
            Stream::PlainFile(file) => Some(PlainStream::File(Arc::clone(file))),
            Stream::PlainSocket(socket) => Some(PlainStream::Socket(Arc::clone(socket))),
            Stream::Datagram(socket) => Some(PlainStream::Datagram(Arc::clone(socket))),
            Stream::TlsSocket(_) => None,
        }
    }

    /// Release OS resources, ending a TLS session cleanly first. A plain
    /// socket is shut down here so readers still holding it see EOF; the
    /// descriptor itself goes away with the last reference.
    pub fn close(self) {
        match self {
            Stream::TlsSocket(session) => session.close(),
            Stream::PlainSocket(socket) => {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
            Stream::PlainFile(_) | Stream::Datagram(_) => {}
        }
    }
}

/// OS object behind a plain stream. Reads and writes go through shared
/// references, so one thread can read while another writes.
#[derive(Debug, Clone)]
pub enum PlainStream {
    File(Arc<File>),
    Socket(Arc<TcpStream>),
    Datagram(Arc<UdpSocket>),
}

impl Read for PlainStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PlainStream::File(file) => (&**file).read(buf),
            PlainStream::Socket(socket) => (&**socket).read(buf),
            PlainStream::Datagram(socket) => socket.recv(buf),
        }
    }
}

impl Write for PlainStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PlainStream::File(file) => (&**file).write(buf),
            PlainStream::Socket(socket) => (&**socket).write(buf),
            PlainStream::Datagram(socket) => socket.send(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PlainStream::File(file) => (&**file).flush(),
            PlainStream::Socket(socket) => (&**socket).flush(),
            PlainStream::Datagram(_) => Ok(()),
        }
    }
}

/// Numeric OS handle of a socket, for diagnostics and distinctness checks
pub fn os_handle(socket: &TcpStream) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        socket.as_raw_fd() as u64
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawSocket;
        socket.as_raw_socket()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify_network_and_secure() {
        assert!(!StreamKind::PlainFile.is_network());
        assert!(StreamKind::PlainSocket.is_network());
        assert!(StreamKind::Datagram.is_network());
        assert!(StreamKind::TlsSocket.is_network());
        assert!(StreamKind::TlsSocket.is_secure());
        assert!(!StreamKind::PlainSocket.is_secure());
    }

    #[test]
    fn plain_file_is_shared_not_reopened() {
        let file = File::open(env!("CARGO_MANIFEST_DIR").to_string() + "/Cargo.toml").unwrap();
        let stream = Stream::file(file);
        assert_eq!(stream.kind(), StreamKind::PlainFile);

        let Some(PlainStream::File(shared)) = stream.plain() else {
            panic!("plain file stream should expose its file");
        };
        let mut contents = String::new();
        (&*shared).read_to_string(&mut contents).unwrap();
        assert!(contents.contains("conduit-common"));
    }
}
