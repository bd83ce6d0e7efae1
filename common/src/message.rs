//! Datagram messages over UDP.
//!
//! Delivery is best effort: a message is one datagram, sent once. Only a
//! loopback peer is reported as reliable.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    dispatch::Transport,
    error::{Result, TransportError},
    registry::StreamHandle,
    resolver::{AddressFamily, AddressTarget},
};

/// Ethernet MTU, the documented default for IPv4 peers
pub const DEFAULT_IPV4_MTU: usize = 1500;

/// IPv6 minimum MTU
pub const DEFAULT_IPV6_MTU: usize = 1280;

/// Handle of an open message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(StreamHandle);

impl MessageHandle {
    pub fn stream_handle(&self) -> StreamHandle {
        self.0
    }
}

/// Largest message `write_message` accepts for `addr`
pub fn max_message_size(addr: AddressTarget) -> usize {
    match addr.family() {
        AddressFamily::V4 => DEFAULT_IPV4_MTU,
        AddressFamily::V6 => DEFAULT_IPV6_MTU,
    }
}

/// True only for loopback peers, where the OS delivers datagrams in order
/// and without loss
pub fn is_reliable(addr: AddressTarget) -> bool {
    addr.is_loopback()
}

fn bind_connected(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let (domain, local) = if peer.is_ipv4() {
        (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    } else {
        (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    Ok(socket.into())
}

impl Transport {
    /// Opens a datagram channel to `addr:port`. `secure` would need DTLS,
    /// which is not available.
    pub fn open_message(&self, addr: AddressTarget, port: u16, secure: bool) -> Result<MessageHandle> {
        if secure {
            return Err(TransportError::NotImplemented("DTLS message transport"));
        }
        let peer = addr.socket_addr(port);
        let socket = bind_connected(peer).map_err(|source| TransportError::ConnectFailed {
            addr: peer,
            source,
        })?;
        if let Some(timeout) = self.config().read_timeout() {
            socket.set_read_timeout(Some(timeout))?;
        }

        let handle = self.register_datagram(socket)?;
        tracing::debug!(
            "Opened message channel {} to {} (reliable: {})",
            handle,
            peer,
            is_reliable(addr)
        );
        Ok(MessageHandle(handle))
    }

    fn message_peer(&self, handle: MessageHandle) -> Result<SocketAddr> {
        self.record(handle.0)?
            .peer_addr
            .ok_or(TransportError::InvalidHandle(handle.0))
    }

    /// Sends `bytes` as one datagram
    pub fn write_message(&self, handle: MessageHandle, bytes: &[u8]) -> Result<usize> {
        let max = max_message_size(self.message_peer(handle)?.ip().into());
        if bytes.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max,
            });
        }
        self.write(handle.0, bytes)
    }

    /// Receives one datagram; excess bytes beyond `buf` are discarded
    pub fn read_message(&self, handle: MessageHandle, buf: &mut [u8]) -> Result<usize> {
        self.read(handle.0, buf)
    }

    pub fn close_message(&self, handle: MessageHandle) -> Result<()> {
        self.close(handle.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[test]
    fn mtu_defaults_per_family() {
        assert_eq!(max_message_size(Ipv4Addr::LOCALHOST.into()), 1500);
        assert_eq!(max_message_size(Ipv6Addr::LOCALHOST.into()), 1280);
    }

    #[test]
    fn only_loopback_is_reliable() {
        assert!(is_reliable(Ipv4Addr::LOCALHOST.into()));
        assert!(is_reliable(Ipv6Addr::LOCALHOST.into()));
        assert!(!is_reliable(Ipv4Addr::new(8, 8, 8, 8).into()));
        assert!(!is_reliable(Ipv4Addr::new(10, 0, 0, 1).into()));
    }

    #[test]
    fn loopback_round_trip() {
        let transport = Transport::new(TransportConfig::default());
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let handle = transport
            .open_message(Ipv4Addr::LOCALHOST.into(), port, false)
            .unwrap();
        assert!(transport.record(handle.stream_handle()).unwrap().is_network);
        assert_eq!(transport.write_message(handle, b"ping").unwrap(), 4);

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).unwrap();
        let n = transport.read_message(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");

        transport.close_message(handle).unwrap();
        assert!(transport.close_message(handle).is_err());
    }

    #[test]
    fn ipv6_loopback_round_trip() {
        let transport = Transport::new(TransportConfig::default());
        let peer = UdpSocket::bind("[::1]:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let target: AddressTarget = Ipv6Addr::LOCALHOST.into();
        let handle = transport.open_message(target, port, false).unwrap();
        assert_eq!(
            transport.record(handle.stream_handle()).unwrap().peer_addr,
            Some(SocketAddr::from((Ipv6Addr::LOCALHOST, port)))
        );
        assert_eq!(transport.write_message(handle, b"ping6").unwrap(), 5);

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping6");
        assert!(from.is_ipv6());

        peer.send_to(b"pong6", from).unwrap();
        let n = transport.read_message(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong6");

        // The IPv6 limit applies
        assert!(matches!(
            transport.write_message(handle, &[0u8; 1281]),
            Err(TransportError::MessageTooLarge { max: 1280, .. })
        ));
        transport.close_message(handle).unwrap();
    }

    #[test]
    fn oversized_message_is_rejected() {
        let transport = Transport::new(TransportConfig::default());
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = transport
            .open_message(Ipv4Addr::LOCALHOST.into(), peer.local_addr().unwrap().port(), false)
            .unwrap();

        let err = transport.write_message(handle, &[0u8; 1501]).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 1501, max: 1500 }));
        transport.close_message(handle).unwrap();
    }

    #[test]
    fn secure_messages_are_not_implemented() {
        let transport = Transport::new(TransportConfig::default());
        assert!(matches!(
            transport.open_message(Ipv4Addr::LOCALHOST.into(), 9, true),
            Err(TransportError::NotImplemented(_))
        ));
    }
}
