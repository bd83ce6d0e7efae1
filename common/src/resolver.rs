use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
};

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("IPv4"),
            AddressFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// A resolved peer address, kept as its raw integer form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressTarget {
    V4(u32),
    V6(u128),
}

impl AddressTarget {
    pub fn ip(&self) -> IpAddr {
        match *self {
            AddressTarget::V4(raw) => IpAddr::V4(Ipv4Addr::from(raw)),
            AddressTarget::V6(raw) => IpAddr::V6(Ipv6Addr::from(raw)),
        }
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip(), port)
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            AddressTarget::V4(_) => AddressFamily::V4,
            AddressTarget::V6(_) => AddressFamily::V6,
        }
    }

    /// 127.0.0.0/8, ::1, and IPv4-mapped loopback
    pub fn is_loopback(&self) -> bool {
        match self.ip() {
            IpAddr::V4(ip) => ip.is_loopback(),
            IpAddr::V6(ip) => {
                ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
            }
        }
    }
}

impl From<Ipv4Addr> for AddressTarget {
    fn from(ip: Ipv4Addr) -> Self {
        AddressTarget::V4(ip.into())
    }
}

impl From<Ipv6Addr> for AddressTarget {
    fn from(ip: Ipv6Addr) -> Self {
        AddressTarget::V6(ip.into())
    }
}

impl From<IpAddr> for AddressTarget {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl fmt::Display for AddressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ip().fmt(f)
    }
}

/// Resolves `name` and returns the first stream-capable address of `family`
pub fn resolve(name: &str, family: AddressFamily) -> Result<AddressTarget> {
    lookup(name, family, |ip| {
        let target = AddressTarget::from(ip);
        (target.family() == family).then_some(target)
    })
}

pub fn resolve_v4(name: &str) -> Result<u32> {
    lookup(name, AddressFamily::V4, |ip| match ip {
        IpAddr::V4(v4) => Some(u32::from(v4)),
        IpAddr::V6(_) => None,
    })
}

pub fn resolve_v6(name: &str) -> Result<u128> {
    lookup(name, AddressFamily::V6, |ip| match ip {
        IpAddr::V6(v6) => Some(u128::from(v6)),
        IpAddr::V4(_) => None,
    })
}

fn lookup<T: fmt::Debug>(
    name: &str,
    family: AddressFamily,
    pick: impl Fn(IpAddr) -> Option<T>,
) -> Result<T> {
    let addrs = (name, 0u16)
        .to_socket_addrs()
        .map_err(|e| TransportError::ResolutionError {
            name:   name.to_string(),
            reason: e.to_string(),
        })?;

    match addrs.map(|addr| addr.ip()).find_map(pick) {
        Some(found) => {
            tracing::debug!("Resolved '{}' ({}) to {:?}", name, family, found);
            Ok(found)
        }
        None => Err(TransportError::NoAddressFound {
            name: name.to_string(),
            family,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolves_to_loopback() {
        let raw = resolve_v4("localhost").unwrap();
        assert_eq!(Ipv4Addr::from(raw), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn numeric_literals_resolve_to_themselves() {
        assert_eq!(resolve_v4("10.1.2.3").unwrap(), u32::from(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(resolve_v6("::1").unwrap(), u128::from(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn family_mismatch_is_no_address_found() {
        let err = resolve("127.0.0.1", AddressFamily::V6).unwrap_err();
        assert!(matches!(
            err,
            TransportError::NoAddressFound { family: AddressFamily::V6, .. }
        ));
    }

    #[test]
    fn resolver_failure_carries_reason() {
        let err = resolve("no-such-host.invalid", AddressFamily::V4).unwrap_err();
        match err {
            TransportError::ResolutionError { name, reason } => {
                assert_eq!(name, "no-such-host.invalid");
                assert!(!reason.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn loopback_detection() {
        assert!(AddressTarget::from(Ipv4Addr::LOCALHOST).is_loopback());
        assert!(AddressTarget::from(Ipv4Addr::new(127, 9, 9, 9)).is_loopback());
        assert!(AddressTarget::from(Ipv6Addr::LOCALHOST).is_loopback());
        assert!(!AddressTarget::from(Ipv4Addr::new(192, 168, 1, 1)).is_loopback());
        assert!(!AddressTarget::from(Ipv6Addr::UNSPECIFIED).is_loopback());
    }
}
