//! Core type definitions for the rendezvous server
//!
//! # Address trust rule
//!
//! The transport-observed address of a datagram is authoritative for peer
//! identity. A client-declared port is only ever used as an additional
//! registration entry or as an exclusion hint when filtering a query; it is
//! never used to decide who a sender is. Relay `from` fields are always
//! overwritten with the observed address.
//!
//! Address equality is structural on `(ip, port)` everywhere. The address
//! family is carried for clients but never compared.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Opaque room identifier
pub type RoomId = String;

/// IP address family, as reported to clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "IPv4")]
    V4,
    #[serde(rename = "IPv6")]
    V6,
}

impl AddressFamily {
    /// Family of the given ip
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// A peer's network address as seen by the server
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(from = "WirePeerAddress")]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub family: AddressFamily,
    pub port: u16,
}

/// Wire form, where `family` may be omitted by clients
#[derive(Deserialize)]
struct WirePeerAddress {
    ip: IpAddr,
    #[serde(default)]
    family: Option<AddressFamily>,
    port: u16,
}

impl From<WirePeerAddress> for PeerAddress {
    fn from(wire: WirePeerAddress) -> Self {
        let ip = canonical_ip(wire.ip);
        Self {
            family: wire.family.unwrap_or_else(|| AddressFamily::of(&ip)),
            ip,
            port: wire.port,
        }
    }
}

impl PeerAddress {
    /// Create an address, deriving the family from the ip
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = canonical_ip(ip);
        Self {
            family: AddressFamily::of(&ip),
            ip,
            port,
        }
    }

    /// Same host, different port
    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..*self }
    }

    /// Socket address to send datagrams to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Collapse IPv4-mapped IPv6 addresses from dual-stack sockets to IPv4
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_family() {
        let a = PeerAddress::new("10.0.0.1".parse().unwrap(), 4000);
        let mut b = a;
        b.family = AddressFamily::V6;
        assert_eq!(a, b);
        assert_ne!(a, a.with_port(4001));
    }

    #[test]
    fn test_mapped_ipv6_is_canonicalised() {
        let mapped: SocketAddr = "[::ffff:192.168.1.5]:9000".parse().unwrap();
        let plain: SocketAddr = "192.168.1.5:9000".parse().unwrap();

        let a = PeerAddress::from(mapped);
        assert_eq!(a, PeerAddress::from(plain));
        assert_eq!(a.family, AddressFamily::V4);
    }

    #[test]
    fn test_wire_family_is_optional() {
        let addr: PeerAddress = serde_json::from_str(r#"{"ip":"::1","port":80}"#).unwrap();
        assert_eq!(addr.family, AddressFamily::V6);
        assert_eq!(addr.port, 80);

        let json = serde_json::to_string(&addr).unwrap();
        assert!(json.contains(r#""family":"IPv6""#));
    }
}
