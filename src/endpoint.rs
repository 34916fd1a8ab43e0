//! IPv4 endpoint value type.
//!
//! An [`Endpoint`] is the address half of every socket operation: a 32-bit
//! IPv4 address plus a 16-bit port. It is a plain value: comparable,
//! hashable, ordered by `(address, port)`, convertible to and from the
//! standard library socket address types used by the OS layer.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 address and port pair.
///
/// Parsing never fails: text that is not a dotted quad with a port yields
/// the zero endpoint (`0.0.0.0:0`), mirroring how the transport treats an
/// unspecified address. DNS names are out of scope; only dotted-quad text
/// is understood.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    address: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    /// Builds an endpoint from an address and port.
    pub fn new(address: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { address, port }
    }

    /// Builds a wildcard-address endpoint from a port alone, for binding
    /// on all interfaces or requesting an ephemeral port with `port == 0`.
    pub fn from_port(port: u16) -> Endpoint {
        Endpoint {
            address: Ipv4Addr::UNSPECIFIED,
            port,
        }
    }

    /// Parses `"a.b.c.d:port"` text. Unparsable input yields the zero
    /// endpoint rather than an error.
    pub fn parse(text: &str) -> Endpoint {
        match text.parse::<SocketAddrV4>() {
            Ok(addr) => Endpoint::from(addr),
            Err(_) => Endpoint::default(),
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the address is the wildcard `0.0.0.0`.
    pub fn is_wildcard(&self) -> bool {
        self.address.is_unspecified()
    }

    /// Converts a standard socket address, taking the zero endpoint for
    /// anything that is not IPv4.
    pub(crate) fn from_socket_addr(addr: SocketAddr) -> Endpoint {
        match addr {
            SocketAddr::V4(v4) => Endpoint::from(v4),
            SocketAddr::V6(_) => Endpoint::default(),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Endpoint {
        Endpoint::from_port(0)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Endpoint {
        Endpoint::new(*addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(ep: Endpoint) -> SocketAddrV4 {
        SocketAddrV4::new(ep.address, ep.port)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> SocketAddr {
        SocketAddr::V4(ep.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_round_trip() {
        let ep = Endpoint::new(Ipv4Addr::new(192, 168, 1, 20), 9000);
        assert_eq!(ep.address(), Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(ep.port(), 9000);
    }

    #[test]
    fn test_display_parse_round_trip() {
        let ep = Endpoint::new(Ipv4Addr::new(10, 0, 0, 7), 8125);
        assert_eq!(Endpoint::parse(&ep.to_string()), ep);
    }

    #[test]
    fn test_parse_garbage_yields_zero_endpoint() {
        assert_eq!(Endpoint::parse("not an address"), Endpoint::default());
        assert_eq!(Endpoint::parse("256.1.1.1:80"), Endpoint::default());
        assert_eq!(Endpoint::parse("10.0.0.1"), Endpoint::default());
        assert_eq!(Endpoint::parse(""), Endpoint::default());
    }

    #[test]
    fn test_wildcard_from_port() {
        let ep = Endpoint::from_port(4000);
        assert!(ep.is_wildcard());
        assert_eq!(ep.port(), 4000);
    }

    #[test]
    fn test_ordering_is_address_then_port() {
        let a = Endpoint::new(Ipv4Addr::new(1, 0, 0, 1), 9000);
        let b = Endpoint::new(Ipv4Addr::new(1, 0, 0, 2), 80);
        let c = Endpoint::new(Ipv4Addr::new(1, 0, 0, 2), 81);
        assert!(a < b);
        assert!(b < c);
    }
}
