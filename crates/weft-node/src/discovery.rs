//! UDP discovery.
//!
//! Nodes below their target degree broadcast ASCII solicitations
//! (`meshage:<name>`) on the shared mesh port. Any node hearing one dials
//! the datagram's *source address* back: solicitations are sent from the
//! sender's bound discovery socket, so the source port is the sender's
//! mesh port and the reply dial lands on its TCP listener.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Protocol tag on every solicitation datagram.
pub const SOLICIT_PREFIX: &str = "meshage";

/// Solicitation backoff cap: sleeps stay under `2^7` seconds.
pub const MAX_BACKOFF: u32 = 7;

/// Bind the shared discovery socket on `0.0.0.0:port`.
///
/// Built with socket2 so broadcast and address reuse are set before the
/// bind, then handed to tokio.
pub fn bind(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SocketAddr::V4(addr).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// The solicitation datagram for a node name.
pub fn solicitation(name: &str) -> String {
    format!("{}:{}", SOLICIT_PREFIX, name)
}

/// Parse a datagram into the soliciting node's name.
///
/// Exactly two colon-separated parts, `meshage` then the name; anything
/// else, a name containing a colon included, is malformed and the
/// caller's to log and ignore.
pub fn parse_solicitation(datagram: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut parts = text.split(':');
    let prefix = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() || prefix != SOLICIT_PREFIX || name.is_empty() {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solicitation_round_trips() {
        let datagram = solicitation("node-7");
        assert_eq!(datagram, "meshage:node-7");
        assert_eq!(parse_solicitation(datagram.as_bytes()), Some("node-7"));
    }

    #[test]
    fn malformed_datagrams_are_rejected() {
        assert_eq!(parse_solicitation(b"meshage"), None);
        assert_eq!(parse_solicitation(b"meshage:"), None);
        assert_eq!(parse_solicitation(b"other:node"), None);
        assert_eq!(parse_solicitation(&[0xff, 0xfe, b':', b'x']), None);
    }

    #[test]
    fn extra_fields_are_malformed() {
        // Strict two-part parse: a name with a colon in it is a bad
        // datagram, not a name.
        assert_eq!(parse_solicitation(b"meshage:a:b"), None);
        assert_eq!(parse_solicitation(b"meshage:a:"), None);
    }

    #[tokio::test]
    async fn bound_socket_can_broadcast() {
        let socket = bind(0).unwrap();
        assert!(socket.local_addr().unwrap().port() != 0);
        // SO_BROADCAST was set before the bind.
        assert!(socket.broadcast().unwrap());
    }
}
