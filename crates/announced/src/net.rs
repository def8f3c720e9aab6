//! Multicast socket setup.  Everything mDNS needs that tokio does
//! not expose directly goes through socket2: address reuse, group
//! membership, and the outgoing-interface selection.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

use mdns_types::protocol::types::{MDNS_GROUP_V4, MDNS_GROUP_V6, MDNS_PORT};

/// A UDP socket bound to port 5353, joined to the IPv4 mDNS group on
/// the interface owning `iface_addr`, with multicast loopback off so
/// we do not hear ourselves.
pub fn bind_multicast_v4(iface_addr: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v4(&MDNS_GROUP_V4, &iface_addr)?;
    socket.set_multicast_if_v4(&iface_addr)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_ttl_v4(255)?;

    UdpSocket::from_std(socket.into())
}

/// The IPv6 counterpart, joined on the interface with OS index
/// `iface_index`.
pub fn bind_multicast_v6(iface_index: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v6(&MDNS_GROUP_V6, iface_index)?;
    socket.set_multicast_if_v6(iface_index)?;
    socket.set_multicast_loop_v6(false)?;

    UdpSocket::from_std(socket.into())
}

/// Where multicast transmits go.
pub fn group_addr_v4() -> SocketAddr {
    SocketAddr::from((MDNS_GROUP_V4, MDNS_PORT))
}

pub fn group_addr_v6() -> SocketAddr {
    SocketAddr::from((MDNS_GROUP_V6, MDNS_PORT))
}
