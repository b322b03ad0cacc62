//! UDP socket marked for low delay so routers that honor TOS queue it first
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use super::box_error::BoxError;

const IPTOS_LOWDELAY: u32 = 0x10;

/// bind a TOS marked socket on all interfaces.  Port 0 picks any free port.
pub fn new(port: u32) -> Result<UdpSocket, BoxError> {
    let raw_sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    raw_sock.set_tos(IPTOS_LOWDELAY)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port as u16);
    raw_sock.bind(&SockAddr::from(addr))?;
    Ok(UdpSocket::from(raw_sock))
}
