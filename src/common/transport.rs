//! Raw packet send contract.
//!
//! The audio callbacks send through this trait instead of a socket so they can
//! be run against a mock in tests.  Receiving stays on the network threads,
//! which own the real socket.
#[cfg(test)]
use mockall::automock;
use std::net::{SocketAddr, UdpSocket};

use super::box_error::BoxError;
use super::jam_packet::JamPacket;

#[cfg_attr(test, automock)]
pub trait PacketTransport: Send {
    fn send_to(&self, packet: &JamPacket, addr: SocketAddr) -> Result<usize, BoxError>;
}

impl PacketTransport for UdpSocket {
    fn send_to(&self, packet: &JamPacket, addr: SocketAddr) -> Result<usize, BoxError> {
        Ok(UdpSocket::send_to(self, packet.get_send_buffer(), addr)?)
    }
}

/// every packet a recording mock was asked to send, in order
#[cfg(test)]
pub type SentLog = std::sync::Arc<std::sync::Mutex<Vec<(JamPacket, SocketAddr)>>>;

/// Mock that accepts anything and keeps a copy for the test to look at
#[cfg(test)]
pub fn recording_transport() -> (MockPacketTransport, SentLog) {
    let log: SentLog = Default::default();
    let sent = std::sync::Arc::clone(&log);
    let mut mock = MockPacketTransport::new();
    mock.expect_send_to().returning(move |packet, addr| {
        if let Ok(mut v) = sent.lock() {
            v.push((packet.clone(), addr));
        }
        Ok(packet.get_nbytes())
    });
    (mock, log)
}

#[cfg(test)]
mod test_transport {
    use super::*;
    use crate::common::jam_packet::PacketKind;
    use crate::common::sock_with_tos;
    use std::time::Duration;

    #[test]
    fn udp_socket_sends_packets() {
        let rx = sock_with_tos::new(0).unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = rx.local_addr().unwrap().port();
        let tx = sock_with_tos::new(0).unwrap();
        let mut packet = JamPacket::new(PacketKind::Ping);
        packet.set_timestamp(1234);
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let sent = PacketTransport::send_to(&tx, &packet, addr).unwrap();
        assert_eq!(sent, packet.get_nbytes());

        let mut incoming = JamPacket::new(PacketKind::Audio);
        let (amt, _src) = rx.recv_from(incoming.get_buffer()).unwrap();
        incoming.set_nbytes(amt).unwrap();
        assert_eq!(incoming.get_kind(), Some(PacketKind::Ping));
        assert_eq!(incoming.get_timestamp(), 1234);
    }
}
