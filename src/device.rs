//! smoltcp devices: one over the stdlib's UdpSocket, one over an in-memory link.
use core::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use smoltcp::{
    phy::{Checksum, DeviceCapabilities, Medium},
    time::Instant,
    wire::{IpAddress, IpEndpoint, Ipv4Packet, Ipv6Packet, UdpPacket},
};
use tracing::warn;

use std::{
    io::{ErrorKind, Result},
    net::{SocketAddr, UdpSocket},
};

/// Longest a device blocks waiting for a frame.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

const MTU: usize = 1500;

/// Interface address a [`UdpSocketDevice`] presents to smoltcp. Headers are
/// rebuilt around every datagram, so it only has to be consistent. Taken from
/// the documentation ranges (RFC 5737, RFC 3849).
fn virtual_addr(bound: &SocketAddr) -> IpAddress {
    match bound {
        SocketAddr::V4(_) => IpAddress::v4(192, 0, 2, 1),
        SocketAddr::V6(_) => IpAddress::v6(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
    }
}

pub struct RxToken(Vec<u8>);
impl smoltcp::phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub struct UdpTxToken<'a>(&'a UdpSocket);
impl<'a> smoltcp::phy::TxToken for UdpTxToken<'a> {
    /// Consume a raw IP packet and send its UDP payload over the socket.
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0; len];
        let result = f(&mut buffer);
        match strip_ip_packet(&buffer) {
            Some((payload, addr)) => {
                if let Err(err) = self.0.send_to(payload, addr) {
                    warn!(%addr, %err, "datagram send failed");
                }
            }
            None => warn!(len, "dropping unparseable outbound frame"),
        }
        result
    }
}

/// Set basic UDP headers on a packet.
fn set_udp_headers<T: AsRef<[u8]> + AsMut<[u8]>>(
    src_addr: &IpEndpoint,
    dst_addr: &IpEndpoint,
    packet: &mut UdpPacket<T>,
    payload: &[u8],
) {
    packet.set_src_port(src_addr.port);
    packet.set_dst_port(dst_addr.port);
    packet.set_len((packet.as_ref().len()) as u16);
    packet.payload_mut().copy_from_slice(payload);
    packet.fill_checksum(&src_addr.addr, &dst_addr.addr);
}

/// Craft a minimal raw packet given a source and a destination. `None` when
/// the address families differ.
fn craft_raw_packet(
    src_addr: &IpEndpoint,
    dst_addr: &IpEndpoint,
    packet: &[u8],
) -> Option<Vec<u8>> {
    let pkt_len = packet.len();
    match (src_addr.addr, dst_addr.addr) {
        (IpAddress::Ipv4(src), IpAddress::Ipv4(dst)) => {
            let mut buffer = vec![0; pkt_len + 20 + 8];
            let mut udp_packet = UdpPacket::new_unchecked(&mut buffer[20..]);
            set_udp_headers(src_addr, dst_addr, &mut udp_packet, packet);

            let mut ip_packet = Ipv4Packet::new_unchecked(&mut buffer);
            ip_packet.set_version(4);
            ip_packet.set_header_len(20);
            ip_packet.set_next_header(smoltcp::wire::IpProtocol::Udp);
            ip_packet.set_dont_frag(true);
            ip_packet.set_hop_limit(64);
            ip_packet.set_total_len(ip_packet.as_ref().len() as u16);
            ip_packet.set_src_addr(src);
            ip_packet.set_dst_addr(dst);
            ip_packet.fill_checksum();

            Some(buffer)
        }
        (IpAddress::Ipv6(src), IpAddress::Ipv6(dst)) => {
            let mut buffer = vec![0; pkt_len + 40 + 8];
            let mut udp_packet = UdpPacket::new_unchecked(&mut buffer[40..]);
            let udp_len = udp_packet.as_ref().len();
            set_udp_headers(src_addr, dst_addr, &mut udp_packet, packet);

            let mut ip_packet = Ipv6Packet::new_unchecked(&mut buffer);
            ip_packet.set_version(6);
            ip_packet.set_next_header(smoltcp::wire::IpProtocol::Udp);
            ip_packet.set_payload_len(udp_len as u16);
            ip_packet.set_hop_limit(64);
            ip_packet.set_src_addr(src);
            ip_packet.set_dst_addr(dst);

            Some(buffer)
        }
        _ => None,
    }
}

fn strip_ip_packet(packet: &[u8]) -> Option<(&[u8], SocketAddr)> {
    match packet.first()? >> 4 {
        4 => {
            let ip_packet = Ipv4Packet::new_checked(packet).ok()?;
            let udp_packet = UdpPacket::new_checked(ip_packet.payload()).ok()?;
            let addr = SocketAddr::new(ip_packet.dst_addr().into(), udp_packet.dst_port());
            Some((udp_packet.payload(), addr))
        }
        6 => {
            let ip_packet = Ipv6Packet::new_checked(packet).ok()?;
            let udp_packet = UdpPacket::new_checked(ip_packet.payload()).ok()?;
            let addr = SocketAddr::new(ip_packet.dst_addr().into(), udp_packet.dst_port());
            Some((udp_packet.payload(), addr))
        }
        _ => None,
    }
}

/// A smoltcp device backed by an ordinary UDP socket, so no TUN/TAP is needed.
pub struct UdpSocketDevice {
    socket: UdpSocket,
    /// Where received datagrams are addressed to inside smoltcp.
    iface_endpoint: IpEndpoint,
}

impl UdpSocketDevice {
    /// Bind the underlying socket. Returns the address actually bound.
    pub fn bind(addr: SocketAddr) -> Result<(Self, SocketAddr)> {
        let socket = UdpSocket::bind(addr)?;
        let bound_addr = socket.local_addr()?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let iface_addr = virtual_addr(&bound_addr);
        Ok((
            Self {
                socket,
                iface_endpoint: IpEndpoint::new(iface_addr, bound_addr.port()),
            },
            bound_addr,
        ))
    }

    /// The address to give the smoltcp interface driving this device.
    pub fn iface_addr(&self) -> IpAddress {
        self.iface_endpoint.addr
    }
}

// The OS owns the real IP headers. smoltcp gets synthesized ones.
impl smoltcp::phy::Device for UdpSocketDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = UdpTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut buffer = vec![0; MTU];
        match self.socket.recv_from(&mut buffer) {
            Ok((size, src_addr)) => {
                buffer.truncate(size);
                let raw = craft_raw_packet(&src_addr.into(), &self.iface_endpoint, &buffer)?;
                Some((RxToken(raw), UdpTxToken(&self.socket)))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
            Err(e) => {
                warn!(err = %e, "datagram receive failed");
                None
            }
        }
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(UdpTxToken(&self.socket))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut capabilities = DeviceCapabilities::default();
        capabilities.medium = Medium::Ip;
        capabilities.max_transmission_unit = MTU;
        // Headers are synthesized locally, the OS checks the real ones.
        capabilities.checksum.ipv4 = Checksum::None;
        capabilities.checksum.udp = Checksum::None;
        capabilities
    }
}

pub struct ChannelTxToken<'a>(&'a Sender<Vec<u8>>);
impl<'a> smoltcp::phy::TxToken for ChannelTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0; len];
        let result = f(&mut buffer);
        // A closed link loses the frame, like a cable pulled mid-flight.
        let _ = self.0.send(buffer);
        result
    }
}

/// One end of an in-memory link that carries raw IP packets.
pub struct ChannelDevice {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelDevice {
    /// Two devices wired to each other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

impl smoltcp::phy::Device for ChannelDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = ChannelTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.recv_timeout(POLL_INTERVAL).ok()?;
        Some((RxToken(frame), ChannelTxToken(&self.tx)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(ChannelTxToken(&self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut capabilities = DeviceCapabilities::default();
        capabilities.medium = Medium::Ip;
        capabilities.max_transmission_unit = MTU;
        capabilities
    }
}
