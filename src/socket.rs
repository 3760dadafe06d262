//! Datagram endpoints that transfers talk through.

use core::time::Duration;
use std::net::SocketAddr;
use std::time::Instant as StdInstant;

use managed::ManagedSlice;
use smoltcp::{
    iface::{Config, Interface, SocketHandle, SocketSet, SocketStorage},
    phy::Device,
    socket::udp::{PacketBuffer, PacketMetadata, Socket as UdpSocket},
    time::Instant,
    wire::{HardwareAddress, IpCidr, IpEndpoint},
};

use crate::device::UdpSocketDevice;
use crate::error::{Error, Result};

/// Datagram slots in each direction of a socket.
const SOCKET_SLOTS: usize = 8;
/// Payload bytes buffered in each direction of a socket.
const SOCKET_BUFFER: usize = 16 * 1024;

/// One local send/receive endpoint.
pub trait Endpoint {
    /// The address peers reach this endpoint on.
    fn local_endpoint(&self) -> IpEndpoint;

    /// Send one datagram.
    fn send_to(&mut self, buf: &[u8], remote: IpEndpoint) -> Result<()>;

    /// Wait up to `timeout` for one datagram from anyone, returning
    /// [`Error::Timeout`] if none arrives.
    ///
    /// The returned length is the datagram's full length. When it exceeds
    /// `buf.len()` only a prefix was copied.
    fn recv_from(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, IpEndpoint)>;
}

impl<E: Endpoint + ?Sized> Endpoint for &mut E {
    fn local_endpoint(&self) -> IpEndpoint {
        (**self).local_endpoint()
    }

    fn send_to(&mut self, buf: &[u8], remote: IpEndpoint) -> Result<()> {
        (**self).send_to(buf, remote)
    }

    fn recv_from(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, IpEndpoint)> {
        (**self).recv_from(buf, timeout)
    }
}

/// An endpoint that wraps smoltcp primitives: an interface over `device`
/// with a single UDP socket.
pub struct SmolEndpoint<D: Device> {
    /// Our address as seen by peers.
    local: IpEndpoint,
    /// Our socket storage
    sockets: SocketSet<'static>,
    /// Our UDP socket handle
    handle: SocketHandle,
    /// The device interface
    iface: Interface,
    /// Our device for RX/TX.
    device: D,
}

impl SmolEndpoint<UdpSocketDevice> {
    /// Bind an endpoint on a real UDP socket. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let (device, bound_addr) = UdpSocketDevice::bind(addr)?;
        let cidr = IpCidr::new(device.iface_addr(), 0);
        let mut endpoint = Self::new(device, cidr, bound_addr.port())?;
        endpoint.local = bound_addr.into();
        Ok(endpoint)
    }
}

impl<D: Device> SmolEndpoint<D> {
    /// Create an endpoint with `cidr` as the interface address and the UDP
    /// socket bound to `port`.
    pub fn new(device: D, cidr: IpCidr, port: u16) -> Result<Self> {
        let sockets = vec![SocketStorage::EMPTY];
        Self::with_storage(device, cidr, port, sockets)
    }

    /// Like [`SmolEndpoint::new`] with caller provided socket storage.
    pub fn with_storage<U>(mut device: D, cidr: IpCidr, port: u16, storage: U) -> Result<Self>
    where
        U: Into<ManagedSlice<'static, SocketStorage<'static>>>,
    {
        let rx_buffer = PacketBuffer::new(metadata(), vec![0u8; SOCKET_BUFFER]);
        let tx_buffer = PacketBuffer::new(metadata(), vec![0u8; SOCKET_BUFFER]);
        let mut socket = UdpSocket::new(rx_buffer, tx_buffer);
        socket.bind(port)?;

        let mut sockets = SocketSet::new(storage);
        let handle = sockets.add(socket);

        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, Instant::now());
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(cidr);
        });

        Ok(Self {
            local: IpEndpoint::new(cidr.address(), port),
            sockets,
            handle,
            iface,
            device,
        })
    }

    fn socket(&mut self) -> &mut UdpSocket<'static> {
        self.sockets.get_mut::<UdpSocket>(self.handle)
    }
}

impl<D: Device> Endpoint for SmolEndpoint<D> {
    fn local_endpoint(&self) -> IpEndpoint {
        self.local
    }

    fn send_to(&mut self, buf: &[u8], remote: IpEndpoint) -> Result<()> {
        self.socket().send_slice(buf, remote)?;
        self.iface
            .poll_egress(Instant::now(), &mut self.device, &mut self.sockets);
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, IpEndpoint)> {
        let deadline = StdInstant::now() + timeout;
        loop {
            // The device blocks for at most its poll interval.
            self.iface
                .poll(Instant::now(), &mut self.device, &mut self.sockets);
            let socket = self.socket();
            if socket.can_recv() {
                let (payload, meta) = socket.recv()?;
                let copied = payload.len().min(buf.len());
                buf[..copied].copy_from_slice(&payload[..copied]);
                return Ok((payload.len(), meta.endpoint));
            }
            if StdInstant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }
}

fn metadata() -> Vec<PacketMetadata> {
    (0..SOCKET_SLOTS).map(|_| PacketMetadata::EMPTY).collect()
}
