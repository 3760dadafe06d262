use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use smoltcp::wire::IpEndpoint;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::UdpSocketDevice;
use crate::error::{Error, Result};
use crate::packet::Repr;
use crate::socket::{Endpoint, SmolEndpoint};
use crate::storage::Storage;
use crate::transfer::{handle_read, handle_write, send_error, Request};

/// Receive buffer for requests. Filename and mode may be longer than a
/// DATA block.
const REQUEST_BUFFER: usize = 1024;

/// Accepts requests on a well-known port and runs each transfer on its own
/// thread and its own ephemeral port.
pub struct Server<S: Storage + ?Sized + 'static> {
    listener: SmolEndpoint<UdpSocketDevice>,
    /// The address the listener is bound to, ephemeral ports use its IP.
    listen_addr: SocketAddr,
    storage: Arc<S>,
    config: Config,
}

enum Direction {
    Read,
    Write,
}

impl<S: Storage + ?Sized + 'static> Server<S> {
    pub fn bind(addr: SocketAddr, storage: Arc<S>, config: Config) -> Result<Self> {
        let listener = SmolEndpoint::bind(addr)?;
        let local = listener.local_endpoint();
        let listen_addr = SocketAddr::new(local.addr.into(), local.port);
        info!(%listen_addr, "listening");
        Ok(Self {
            listener,
            listen_addr,
            storage,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Serve requests until the listening socket fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.accept()?;
        }
    }

    /// Wait for one request and start its transfer.
    ///
    /// Returns `None` when nothing arrived within the configured timeout or
    /// the datagram was not a usable request.
    pub fn accept(&mut self) -> Result<Option<JoinHandle<()>>> {
        let mut buf = [0u8; REQUEST_BUFFER];
        let (len, from) = match self.listener.recv_from(&mut buf, self.config.timeout) {
            Ok(received) => received,
            Err(Error::Timeout) => return Ok(None),
            Err(Error::Recv(err)) => {
                warn!(?err, "dropping unreadable request");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if len > buf.len() {
            self.reject(from, &Error::Overlong(len));
            return Ok(None);
        }

        let (direction, request) = match Repr::decode(&buf[..len]) {
            Ok(Repr::Rrq { filename, mode }) => (Direction::Read, Request::new(filename, mode)),
            Ok(Repr::Wrq { filename, mode }) => (Direction::Write, Request::new(filename, mode)),
            Ok(Repr::Error { code, msg }) => {
                debug!(%from, ?code, msg, "ignoring error packet outside a transfer");
                return Ok(None);
            }
            Ok(other) => {
                self.reject(from, &Error::UnexpectedPacket(other.opcode()));
                return Ok(None);
            }
            Err(err) => {
                self.reject(from, &err);
                return Ok(None);
            }
        };

        let endpoint = match SmolEndpoint::bind(SocketAddr::new(self.listen_addr.ip(), 0)) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(%from, %err, "could not bind transfer endpoint");
                return Ok(None);
            }
        };
        debug!(%from, local = %endpoint.local_endpoint(), "transfer endpoint bound");

        let storage = Arc::clone(&self.storage);
        let config = self.config;
        let handle = thread::Builder::new()
            .name(format!("tftp-{from}"))
            .spawn(move || match direction {
                Direction::Read => handle_read(endpoint, from, &request, &*storage, &config),
                Direction::Write => handle_write(endpoint, from, &request, &*storage, &config),
            })?;
        Ok(Some(handle))
    }

    fn reject(&mut self, from: IpEndpoint, err: &Error) {
        warn!(%from, %err, "bad request");
        if let Err(send_err) = send_error(&mut self.listener, from, err) {
            debug!(%from, err = %send_err, "could not reject request");
        }
    }
}
