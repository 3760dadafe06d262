//! One file moved between the server and a single client.
//!
//! A [`Transfer`] owns a dedicated [`Endpoint`] and the client's address (its
//! transfer ID). Every exchange goes through [`Transfer::transmit`], the only
//! place that retries: the read and write loops just react to whatever packet
//! comes back.

use core::fmt::Write as _;

use smoltcp::wire::IpEndpoint;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::{Packet, Repr, DATA_SIZE, PACKET_SIZE};
use crate::socket::Endpoint;
use crate::storage::Storage;

/// Longest error message that still fits in one packet.
const MSG_CAPACITY: usize = DATA_SIZE - 1;

/// The file a client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: String,
}

impl Request {
    pub fn new(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mode: mode.into(),
        }
    }
}

/// Send `request.filename` from `storage` to `remote`.
///
/// Takes ownership of `endpoint`, which is closed when the transfer ends.
pub fn handle_read<E, S>(
    endpoint: E,
    remote: IpEndpoint,
    request: &Request,
    storage: &S,
    config: &Config,
)
where
    E: Endpoint,
    S: Storage + ?Sized,
{
    let mut transfer = Transfer::new(endpoint, remote, *config);
    info!(%remote, file = %request.filename, mode = %request.mode, "read request");
    match transfer.send_file(&request.filename, storage) {
        Ok(len) => info!(%remote, file = %request.filename, len, "sent file"),
        Err(err) => transfer.abort(&err),
    }
}

/// Receive `request.filename` from `remote` into `storage`.
///
/// Takes ownership of `endpoint`, which is closed when the transfer ends.
pub fn handle_write<E, S>(
    endpoint: E,
    remote: IpEndpoint,
    request: &Request,
    storage: &S,
    config: &Config,
)
where
    E: Endpoint,
    S: Storage + ?Sized,
{
    let mut transfer = Transfer::new(endpoint, remote, *config);
    info!(%remote, file = %request.filename, mode = %request.mode, "write request");
    match transfer.receive_file(&request.filename, storage) {
        Ok(len) => info!(%remote, file = %request.filename, len, "put file"),
        Err(err) => transfer.abort(&err),
    }
}

/// The state of one transfer.
pub struct Transfer<E: Endpoint> {
    endpoint: E,
    /// The client's transfer ID. Anything else that talks to us is turned away.
    remote: IpEndpoint,
    config: Config,
}

impl<E: Endpoint> Transfer<E> {
    pub fn new(endpoint: E, remote: IpEndpoint, config: Config) -> Self {
        Self {
            endpoint,
            remote,
            config,
        }
    }

    pub fn remote(&self) -> IpEndpoint {
        self.remote
    }

    /// Send a packet to the client once.
    pub fn send(&mut self, repr: &Repr<'_>) -> Result<()> {
        send_repr(&mut self.endpoint, self.remote, repr)
    }

    /// Send `repr` and wait for the client's answer, decoded into `rx`.
    ///
    /// A receive timeout resends `repr`, up to `max_attempts` sends in total,
    /// after which this fails with [`Error::Timeout`]. A datagram from any
    /// other address is answered with an "unknown transfer ID" error and
    /// `repr` is resent without using up an attempt, however long its
    /// datagram. A reply from the client that does not fit in `rx` fails
    /// with [`Error::Overlong`]. Send, receive and decode failures are
    /// returned as is.
    pub fn transmit<'b>(&mut self, repr: &Repr<'_>, rx: &'b mut [u8]) -> Result<Repr<'b>> {
        let mut attempts = 0;
        loop {
            self.send(repr)?;
            let (len, from) = match self.endpoint.recv_from(rx, self.config.timeout) {
                Ok(received) => received,
                Err(Error::Timeout) => {
                    attempts += 1;
                    debug!(remote = %self.remote, attempts, "receive timed out");
                    if attempts >= self.config.max_attempts {
                        warn!(remote = %self.remote, "reached timeout limit");
                        return Err(Error::Timeout);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            if from != self.remote {
                warn!(%from, expected = %self.remote, "datagram from unknown transfer ID");
                if let Err(err) = send_error(&mut self.endpoint, from, &Error::InvalidAddr(from)) {
                    debug!(%from, %err, "could not reject stray datagram");
                }
                continue;
            }
            if len > rx.len() {
                return Err(Error::Overlong(len));
            }

            let rx: &'b [u8] = rx;
            return Repr::decode(&rx[..len]);
        }
    }

    /// Send a file in DATA blocks. Returns its length.
    ///
    /// A file that is a whole number of blocks long ends with its last full
    /// block. An empty file sends nothing.
    pub fn send_file<S: Storage + ?Sized>(&mut self, filename: &str, storage: &S) -> Result<usize> {
        let file = storage.get(filename)?;
        let mut rx = [0u8; PACKET_SIZE];
        let mut position = 0;
        let mut block: u16 = 1;
        while position < file.len() {
            let end = (position + DATA_SIZE).min(file.len());
            let data = Repr::Data {
                block,
                data: &file[position..end],
            };
            match self.transmit(&data, &mut rx)? {
                Repr::Ack { block: acked } if acked == block => {
                    block = block.wrapping_add(1);
                    position = end;
                }
                Repr::Ack { block: acked } => {
                    debug!(remote = %self.remote, acked, expected = block, "ignoring stale ack");
                }
                Repr::Error { code, msg } => {
                    warn!(remote = %self.remote, ?code, msg, "client sent an error");
                    return Err(Error::Remote(code));
                }
                other => return Err(Error::UnexpectedPacket(other.opcode())),
            }
        }
        Ok(file.len())
    }

    /// Receive DATA blocks until a short one, store the result and send the
    /// closing ACK. Returns the stored length.
    pub fn receive_file<S: Storage + ?Sized>(&mut self, filename: &str, storage: &S) -> Result<usize> {
        let mut rx = [0u8; PACKET_SIZE];
        let mut block: u16 = 0;
        let mut file = Vec::new();
        loop {
            match self.transmit(&Repr::Ack { block }, &mut rx)? {
                Repr::Data {
                    block: received,
                    data,
                } => {
                    if received == block.wrapping_add(1) {
                        block = received;
                        file.extend_from_slice(data);
                    } else {
                        debug!(
                            remote = %self.remote,
                            received,
                            expected = block.wrapping_add(1),
                            "ignoring out of order block"
                        );
                    }
                    // A short block ends the transfer whether or not it was accepted.
                    if data.len() < DATA_SIZE {
                        break;
                    }
                }
                Repr::Error { code, msg } => {
                    warn!(remote = %self.remote, ?code, msg, "client sent an error");
                    return Err(Error::Remote(code));
                }
                other => return Err(Error::UnexpectedPacket(other.opcode())),
            }
        }

        if let Err(err) = storage.put(filename, &file) {
            warn!(file = filename, %err, "storage put failed");
            return Err(Error::PutFailed);
        }
        if let Err(err) = self.send(&Repr::Ack { block }) {
            // The file is stored, the client will time out on its own.
            warn!(remote = %self.remote, %err, "failed to send final ack");
        }
        Ok(file.len())
    }

    /// Tell the client why the transfer ended, unless it told us.
    pub fn abort(&mut self, err: &Error) {
        if let Error::Remote(_) = err {
            return;
        }
        warn!(remote = %self.remote, %err, "aborting transfer");
        if let Err(send_err) = send_error(&mut self.endpoint, self.remote, err) {
            debug!(remote = %self.remote, err = %send_err, "could not send error packet");
        }
    }
}

/// Emit `repr` into a fixed buffer and send it.
pub(crate) fn send_repr<E>(endpoint: &mut E, remote: IpEndpoint, repr: &Repr<'_>) -> Result<()>
where
    E: Endpoint + ?Sized,
{
    let mut buffer: heapless::Vec<u8, PACKET_SIZE> = heapless::Vec::new();
    buffer
        .resize_default(repr.buffer_len())
        .map_err(|_| Error::Oversized)?;
    repr.emit(&mut Packet::new_unchecked(&mut buffer[..]));
    endpoint.send_to(&buffer, remote)
}

/// Send an ERROR packet describing `err`, truncating the message to fit.
pub(crate) fn send_error<E>(endpoint: &mut E, remote: IpEndpoint, err: &Error) -> Result<()>
where
    E: Endpoint + ?Sized,
{
    let mut msg: heapless::String<MSG_CAPACITY> = heapless::String::new();
    let _ = write!(msg, "{err}");
    let repr = Repr::Error {
        code: err.code(),
        msg: msg.as_str(),
    };
    send_repr(endpoint, remote, &repr)
}
