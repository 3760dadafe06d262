//! TFTP Protocol (Revision 2)
//! from https://datatracker.ietf.org/doc/html/rfc1350
//!
//! [`Packet`] is a typed view over a raw datagram buffer. [`Repr`] is the
//! parsed, high-level form that transfers match on.

use core::str::from_utf8;

use crate::error::{Error, Result};

/// The max number of bytes sent at a time.
pub const DATA_SIZE: usize = 512;

/// Opcode plus block number (or error code).
pub const META_SIZE: usize = 4;

/// The largest packet a transfer sends: a full DATA block.
pub const PACKET_SIZE: usize = META_SIZE + DATA_SIZE;

enum_with_unknown! {
    /// The five TFTP packet types. 2 bytes in length.
    pub enum Opcode(u16) {
        /// Read request (RRQ)
        Rrq = 0x1,
        /// Write request (WRQ)
        Wrq = 0x2,
        /// Data (DATA)
        Data = 0x3,
        /// Acknowledgement (ACK)
        Ack = 0x4,
        /// Error (ERROR)
        Error = 0x5
    }
}

enum_with_unknown! {
    /// Error codes carried by an ERROR packet.
    pub enum ErrorCode(u16) {
        /// Not defined, see the message.
        NotDefined = 0,
        FileNotFound = 1,
        AccessViolation = 2,
        DiskFull = 3,
        IllegalOperation = 4,
        UnknownTid = 5,
        FileExists = 6,
        NoSuchUser = 7
    }
}

mod field {
    use core::ops::{Range, RangeFrom};

    pub const OPCODE: Range<usize> = 0..2;
    pub const REQUEST: RangeFrom<usize> = 2..;
    pub const BLOCK: Range<usize> = 2..4;
    pub const CODE: Range<usize> = 2..4;
    pub const DATA: RangeFrom<usize> = 4..;
    pub const MSG: RangeFrom<usize> = 4..;
}

/// A TFTP packet.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Wrap a buffer without checking its length.
    ///
    /// Accessors panic on a buffer too short for the packet type, so only use
    /// this for buffers sized with [`Repr::buffer_len`].
    pub const fn new_unchecked(buffer: T) -> Self {
        Packet { buffer }
    }

    /// Wrap a buffer, making sure every accessor for its opcode is in bounds.
    pub fn new_checked(buffer: T) -> Result<Self> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Fails with [`Error::Truncated`] when the opcode or the fixed header is
    /// missing and with [`Error::UnknownOpcode`] for anything but the five
    /// packet types.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::OPCODE.end {
            return Err(Error::Truncated);
        }
        match self.opcode() {
            Opcode::Rrq | Opcode::Wrq => Ok(()),
            Opcode::Data | Opcode::Ack | Opcode::Error if len < META_SIZE => Err(Error::Truncated),
            Opcode::Data | Opcode::Ack | Opcode::Error => Ok(()),
            Opcode::Unknown(op) => Err(Error::UnknownOpcode(op)),
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the opcode of the packet.
    pub fn opcode(&self) -> Opcode {
        read_be_u16(&self.buffer.as_ref()[field::OPCODE]).into()
    }

    /// The block number of a DATA or ACK packet.
    pub fn block(&self) -> u16 {
        read_be_u16(&self.buffer.as_ref()[field::BLOCK])
    }

    /// The error code of an ERROR packet.
    pub fn code(&self) -> ErrorCode {
        read_be_u16(&self.buffer.as_ref()[field::CODE]).into()
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// The payload of a DATA packet.
    pub fn data(&self) -> &'a [u8] {
        let buffer = self.buffer;
        &buffer.as_ref()[field::DATA]
    }

    /// The filename and mode of a request.
    pub fn request(&self) -> Result<(&'a str, &'a str)> {
        let buffer = self.buffer;
        let mut fields = buffer.as_ref()[field::REQUEST].split(|&b| b == 0);
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(filename), Some(mode), Some([]), None) => Ok((text(filename)?, text(mode)?)),
            _ => Err(Error::MalformedRequest),
        }
    }

    /// The message of an ERROR packet, without its terminating nul.
    pub fn msg(&self) -> Result<&'a str> {
        let buffer = self.buffer;
        let msg = &buffer.as_ref()[field::MSG];
        text(msg.strip_suffix(&[0]).unwrap_or(msg))
    }
}

impl<T> Packet<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Set the opcode of the packet.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.buffer.as_mut()[field::OPCODE].copy_from_slice(&u16::from(opcode).to_be_bytes());
    }

    pub fn set_block(&mut self, block: u16) {
        self.buffer.as_mut()[field::BLOCK].copy_from_slice(&block.to_be_bytes());
    }

    pub fn set_code(&mut self, code: ErrorCode) {
        self.buffer.as_mut()[field::CODE].copy_from_slice(&u16::from(code).to_be_bytes());
    }

    /// Write `filename\0mode\0` after the opcode.
    pub fn set_request(&mut self, filename: &str, mode: &str) {
        let fields = &mut self.buffer.as_mut()[field::REQUEST];
        let (filename_field, rest) = fields.split_at_mut(filename.len() + 1);
        put_text(filename_field, filename);
        put_text(&mut rest[..mode.len() + 1], mode);
    }

    /// Write a nul terminated message after the error code.
    pub fn set_msg(&mut self, msg: &str) {
        put_text(&mut self.buffer.as_mut()[field::MSG][..msg.len() + 1], msg);
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[field::DATA]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A parsed TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr<'a> {
    Rrq { filename: &'a str, mode: &'a str },
    Wrq { filename: &'a str, mode: &'a str },
    // A DATA payload shorter than DATA_SIZE ends the transfer.
    Data { block: u16, data: &'a [u8] },
    Ack { block: u16 },
    Error { code: ErrorCode, msg: &'a str },
}

impl<'a> Repr<'a> {
    /// Parse a packet whose length was already checked.
    pub fn parse<T>(packet: &Packet<&'a T>) -> Result<Self>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;
        match packet.opcode() {
            Opcode::Rrq => {
                let (filename, mode) = packet.request()?;
                Ok(Repr::Rrq { filename, mode })
            }
            Opcode::Wrq => {
                let (filename, mode) = packet.request()?;
                Ok(Repr::Wrq { filename, mode })
            }
            Opcode::Data => Ok(Repr::Data {
                block: packet.block(),
                data: packet.data(),
            }),
            Opcode::Ack => Ok(Repr::Ack {
                block: packet.block(),
            }),
            Opcode::Error => Ok(Repr::Error {
                code: packet.code(),
                msg: packet.msg()?,
            }),
            Opcode::Unknown(op) => Err(Error::UnknownOpcode(op)),
        }
    }

    /// Decode a raw datagram.
    pub fn decode(buffer: &'a [u8]) -> Result<Self> {
        Repr::parse(&Packet::new_checked(buffer)?)
    }

    /// The opcode this packet is emitted with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Repr::Rrq { .. } => Opcode::Rrq,
            Repr::Wrq { .. } => Opcode::Wrq,
            Repr::Data { .. } => Opcode::Data,
            Repr::Ack { .. } => Opcode::Ack,
            Repr::Error { .. } => Opcode::Error,
        }
    }

    /// The exact number of bytes [`Repr::emit`] writes.
    pub fn buffer_len(&self) -> usize {
        match *self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                field::REQUEST.start + filename.len() + 1 + mode.len() + 1
            }
            Repr::Data { data, .. } => META_SIZE + data.len(),
            Repr::Ack { .. } => META_SIZE,
            Repr::Error { msg, .. } => META_SIZE + msg.len() + 1,
        }
    }

    /// Emit into a buffer of at least [`Repr::buffer_len`] bytes.
    pub fn emit<T>(&self, packet: &mut Packet<T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]>,
    {
        packet.set_opcode(self.opcode());
        match *self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                packet.set_request(filename, mode);
            }
            Repr::Data { block, data } => {
                packet.set_block(block);
                packet.data_mut()[..data.len()].copy_from_slice(data);
            }
            Repr::Ack { block } => {
                packet.set_block(block);
            }
            Repr::Error { code, msg } => {
                packet.set_code(code);
                packet.set_msg(msg);
            }
        }
    }

    /// Encode into a freshly allocated datagram.
    #[cfg(feature = "std")]
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0; self.buffer_len()];
        self.emit(&mut Packet::new_unchecked(&mut buffer[..]));
        buffer
    }
}

fn read_be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn text(bytes: &[u8]) -> Result<&str> {
    from_utf8(bytes).map_err(|_| Error::Utf8)
}

/// Copy `s` into `buf` followed by a nul. `buf` must be exactly one byte longer.
fn put_text(buf: &mut [u8], s: &str) {
    let (body, nul) = buf.split_at_mut(s.len());
    body.copy_from_slice(s.as_bytes());
    nul[0] = 0;
}
