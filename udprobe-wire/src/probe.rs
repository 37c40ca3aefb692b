use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// The ID of the probe format on the wire.
pub const WIRE_ID: u8 = 0x7A;

/// The current version of the probe format.
pub const VERSION: u8 = 1;

/// The maximum size of a probe signature in bytes.
pub const MAX_SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid wire ID: {0:#04x}")]
    WireId(u8),
    #[error("Unsupported version: {0}")]
    Version(u8),
    #[error("Truncated probe: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Signature too long: {0} bytes (max {MAX_SIGNATURE_LEN})")]
    SignatureTooLong(usize),
    #[error("{0} trailing bytes after probe")]
    TrailingBytes(usize),
}

/// A probe as it travels over the wire.
///
/// The collector fills in the signature, ToS and send timestamp. The reflector stamps the
/// receive timestamp before echoing it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    /// Correlation signature, opaque to the reflector.
    signature: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The IP Type-of-Service value the probe was sent with.
    pub(crate) tos: u8,
    /// Send timestamp in nanoseconds since the UNIX epoch.
    pub(crate) sent: u64,
    /// Reflector receive timestamp in nanoseconds since the UNIX epoch. Zero until reflected.
    pub(crate) rcvd: u64,
}

impl Header {
    /// Returns the length of the fixed part of the encoding in bytes:
    /// wire ID, version, signature length, ToS, send and receive timestamps.
    #[inline]
    pub const fn len() -> usize {
        1 + 1 + 1 + 1 + 8 + 8
    }
}

impl Message {
    /// Creates a new, not yet reflected, probe message.
    pub fn new(signature: Bytes, tos: u8, sent: u64) -> Result<Self, Error> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(Error::SignatureTooLong(signature.len()));
        }

        Ok(Self { header: Header { tos, sent, rcvd: 0 }, signature })
    }

    #[inline]
    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    #[inline]
    pub const fn tos(&self) -> u8 {
        self.header.tos
    }

    #[inline]
    pub const fn sent(&self) -> u64 {
        self.header.sent
    }

    #[inline]
    pub const fn rcvd(&self) -> u64 {
        self.header.rcvd
    }

    /// Stamps the reflector receive timestamp.
    #[inline]
    pub fn set_rcvd(&mut self, rcvd: u64) {
        self.header.rcvd = rcvd;
    }

    /// Returns the largest possible size of an encoded message in bytes.
    #[inline]
    pub const fn max_size() -> usize {
        Header::len() + MAX_SIGNATURE_LEN
    }

    /// Returns the size of the encoded message in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        Header::len() + self.signature.len()
    }

    /// Encodes the message into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.size());

        dst.put_u8(WIRE_ID);
        dst.put_u8(VERSION);
        // Length is checked on construction and decode.
        dst.put_u8(self.signature.len() as u8);
        dst.put_slice(&self.signature);
        dst.put_u8(self.header.tos);
        dst.put_u64(self.header.sent);
        dst.put_u64(self.header.rcvd);
    }

    /// Encodes the message into a new buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a single datagram. The whole buffer must be exactly one message.
    pub fn decode(mut src: &[u8]) -> Result<Self, Error> {
        let available = src.len();
        if available < Header::len() {
            return Err(Error::Truncated { needed: Header::len(), available });
        }

        let wire_id = src.get_u8();
        if wire_id != WIRE_ID {
            return Err(Error::WireId(wire_id));
        }

        let version = src.get_u8();
        if version != VERSION {
            return Err(Error::Version(version));
        }

        let sig_len = src.get_u8() as usize;
        if sig_len > MAX_SIGNATURE_LEN {
            return Err(Error::SignatureTooLong(sig_len));
        }

        let needed = Header::len() + sig_len;
        if available < needed {
            return Err(Error::Truncated { needed, available });
        }
        if available > needed {
            return Err(Error::TrailingBytes(available - needed));
        }

        let signature = Bytes::copy_from_slice(&src[..sig_len]);
        src.advance(sig_len);

        let header = Header { tos: src.get_u8(), sent: src.get_u64(), rcvd: src.get_u64() };

        Ok(Self { header, signature })
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] Error),
}

/// A datagram codec for probe messages, for use with [`tokio_util::udp::UdpFramed`].
///
/// Every buffer handed to the decoder is treated as exactly one datagram: it is consumed in
/// full, whether or not it holds a valid message, so one bad datagram never poisons the next.
/// Each datagram yields exactly one item, a zero-length one included (as a decode error); the
/// empty buffer that follows it yields `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec {
    /// Set once the current datagram has produced its item.
    consumed: bool,
}

impl Codec {
    pub const fn new() -> Self {
        Self { consumed: false }
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() && std::mem::take(&mut self.consumed) {
            return Ok(None);
        }

        self.consumed = true;
        let datagram = src.split();
        Ok(Some(Message::decode(&datagram)?))
    }
}

impl Encoder<Message> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}
