//! Fixed datagram header framing.
//!
//! Every datagram begins with a 22-byte big-endian header:
//!
//! ```text
//! off  len  field
//!  0    3   magic "QDT"
//!  3    1   version (1)
//!  4    1   type
//!  5    1   flags
//!  6    8   session id
//! 14    8   counter
//! ```
//!
//! The remainder is AEAD ciphertext whose AAD is the header bytes.

use crate::error::{Error, Result};

/// Protocol magic.
pub const MAGIC: &[u8; 3] = b"QDT";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized header length.
pub const HEADER_LEN: usize = 22;

/// Datagram message types. Unknown values are dropped by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Data = 0,
    Fragment = 1,
    Ping = 2,
    Pong = 3,
    Close = 4,
}

impl MsgType {
    /// Decode a wire byte; `None` for unknown types.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(MsgType::Data),
            1 => Some(MsgType::Fragment),
            2 => Some(MsgType::Ping),
            3 => Some(MsgType::Pong),
            4 => Some(MsgType::Close),
            _ => None,
        }
    }
}

/// Parsed datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MsgType,
    pub flags: u8,
    pub session_id: u64,
    pub counter: u64,
}

impl Header {
    /// Header for an outbound datagram of the given type.
    pub fn new(msg_type: MsgType, session_id: u64, counter: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            flags: 0,
            session_id,
            counter,
        }
    }
}

/// Serialize `h` into the first [`HEADER_LEN`] bytes of `dst`.
///
/// # Panics
///
/// Panics when `dst` is shorter than [`HEADER_LEN`].
pub fn write_header(dst: &mut [u8], h: &Header) {
    dst[0..3].copy_from_slice(MAGIC);
    dst[3] = h.version;
    dst[4] = h.msg_type as u8;
    dst[5] = h.flags;
    dst[6..14].copy_from_slice(&h.session_id.to_be_bytes());
    dst[14..22].copy_from_slice(&h.counter.to_be_bytes());
}

/// Append a serialized header to `dst`.
pub fn append_header(dst: &mut Vec<u8>, h: &Header) {
    let start = dst.len();
    dst.resize(start + HEADER_LEN, 0);
    write_header(&mut dst[start..], h);
}

/// Parse a header, returning it together with the remaining bytes.
///
/// Fails with [`Error::InvalidDatagram`] when too short (or the type is
/// unknown), [`Error::BadMagic`] / [`Error::BadVersion`] on the
/// corresponding corruptions.
pub fn parse_header(b: &[u8]) -> Result<(Header, &[u8])> {
    if b.len() < HEADER_LEN {
        return Err(Error::InvalidDatagram);
    }
    if &b[0..3] != MAGIC {
        return Err(Error::BadMagic);
    }
    let version = b[3];
    if version != PROTOCOL_VERSION {
        return Err(Error::BadVersion(version));
    }
    let msg_type = MsgType::from_wire(b[4]).ok_or(Error::InvalidDatagram)?;
    let header = Header {
        version,
        msg_type,
        flags: b[5],
        session_id: u64::from_be_bytes(b[6..14].try_into().expect("8-byte slice")),
        counter: u64::from_be_bytes(b[14..22].try_into().expect("8-byte slice")),
    };
    Ok((header, &b[HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header {
            version: PROTOCOL_VERSION,
            msg_type: MsgType::Data,
            flags: 1,
            session_id: 42,
            counter: 7,
        };
        let mut buf = Vec::new();
        append_header(&mut buf, &h);
        buf.extend_from_slice(b"test");
        assert_eq!(buf.len(), HEADER_LEN + 4);

        let (parsed, rest) = parse_header(&buf).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(rest, b"test");
    }

    #[test]
    fn short_input_is_invalid() {
        assert!(matches!(parse_header(b"bad"), Err(Error::InvalidDatagram)));
    }

    #[test]
    fn corrupted_magic_detected() {
        let mut buf = Vec::new();
        append_header(&mut buf, &Header::new(MsgType::Data, 1, 1));
        buf[0] = b'X';
        assert!(matches!(parse_header(&buf), Err(Error::BadMagic)));
    }

    #[test]
    fn wrong_version_detected() {
        let mut buf = Vec::new();
        append_header(&mut buf, &Header::new(MsgType::Data, 1, 1));
        buf[3] = 9;
        assert!(matches!(parse_header(&buf), Err(Error::BadVersion(9))));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = Vec::new();
        append_header(&mut buf, &Header::new(MsgType::Data, 1, 1));
        buf[4] = 200;
        assert!(matches!(parse_header(&buf), Err(Error::InvalidDatagram)));
    }

    #[test]
    fn all_known_types_roundtrip() {
        for t in [
            MsgType::Data,
            MsgType::Fragment,
            MsgType::Ping,
            MsgType::Pong,
            MsgType::Close,
        ] {
            assert_eq!(MsgType::from_wire(t as u8), Some(t));
        }
        assert_eq!(MsgType::from_wire(5), None);
    }

    #[test]
    fn counter_uses_big_endian() {
        let mut buf = Vec::new();
        append_header(&mut buf, &Header::new(MsgType::Data, 0x0102030405060708, 0x1122334455667788));
        assert_eq!(&buf[6..14], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[14..22], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    }
}
