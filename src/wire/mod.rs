//! Wayland wire format.
//!
//! Every message is an 8-byte header followed by a payload of 32-bit
//! aligned arguments, all in host byte order:
//!
//! ```text
//! ┌────────────────┬─────────────────────────────┬───────────────────┐
//! │ object id (u32)│ size (u16) << 16 | opcode   │ args (size - 8 B) │
//! └────────────────┴─────────────────────────────┴───────────────────┘
//! ```
//!
//! `size` covers the header. Strings carry a u32 length that includes the
//! trailing NUL, then the bytes, then zero padding to a 4-byte boundary; a
//! null string is a bare zero length. Arrays are a u32 length and padded
//! bytes. File descriptors never appear in the payload: they travel as
//! SCM_RIGHTS ancillary data next to the bytes (see
//! [`crate::transport::ancillary`]).
//!
//! Rust guideline compliant 2026-02

use std::os::fd::OwnedFd;

use crate::error::WireError;

/// Header length in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest encodable message (16-bit size field, 4-byte aligned).
pub const MAX_MESSAGE_SIZE: usize = 0xFFFC;

/// Round `len` up to the next 4-byte boundary.
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

// ─── Header ────────────────────────────────────────────────────────────────

/// Fixed 8-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Target (request) or sender (event) object.
    pub object_id: u32,
    /// Total message size including the header.
    pub size: u16,
    /// Request or event index within the interface.
    pub opcode: u16,
}

impl Header {
    /// Serialize to host byte order.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.object_id.to_ne_bytes());
        let word = (u32::from(self.size) << 16) | u32::from(self.opcode);
        out[4..].copy_from_slice(&word.to_ne_bytes());
        out
    }

    /// Parse the first 8 bytes of `bytes`.
    ///
    /// Validates that the declared size can hold a header and is aligned;
    /// it does not check the size against `bytes.len()`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let object_id = read_u32(&bytes[..4]);
        let word = read_u32(&bytes[4..8]);
        let header = Self {
            object_id,
            size: (word >> 16) as u16,
            opcode: (word & 0xFFFF) as u16,
        };
        let size = usize::from(header.size);
        if size < HEADER_SIZE || size % 4 != 0 {
            return Err(WireError::InvalidSize(size));
        }
        Ok(header)
    }

    /// Payload length implied by `size`.
    pub fn payload_len(&self) -> usize {
        usize::from(self.size).saturating_sub(HEADER_SIZE)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_ne_bytes(word)
}

// ─── Fixed point ───────────────────────────────────────────────────────────

/// Signed 24.8 fixed-point number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    /// Wrap a raw wire value.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Nearest representable value to `value`.
    pub fn from_f64(value: f64) -> Self {
        Self((value * 256.0).round() as i32)
    }

    /// Integer value.
    pub const fn from_int(value: i32) -> Self {
        Self(value << 8)
    }

    /// Floating-point value.
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

// ─── Encoding ──────────────────────────────────────────────────────────────

/// One request or event argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    /// Signed 32-bit integer.
    Int(i32),
    /// Unsigned 32-bit integer (also enums and bitfields).
    Uint(u32),
    /// 24.8 fixed point.
    Fixed(Fixed),
    /// UTF-8 string; `None` encodes the null string.
    String(Option<&'a str>),
    /// Existing object id (0 for null).
    Object(u32),
    /// Id of the object created by this message.
    NewId(u32),
    /// Opaque byte array.
    Array(&'a [u8]),
}

impl Arg<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            Self::String(None) => 4,
            Self::String(Some(s)) => 4 + padded_len(s.len() + 1),
            Self::Array(a) => 4 + padded_len(a.len()),
            _ => 4,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        match *self {
            Self::Int(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Self::Uint(v) | Self::Object(v) | Self::NewId(v) => {
                out.extend_from_slice(&v.to_ne_bytes());
            }
            Self::Fixed(v) => out.extend_from_slice(&v.raw().to_ne_bytes()),
            Self::String(None) => out.extend_from_slice(&0u32.to_ne_bytes()),
            Self::String(Some(s)) => {
                if s.as_bytes().contains(&0) {
                    return Err(WireError::InteriorNul);
                }
                let len = s.len() + 1;
                out.extend_from_slice(&(len as u32).to_ne_bytes());
                out.extend_from_slice(s.as_bytes());
                out.resize(out.len() + padded_len(len) - s.len(), 0);
            }
            Self::Array(a) => {
                out.extend_from_slice(&(a.len() as u32).to_ne_bytes());
                out.extend_from_slice(a);
                out.resize(out.len() + padded_len(a.len()) - a.len(), 0);
            }
        }
        Ok(())
    }
}

/// Encode a complete message.
///
/// # Errors
///
/// Fails when a string holds a NUL byte or the message exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn encode(object_id: u32, opcode: u16, args: &[Arg<'_>]) -> Result<Vec<u8>, WireError> {
    let size = HEADER_SIZE + args.iter().map(Arg::encoded_len).sum::<usize>();
    if size > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge(size));
    }
    let mut out = Vec::with_capacity(size);
    let header = Header {
        object_id,
        size: size as u16,
        opcode,
    };
    out.extend_from_slice(&header.encode());
    for arg in args {
        arg.write_to(&mut out)?;
    }
    debug_assert_eq!(out.len(), size);
    Ok(out)
}

/// Split one complete frame into header and payload.
///
/// # Errors
///
/// Rejects frames whose declared size differs from `frame.len()`.
pub fn decode(frame: &[u8]) -> Result<(Header, &[u8]), WireError> {
    let header = Header::decode(frame)?;
    let declared = usize::from(header.size);
    if declared != frame.len() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }
    Ok((header, &frame[HEADER_SIZE..]))
}

// ─── Decoding arguments ────────────────────────────────────────────────────

/// Sequential reader over a message payload.
#[derive(Debug, Clone)]
pub struct ArgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    /// Read from the start of `payload`.
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let available = self.buf.len() - self.pos;
        if len > available {
            return Err(WireError::Truncated {
                needed: len,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Next `uint`.
    pub fn uint(&mut self) -> Result<u32, WireError> {
        self.take(4).map(read_u32)
    }

    /// Next `int`.
    pub fn int(&mut self) -> Result<i32, WireError> {
        self.uint().map(|v| v as i32)
    }

    /// Next `fixed`.
    pub fn fixed(&mut self) -> Result<Fixed, WireError> {
        self.int().map(Fixed::from_raw)
    }

    /// Next `object` (0 is null).
    pub fn object(&mut self) -> Result<u32, WireError> {
        self.uint()
    }

    /// Next `new_id`.
    pub fn new_id(&mut self) -> Result<u32, WireError> {
        self.uint()
    }

    /// Next nullable `string`.
    pub fn optional_string(&mut self) -> Result<Option<&'a str>, WireError> {
        let len = self.uint()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.take(padded_len(len))?;
        let (text, nul) = bytes[..len].split_at(len - 1);
        if nul != [0] {
            return Err(WireError::InvalidString);
        }
        std::str::from_utf8(text)
            .map(Some)
            .map_err(|_utf8| WireError::InvalidString)
    }

    /// Next `string`; a null string reads as empty.
    pub fn string(&mut self) -> Result<&'a str, WireError> {
        self.optional_string().map(Option::unwrap_or_default)
    }

    /// Next `array`.
    pub fn array(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.uint()? as usize;
        let bytes = self.take(padded_len(len))?;
        Ok(&bytes[..len])
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ─── Messages ──────────────────────────────────────────────────────────────

/// An inbound message with its ancillary descriptors.
#[derive(Debug)]
pub struct Message {
    /// Sender object.
    pub object_id: u32,
    /// Event index.
    pub opcode: u16,
    /// Encoded arguments.
    pub payload: Vec<u8>,
    /// Descriptors received alongside the bytes of this message.
    pub fds: Vec<OwnedFd>,
}

impl Message {
    /// Reader over the payload.
    pub fn args(&self) -> ArgReader<'_> {
        ArgReader::new(&self.payload)
    }

    /// Take the message's fd slot.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        if self.fds.is_empty() {
            None
        } else {
            Some(self.fds.remove(0))
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_size_and_opcode() {
        let header = Header {
            object_id: 42,
            size: 24,
            opcode: 3,
        };
        let bytes = header.encode();
        assert_eq!(read_u32(&bytes[4..]), (24 << 16) | 3);
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn string_padding_includes_nul() {
        // "abc" + NUL fills exactly one word.
        let msg = encode(1, 0, &[Arg::String(Some("abc"))]).unwrap();
        assert_eq!(msg.len(), HEADER_SIZE + 4 + 4);
        assert_eq!(&msg[12..], b"abc\0");

        // "abcd" + NUL spills into a second word.
        let msg = encode(1, 0, &[Arg::String(Some("abcd"))]).unwrap();
        assert_eq!(msg.len(), HEADER_SIZE + 4 + 8);
        assert_eq!(&msg[12..], b"abcd\0\0\0\0");
    }

    #[test]
    fn mixed_arguments_decode_in_order() {
        let msg = encode(
            7,
            5,
            &[
                Arg::Uint(0xDEAD_BEEF),
                Arg::Int(-12),
                Arg::String(Some("wl_output")),
                Arg::String(None),
                Arg::Array(&[1, 2, 3, 4, 5]),
                Arg::Fixed(Fixed::from_f64(1.5)),
                Arg::NewId(9),
                Arg::Object(0),
            ],
        )
        .unwrap();
        let (header, payload) = decode(&msg).unwrap();
        assert_eq!(header.object_id, 7);
        assert_eq!(header.opcode, 5);
        assert_eq!(usize::from(header.size), msg.len());

        let mut args = ArgReader::new(payload);
        assert_eq!(args.uint().unwrap(), 0xDEAD_BEEF);
        assert_eq!(args.int().unwrap(), -12);
        assert_eq!(args.string().unwrap(), "wl_output");
        assert_eq!(args.optional_string().unwrap(), None);
        assert_eq!(args.array().unwrap(), &[1, 2, 3, 4, 5]);
        assert!((args.fixed().unwrap().to_f64() - 1.5).abs() < f64::EPSILON);
        assert_eq!(args.new_id().unwrap(), 9);
        assert_eq!(args.object().unwrap(), 0);
        assert_eq!(args.remaining(), 0);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut msg = encode(1, 0, &[Arg::Uint(1)]).unwrap();
        msg.extend_from_slice(&[0; 4]);
        assert_eq!(
            decode(&msg).unwrap_err(),
            WireError::LengthMismatch {
                declared: 12,
                actual: 16
            }
        );
        assert!(matches!(
            decode(&msg[..10]).unwrap_err(),
            WireError::LengthMismatch { .. }
        ));
    }

    #[test]
    fn decode_rejects_unaligned_size() {
        let header = Header {
            object_id: 1,
            size: 10,
            opcode: 0,
        };
        assert_eq!(
            Header::decode(&header.encode()).unwrap_err(),
            WireError::InvalidSize(10)
        );
    }

    #[test]
    fn encode_rejects_interior_nul() {
        assert_eq!(
            encode(1, 0, &[Arg::String(Some("a\0b"))]).unwrap_err(),
            WireError::InteriorNul
        );
    }

    #[test]
    fn encode_rejects_oversized_message() {
        let big = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(matches!(
            encode(1, 0, &[Arg::Array(&big)]).unwrap_err(),
            WireError::MessageTooLarge(_)
        ));
    }

    #[test]
    fn truncated_string_is_an_error() {
        let msg = encode(1, 0, &[Arg::String(Some("hello"))]).unwrap();
        let mut args = ArgReader::new(&msg[HEADER_SIZE..msg.len() - 4]);
        assert!(matches!(
            args.string().unwrap_err(),
            WireError::Truncated { .. }
        ));
    }

    #[test]
    fn missing_nul_is_invalid() {
        let mut payload = 3u32.to_ne_bytes().to_vec();
        payload.extend_from_slice(b"abc\0");
        assert_eq!(
            ArgReader::new(&payload).string().unwrap_err(),
            WireError::InvalidString
        );
    }

    #[test]
    fn fixed_conversions() {
        assert_eq!(Fixed::from_int(2).raw(), 512);
        assert_eq!(Fixed::from_f64(-0.5).raw(), -128);
        assert!((Fixed::from_raw(384).to_f64() - 1.5).abs() < f64::EPSILON);
    }

    mod roundtrip {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Sample {
            Int(i32),
            Uint(u32),
            Fixed(i32),
            String(Option<String>),
            Object(u32),
            NewId(u32),
            Array(Vec<u8>),
        }

        impl Sample {
            fn as_arg(&self) -> Arg<'_> {
                match self {
                    Self::Int(v) => Arg::Int(*v),
                    Self::Uint(v) => Arg::Uint(*v),
                    Self::Fixed(raw) => Arg::Fixed(Fixed::from_raw(*raw)),
                    Self::String(s) => Arg::String(s.as_deref()),
                    Self::Object(id) => Arg::Object(*id),
                    Self::NewId(id) => Arg::NewId(*id),
                    Self::Array(bytes) => Arg::Array(bytes),
                }
            }

            fn check(&self, args: &mut ArgReader<'_>) -> Result<(), TestCaseError> {
                match self {
                    Self::Int(v) => prop_assert_eq!(args.int().unwrap(), *v),
                    Self::Uint(v) => prop_assert_eq!(args.uint().unwrap(), *v),
                    Self::Fixed(raw) => prop_assert_eq!(args.fixed().unwrap().raw(), *raw),
                    Self::String(s) => prop_assert_eq!(args.optional_string().unwrap(), s.as_deref()),
                    Self::Object(id) => prop_assert_eq!(args.object().unwrap(), *id),
                    Self::NewId(id) => prop_assert_eq!(args.new_id().unwrap(), *id),
                    Self::Array(bytes) => prop_assert_eq!(args.array().unwrap(), bytes.as_slice()),
                }
                Ok(())
            }
        }

        fn value_strategy() -> impl Strategy<Value = Sample> {
            // Lengths 0..=40 hit every residue mod 4, with and without the NUL.
            let text = proptest::string::string_regex("[^\\x00]{0,40}")
                .unwrap_or_else(|e| panic!("regex failed: {e}"));
            prop_oneof![
                any::<i32>().prop_map(Sample::Int),
                any::<u32>().prop_map(Sample::Uint),
                any::<i32>().prop_map(Sample::Fixed),
                proptest::option::of(text).prop_map(Sample::String),
                any::<u32>().prop_map(Sample::Object),
                any::<u32>().prop_map(Sample::NewId),
                prop::collection::vec(any::<u8>(), 0..=40).prop_map(Sample::Array),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

            #[test]
            fn encoded_messages_decode_to_the_same_arguments(
                object_id in 1u32..,
                opcode in any::<u16>(),
                values in prop::collection::vec(value_strategy(), 0..8),
            ) {
                let args: Vec<Arg<'_>> = values.iter().map(Sample::as_arg).collect();
                let frame = encode(object_id, opcode, &args).unwrap();
                prop_assert_eq!(frame.len() % 4, 0);

                let (header, payload) = decode(&frame).unwrap();
                prop_assert_eq!(header.object_id, object_id);
                prop_assert_eq!(header.opcode, opcode);
                prop_assert_eq!(usize::from(header.size), frame.len());

                let mut reader = ArgReader::new(payload);
                for value in &values {
                    value.check(&mut reader)?;
                }
                prop_assert_eq!(reader.remaining(), 0);
            }
        }
    }
}
