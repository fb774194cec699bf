//! Framing and primitive (de)serialization for the PVAccess wire protocol.
//!
//! Every message on the wire is a frame: an 8-byte header (magic, protocol
//! revision, flags, command byte, 4-byte payload length) followed by the
//! payload. Integers are big-endian unless the sender cleared the byte-order
//! flag in the header; [`PayloadReader`] carries that flag so payload parsing
//! follows whatever the frame declared. Strings and bit sets are prefixed
//! with the compact size encoding implemented by [`write_size`]/
//! [`PayloadReader::size`].
//!
//! A logical message larger than the negotiated limit is split across
//! multiple frames marked with the segmentation flags; receivers concatenate
//! until the final segment arrives. [`split_into_frames`] implements the
//! sending side, the circuit receive loop implements reassembly.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::{
    IResult,
    number::complete::{be_u8, be_u32, le_u32},
};
use thiserror::Error;

/// First byte of every frame.
pub const MAGIC: u8 = 0xCA;
/// Protocol revision this client speaks.
pub const PROTOCOL_REVISION: u8 = 1;

/// Maximum UDP payload we will put in one search packet.
pub const MAX_UDP_SEND: usize = 1440;
/// Default TCP receive buffer size advertised during validation.
pub const MAX_TCP_RECV: usize = 1024 * 16;

/// Header flag bits.
pub mod flags {
    /// Message travels server-to-client.
    pub const FROM_SERVER: u8 = 0x01;
    /// First frame of a segmented message.
    pub const SEGMENT_FIRST: u8 = 0x10;
    /// Last frame of a segmented message.
    pub const SEGMENT_LAST: u8 = 0x20;
    /// Interior frame of a segmented message.
    pub const SEGMENT_MIDDLE: u8 = 0x30;
    pub const SEGMENT_MASK: u8 = 0x30;
    /// Payload integers are big-endian.
    pub const BIG_ENDIAN: u8 = 0x80;
}

/// Command bytes, table-compatible with the 28-entry dispatch table.
pub mod commands {
    pub const BEACON: u8 = 0;
    pub const CONNECTION_VALIDATION: u8 = 1;
    pub const ECHO: u8 = 2;
    pub const SEARCH_REQUEST: u8 = 3;
    pub const SEARCH_RESPONSE: u8 = 4;
    pub const INTROSPECTION_SEARCH: u8 = 5;
    pub const INTROSPECTION_SEARCH_DATA: u8 = 6;
    pub const CREATE_CHANNEL: u8 = 7;
    pub const DESTROY_CHANNEL: u8 = 8;
    pub const GET: u8 = 10;
    pub const PUT: u8 = 11;
    pub const PUT_GET: u8 = 12;
    pub const MONITOR: u8 = 13;
    pub const ARRAY: u8 = 14;
    pub const CANCEL_REQUEST: u8 = 15;
    pub const PROCESS: u8 = 16;
    pub const GET_FIELD: u8 = 17;
    pub const MESSAGE: u8 = 18;
    pub const MULTIPLE_DATA: u8 = 19;
    pub const RPC: u8 = 20;
    /// One past the highest command the dispatch table knows.
    pub const HANDLER_COUNT: usize = 28;
}

/// QoS bits carried in the per-request byte.
pub mod qos {
    pub const DEFAULT: u8 = 0x00;
    pub const INIT: u8 = 0x08;
    pub const DESTROY: u8 = 0x10;
    pub const PROCESS: u8 = 0x20;
    pub const GET: u8 = 0x40;
    pub const GET_PUT: u8 = 0x80;
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload truncated: needed {0} more bytes")]
    Truncated(usize),
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("frame header too short")]
    ShortHeader,
    #[error("string is not valid UTF-8")]
    BadString,
    #[error("negative size where a count was required")]
    NegativeSize,
    #[error("unknown field type code {0:#04x}")]
    UnknownTypeCode(u8),
    #[error("reference to unknown introspection id {0}")]
    UnknownIntrospectionId(u16),
    #[error("bad status kind {0}")]
    BadStatusKind(u8),
}

/// Segmentation position of one frame within a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    None,
    First,
    Middle,
    Last,
}

/// The fixed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    pub payload_size: u32,
}

impl FrameHeader {
    pub const LEN: usize = 8;

    /// Header for a client-to-server frame, big-endian payload.
    pub fn request(command: u8, payload_size: u32) -> FrameHeader {
        FrameHeader {
            version: PROTOCOL_REVISION,
            flags: flags::BIG_ENDIAN,
            command,
            payload_size,
        }
    }

    pub fn is_big_endian(&self) -> bool {
        self.flags & flags::BIG_ENDIAN != 0
    }

    pub fn segment(&self) -> Segment {
        match self.flags & flags::SEGMENT_MASK {
            flags::SEGMENT_FIRST => Segment::First,
            flags::SEGMENT_LAST => Segment::Last,
            flags::SEGMENT_MIDDLE => Segment::Middle,
            _ => Segment::None,
        }
    }

    /// Minor protocol revision of the peer, carried in the low nibble.
    pub fn minor_revision(&self) -> u8 {
        self.version & 0x0F
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u8(self.command);
        if self.is_big_endian() {
            buf.put_u32(self.payload_size);
        } else {
            buf.put_u32_le(self.payload_size);
        }
    }

    /// Parse one header off the front of `input`.
    pub fn parse(input: &[u8]) -> IResult<&[u8], FrameHeader> {
        let (input, magic) = be_u8(input)?;
        if magic != MAGIC {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
        let (input, version) = be_u8(input)?;
        let (input, flags) = be_u8(input)?;
        let (input, command) = be_u8(input)?;
        let (input, payload_size) = if flags & flags::BIG_ENDIAN != 0 {
            be_u32(input)?
        } else {
            le_u32(input)?
        };
        Ok((
            input,
            FrameHeader {
                version,
                flags,
                command,
                payload_size,
            },
        ))
    }
}

/// Write the compact size encoding: `0xFF` for -1, one byte below 254,
/// otherwise `0xFE` followed by a four-byte value.
pub fn write_size(buf: &mut BytesMut, size: i32) {
    if size == -1 {
        buf.put_u8(0xFF);
    } else if size < 254 {
        buf.put_u8(size as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_i32(size);
    }
}

/// Write a size-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_size(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// Encode an IPv4 address in the 128-bit IPv4-mapped form used on the wire.
pub fn encode_ipv4_mapped(addr: Ipv4Addr) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[10] = 0xFF;
    out[11] = 0xFF;
    out[12..].copy_from_slice(&addr.octets());
    out
}

/// Decode a 128-bit address, accepting only the IPv4-mapped form
/// (80 zero bits, `0xFFFF`, then the IPv4 octets).
pub fn decode_ipv4_mapped(raw: &[u8; 16]) -> Option<Ipv4Addr> {
    if raw[..10] != [0u8; 10] || raw[10] != 0xFF || raw[11] != 0xFF {
        return None;
    }
    Some(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
}

/// Cursor over a frame payload that honors the frame's declared byte order.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

macro_rules! reader_prim {
    ($name:ident, $ty:ty, $len:expr) => {
        pub fn $name(&mut self) -> Result<$ty, WireError> {
            let raw: [u8; $len] = self.take($len)?.try_into().unwrap();
            Ok(if self.big_endian {
                <$ty>::from_be_bytes(raw)
            } else {
                <$ty>::from_le_bytes(raw)
            })
        }
    };
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8], big_endian: bool) -> PayloadReader<'a> {
        PayloadReader {
            buf,
            pos: 0,
            big_endian,
        }
    }

    /// Reader for a frame parsed with the given header.
    pub fn for_frame(buf: &'a [u8], header: &FrameHeader) -> PayloadReader<'a> {
        PayloadReader::new(buf, header.is_big_endian())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated(n - self.remaining()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    reader_prim!(u16, u16, 2);
    reader_prim!(i16, i16, 2);
    reader_prim!(u32, u32, 4);
    reader_prim!(i32, i32, 4);
    reader_prim!(u64, u64, 8);
    reader_prim!(i64, i64, 8);
    reader_prim!(f32, f32, 4);
    reader_prim!(f64, f64, 8);

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Read the compact size encoding. May legitimately return -1.
    pub fn size(&mut self) -> Result<i32, WireError> {
        match self.u8()? {
            0xFF => Ok(-1),
            0xFE => self.i32(),
            b => Ok(b as i32),
        }
    }

    /// Read a size that must be a non-negative count.
    pub fn count(&mut self) -> Result<usize, WireError> {
        let size = self.size()?;
        if size < 0 {
            return Err(WireError::NegativeSize);
        }
        Ok(size as usize)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let size = self.size()?;
        if size <= 0 {
            return Ok(String::new());
        }
        let raw = self.take(size as usize)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadString)
    }

    pub fn bitset(&mut self) -> Result<BitSet, WireError> {
        let nbytes = self.count()?;
        Ok(BitSet::from_bytes(self.take(nbytes)?))
    }
}

/// A growable bit set, serialized as a size-prefixed byte array (bit `i` of
/// byte `j` represents member `j * 8 + i`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> BitSet {
        BitSet::default()
    }

    pub fn from_bits<I: IntoIterator<Item = usize>>(bits: I) -> BitSet {
        let mut set = BitSet::new();
        for bit in bits {
            set.set(bit);
        }
        set
    }

    fn from_bytes(raw: &[u8]) -> BitSet {
        let mut set = BitSet::new();
        for (j, byte) in raw.iter().enumerate() {
            for i in 0..8 {
                if byte & (1 << i) != 0 {
                    set.set(j * 8 + i);
                }
            }
        }
        set
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 64);
    }

    pub fn unset(&mut self, bit: usize) {
        if let Some(word) = self.words.get_mut(bit / 64) {
            *word &= !(1 << (bit % 64));
        }
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .is_some_and(|w| w & (1 << (bit % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// `self |= other`
    pub fn or_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    /// `self |= a & b`
    pub fn or_and(&mut self, a: &BitSet, b: &BitSet) {
        let n = a.words.len().min(b.words.len());
        if n > self.words.len() {
            self.words.resize(n, 0);
        }
        for i in 0..n {
            self.words[i] |= a.words[i] & b.words[i];
        }
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(wi, w)| (0..64).filter(move |b| w & (1 << b) != 0).map(move |b| wi * 64 + b))
    }

    fn byte_len(&self) -> usize {
        match self.iter_set().max() {
            Some(max) => max / 8 + 1,
            None => 0,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        let nbytes = self.byte_len();
        write_size(buf, nbytes as i32);
        for j in 0..nbytes {
            let mut byte = 0u8;
            for i in 0..8 {
                if self.get(j * 8 + i) {
                    byte |= 1 << i;
                }
            }
            buf.put_u8(byte);
        }
    }
}

/// Completion status attached to most responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
    pub stack: String,
}

impl Status {
    pub fn ok() -> Status {
        Status {
            kind: StatusKind::Ok,
            message: String::new(),
            stack: String::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Status {
        Status {
            kind: StatusKind::Warning,
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Status {
        Status {
            kind: StatusKind::Error,
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Status {
        Status {
            kind: StatusKind::Fatal,
            message: message.into(),
            stack: String::new(),
        }
    }

    /// OK and WARNING both count as success.
    pub fn is_success(&self) -> bool {
        matches!(self.kind, StatusKind::Ok | StatusKind::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        if self.is_ok() && self.message.is_empty() && self.stack.is_empty() {
            buf.put_u8(0xFF);
            return;
        }
        buf.put_u8(match self.kind {
            StatusKind::Ok => 0,
            StatusKind::Warning => 1,
            StatusKind::Error => 2,
            StatusKind::Fatal => 3,
        });
        write_string(buf, &self.message);
        write_string(buf, &self.stack);
    }

    pub fn deserialize(reader: &mut PayloadReader<'_>) -> Result<Status, WireError> {
        let kind = match reader.u8()? {
            0xFF => return Ok(Status::ok()),
            0 => StatusKind::Ok,
            1 => StatusKind::Warning,
            2 => StatusKind::Error,
            3 => StatusKind::Fatal,
            b => return Err(WireError::BadStatusKind(b)),
        };
        let message = reader.string()?;
        let stack = reader.string()?;
        Ok(Status {
            kind,
            message,
            stack,
        })
    }
}

/// Emit `body` as one frame, or as a first/middle/last segmented series when
/// it exceeds `limit`.
pub fn split_into_frames(out: &mut BytesMut, command: u8, body: &[u8], limit: usize) {
    let limit = limit.max(1);
    if body.len() <= limit {
        FrameHeader::request(command, body.len() as u32).encode(out);
        out.put_slice(body);
        return;
    }
    let mut chunks = body.chunks(limit).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let segment = match (first, chunks.peek().is_some()) {
            (true, _) => flags::SEGMENT_FIRST,
            (false, true) => flags::SEGMENT_MIDDLE,
            (false, false) => flags::SEGMENT_LAST,
        };
        first = false;
        let mut header = FrameHeader::request(command, chunk.len() as u32);
        header.flags |= segment;
        header.encode(out);
        out.put_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::request(commands::GET, 42);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FrameHeader::LEN);
        let (rest, parsed) = FrameHeader::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, header);
        assert!(parsed.is_big_endian());
        assert_eq!(parsed.segment(), Segment::None);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let raw = [0x00, 1, 0x80, 10, 0, 0, 0, 0];
        assert!(FrameHeader::parse(&raw).is_err());
    }

    #[test]
    fn little_endian_payload_size() {
        let raw = [MAGIC, 1, 0x00, 2, 16, 0, 0, 0];
        let (_, header) = FrameHeader::parse(&raw).unwrap();
        assert!(!header.is_big_endian());
        assert_eq!(header.payload_size, 16);
    }

    #[test]
    fn size_encoding_boundaries() {
        for value in [-1, 0, 1, 253, 254, 255, 70_000] {
            let mut buf = BytesMut::new();
            write_size(&mut buf, value);
            let mut reader = PayloadReader::new(&buf, true);
            assert_eq!(reader.size().unwrap(), value, "value {value}");
            assert_eq!(reader.remaining(), 0);
        }
        // one byte for small, five for large
        let mut buf = BytesMut::new();
        write_size(&mut buf, 253);
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_size(&mut buf, 254);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "x:counter");
        write_string(&mut buf, "");
        let mut reader = PayloadReader::new(&buf, true);
        assert_eq!(reader.string().unwrap(), "x:counter");
        assert_eq!(reader.string().unwrap(), "");
    }

    #[test]
    fn bitset_round_trip() {
        let set = BitSet::from_bits([0, 3, 9, 64, 130]);
        let mut buf = BytesMut::new();
        set.serialize(&mut buf);
        let mut reader = PayloadReader::new(&buf, true);
        let parsed = reader.bitset().unwrap();
        assert_eq!(parsed, set);
        assert_eq!(parsed.iter_set().collect::<Vec<_>>(), vec![0, 3, 9, 64, 130]);
    }

    #[test]
    fn bitset_or_and() {
        let mut overrun = BitSet::from_bits([5]);
        let incoming = BitSet::from_bits([1, 2]);
        let already = BitSet::from_bits([1, 3]);
        overrun.or_and(&incoming, &already);
        assert_eq!(overrun, BitSet::from_bits([1, 5]));
    }

    #[test]
    fn empty_bitset_serializes_as_zero_bytes() {
        let mut buf = BytesMut::new();
        BitSet::new().serialize(&mut buf);
        assert_eq!(&buf[..], &[0]);
    }

    #[test]
    fn status_round_trip() {
        let mut buf = BytesMut::new();
        Status::ok().serialize(&mut buf);
        assert_eq!(&buf[..], &[0xFF]);
        let mut reader = PayloadReader::new(&buf, true);
        assert!(Status::deserialize(&mut reader).unwrap().is_ok());

        for status in [
            Status::warning("channel disconnected"),
            Status::error("other request pending"),
            Status::fatal("bind failed"),
        ] {
            let mut buf = BytesMut::new();
            status.serialize(&mut buf);
            let mut reader = PayloadReader::new(&buf, true);
            assert_eq!(Status::deserialize(&mut reader).unwrap(), status);
        }
    }

    #[test]
    fn ipv4_mapped_round_trip() {
        let addr = Ipv4Addr::new(172, 23, 124, 207);
        let raw = encode_ipv4_mapped(addr);
        assert_eq!(decode_ipv4_mapped(&raw), Some(addr));
    }

    #[test]
    fn ipv4_mapped_rejects_other_forms() {
        // wrong marker
        let mut raw = encode_ipv4_mapped(Ipv4Addr::LOCALHOST);
        raw[10] = 0x00;
        assert_eq!(decode_ipv4_mapped(&raw), None);
        // non-zero prefix (a real IPv6 address)
        let mut raw = encode_ipv4_mapped(Ipv4Addr::LOCALHOST);
        raw[0] = 0xFE;
        assert_eq!(decode_ipv4_mapped(&raw), None);
        // marker in the wrong place
        let mut raw = [0u8; 16];
        raw[8] = 0xFF;
        raw[9] = 0xFF;
        assert_eq!(decode_ipv4_mapped(&raw), None);
    }

    #[test]
    fn truncated_reads_error() {
        let mut reader = PayloadReader::new(&[0, 1], true);
        assert!(matches!(reader.u32(), Err(WireError::Truncated(_))));
    }

    #[test]
    fn segmentation_split() {
        let body: Vec<u8> = (0..100u8).collect();
        let mut out = BytesMut::new();
        split_into_frames(&mut out, commands::MONITOR, &body, 40);
        let mut rest: &[u8] = &out;
        let mut segments = Vec::new();
        let mut collected = Vec::new();
        while !rest.is_empty() {
            let (after, header) = FrameHeader::parse(rest).unwrap();
            segments.push(header.segment());
            collected.extend_from_slice(&after[..header.payload_size as usize]);
            rest = &after[header.payload_size as usize..];
        }
        assert_eq!(
            segments,
            vec![Segment::First, Segment::Middle, Segment::Last]
        );
        assert_eq!(collected, body);
    }

    #[test]
    fn small_body_is_single_frame() {
        let mut out = BytesMut::new();
        split_into_frames(&mut out, commands::GET, &[1, 2, 3], 40);
        let (rest, header) = FrameHeader::parse(&out).unwrap();
        assert_eq!(header.segment(), Segment::None);
        assert_eq!(rest, &[1, 2, 3]);
    }
}
