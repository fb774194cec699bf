//! Concrete message bodies exchanged over the datagram and circuit
//! transports: beacons, searches, the connection-validation handshake and
//! channel creation. Frame headers live in [`crate::wire`]; this module only
//! deals in payloads, plus the packing/unpacking of multi-message UDP
//! datagrams.

use std::{
    io::Cursor,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use binrw::{BinReaderExt, BinWrite, binrw};
use bytes::{BufMut, BytesMut};

use crate::wire::{
    FrameHeader, PayloadReader, Status, WireError, decode_ipv4_mapped, encode_ipv4_mapped,
    write_string,
};

/// Fixed part of a server liveness beacon (command 0).
///
/// The wire layout is sequential id (2 bytes), startup timestamp (8 + 4
/// bytes), IPv4-mapped server address (16 bytes) and port (2 bytes). Servers
/// may append introspected extra data, which this client tolerates and
/// ignores.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    pub sequence_id: u16,
    pub startup_secs: i64,
    pub startup_nanos: i32,
    address: [u8; 16],
    pub port: u16,
}

impl Beacon {
    pub fn new(sequence_id: u16, startup_secs: i64, address: Ipv4Addr, port: u16) -> Beacon {
        Beacon {
            sequence_id,
            startup_secs,
            startup_nanos: 0,
            address: encode_ipv4_mapped(address),
            port,
        }
    }

    /// Parse a beacon payload. Non-IPv4-mapped addresses yield `None`.
    pub fn parse(payload: &[u8]) -> Option<Beacon> {
        let mut reader = Cursor::new(payload);
        let beacon: Beacon = reader.read_be().ok()?;
        decode_ipv4_mapped(&beacon.address)?;
        Some(beacon)
    }

    /// The advertised server endpoint; a wildcard address defers to the
    /// datagram's source.
    pub fn server_endpoint(&self, origin: SocketAddr) -> SocketAddr {
        let ip = decode_ipv4_mapped(&self.address).expect("checked at parse");
        if ip.is_unspecified() {
            SocketAddr::new(origin.ip(), self.port)
        } else {
            SocketAddr::new(IpAddr::V4(ip), self.port)
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut writer = Cursor::new(Vec::new());
        self.write(&mut writer).unwrap();
        writer.into_inner()
    }
}

/// A batch of channel searches (command 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub sequence_id: i32,
    /// `(CID, channel name)` pairs.
    pub channels: Vec<(u32, String)>,
}

impl SearchRequest {
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_i32(self.sequence_id);
        buf.put_u16(self.channels.len() as u16);
        for (cid, name) in &self.channels {
            buf.put_u32(*cid);
            write_string(buf, name);
        }
    }

    pub fn parse(reader: &mut PayloadReader<'_>) -> Result<SearchRequest, WireError> {
        let sequence_id = reader.i32()?;
        let count = reader.u16()?;
        let mut channels = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let cid = reader.u32()?;
            let name = reader.string()?;
            channels.push((cid, name));
        }
        Ok(SearchRequest {
            sequence_id,
            channels,
        })
    }

    /// Wire size of one `(cid, name)` entry within a search frame.
    pub fn entry_size(name: &str) -> usize {
        let prefix = if name.len() < 254 { 1 } else { 5 };
        4 + prefix + name.len()
    }
}

/// Reply to a search (command 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub sequence_id: i32,
    pub found: bool,
    server: [u8; 16],
    pub port: u16,
    pub cids: Vec<u32>,
}

impl SearchResponse {
    pub fn new(sequence_id: i32, server: Ipv4Addr, port: u16, cids: Vec<u32>) -> SearchResponse {
        SearchResponse {
            sequence_id,
            found: true,
            server: encode_ipv4_mapped(server),
            port,
            cids,
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_i32(self.sequence_id);
        buf.put_u8(self.found as u8);
        buf.put_slice(&self.server);
        buf.put_u16(self.port);
        buf.put_u16(self.cids.len() as u16);
        for cid in &self.cids {
            buf.put_u32(*cid);
        }
    }

    /// Parse a search-response payload.
    ///
    /// Returns `Ok(None)` for not-found replies and for any reply whose
    /// address is not IPv4-mapped, both of which are silently dropped.
    pub fn parse(reader: &mut PayloadReader<'_>) -> Result<Option<SearchResponse>, WireError> {
        let sequence_id = reader.i32()?;
        let found = reader.u8()? != 0;
        if !found {
            return Ok(None);
        }
        let raw: [u8; 16] = reader.bytes(16)?.try_into().unwrap();
        if decode_ipv4_mapped(&raw).is_none() {
            return Ok(None);
        }
        let port = reader.u16()?;
        let count = reader.u16()?;
        let mut cids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cids.push(reader.u32()?);
        }
        Ok(Some(SearchResponse {
            sequence_id,
            found,
            server: raw,
            port,
            cids,
        }))
    }

    /// The responding server endpoint; a wildcard address defers to the
    /// datagram's source.
    pub fn server_endpoint(&self, origin: SocketAddr) -> SocketAddr {
        let ip = decode_ipv4_mapped(&self.server).expect("checked at parse");
        if ip.is_unspecified() {
            SocketAddr::new(origin.ip(), self.port)
        } else {
            SocketAddr::new(IpAddr::V4(ip), self.port)
        }
    }
}

/// Connection-validation payload (command 1), sent by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub receive_buffer_size: i32,
    pub socket_buffer_size: i32,
}

impl Validation {
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_i32(self.receive_buffer_size);
        buf.put_i32(self.socket_buffer_size);
    }

    pub fn parse(reader: &mut PayloadReader<'_>) -> Result<Validation, WireError> {
        Ok(Validation {
            receive_buffer_size: reader.i32()?,
            socket_buffer_size: reader.i32()?,
        })
    }
}

/// Channel creation request (command 7). The count is always 1 in this
/// client, but the wire form carries a list.
pub fn serialize_create_channel(buf: &mut BytesMut, cid: u32, name: &str) {
    buf.put_u16(1);
    buf.put_u32(cid);
    write_string(buf, name);
}

/// Channel creation reply (command 7).
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelResponse {
    pub cid: u32,
    pub sid: u32,
    pub status: Status,
}

impl CreateChannelResponse {
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.cid);
        buf.put_u32(self.sid);
        self.status.serialize(buf);
    }

    pub fn parse(reader: &mut PayloadReader<'_>) -> Result<CreateChannelResponse, WireError> {
        Ok(CreateChannelResponse {
            cid: reader.u32()?,
            sid: reader.u32()?,
            status: Status::deserialize(reader)?,
        })
    }
}

/// Severity of a command-18 message to a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Warning,
    Error,
    FatalError,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> MessageKind {
        match byte {
            1 => MessageKind::Warning,
            2 => MessageKind::Error,
            3 => MessageKind::FatalError,
            _ => MessageKind::Info,
        }
    }
}

/// Append one non-segmented frame to a datagram under construction.
pub fn append_frame(out: &mut BytesMut, command: u8, payload: &[u8]) {
    FrameHeader::request(command, payload.len() as u32).encode(out);
    out.put_slice(payload);
}

/// Split a datagram into its `(header, payload)` frames.
///
/// A single UDP packet may concatenate several messages; a malformed tail
/// invalidates the whole packet.
pub fn parse_datagram(buf: &[u8]) -> Result<Vec<(FrameHeader, &[u8])>, WireError> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (after, header) = FrameHeader::parse(rest).map_err(|_| WireError::ShortHeader)?;
        let size = header.payload_size as usize;
        if after.len() < size {
            return Err(WireError::Truncated(size - after.len()));
        }
        frames.push((header, &after[..size]));
        rest = &after[size..];
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::commands;

    #[test]
    fn beacon_round_trip() {
        let beacon = Beacon::new(45_027, 1_700_000_000, "172.23.124.207".parse().unwrap(), 37426);
        let raw = beacon.as_bytes();
        assert_eq!(raw.len(), 32);
        let parsed = Beacon::parse(&raw).unwrap();
        assert_eq!(parsed, beacon);
        let origin: SocketAddr = "10.0.0.1:5076".parse().unwrap();
        assert_eq!(
            parsed.server_endpoint(origin),
            "172.23.124.207:37426".parse().unwrap()
        );
    }

    #[test]
    fn beacon_wildcard_address_uses_origin() {
        let beacon = Beacon::new(1, 0, Ipv4Addr::UNSPECIFIED, 5075);
        let parsed = Beacon::parse(&beacon.as_bytes()).unwrap();
        let origin: SocketAddr = "192.168.1.9:41000".parse().unwrap();
        assert_eq!(
            parsed.server_endpoint(origin),
            "192.168.1.9:5075".parse().unwrap()
        );
    }

    #[test]
    fn beacon_rejects_unmapped_address() {
        let mut raw = Beacon::new(1, 0, Ipv4Addr::LOCALHOST, 5075).as_bytes();
        raw[14 + 10] = 0; // corrupt the 0xFFFF marker inside the address field
        assert!(Beacon::parse(&raw).is_none());
    }

    #[test]
    fn beacon_tolerates_trailing_data() {
        let mut raw = Beacon::new(7, 5, Ipv4Addr::LOCALHOST, 5075).as_bytes();
        raw.extend_from_slice(&[0xFF, 1, 2, 3]);
        assert_eq!(Beacon::parse(&raw).unwrap().sequence_id, 7);
    }

    #[test]
    fn search_request_round_trip() {
        let request = SearchRequest {
            sequence_id: 12,
            channels: vec![(1, "x:counter".to_string()), (2, "nope".to_string())],
        };
        let mut buf = BytesMut::new();
        request.serialize(&mut buf);
        let mut reader = PayloadReader::new(&buf, true);
        assert_eq!(SearchRequest::parse(&mut reader).unwrap(), request);
    }

    #[test]
    fn search_response_round_trip() {
        let response = SearchResponse::new(12, Ipv4Addr::new(127, 0, 0, 1), 6464, vec![1, 2]);
        let mut buf = BytesMut::new();
        response.serialize(&mut buf);
        let mut reader = PayloadReader::new(&buf, true);
        let parsed = SearchResponse::parse(&mut reader).unwrap().unwrap();
        assert_eq!(parsed, response);
        let origin: SocketAddr = "127.0.0.1:39000".parse().unwrap();
        assert_eq!(
            parsed.server_endpoint(origin),
            "127.0.0.1:6464".parse().unwrap()
        );
    }

    #[test]
    fn search_response_drops_not_found_and_unmapped() {
        let mut buf = BytesMut::new();
        buf.put_i32(3);
        buf.put_u8(0);
        let mut reader = PayloadReader::new(&buf, true);
        assert!(SearchResponse::parse(&mut reader).unwrap().is_none());

        let mut buf = BytesMut::new();
        buf.put_i32(3);
        buf.put_u8(1);
        buf.put_slice(&[0xFE; 16]); // a real IPv6 address, not mapped
        buf.put_u16(6464);
        buf.put_u16(0);
        let mut reader = PayloadReader::new(&buf, true);
        assert!(SearchResponse::parse(&mut reader).unwrap().is_none());
    }

    #[test]
    fn create_channel_response_round_trip() {
        let response = CreateChannelResponse {
            cid: 5,
            sid: 99,
            status: Status::ok(),
        };
        let mut buf = BytesMut::new();
        response.serialize(&mut buf);
        let mut reader = PayloadReader::new(&buf, true);
        assert_eq!(CreateChannelResponse::parse(&mut reader).unwrap(), response);
    }

    #[test]
    fn datagram_splits_multiple_frames() {
        let mut payload = BytesMut::new();
        SearchRequest {
            sequence_id: 1,
            channels: vec![(9, "a".to_string())],
        }
        .serialize(&mut payload);
        let mut out = BytesMut::new();
        append_frame(&mut out, commands::ECHO, &[]);
        append_frame(&mut out, commands::SEARCH_REQUEST, &payload);

        let frames = parse_datagram(&out).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.command, commands::ECHO);
        assert_eq!(frames[1].0.command, commands::SEARCH_REQUEST);
        assert_eq!(frames[1].1.len(), payload.len());
    }

    #[test]
    fn datagram_with_truncated_tail_is_rejected() {
        let mut out = BytesMut::new();
        append_frame(&mut out, commands::ECHO, &[1, 2, 3]);
        assert!(parse_datagram(&out[..out.len() - 1]).is_err());
    }
}
