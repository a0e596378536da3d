//! PVA message framing and the primitive wire encodings.
//!
//! Every PVA message starts with an eight byte header:
//!
//! | byte | content |
//! |------|---------|
//! | 0    | magic `0xCA` |
//! | 1    | protocol version |
//! | 2    | flags (control, segmentation, direction, byte order) |
//! | 3    | command |
//! | 4..8 | payload size, in the byte order named by the flags |
//!
//! Control messages carry no payload; the size field is reused as data. Unlike CA,
//! PVA has no fixed byte order: each message names its own, and the server
//! announces the order it will use with a `SET_BYTE_ORDER` control message at the
//! start of every connection.
//!
//! Decoding is done with [nom] over byte slices. Since the byte order is only known
//! at runtime, the numeric parsers here all take a [`ByteOrder`]. Encoding goes
//! into a [`WireBuffer`], which knows its byte order and can reserve the length slot
//! of a header and patch it once the payload has been written.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::{Buf, Bytes, BytesMut};
use nom::{
    Err, IResult,
    bytes::complete::take,
    error::{Error, ErrorKind},
    number::{Endianness, complete as number},
};
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::{
    data::{DataError, PvStructure, TypeRegistry},
    guid::{GUID_LENGTH, Guid},
};

pub const PVA_MAGIC: u8 = 0xCA;
/// Protocol revision we implement and announce
pub const PVA_PROTOCOL_REVISION: u8 = 2;
pub const HEADER_SIZE: usize = 8;
/// Largest UDP datagram we will handle
pub const MAX_UDP_PACKET: usize = 1500;

/// Bits of the header flags byte
pub mod flags {
    pub const CONTROL: u8 = 0x01;
    pub const SEGMENT_MASK: u8 = 0x30;
    pub const FROM_SERVER: u8 = 0x40;
    pub const BIG_ENDIAN: u8 = 0x80;
}

/// Control message commands. These have no payload.
pub mod control {
    pub const MARK_TOTAL_BYTES_SENT: u8 = 0;
    pub const ACK_TOTAL_BYTES_RECEIVED: u8 = 1;
    pub const SET_BYTE_ORDER: u8 = 2;
    pub const ECHO_REQUEST: u8 = 3;
    pub const ECHO_RESPONSE: u8 = 4;
}

/// Subcommand bits used by GET, PUT, MONITOR and RPC
pub mod subcommand {
    pub const EXEC: u8 = 0x00;
    pub const MONITOR_STOP: u8 = 0x04;
    pub const INIT: u8 = 0x08;
    pub const DESTROY: u8 = 0x10;
    pub const PUT_GET: u8 = 0x40;
    pub const MONITOR_START: u8 = 0x44;
    pub const MONITOR_PIPELINE_ACK: u8 = 0x80;
}

/// Application message commands
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Beacon = 0x00,
    ConnectionValidation = 0x01,
    Echo = 0x02,
    Search = 0x03,
    SearchResponse = 0x04,
    AuthNZ = 0x05,
    AclChange = 0x06,
    CreateChannel = 0x07,
    DestroyChannel = 0x08,
    ConnectionValidated = 0x09,
    Get = 0x0A,
    Put = 0x0B,
    PutGet = 0x0C,
    Monitor = 0x0D,
    Array = 0x0E,
    DestroyRequest = 0x0F,
    Process = 0x10,
    GetType = 0x11,
    Message = 0x12,
    MultipleData = 0x13,
    Rpc = 0x14,
    CancelRequest = 0x15,
    OriginTag = 0x16,
}

/// Number of defined command codes, i.e. size of a command dispatch table
pub const COMMAND_COUNT: usize = 0x17;

impl TryFrom<u8> for Command {
    type Error = MessageError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Beacon,
            0x01 => Self::ConnectionValidation,
            0x02 => Self::Echo,
            0x03 => Self::Search,
            0x04 => Self::SearchResponse,
            0x05 => Self::AuthNZ,
            0x06 => Self::AclChange,
            0x07 => Self::CreateChannel,
            0x08 => Self::DestroyChannel,
            0x09 => Self::ConnectionValidated,
            0x0A => Self::Get,
            0x0B => Self::Put,
            0x0C => Self::PutGet,
            0x0D => Self::Monitor,
            0x0E => Self::Array,
            0x0F => Self::DestroyRequest,
            0x10 => Self::Process,
            0x11 => Self::GetType,
            0x12 => Self::Message,
            0x13 => Self::MultipleData,
            0x14 => Self::Rpc,
            0x15 => Self::CancelRequest,
            0x16 => Self::OriginTag,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Unknown command ID: {0:#04x}")]
    UnknownCommandId(u8),
    #[error("Got a valid message but is not valid at this state: {0}")]
    UnexpectedMessage(String),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
    #[error("Message does not start with PVA magic byte, got {0:#04x}")]
    BadMagic(u8),
    #[error("Segmented messages are not supported")]
    Segmented,
    #[error("Message payload of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// Byte order of a message
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    pub fn endianness(self) -> Endianness {
        match self {
            ByteOrder::Big => Endianness::Big,
            ByteOrder::Little => Endianness::Little,
        }
    }
    fn from_flags(flags: u8) -> Self {
        if flags & flags::BIG_ENDIAN != 0 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
    fn flag(self) -> u8 {
        match self {
            ByteOrder::Big => flags::BIG_ENDIAN,
            ByteOrder::Little => 0,
        }
    }
}

pub fn parse_u8(input: &[u8]) -> IResult<&[u8], u8> {
    number::u8(input)
}
pub fn parse_i8(input: &[u8]) -> IResult<&[u8], i8> {
    number::i8(input)
}
pub fn parse_u16(order: ByteOrder, input: &[u8]) -> IResult<&[u8], u16> {
    number::u16(order.endianness())(input)
}
pub fn parse_i16(order: ByteOrder, input: &[u8]) -> IResult<&[u8], i16> {
    number::i16(order.endianness())(input)
}
pub fn parse_u32(order: ByteOrder, input: &[u8]) -> IResult<&[u8], u32> {
    number::u32(order.endianness())(input)
}
pub fn parse_i32(order: ByteOrder, input: &[u8]) -> IResult<&[u8], i32> {
    number::i32(order.endianness())(input)
}
pub fn parse_u64(order: ByteOrder, input: &[u8]) -> IResult<&[u8], u64> {
    number::u64(order.endianness())(input)
}
pub fn parse_i64(order: ByteOrder, input: &[u8]) -> IResult<&[u8], i64> {
    number::i64(order.endianness())(input)
}
pub fn parse_f32(order: ByteOrder, input: &[u8]) -> IResult<&[u8], f32> {
    number::f32(order.endianness())(input)
}
pub fn parse_f64(order: ByteOrder, input: &[u8]) -> IResult<&[u8], f64> {
    number::f64(order.endianness())(input)
}
pub fn parse_bool(input: &[u8]) -> IResult<&[u8], bool> {
    let (input, b) = number::u8(input)?;
    Ok((input, b != 0))
}

/// Parse a PVA "size", which is `None` for the special null size
pub fn parse_size(order: ByteOrder, input: &[u8]) -> IResult<&[u8], Option<usize>> {
    let (input, first) = number::u8(input)?;
    match first {
        0xFF => Ok((input, None)),
        0xFE => {
            let (rest, size) = parse_i32(order, input)?;
            if size < 0 {
                return Err(Err::Failure(Error::new(input, ErrorKind::Verify)));
            }
            Ok((rest, Some(size as usize)))
        }
        n => Ok((input, Some(n as usize))),
    }
}

/// Parse a size that must not be the null size
pub fn parse_count(order: ByteOrder, input: &[u8]) -> IResult<&[u8], usize> {
    let (rest, size) = parse_size(order, input)?;
    match size {
        Some(size) => Ok((rest, size)),
        None => Err(Err::Failure(Error::new(input, ErrorKind::Verify))),
    }
}

/// Parse a size-prefixed string. A null size is read as the empty string.
pub fn parse_string(order: ByteOrder, input: &[u8]) -> IResult<&[u8], String> {
    let (input, size) = parse_size(order, input)?;
    let (input, raw) = take(size.unwrap_or(0))(input)?;
    Ok((input, String::from_utf8_lossy(raw).into_owned()))
}

/// Parse a 16-byte address; IPv4 is sent as an IPv4-mapped IPv6 address
pub fn parse_address(input: &[u8]) -> IResult<&[u8], IpAddr> {
    let (input, raw) = take(16usize)(input)?;
    let mut octets = [0u8; 16];
    octets.copy_from_slice(raw);
    let v6 = Ipv6Addr::from(octets);
    Ok((
        input,
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
    ))
}

/// Growable output buffer with a fixed byte order
///
/// Messages are written by reserving a header with [`WireBuffer::begin_message`],
/// writing the payload, and then patching the header's size slot with
/// [`WireBuffer::end_message`].
#[derive(Debug, Clone)]
pub struct WireBuffer {
    order: ByteOrder,
    data: Vec<u8>,
}

impl WireBuffer {
    pub fn new(order: ByteOrder) -> Self {
        WireBuffer {
            order,
            data: Vec::with_capacity(128),
        }
    }
    pub fn order(&self) -> ByteOrder {
        self.order
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Write a message header with a placeholder size, returning the offset to
    /// pass to [`WireBuffer::end_message`]
    pub fn begin_message(&mut self, flags: u8, command: Command) -> usize {
        let start = self.data.len();
        self.put_u8(PVA_MAGIC);
        self.put_u8(PVA_PROTOCOL_REVISION);
        self.put_u8(flags | self.order.flag());
        self.put_u8(command as u8);
        self.put_u32(0);
        start
    }

    /// Patch the size slot of the header started at `start`
    pub fn end_message(&mut self, start: usize) {
        let payload = (self.data.len() - start - HEADER_SIZE) as u32;
        let bytes = match self.order {
            ByteOrder::Big => payload.to_be_bytes(),
            ByteOrder::Little => payload.to_le_bytes(),
        };
        self.data[start + 4..start + 8].copy_from_slice(&bytes);
    }

    /// Write a complete control message
    pub fn put_control(&mut self, flags: u8, command: u8, data: u32) {
        self.put_u8(PVA_MAGIC);
        self.put_u8(PVA_PROTOCOL_REVISION);
        self.put_u8(flags | flags::CONTROL | self.order.flag());
        self.put_u8(command);
        self.put_u32(data);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }
    pub fn put_i8(&mut self, value: i8) {
        self.data.push(value as u8);
    }
    pub fn put_bool(&mut self, value: bool) {
        self.data.push(value as u8);
    }
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put_size(&mut self, size: Option<usize>) {
        match size {
            None => self.put_u8(0xFF),
            Some(n) if n < 254 => self.put_u8(n as u8),
            Some(n) => {
                self.put_u8(0xFE);
                self.put_i32(n as i32);
            }
        }
    }
    pub fn put_string(&mut self, value: &str) {
        self.put_size(Some(value.len()));
        self.put_bytes(value.as_bytes());
    }
    pub fn put_address(&mut self, address: IpAddr) {
        let v6 = match address {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        self.put_bytes(&v6.octets());
    }
}

macro_rules! impl_wire_put {
    ($name:ident, $typ:ty) => {
        impl WireBuffer {
            pub fn $name(&mut self, value: $typ) {
                match self.order {
                    ByteOrder::Big => self.data.extend_from_slice(&value.to_be_bytes()),
                    ByteOrder::Little => self.data.extend_from_slice(&value.to_le_bytes()),
                }
            }
        }
    };
}
impl_wire_put!(put_u16, u16);
impl_wire_put!(put_i16, i16);
impl_wire_put!(put_u32, u32);
impl_wire_put!(put_i32, i32);
impl_wire_put!(put_u64, u64);
impl_wire_put!(put_i64, i64);
impl_wire_put!(put_f32, f32);
impl_wire_put!(put_f64, f64);

/// Decoded message header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PvaHeader {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    /// Payload size for application messages, or the data field of a control message
    pub payload_size: u32,
}

impl PvaHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PvaHeader> {
        let (rest, magic) = number::u8(input)?;
        if magic != PVA_MAGIC {
            return Err(Err::Failure(Error::new(input, ErrorKind::Tag)));
        }
        let (rest, version) = number::u8(rest)?;
        let (rest, flags) = number::u8(rest)?;
        let (rest, command) = number::u8(rest)?;
        let (rest, payload_size) = parse_u32(ByteOrder::from_flags(flags), rest)?;
        Ok((
            rest,
            PvaHeader {
                version,
                flags,
                command,
                payload_size,
            },
        ))
    }
    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_flags(self.flags)
    }
    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }
    pub fn is_segmented(&self) -> bool {
        self.flags & flags::SEGMENT_MASK != 0
    }
    pub fn is_from_server(&self) -> bool {
        self.flags & flags::FROM_SERVER != 0
    }
}

/// One complete message read from a TCP stream
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: PvaHeader,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order()
    }
}

/// Splits a TCP byte stream into [`RawFrame`] messages
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        FrameCodec { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(64 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[0] != PVA_MAGIC {
            return Err(MessageError::BadMagic(src[0]));
        }
        let (_, header) = PvaHeader::parse(&src[..HEADER_SIZE])?;
        if header.is_control() {
            src.advance(HEADER_SIZE);
            return Ok(Some(RawFrame {
                header,
                payload: Bytes::new(),
            }));
        }
        if header.is_segmented() {
            return Err(MessageError::Segmented);
        }
        let payload_size = header.payload_size as usize;
        if payload_size > self.max_payload {
            return Err(MessageError::TooLarge(payload_size));
        }
        let total = HEADER_SIZE + payload_size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total).freeze();
        let payload = frame.split_off(HEADER_SIZE);
        trace!(
            "Received command {:#04x} with {} byte payload",
            header.command, payload_size
        );
        Ok(Some(RawFrame { header, payload }))
    }
}

/// Split a UDP datagram into the messages it contains
pub fn parse_udp_messages(datagram: &[u8]) -> Result<Vec<(PvaHeader, &[u8])>, MessageError> {
    let mut messages = Vec::new();
    let mut input = datagram;
    while input.len() >= HEADER_SIZE {
        let (rest, header) = PvaHeader::parse(input)?;
        if header.is_control() {
            input = rest;
            continue;
        }
        let (rest, payload) =
            take::<usize, &[u8], nom::error::Error<&[u8]>>(header.payload_size as usize)(rest)?;
        messages.push((header, payload));
        input = rest;
    }
    Ok(messages)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusType {
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

/// Status included in many replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusType,
    pub message: String,
    pub call_stack: String,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            kind: StatusType::Ok,
            message: String::new(),
            call_stack: String::new(),
        }
    }
    pub fn warning(message: impl Into<String>) -> Self {
        Status {
            kind: StatusType::Warning,
            message: message.into(),
            call_stack: String::new(),
        }
    }
    pub fn error(message: impl Into<String>) -> Self {
        Status {
            kind: StatusType::Error,
            message: message.into(),
            call_stack: String::new(),
        }
    }
    pub fn is_ok(&self) -> bool {
        self.kind == StatusType::Ok
    }

    pub fn write(&self, buffer: &mut WireBuffer) {
        if self.kind == StatusType::Ok && self.message.is_empty() && self.call_stack.is_empty() {
            buffer.put_u8(0xFF);
        } else {
            buffer.put_u8(self.kind as u8);
            buffer.put_string(&self.message);
            buffer.put_string(&self.call_stack);
        }
    }

    pub fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], Status> {
        let (rest, kind) = number::u8(input)?;
        let kind = match kind {
            0xFF => return Ok((rest, Status::ok())),
            0 => StatusType::Ok,
            1 => StatusType::Warning,
            2 => StatusType::Error,
            3 => StatusType::Fatal,
            _ => return Err(Err::Failure(Error::new(input, ErrorKind::Verify))),
        };
        let (rest, message) = parse_string(order, rest)?;
        let (rest, call_stack) = parse_string(order, rest)?;
        Ok((
            rest,
            Status {
                kind,
                message,
                call_stack,
            },
        ))
    }
}

/// One channel in a [`SearchRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchChannel {
    pub cid: u32,
    pub name: String,
}

/// Message SEARCH.
///
/// Searches for one or more channel names, or with no channels, asks all
/// servers to identify themselves. Sent over UDP, or over an established TCP
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub sequence: u32,
    /// Reply even if no channel was found?
    pub reply_required: bool,
    /// Was this sent unicast, i.e. only seen by one socket on this host?
    pub unicast: bool,
    /// Where replies should be sent. An unspecified IP means "the sender".
    pub response_address: SocketAddr,
    pub protocols: Vec<String>,
    pub channels: Vec<SearchChannel>,
}

impl SearchRequest {
    pub const FLAG_REPLY_REQUIRED: u8 = 0x01;
    pub const FLAG_UNICAST: u8 = 0x80;

    pub fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], SearchRequest> {
        let (input, sequence) = parse_u32(order, input)?;
        let (input, search_flags) = number::u8(input)?;
        let (input, _reserved) = take(3usize)(input)?;
        let (input, address) = parse_address(input)?;
        let (input, port) = parse_u16(order, input)?;
        let (mut input, protocol_count) = parse_count(order, input)?;
        let mut protocols = Vec::with_capacity(protocol_count.min(8));
        for _ in 0..protocol_count {
            let (rest, protocol) = parse_string(order, input)?;
            protocols.push(protocol);
            input = rest;
        }
        let (mut input, count) = parse_u16(order, input)?;
        let mut channels = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (rest, cid) = parse_u32(order, input)?;
            let (rest, name) = parse_string(order, rest)?;
            channels.push(SearchChannel { cid, name });
            input = rest;
        }
        Ok((
            input,
            SearchRequest {
                sequence,
                reply_required: search_flags & Self::FLAG_REPLY_REQUIRED != 0,
                unicast: search_flags & Self::FLAG_UNICAST != 0,
                response_address: SocketAddr::new(address, port),
                protocols,
                channels,
            },
        ))
    }

    /// The address a reply should go to, given the datagram's sender
    pub fn reply_address(&self, sender: SocketAddr) -> SocketAddr {
        if self.response_address.ip().is_unspecified() {
            SocketAddr::new(sender.ip(), self.response_address.port())
        } else {
            self.response_address
        }
    }

    pub fn is_list_servers(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn tls_requested(&self) -> bool {
        self.protocols.iter().any(|p| p == "tls")
    }

    pub fn write(&self, buffer: &mut WireBuffer) {
        let start = buffer.begin_message(0, Command::Search);
        buffer.put_u32(self.sequence);
        let mut search_flags = 0;
        if self.reply_required {
            search_flags |= Self::FLAG_REPLY_REQUIRED;
        }
        if self.unicast {
            search_flags |= Self::FLAG_UNICAST;
        }
        buffer.put_u8(search_flags);
        buffer.put_bytes(&[0, 0, 0]);
        buffer.put_address(self.response_address.ip());
        buffer.put_u16(self.response_address.port());
        buffer.put_size(Some(self.protocols.len()));
        for protocol in &self.protocols {
            buffer.put_string(protocol);
        }
        buffer.put_u16(self.channels.len() as u16);
        for channel in &self.channels {
            buffer.put_u32(channel.cid);
            buffer.put_string(&channel.name);
        }
        buffer.end_message(start);
    }
}

/// Message SEARCH_RESPONSE.
///
/// Tells a client which server, at which TCP endpoint, hosts the named channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub guid: Guid,
    pub sequence: u32,
    pub server_address: SocketAddr,
    /// "tcp" or "tls"
    pub protocol: String,
    pub found: bool,
    pub cids: Vec<u32>,
}

impl SearchResponse {
    pub fn write(&self, buffer: &mut WireBuffer) {
        let start = buffer.begin_message(flags::FROM_SERVER, Command::SearchResponse);
        buffer.put_bytes(self.guid.as_bytes());
        buffer.put_u32(self.sequence);
        buffer.put_address(self.server_address.ip());
        buffer.put_u16(self.server_address.port());
        buffer.put_string(&self.protocol);
        buffer.put_bool(self.found);
        buffer.put_u16(self.cids.len() as u16);
        for cid in &self.cids {
            buffer.put_u32(*cid);
        }
        buffer.end_message(start);
    }

    pub fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], SearchResponse> {
        let (input, raw_guid) = take(GUID_LENGTH)(input)?;
        let mut guid = [0u8; GUID_LENGTH];
        guid.copy_from_slice(raw_guid);
        let (input, sequence) = parse_u32(order, input)?;
        let (input, address) = parse_address(input)?;
        let (input, port) = parse_u16(order, input)?;
        let (input, protocol) = parse_string(order, input)?;
        let (input, found) = parse_bool(input)?;
        let (mut input, count) = parse_u16(order, input)?;
        let mut cids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (rest, cid) = parse_u32(order, input)?;
            cids.push(cid);
            input = rest;
        }
        Ok((
            input,
            SearchResponse {
                guid: Guid::from_bytes(guid),
                sequence,
                server_address: SocketAddr::new(address, port),
                protocol,
                found,
                cids,
            },
        ))
    }
}

/// Message ORIGIN_TAG.
///
/// Prefixes a search that was forwarded to the local multicast group, naming the
/// interface it originally arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginTag {
    pub address: IpAddr,
}

impl OriginTag {
    pub fn write(&self, buffer: &mut WireBuffer) {
        let start = buffer.begin_message(0, Command::OriginTag);
        buffer.put_address(self.address);
        buffer.end_message(start);
    }
    pub fn parse(input: &[u8]) -> IResult<&[u8], OriginTag> {
        let (input, address) = parse_address(input)?;
        Ok((input, OriginTag { address }))
    }
}

/// Message CONNECTION_VALIDATION, as sent by the server.
///
/// First application message on every connection. Lists the authentication
/// methods the client may pick from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub buffer_size: u32,
    pub registry_size: u16,
    pub auth_methods: Vec<String>,
}

impl ValidationRequest {
    pub fn write(&self, buffer: &mut WireBuffer) {
        let start = buffer.begin_message(flags::FROM_SERVER, Command::ConnectionValidation);
        buffer.put_u32(self.buffer_size);
        buffer.put_u16(self.registry_size);
        buffer.put_size(Some(self.auth_methods.len()));
        for method in &self.auth_methods {
            buffer.put_string(method);
        }
        buffer.end_message(start);
    }
    pub fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], ValidationRequest> {
        let (input, buffer_size) = parse_u32(order, input)?;
        let (input, registry_size) = parse_u16(order, input)?;
        let (mut input, count) = parse_count(order, input)?;
        let mut auth_methods = Vec::new();
        for _ in 0..count {
            let (rest, method) = parse_string(order, input)?;
            auth_methods.push(method);
            input = rest;
        }
        Ok((
            input,
            ValidationRequest {
                buffer_size,
                registry_size,
                auth_methods,
            },
        ))
    }
}

/// Message CONNECTION_VALIDATION, as sent back by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReply {
    pub buffer_size: u32,
    pub registry_size: u16,
    pub qos: u16,
    pub auth_method: String,
    /// Extra information for the authentication method, e.g. user and host for "ca"
    pub auth_data: Option<PvStructure>,
}

impl ValidationReply {
    pub fn parse(order: ByteOrder, input: &[u8]) -> Result<ValidationReply, MessageError> {
        let (input, buffer_size) = parse_u32(order, input)?;
        let (input, registry_size) = parse_u16(order, input)?;
        let (input, qos) = parse_u16(order, input)?;
        let (input, auth_method) = parse_string(order, input)?;
        // Identity data is described inline, with a registry private to this message
        let auth_data = if input.is_empty() {
            None
        } else {
            let mut types = TypeRegistry::default();
            let (input, desc) = types.parse_field_desc(order, input)?;
            match desc {
                Some(desc) => {
                    let (_, value) = desc.parse_value(order, &mut types, input)?;
                    value.into_structure()
                }
                None => None,
            }
        };
        Ok(ValidationReply {
            buffer_size,
            registry_size,
            qos,
            auth_method,
            auth_data,
        })
    }

    pub fn write(&self, buffer: &mut WireBuffer) {
        let start = buffer.begin_message(0, Command::ConnectionValidation);
        buffer.put_u32(self.buffer_size);
        buffer.put_u16(self.registry_size);
        buffer.put_u16(self.qos);
        buffer.put_string(&self.auth_method);
        if let Some(data) = &self.auth_data {
            data.field_desc().write(buffer);
            data.write(buffer);
        }
        buffer.end_message(start);
    }
}

/// Unwrap the IPv4 address out of an IPv4-mapped IPv6 socket address
pub fn canonical_address(address: SocketAddr) -> SocketAddr {
    match address.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), address.port()),
            None => address,
        },
        IpAddr::V4(_) => address,
    }
}

/// The IPv4 "any" address, used in replies to mean "the address you sent to"
pub const UNSPECIFIED_V4: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
