//! The peer frame codec.
//!
//! Frames are OER-encoded: a 1-byte type, a u32 big-endian request id and a
//! var-octet envelope holding the type-specific fields and the sub-protocol
//! list. Parsing is strict: trailing bytes anywhere are an error.

use std::borrow::Cow;
use std::io::Read;
use std::str;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use chrono::{DateTime, TimeZone, Utc};
use conductor_packet::oer::{BufOerExt, MutBufOerExt};
use conductor_packet::ParseError;

static GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3fZ";

pub trait Serializable<T> {
    fn from_bytes(bytes: &[u8]) -> Result<T, ParseError>;

    fn to_bytes(&self) -> Vec<u8>;
}

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
enum PacketType {
    Response = 1,
    Error = 2,
    Message = 6,
    Transfer = 7,
    Unknown,
}

impl From<u8> for PacketType {
    fn from(type_int: u8) -> Self {
        match type_int {
            1 => PacketType::Response,
            2 => PacketType::Error,
            6 => PacketType::Message,
            7 => PacketType::Transfer,
            _ => PacketType::Unknown,
        }
    }
}

/// Any of the four frame forms.
#[derive(Debug, PartialEq, Clone)]
pub enum BtpPacket {
    Message(BtpMessage),
    Response(BtpResponse),
    Error(BtpError),
    Transfer(BtpTransfer),
}

impl BtpPacket {
    pub fn request_id(&self) -> u32 {
        match self {
            BtpPacket::Message(packet) => packet.request_id,
            BtpPacket::Response(packet) => packet.request_id,
            BtpPacket::Error(packet) => packet.request_id,
            BtpPacket::Transfer(packet) => packet.request_id,
        }
    }
}

impl Serializable<BtpPacket> for BtpPacket {
    fn from_bytes(bytes: &[u8]) -> Result<BtpPacket, ParseError> {
        match bytes.first().copied().map(PacketType::from) {
            Some(PacketType::Message) => Ok(BtpPacket::Message(BtpMessage::from_bytes(bytes)?)),
            Some(PacketType::Response) => Ok(BtpPacket::Response(BtpResponse::from_bytes(bytes)?)),
            Some(PacketType::Error) => Ok(BtpPacket::Error(BtpError::from_bytes(bytes)?)),
            Some(PacketType::Transfer) => Ok(BtpPacket::Transfer(BtpTransfer::from_bytes(bytes)?)),
            Some(PacketType::Unknown) => Err(ParseError::InvalidPacket(format!(
                "Unknown packet type: {}",
                bytes[0]
            ))),
            None => Err(ParseError::InvalidPacket("Empty buffer".to_string())),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            BtpPacket::Message(packet) => packet.to_bytes(),
            BtpPacket::Response(packet) => packet.to_bytes(),
            BtpPacket::Error(packet) => packet.to_bytes(),
            BtpPacket::Transfer(packet) => packet.to_bytes(),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ContentType {
    ApplicationOctetStream,
    TextPlainUtf8,
    ApplicationJson,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(type_int: u8) -> Self {
        match type_int {
            0 => ContentType::ApplicationOctetStream,
            1 => ContentType::TextPlainUtf8,
            2 => ContentType::ApplicationJson,
            other => ContentType::Unknown(other),
        }
    }
}

impl From<ContentType> for u8 {
    fn from(content_type: ContentType) -> Self {
        match content_type {
            ContentType::ApplicationOctetStream => 0,
            ContentType::TextPlainUtf8 => 1,
            ContentType::ApplicationJson => 2,
            ContentType::Unknown(other) => other,
        }
    }
}

/// One sub-protocol entry: a name, a content type and opaque bytes.
#[derive(Debug, PartialEq, Clone)]
pub struct ProtocolData {
    pub protocol_name: Cow<'static, str>,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl ProtocolData {
    pub fn octet_stream(protocol_name: impl Into<Cow<'static, str>>, data: Vec<u8>) -> Self {
        ProtocolData {
            protocol_name: protocol_name.into(),
            content_type: ContentType::ApplicationOctetStream,
            data,
        }
    }

    pub fn json(protocol_name: impl Into<Cow<'static, str>>, data: Vec<u8>) -> Self {
        ProtocolData {
            protocol_name: protocol_name.into(),
            content_type: ContentType::ApplicationJson,
            data,
        }
    }
}

fn read_protocol_data(reader: &mut &[u8]) -> Result<Vec<ProtocolData>, ParseError> {
    let num_entries = reader.read_var_uint()?;
    let mut protocol_data = Vec::with_capacity(num_entries.min(8) as usize);
    for _ in 0..num_entries {
        let protocol_name = str::from_utf8(reader.read_var_octet_string()?)?;

        // the well-known names stay borrowed to avoid per-frame allocations
        let protocol_name = match protocol_name {
            crate::PROTOCOL_ILP => Cow::Borrowed(crate::PROTOCOL_ILP),
            crate::PROTOCOL_CCP_CONTROL => Cow::Borrowed(crate::PROTOCOL_CCP_CONTROL),
            crate::PROTOCOL_CCP_UPDATE => Cow::Borrowed(crate::PROTOCOL_CCP_UPDATE),
            crate::PROTOCOL_PEERING_REQUEST => Cow::Borrowed(crate::PROTOCOL_PEERING_REQUEST),
            crate::PROTOCOL_PEERING_RESPONSE => Cow::Borrowed(crate::PROTOCOL_PEERING_RESPONSE),
            crate::PROTOCOL_INVOICE_REQUEST => Cow::Borrowed(crate::PROTOCOL_INVOICE_REQUEST),
            crate::PROTOCOL_INVOICE_RESPONSE => Cow::Borrowed(crate::PROTOCOL_INVOICE_RESPONSE),
            other => Cow::Owned(other.to_owned()),
        };

        let content_type = ContentType::from(reader.read_u8()?);
        let data = reader.read_var_octet_string()?.to_vec();
        protocol_data.push(ProtocolData {
            protocol_name,
            content_type,
            data,
        });
    }
    Ok(protocol_data)
}

fn put_protocol_data<T: BufMut>(buf: &mut T, protocol_data: &[ProtocolData]) {
    buf.put_var_uint(protocol_data.len() as u64);
    for entry in protocol_data {
        buf.put_var_octet_string(entry.protocol_name.as_bytes());
        buf.put_u8(entry.content_type.into());
        buf.put_var_octet_string(&entry.data[..]);
    }
}

fn check_no_trailing_bytes(buf: &[u8]) -> Result<(), std::io::Error> {
    // frames leave no room for trailing bytes, inside or outside the
    // envelope
    if !buf.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "extra trailing bytes",
        ));
    }
    Ok(())
}

fn read_envelope(expected: PacketType, bytes: &[u8]) -> Result<(u32, &[u8]), ParseError> {
    let mut reader = bytes;
    let packet_type = reader.read_u8()?;
    if PacketType::from(packet_type) != expected {
        return Err(ParseError::InvalidPacket(format!(
            "Cannot parse packet of type {}, expected type {}",
            packet_type, expected as u8
        )));
    }
    let request_id = reader.read_u32::<BigEndian>()?;
    let contents = reader.read_var_octet_string()?;
    check_no_trailing_bytes(reader)?;
    Ok((request_id, contents))
}

/// A request frame carrying sub-protocol data.
#[derive(Debug, PartialEq, Clone)]
pub struct BtpMessage {
    pub request_id: u32,
    pub protocol_data: Vec<ProtocolData>,
}

impl Serializable<BtpMessage> for BtpMessage {
    fn from_bytes(bytes: &[u8]) -> Result<BtpMessage, ParseError> {
        let (request_id, mut contents) = read_envelope(PacketType::Message, bytes)?;
        let protocol_data = read_protocol_data(&mut contents)?;
        check_no_trailing_bytes(contents)?;
        Ok(BtpMessage {
            request_id,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut contents = Vec::new();
        put_protocol_data(&mut contents, &self.protocol_data);

        let mut buf = Vec::with_capacity(contents.len() + 8);
        buf.put_u8(PacketType::Message as u8);
        buf.put_u32(self.request_id);
        buf.put_var_octet_string(&contents[..]);
        buf
    }
}

/// The success reply to a MESSAGE or TRANSFER, echoing its request id.
#[derive(Debug, PartialEq, Clone)]
pub struct BtpResponse {
    pub request_id: u32,
    pub protocol_data: Vec<ProtocolData>,
}

impl Serializable<BtpResponse> for BtpResponse {
    fn from_bytes(bytes: &[u8]) -> Result<BtpResponse, ParseError> {
        let (request_id, mut contents) = read_envelope(PacketType::Response, bytes)?;
        let protocol_data = read_protocol_data(&mut contents)?;
        check_no_trailing_bytes(contents)?;
        Ok(BtpResponse {
            request_id,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut contents = Vec::new();
        put_protocol_data(&mut contents, &self.protocol_data);

        let mut buf = Vec::with_capacity(contents.len() + 8);
        buf.put_u8(PacketType::Response as u8);
        buf.put_u32(self.request_id);
        buf.put_var_octet_string(&contents[..]);
        buf
    }
}

/// The failure reply: a 3-byte code, a name, a timestamp and free-form
/// data.
#[derive(Debug, PartialEq, Clone)]
pub struct BtpError {
    pub request_id: u32,
    pub code: String,
    pub name: String,
    pub triggered_at: DateTime<Utc>,
    pub data: String,
    pub protocol_data: Vec<ProtocolData>,
}

impl Serializable<BtpError> for BtpError {
    fn from_bytes(bytes: &[u8]) -> Result<BtpError, ParseError> {
        let (request_id, mut contents) = read_envelope(PacketType::Error, bytes)?;

        let mut code: [u8; 3] = [0; 3];
        contents.read_exact(&mut code)?;
        let name = str::from_utf8(contents.read_var_octet_string()?)?.to_owned();
        let triggered_at = str::from_utf8(contents.read_var_octet_string()?)?.to_owned();
        let triggered_at = Utc.datetime_from_str(&triggered_at, GENERALIZED_TIME_FORMAT)?;
        let data = str::from_utf8(contents.read_var_octet_string()?)?.to_owned();
        let protocol_data = read_protocol_data(&mut contents)?;
        check_no_trailing_bytes(contents)?;

        Ok(BtpError {
            request_id,
            code: str::from_utf8(&code[..])?.to_owned(),
            name,
            triggered_at,
            data,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        debug_assert_eq!(self.code.len(), 3);
        let mut contents = Vec::new();
        contents.put_slice(self.code.as_bytes());
        contents.put_var_octet_string(self.name.as_bytes());
        contents.put_var_octet_string(
            self.triggered_at
                .format(GENERALIZED_TIME_FORMAT)
                .to_string()
                .as_bytes(),
        );
        contents.put_var_octet_string(self.data.as_bytes());
        put_protocol_data(&mut contents, &self.protocol_data);

        let mut buf = Vec::with_capacity(contents.len() + 8);
        buf.put_u8(PacketType::Error as u8);
        buf.put_u32(self.request_id);
        buf.put_var_octet_string(&contents[..]);
        buf
    }
}

/// A money-protocol frame: the peer is notifying us of `amount` moving on
/// the underlying settlement layer.
#[derive(Debug, PartialEq, Clone)]
pub struct BtpTransfer {
    pub request_id: u32,
    pub amount: u64,
    pub protocol_data: Vec<ProtocolData>,
}

impl Serializable<BtpTransfer> for BtpTransfer {
    fn from_bytes(bytes: &[u8]) -> Result<BtpTransfer, ParseError> {
        let (request_id, mut contents) = read_envelope(PacketType::Transfer, bytes)?;
        let amount = contents.read_u64::<BigEndian>()?;
        let protocol_data = read_protocol_data(&mut contents)?;
        check_no_trailing_bytes(contents)?;
        Ok(BtpTransfer {
            request_id,
            amount,
            protocol_data,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut contents = Vec::new();
        contents.put_u64(self.amount);
        put_protocol_data(&mut contents, &self.protocol_data);

        let mut buf = Vec::with_capacity(contents.len() + 8);
        buf.put_u8(PacketType::Transfer as u8);
        buf.put_u32(self.request_id);
        buf.put_var_octet_string(&contents[..]);
        buf
    }
}
