use std::convert::TryFrom;
use std::fmt;
use std::str;
use std::time::SystemTime;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use super::oer::{self, BufOerExt, MutBufOerExt};
use super::{Address, ErrorCode, ParseError};

const AMOUNT_LEN: usize = 8;
const EXPIRY_LEN: usize = 17;
const CONDITION_LEN: usize = 32;
const FULFILLMENT_LEN: usize = 32;
const ERROR_CODE_LEN: usize = 3;

static INTERLEDGER_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    Prepare = 12,
    Fulfill = 13,
    Reject = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ParseError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            12 => Ok(PacketType::Prepare),
            13 => Ok(PacketType::Fulfill),
            14 => Ok(PacketType::Reject),
            _ => Err(ParseError::InvalidPacket(format!(
                "Unknown packet type: {}",
                byte,
            ))),
        }
    }
}

/// Any of the three ILP packet forms.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl TryFrom<BytesMut> for Packet {
    type Error = ParseError;

    fn try_from(buffer: BytesMut) -> Result<Self, Self::Error> {
        match buffer.first() {
            Some(&12) => Ok(Packet::Prepare(Prepare::try_from(buffer)?)),
            Some(&13) => Ok(Packet::Fulfill(Fulfill::try_from(buffer)?)),
            Some(&14) => Ok(Packet::Reject(Reject::try_from(buffer)?)),
            other => Err(ParseError::InvalidPacket(format!(
                "Unknown packet type: {:?}",
                other,
            ))),
        }
    }
}

impl From<Packet> for BytesMut {
    fn from(packet: Packet) -> Self {
        match packet {
            Packet::Prepare(prepare) => prepare.into(),
            Packet::Fulfill(fulfill) => fulfill.into(),
            Packet::Reject(reject) => reject.into(),
        }
    }
}

impl From<Prepare> for Packet {
    fn from(prepare: Prepare) -> Self {
        Packet::Prepare(prepare)
    }
}

impl From<Fulfill> for Packet {
    fn from(fulfill: Fulfill) -> Self {
        Packet::Fulfill(fulfill)
    }
}

impl From<Reject> for Packet {
    fn from(reject: Reject) -> Self {
        Packet::Reject(reject)
    }
}

/// An ILP Prepare packet. Keeps the serialized buffer alongside the parsed
/// fields so that forwarding does not re-encode the packet.
#[derive(PartialEq, Clone)]
pub struct Prepare {
    buffer: BytesMut,
    content_offset: usize,
    destination: Address,
    amount: u64,
    expires_at: SystemTime,
    data_offset: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PrepareBuilder<'a> {
    pub amount: u64,
    pub expires_at: SystemTime,
    pub execution_condition: &'a [u8; 32],
    pub destination: Address,
    pub data: &'a [u8],
}

impl TryFrom<BytesMut> for Prepare {
    type Error = ParseError;

    fn try_from(buffer: BytesMut) -> Result<Self, Self::Error> {
        let (content_offset, mut content) = deserialize_envelope(PacketType::Prepare, &buffer)?;
        let content_len = content.len();

        let amount = content.read_u64::<BigEndian>()?;

        let mut expiry = [0u8; EXPIRY_LEN];
        std::io::Read::read_exact(&mut content, &mut expiry)?;
        let expires_at = Utc
            .datetime_from_str(str::from_utf8(&expiry[..])?, INTERLEDGER_TIMESTAMP_FORMAT)?;
        let expires_at = SystemTime::from(expires_at);

        // the condition is read lazily through its accessor
        content.skip(CONDITION_LEN)?;

        let destination =
            Address::try_from(Bytes::copy_from_slice(content.read_var_octet_string()?))?;

        let data_offset = content_offset + content_len - content.len();
        content.skip_var_octet_string()?;

        Ok(Prepare {
            buffer,
            content_offset,
            destination,
            amount,
            expires_at,
            data_offset,
        })
    }
}

impl Prepare {
    #[inline]
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Patches the amount in place, keeping the buffer octet-exact.
    pub fn set_amount(&mut self, amount: u64) {
        self.amount = amount;
        let offset = self.content_offset;
        self.buffer[offset..offset + AMOUNT_LEN].copy_from_slice(&amount.to_be_bytes());
    }

    #[inline]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn set_expires_at(&mut self, expires_at: SystemTime) {
        self.expires_at = expires_at;
        let stamp = DateTime::<Utc>::from(expires_at)
            .format(INTERLEDGER_TIMESTAMP_FORMAT)
            .to_string();
        debug_assert_eq!(stamp.len(), EXPIRY_LEN);
        let offset = self.content_offset + AMOUNT_LEN;
        self.buffer[offset..offset + EXPIRY_LEN].copy_from_slice(stamp.as_bytes());
    }

    /// The returned slice always has a length of 32.
    #[inline]
    pub fn execution_condition(&self) -> &[u8] {
        let begin = self.content_offset + AMOUNT_LEN + EXPIRY_LEN;
        &self.buffer[begin..begin + CONDITION_LEN]
    }

    #[inline]
    pub fn destination(&self) -> Address {
        self.destination.clone()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        (&self.buffer[self.data_offset..])
            .peek_var_octet_string()
            .unwrap()
    }

    #[inline]
    pub fn into_data(mut self) -> BytesMut {
        oer::extract_var_octet_string(self.buffer.split_off(self.data_offset)).unwrap()
    }
}

impl AsRef<[u8]> for Prepare {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl From<Prepare> for BytesMut {
    fn from(prepare: Prepare) -> Self {
        prepare.buffer
    }
}

impl fmt::Debug for Prepare {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Prepare")
            .field("destination", &self.destination())
            .field("amount", &self.amount())
            .field(
                "expires_at",
                &DateTime::<Utc>::from(self.expires_at()).to_rfc3339(),
            )
            .field(
                "execution_condition",
                &hex::encode(self.execution_condition()),
            )
            .field("data_length", &self.data().len())
            .finish()
    }
}

impl<'a> PrepareBuilder<'a> {
    pub fn build(&self) -> Prepare {
        const STATIC_LEN: usize = AMOUNT_LEN + EXPIRY_LEN + CONDITION_LEN;
        let destination_size = oer::predict_var_octet_string(self.destination.len());
        let data_size = oer::predict_var_octet_string(self.data.len());
        let content_len = STATIC_LEN + destination_size + data_size;
        let buf_size = 1 + oer::predict_var_octet_string(content_len);
        let mut buffer = BytesMut::with_capacity(buf_size);

        buffer.put_u8(PacketType::Prepare as u8);
        buffer.put_var_octet_string_length(content_len);
        let content_offset = buffer.len();

        buffer.put_u64(self.amount);
        let stamp = DateTime::<Utc>::from(self.expires_at)
            .format(INTERLEDGER_TIMESTAMP_FORMAT)
            .to_string();
        debug_assert_eq!(stamp.len(), EXPIRY_LEN);
        buffer.put_slice(stamp.as_bytes());
        buffer.put_slice(&self.execution_condition[..]);
        buffer.put_var_octet_string::<&[u8]>(self.destination.as_ref());
        buffer.put_var_octet_string(self.data);

        Prepare {
            buffer,
            content_offset,
            destination: self.destination.clone(),
            amount: self.amount,
            expires_at: self.expires_at,
            data_offset: buf_size - data_size,
        }
    }
}

/// An ILP Fulfill packet.
#[derive(PartialEq, Clone)]
pub struct Fulfill {
    buffer: BytesMut,
    content_offset: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FulfillBuilder<'a> {
    pub fulfillment: &'a [u8; 32],
    pub data: &'a [u8],
}

impl TryFrom<BytesMut> for Fulfill {
    type Error = ParseError;

    fn try_from(buffer: BytesMut) -> Result<Self, Self::Error> {
        let (content_offset, mut content) = deserialize_envelope(PacketType::Fulfill, &buffer)?;
        content.skip(FULFILLMENT_LEN)?;
        content.skip_var_octet_string()?;

        Ok(Fulfill {
            buffer,
            content_offset,
        })
    }
}

impl Fulfill {
    /// The returned slice always has a length of 32.
    #[inline]
    pub fn fulfillment(&self) -> &[u8] {
        let begin = self.content_offset;
        &self.buffer[begin..begin + FULFILLMENT_LEN]
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        let data_offset = self.content_offset + FULFILLMENT_LEN;
        (&self.buffer[data_offset..])
            .peek_var_octet_string()
            .unwrap()
    }

    #[inline]
    pub fn into_data(mut self) -> BytesMut {
        let data_offset = self.content_offset + FULFILLMENT_LEN;
        oer::extract_var_octet_string(self.buffer.split_off(data_offset)).unwrap()
    }
}

impl AsRef<[u8]> for Fulfill {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl From<Fulfill> for BytesMut {
    fn from(fulfill: Fulfill) -> Self {
        fulfill.buffer
    }
}

impl fmt::Debug for Fulfill {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Fulfill")
            .field("fulfillment", &hex::encode(self.fulfillment()))
            .field("data_length", &self.data().len())
            .finish()
    }
}

impl<'a> FulfillBuilder<'a> {
    pub fn build(&self) -> Fulfill {
        let data_size = oer::predict_var_octet_string(self.data.len());
        let content_len = FULFILLMENT_LEN + data_size;
        let buf_size = 1 + oer::predict_var_octet_string(content_len);
        let mut buffer = BytesMut::with_capacity(buf_size);

        buffer.put_u8(PacketType::Fulfill as u8);
        buffer.put_var_octet_string_length(content_len);
        let content_offset = buffer.len();
        buffer.put_slice(&self.fulfillment[..]);
        buffer.put_var_octet_string(self.data);

        Fulfill {
            buffer,
            content_offset,
        }
    }
}

/// An ILP Reject packet.
#[derive(PartialEq, Clone)]
pub struct Reject {
    buffer: BytesMut,
    code: ErrorCode,
    triggered_by_offset: usize,
    message_offset: usize,
    data_offset: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RejectBuilder<'a> {
    pub code: ErrorCode,
    pub message: &'a [u8],
    pub triggered_by: Option<&'a Address>,
    pub data: &'a [u8],
}

impl TryFrom<BytesMut> for Reject {
    type Error = ParseError;

    fn try_from(buffer: BytesMut) -> Result<Self, Self::Error> {
        let (content_offset, mut content) = deserialize_envelope(PacketType::Reject, &buffer)?;
        let content_len = content.len();

        let mut code = [0u8; ERROR_CODE_LEN];
        std::io::Read::read_exact(&mut content, &mut code)?;
        let code = ErrorCode::new(code);

        let triggered_by_offset = content_offset + content_len - content.len();
        // an empty triggered_by is allowed; anything else must parse
        let triggered_by = content.read_var_octet_string()?;
        if !triggered_by.is_empty() {
            Address::try_from(Bytes::copy_from_slice(triggered_by))?;
        }

        let message_offset = content_offset + content_len - content.len();
        content.skip_var_octet_string()?;

        let data_offset = content_offset + content_len - content.len();
        content.skip_var_octet_string()?;

        Ok(Reject {
            buffer,
            code,
            triggered_by_offset,
            message_offset,
            data_offset,
        })
    }
}

impl Reject {
    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[inline]
    pub fn triggered_by(&self) -> Option<Address> {
        let bytes = (&self.buffer[self.triggered_by_offset..])
            .peek_var_octet_string()
            .ok()?;
        Address::try_from(Bytes::copy_from_slice(bytes)).ok()
    }

    #[inline]
    pub fn message(&self) -> &[u8] {
        (&self.buffer[self.message_offset..])
            .peek_var_octet_string()
            .unwrap()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        (&self.buffer[self.data_offset..])
            .peek_var_octet_string()
            .unwrap()
    }

    pub fn into_data(mut self) -> BytesMut {
        oer::extract_var_octet_string(self.buffer.split_off(self.data_offset)).unwrap()
    }
}

impl AsRef<[u8]> for Reject {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl From<Reject> for BytesMut {
    fn from(reject: Reject) -> Self {
        reject.buffer
    }
}

impl fmt::Debug for Reject {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Reject")
            .field("code", &self.code())
            .field("message", &String::from_utf8_lossy(self.message()))
            .field("triggered_by", &self.triggered_by())
            .field("data_length", &self.data().len())
            .finish()
    }
}

impl<'a> RejectBuilder<'a> {
    pub fn build(&self) -> Reject {
        let (triggered_by_bytes, triggered_by_len) = match self.triggered_by {
            Some(address) => (address.as_ref(), address.len()),
            None => (&[][..], 0),
        };
        let triggered_by_size = oer::predict_var_octet_string(triggered_by_len);
        let message_size = oer::predict_var_octet_string(self.message.len());
        let data_size = oer::predict_var_octet_string(self.data.len());
        let content_len = ERROR_CODE_LEN + triggered_by_size + message_size + data_size;
        let buf_size = 1 + oer::predict_var_octet_string(content_len);
        let mut buffer = BytesMut::with_capacity(buf_size);

        buffer.put_u8(PacketType::Reject as u8);
        buffer.put_var_octet_string_length(content_len);
        buffer.put_slice(&<[u8; 3]>::from(self.code)[..]);
        buffer.put_var_octet_string(triggered_by_bytes);
        buffer.put_var_octet_string(self.message);
        buffer.put_var_octet_string(self.data);

        Reject {
            buffer,
            code: self.code,
            triggered_by_offset: buf_size - data_size - message_size - triggered_by_size,
            message_offset: buf_size - data_size - message_size,
            data_offset: buf_size - data_size,
        }
    }
}

fn deserialize_envelope(
    packet_type: PacketType,
    mut reader: &[u8],
) -> Result<(usize, &[u8]), ParseError> {
    let got_type = reader.read_u8()?;
    if got_type != packet_type as u8 {
        return Err(ParseError::InvalidPacket(format!(
            "Unexpected packet type: {}",
            got_type,
        )));
    }
    let content_offset = 1 + {
        let mut peek = &reader[..];
        let before = peek.len();
        peek.read_var_octet_string_length()?;
        before - peek.len()
    };
    let content = reader.peek_var_octet_string()?;
    Ok((content_offset, content))
}

/// The F08 data field: how much arrived and how much would have been
/// accepted, so the sender can right-size its packets.
#[derive(Clone, Debug, PartialEq)]
pub struct MaxPacketAmountDetails {
    amount_received: u64,
    max_amount: u64,
}

impl MaxPacketAmountDetails {
    #[inline]
    pub fn new(amount_received: u64, max_amount: u64) -> Self {
        MaxPacketAmountDetails {
            amount_received,
            max_amount,
        }
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, std::io::Error> {
        let amount_received = bytes.read_u64::<BigEndian>()?;
        let max_amount = bytes.read_u64::<BigEndian>()?;
        Ok(MaxPacketAmountDetails::new(amount_received, max_amount))
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.amount_received.to_be_bytes());
        bytes[8..].copy_from_slice(&self.max_amount.to_be_bytes());
        bytes
    }

    #[inline]
    pub fn amount_received(&self) -> u64 {
        self.amount_received
    }

    #[inline]
    pub fn max_amount(&self) -> u64 {
        self.max_amount
    }
}

#[cfg(test)]
mod test_packet {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn parses_any_packet_type() {
        assert_eq!(
            Packet::try_from(BytesMut::from(&PREPARE_BYTES[..])).unwrap(),
            Packet::Prepare(PREPARE.clone()),
        );
        assert_eq!(
            Packet::try_from(BytesMut::from(&FULFILL_BYTES[..])).unwrap(),
            Packet::Fulfill(FULFILL.clone()),
        );
        assert_eq!(
            Packet::try_from(BytesMut::from(&REJECT_BYTES[..])).unwrap(),
            Packet::Reject(REJECT.clone()),
        );

        assert!(Packet::try_from(BytesMut::new()).is_err());
        assert!(Packet::try_from(BytesMut::from(&[0x99][..])).is_err());
    }

    #[test]
    fn serializes_any_packet_type() {
        assert_eq!(
            BytesMut::from(Packet::Prepare(PREPARE.clone())),
            &PREPARE_BYTES[..]
        );
        assert_eq!(
            BytesMut::from(Packet::Fulfill(FULFILL.clone())),
            &FULFILL_BYTES[..]
        );
        assert_eq!(
            BytesMut::from(Packet::Reject(REJECT.clone())),
            &REJECT_BYTES[..]
        );
    }
}

#[cfg(test)]
mod test_prepare {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn round_trips() {
        let parsed = Prepare::try_from(BytesMut::from(&PREPARE_BYTES[..])).unwrap();
        assert_eq!(parsed, *PREPARE);
        assert_eq!(BytesMut::from(parsed), &PREPARE_BYTES[..]);
    }

    #[test]
    fn exposes_fields() {
        assert_eq!(PREPARE.amount(), 107);
        assert_eq!(PREPARE.expires_at(), *EXPIRES_AT);
        assert_eq!(PREPARE.execution_condition(), &EXECUTION_CONDITION[..]);
        assert_eq!(PREPARE.destination(), *DESTINATION);
        assert_eq!(PREPARE.data(), DATA);
        assert_eq!(PREPARE.clone().into_data(), BytesMut::from(DATA));
    }

    #[test]
    fn rejects_wrong_packet_type() {
        let mut wrong_type = BytesMut::from(&PREPARE_BYTES[..]);
        wrong_type[0] = PacketType::Fulfill as u8;
        assert!(Prepare::try_from(wrong_type).is_err());
    }

    #[test]
    fn rejects_invalid_destination() {
        let mut junk_address = BytesMut::from(&PREPARE_BYTES[..]);
        // corrupt one byte of "example.bob"
        let address_offset = PREPARE_BYTES.len() - DATA.len() - 1 - 11;
        junk_address[address_offset] = b' ';
        assert!(Prepare::try_from(junk_address).is_err());
    }

    #[test]
    fn tolerates_trailing_garbage() {
        let mut buffer = BytesMut::from(&PREPARE_BYTES[..]);
        buffer.extend_from_slice(&[0x11, 0x12, 0x13]);
        let parsed = Prepare::try_from(buffer).unwrap();
        assert_eq!(parsed.amount(), PREPARE.amount());
        assert_eq!(parsed.data(), PREPARE.data());
    }

    #[test]
    fn patches_amount_in_place() {
        let mut prepare = PrepareBuilder {
            amount: 9999,
            destination: DESTINATION.clone(),
            ..*PREPARE_BUILDER
        }
        .build();
        prepare.set_amount(107);
        assert_eq!(prepare.amount(), 107);
        assert_eq!(BytesMut::from(prepare), &PREPARE_BYTES[..]);
    }

    #[test]
    fn patches_expiry_in_place() {
        let mut prepare = PrepareBuilder {
            expires_at: SystemTime::now(),
            destination: DESTINATION.clone(),
            ..*PREPARE_BUILDER
        }
        .build();
        prepare.set_expires_at(*EXPIRES_AT);
        assert_eq!(prepare.expires_at(), *EXPIRES_AT);
        assert_eq!(BytesMut::from(prepare), &PREPARE_BYTES[..]);
    }
}



#[cfg(test)]
mod test_max_packet_amount_details {
    use super::*;

    static BYTES: &[u8] = b"\
        \x00\x00\x00\x00\x00\x03\x02\x01\
        \x00\x00\x00\x00\x00\x06\x05\x04\
    ";

    #[test]
    fn round_trips() {
        let details = MaxPacketAmountDetails::from_bytes(BYTES).unwrap();
        assert_eq!(details.amount_received(), 0x0003_0201);
        assert_eq!(details.max_amount(), 0x0006_0504);
        assert_eq!(&details.to_bytes()[..], BYTES);
    }

    #[test]
    fn fails_on_truncated_input() {
        assert_eq!(
            MaxPacketAmountDetails::from_bytes(&[][..])
                .unwrap_err()
                .kind(),
            std::io::ErrorKind::UnexpectedEof,
        );
    }
}
