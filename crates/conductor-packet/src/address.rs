//! Validated ILP addresses.
//!
//! Addresses are dot-separated sequences of 7-bit-ASCII segments, at most
//! 1023 bytes long, whose first segment is one of the well-known allocation
//! schemes. Prefixes used as routing keys are plain strings and are *not*
//! required to be valid addresses (`"example."` is a prefix, not an
//! address).

// Addresses are never empty.
#![allow(clippy::len_without_is_empty)]

use std::fmt;
use std::str::{self, FromStr};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MAX_ADDRESS_LENGTH: usize = 1023;

static SCHEMES: &[&[u8]] = &[
    b"g", b"private", b"example", b"peer", b"self", b"test", b"test1", b"test2", b"test3", b"local",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid ILP address")]
pub struct AddressError {}

/// An ILP address backed by `Bytes`, so cloning is cheap.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Address(Bytes);

impl Address {
    /// # Panics
    ///
    /// Panics if the bytes are not a valid ILP address. Intended for
    /// statically-known addresses; use `try_from` for anything else.
    pub fn new(bytes: &'static [u8]) -> Self {
        Address::try_from(Bytes::from_static(bytes)).expect("invalid ILP address")
    }

    pub fn try_from(bytes: Bytes) -> Result<Self, AddressError> {
        validate(bytes.as_ref())?;
        Ok(Address(bytes))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The allocation scheme, i.e. the first segment.
    #[inline]
    pub fn scheme(&self) -> &str {
        self.segments().next().unwrap()
    }

    /// Iterates the dot-separated segments of the address.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0
            .as_ref()
            .split(|&byte| byte == b'.')
            .map(|segment| str::from_utf8(segment).unwrap())
    }

    /// The address as a string slice. Validation guarantees ASCII.
    #[inline]
    pub fn as_str(&self) -> &str {
        str::from_utf8(self.0.as_ref()).unwrap()
    }

    /// Appends a segment, e.g. `example.node` + `peer0` = `example.node.peer0`.
    pub fn with_suffix(&self, suffix: &[u8]) -> Result<Self, AddressError> {
        let mut joined = BytesMut::with_capacity(self.len() + 1 + suffix.len());
        joined.put_slice(self.0.as_ref());
        joined.put_u8(b'.');
        joined.put_slice(suffix);
        Address::try_from(joined.freeze())
    }
}

fn validate(bytes: &[u8]) -> Result<(), AddressError> {
    if bytes.len() > MAX_ADDRESS_LENGTH {
        return Err(AddressError {});
    }
    let mut segments = 0;
    for (index, segment) in bytes.split(|&byte| byte == b'.').enumerate() {
        segments += 1;
        if segment.is_empty() {
            return Err(AddressError {});
        }
        if index == 0 && !SCHEMES.contains(&segment) {
            return Err(AddressError {});
        }
        if !segment.iter().all(|&byte| is_segment_byte(byte)) {
            return Err(AddressError {});
        }
    }
    if segments < 2 {
        return Err(AddressError {});
    }
    Ok(())
}

fn is_segment_byte(byte: u8) -> bool {
    byte == b'_' || byte == b'-' || byte == b'~' || byte.is_ascii_alphanumeric()
}

impl std::convert::TryFrom<&[u8]> for Address {
    type Error = AddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        validate(bytes)?;
        Ok(Address(Bytes::copy_from_slice(bytes)))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        validate(string.as_bytes())?;
        Ok(Address(Bytes::copy_from_slice(string.as_bytes())))
    }
}

impl AsRef<[u8]> for Address {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.debug_tuple("Address").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl PartialEq<[u8]> for Address {
    fn eq(&self, other: &[u8]) -> bool {
        self.0 == other
    }
}

impl PartialEq<str> for Address {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = <&str>::deserialize(deserializer)?;
        Address::from_str(string).map_err(de::Error::custom)
    }
}
