#![forbid(unsafe_code)]

//! OER (Octet Encoding Rules) primitives used by all of the wire formats:
//! variable-length octet strings and variable-length unsigned integers.

use std::convert::TryFrom;
use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};

const HIGH_BIT: u8 = 0x80;
const LOWER_SEVEN_BITS: u8 = 0x7f;

/// Size (in bytes) of the encoding of a var-octet-string holding `length`
/// bytes of content.
pub fn predict_var_octet_string(length: usize) -> usize {
    if length < 128 {
        1 + length
    } else {
        1 + predict_var_uint_size(length as u64) as usize + length
    }
}

/// Minimum number of big-endian bytes needed to encode `value` without
/// leading zeroes.
pub fn predict_var_uint_size(value: u64) -> u8 {
    // `value | 1` keeps the zero case out of leading_zeros() without
    // affecting any other input
    let highest_bit = 64 - (value | 1).leading_zeros();
    ((highest_bit + 7) / 8) as u8
}

/// Splits the content of a var-octet-string out of `buffer`, dropping the
/// length prefix and any trailing bytes.
pub fn extract_var_octet_string(mut buffer: BytesMut) -> Result<BytesMut> {
    let buffer_length = buffer.len();
    let mut reader = &buffer[..];
    let content_length = reader.read_var_octet_string_length()?;
    let content_offset = buffer_length - reader.len();

    let mut remaining = buffer.split_off(content_offset);
    if remaining.len() < content_length {
        Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
    } else {
        Ok(remaining.split_to(content_length))
    }
}

pub trait BufOerExt<'a> {
    fn peek_var_octet_string(&self) -> Result<&'a [u8]>;
    fn read_var_octet_string(&mut self) -> Result<&'a [u8]>;
    fn skip(&mut self, discard_bytes: usize) -> Result<()>;
    fn skip_var_octet_string(&mut self) -> Result<()>;
    fn read_var_octet_string_length(&mut self) -> Result<usize>;
    fn read_var_uint(&mut self) -> Result<u64>;
}

impl<'a> BufOerExt<'a> for &'a [u8] {
    /// Decodes a var-octet-string without advancing the cursor.
    #[inline]
    fn peek_var_octet_string(&self) -> Result<&'a [u8]> {
        let mut peek = &self[..];
        let content_length = peek.read_var_octet_string_length()?;
        let offset = self.len() - peek.len();
        if peek.len() < content_length {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            Ok(&self[offset..(offset + content_length)])
        }
    }

    /// Decodes a var-octet-string and advances past it.
    #[inline]
    fn read_var_octet_string(&mut self) -> Result<&'a [u8]> {
        let content_length = self.read_var_octet_string_length()?;
        if self.len() < content_length {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            let content = &self[..content_length];
            *self = &self[content_length..];
            Ok(content)
        }
    }

    #[inline]
    fn skip(&mut self, discard_bytes: usize) -> Result<()> {
        if self.len() < discard_bytes {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            *self = &self[discard_bytes..];
            Ok(())
        }
    }

    #[inline]
    fn skip_var_octet_string(&mut self) -> Result<()> {
        let content_length = self.read_var_octet_string_length()?;
        self.skip(content_length)
    }

    #[doc(hidden)]
    #[inline]
    fn read_var_octet_string_length(&mut self) -> Result<usize> {
        let length = self.read_u8()?;
        if length & HIGH_BIT == 0 {
            return Ok(length as usize);
        }

        let length_of_length = (length & LOWER_SEVEN_BITS) as usize;
        if length_of_length == 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "indefinite lengths are not allowed",
            ));
        }
        if length_of_length > 8 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "length prefix too large",
            ));
        }

        let length = self.read_uint::<BigEndian>(length_of_length)?;
        if length_of_length == 1 && length < 128 {
            // a single-byte length below 128 must be encoded in short form
            return Err(Error::new(
                ErrorKind::InvalidData,
                "non-canonical multibyte length",
            ));
        }

        usize::try_from(length)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "var octet length overflow"))
    }

    /// Decodes a variable-length unsigned integer of 1..=8 bytes.
    #[inline]
    fn read_var_uint(&mut self) -> Result<u64> {
        let size = self.read_var_octet_string_length()?;
        if size == 0 {
            Err(Error::new(ErrorKind::InvalidData, "zero-length VarUInt"))
        } else if size > 8 {
            Err(Error::new(ErrorKind::InvalidData, "VarUInt too large"))
        } else {
            self.read_uint::<BigEndian>(size)
        }
    }
}

pub trait MutBufOerExt: BufMut + Sized {
    /// Encodes the bytes of `buf` as a var-octet-string.
    #[inline]
    fn put_var_octet_string<B: Buf>(&mut self, buf: B) {
        self.put_var_octet_string_length(buf.remaining());
        self.put(buf);
    }

    /// Encodes a var-octet-string length prefix.
    #[inline]
    fn put_var_octet_string_length(&mut self, length: usize) {
        if length < 128 {
            self.put_u8(length as u8);
        } else {
            let length_of_length = predict_var_uint_size(length as u64) as usize;
            self.put_u8(HIGH_BIT | length_of_length as u8);
            self.put_uint(length as u64, length_of_length);
        }
    }

    /// Encodes `uint` as a variable-length unsigned integer.
    #[inline]
    fn put_var_uint(&mut self, uint: u64) {
        let size = predict_var_uint_size(uint) as usize;
        self.put_var_octet_string_length(size);
        self.put_uint(uint, size);
    }
}

impl<B: BufMut + Sized> MutBufOerExt for B {}

#[cfg(test)]
mod test_functions {
    use super::*;

    #[test]
    fn predicts_var_octet_string_sizes() {
        let zeroes = [0u8; 4096];
        let mut buffer = BytesMut::with_capacity(5000);
        for len in 0..4096 {
            buffer.clear();
            buffer.put_var_octet_string(&zeroes[..len]);
            assert_eq!(predict_var_octet_string(len), buffer.len(), "length={}", len);
        }
    }

    #[test]
    fn predicts_var_uint_sizes() {
        assert_eq!(predict_var_uint_size(0), 1);
        assert_eq!(predict_var_uint_size(1), 1);
        assert_eq!(predict_var_uint_size(0xff), 1);
        assert_eq!(predict_var_uint_size(0x100), 2);
        assert_eq!(predict_var_uint_size(0xffff_ffff), 4);
        assert_eq!(predict_var_uint_size(u64::max_value()), 8);
    }

    #[test]
    fn extracts_var_octet_string_content() {
        let extracted =
            extract_var_octet_string(BytesMut::from(&[0x02, 0xaa, 0xbb, 0xcc][..])).unwrap();
        assert_eq!(&extracted[..], &[0xaa, 0xbb]);

        assert_eq!(
            extract_var_octet_string(BytesMut::new()).unwrap_err().kind(),
            ErrorKind::UnexpectedEof,
        );
        // declared length exceeds the buffer
        assert_eq!(
            extract_var_octet_string(BytesMut::from(&[0x07, 0x01][..]))
                .unwrap_err()
                .kind(),
            ErrorKind::UnexpectedEof,
        );
    }
}

#[cfg(test)]
mod test_reading {
    use super::*;

    #[test]
    fn peeks_without_advancing() {
        let buffer: &[u8] = &[0x02, 0x01, 0x02, 0xff];
        assert_eq!(buffer.peek_var_octet_string().unwrap(), &[0x01, 0x02]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn reads_and_advances() {
        let mut buffer: &[u8] = &[0x02, 0x01, 0x02, 0xff];
        assert_eq!(buffer.read_var_octet_string().unwrap(), &[0x01, 0x02]);
        assert_eq!(buffer, &[0xff]);

        let mut empty: &[u8] = &[0x00];
        assert!(empty.read_var_octet_string().unwrap().is_empty());
    }

    #[test]
    fn reads_multibyte_lengths() {
        let mut long = vec![0x82, 0x01, 0x00];
        long.extend_from_slice(&[0xb0; 256]);
        let mut reader = &long[..];
        assert_eq!(reader.read_var_octet_string().unwrap(), &[0xb0; 256][..]);
    }

    #[test]
    fn rejects_indefinite_lengths() {
        let mut reader: &[u8] = &[HIGH_BIT, 0x00, 0x01];
        let err = reader.read_var_octet_string_length().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "indefinite lengths are not allowed");
    }

    #[test]
    fn rejects_oversized_length_prefixes() {
        let mut reader: &[u8] = &[HIGH_BIT | 0x09];
        assert_eq!(
            reader.read_var_octet_string_length().unwrap_err().kind(),
            ErrorKind::InvalidData,
        );

        let mut bytes = vec![HIGH_BIT | 126];
        bytes.extend(std::iter::repeat(0xff).take(126));
        let mut reader = &bytes[..];
        assert_eq!(
            reader
                .read_var_octet_string_length()
                .unwrap_err()
                .to_string(),
            "length prefix too large"
        );
    }

    #[test]
    fn rejects_non_canonical_short_lengths() {
        // 0x05 must be encoded as a bare 0x05, not 0x81 0x05
        let mut reader: &[u8] = &[0x81, 0x05];
        assert_eq!(
            reader
                .read_var_octet_string_length()
                .unwrap_err()
                .to_string(),
            "non-canonical multibyte length"
        );
    }

    #[test]
    fn reads_var_uints() {
        let cases: &[(&[u8], u64)] = &[
            (&[0x01, 0x00], 0),
            (&[0x01, 0x09], 9),
            (&[0x02, 0x01, 0x02], 0x0102),
            (&[0x04, 0x01, 0x02, 0x03, 0x04], 0x0102_0304),
            (
                &[0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
                0x0102_0304_0506_0708,
            ),
        ];
        for (buffer, value) in cases {
            let mut reader = &buffer[..];
            assert_eq!(reader.read_var_uint().unwrap(), *value);
            assert!(reader.is_empty());
        }

        // zero-length, truncated, and oversized VarUInts all fail
        assert!((&[0x00][..]).read_var_uint().is_err());
        assert!((&[0x04, 0x01][..]).read_var_uint().is_err());
        assert!(
            (&[0x09, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09][..])
                .read_var_uint()
                .is_err()
        );
    }
}
