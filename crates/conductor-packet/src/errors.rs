use std::str::Utf8Error;
use std::string::FromUtf8Error;

use thiserror::Error;

use super::AddressError;

/// Errors raised while parsing any of the wire formats in this crate.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not utf-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("not utf-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("invalid timestamp: {0}")]
    Chrono(#[from] chrono::ParseError),
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
}
