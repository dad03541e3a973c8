//! # conductor-packet
//!
//! Octet-exact serialization and deserialization of the three ILP packet
//! forms (Prepare, Fulfill, Reject) along with the OER primitives they are
//! built from, validated ILP addresses and the three-byte error taxonomy.
//!
//! Packets keep their serialized buffer around and expose zero-copy
//! accessors, so forwarding a packet does not require re-encoding it.

mod address;
mod error;
mod errors;
#[cfg(test)]
mod fixtures;
pub mod oer;
mod packet;

pub use self::address::{Address, AddressError};
pub use self::error::{ErrorClass, ErrorCode};
pub use self::errors::ParseError;

pub use self::packet::MaxPacketAmountDetails;
pub use self::packet::{Fulfill, Packet, PacketType, Prepare, Reject};
pub use self::packet::{FulfillBuilder, PrepareBuilder, RejectBuilder};
