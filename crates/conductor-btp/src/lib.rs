//! # conductor-btp
//!
//! The bilateral peer link. Every peer connection carries frames tagged
//! with a 32-bit request id, a type (MESSAGE, RESPONSE, ERROR, TRANSFER)
//! and a list of named sub-protocol entries; responses echo the request id
//! of the frame they answer.
//!
//! The [`Link`] pairs a frame transport with a pending-request table and
//! exposes the capability set the rest of the node depends on: send an ILP
//! packet (as an `OutgoingService`), exchange an arbitrary sub-protocol
//! request, send money, and register the inbound data/money handlers.
//! Concrete socket transports are out of scope; links run over in-process
//! frame pipes.

mod link;
mod packet;

pub use link::{link_pair, DataHandler, Link, LinkError, MoneyHandler};
pub use packet::{BtpError, BtpMessage, BtpPacket, BtpResponse, BtpTransfer};
pub use packet::{ContentType, ProtocolData, Serializable};

/// Sub-protocol carrying serialized ILP packets.
pub const PROTOCOL_ILP: &str = "ilp";
/// Sub-protocols carrying the routing protocol.
pub const PROTOCOL_CCP_CONTROL: &str = "ccp_control";
pub const PROTOCOL_CCP_UPDATE: &str = "ccp_update";
/// Sub-protocols exchanging settlement-engine identities.
pub const PROTOCOL_PEERING_REQUEST: &str = "peeringRequest";
pub const PROTOCOL_PEERING_RESPONSE: &str = "peeringResponse";
/// Sub-protocols exchanging settlement artifacts.
pub const PROTOCOL_INVOICE_REQUEST: &str = "invoiceRequest";
pub const PROTOCOL_INVOICE_RESPONSE: &str = "invoiceResponse";
