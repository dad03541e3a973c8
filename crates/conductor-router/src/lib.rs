//! # conductor-router
//!
//! The forwarding half of the connector: a longest-prefix-match routing
//! table over dot-separated address components and the [`Switch`] that uses
//! it to pick the egress account for each incoming Prepare.
//!
//! The switch only decides *where* a packet goes. Exchange rates, expiry
//! shortening, response validation and balance accounting all happen in the
//! outgoing chain it hands the packet to.

mod switch;
mod table;

pub use switch::{RouterStore, Switch};
pub use table::RoutingTable;
