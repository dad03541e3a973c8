//! # conductor-node
//!
//! Top-level wiring. The [`Connector`] boots the store, registers
//! accounts, composes each account's middleware chains at connect time and
//! services both peer roles: data frames are demultiplexed by sub-protocol
//! (`ilp` into the packet pipeline, `ccp_*` into the route manager,
//! peering/invoice exchanges into settlement) and money frames feed the
//! balance directly.

mod config;
mod connector;

pub use config::{AccountConfig, BalanceConfig, ConnectorConfig, RateLimitConfig, RatePairConfig};
pub use connector::{Connector, NodeError};
