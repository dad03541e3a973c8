//! # conductor-ccp
//!
//! The routing subsystem: keeps a view of every peer's advertised routes,
//! selects the best route per prefix, publishes the selected map for the
//! switch, and relays incremental updates to peers as epoch diffs.
//!
//! Routing messages ride the `ccp_control`/`ccp_update` sub-protocols on
//! the peer link; the manager itself never touches the packet pipeline.

mod manager;
mod packet;
mod peer_table;

#[cfg(test)]
mod fixtures;

pub use manager::{CcpSender, CcpTransportError, RouteManager, RouteManagerStore};
pub use packet::{Mode, Route, RouteControlRequest, RouteProp, RouteUpdateRequest};
pub use peer_table::{PeerRoutes, UpdateOutcome};

use conductor_service::Account;

/// Extension trait for [`Account`] with the account's routing role.
pub trait RoutingAccount: Account {
    /// Whether we broadcast our routes to this peer
    fn should_send_routes(&self) -> bool;

    /// Whether we accept route broadcasts from this peer
    fn should_receive_routes(&self) -> bool;

    /// Tie-break weight when two peers advertise equally long paths to a
    /// prefix; lower wins.
    fn routing_weight(&self) -> u32 {
        0
    }
}
