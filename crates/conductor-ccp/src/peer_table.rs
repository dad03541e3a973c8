use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::packet::{Route, RouteUpdateRequest};

/// What applying a peer's update did to our view of their table.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update applied cleanly; these prefixes changed.
    Applied(Vec<String>),
    /// The peer restarted or we missed epochs; our view of them must be
    /// discarded and re-synced from zero.
    ResetRequired,
}

struct PeerRoute {
    route: Route,
    refreshed_at: Instant,
}

/// Our view of one peer's advertised routing table.
///
/// The table is identified by the peer's table id and versioned by epochs.
/// Updates must be contiguous: an update starting past our current epoch
/// means we missed something, and the whole view is rebuilt from a fresh
/// SYNC rather than guessed at. Withdrawn prefixes are held down for the
/// advertised hold-down time so a flapping route cannot reinstall itself
/// immediately.
pub struct PeerRoutes {
    id: [u8; 16],
    epoch: u32,
    routes: HashMap<String, PeerRoute>,
    hold_downs: HashMap<String, Instant>,
}

impl PeerRoutes {
    pub fn new(id: [u8; 16]) -> Self {
        PeerRoutes {
            id,
            epoch: 0,
            routes: HashMap::new(),
            hold_downs: HashMap::new(),
        }
    }

    pub fn id(&self) -> [u8; 16] {
        self.id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn route(&self, prefix: &str) -> Option<&Route> {
        self.routes.get(prefix).map(|entry| &entry.route)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values().map(|entry| &entry.route)
    }

    /// Applies a route update from this peer.
    pub fn handle_update(&mut self, update: RouteUpdateRequest) -> UpdateOutcome {
        if update.routing_table_id != self.id {
            debug!(
                "Peer's routing table changed from {} to {}",
                hex::encode(self.id),
                hex::encode(update.routing_table_id)
            );
            return UpdateOutcome::ResetRequired;
        }

        // the update covers [from, to); contiguity means it starts at or
        // before our current epoch
        if update.from_epoch_index > self.epoch {
            debug!(
                "Gap in peer's epochs: we are at {}, update starts at {}",
                self.epoch, update.from_epoch_index
            );
            return UpdateOutcome::ResetRequired;
        }

        if update.to_epoch_index <= self.epoch {
            trace!(
                "Ignoring stale update for epochs {}..{} (we are at {})",
                update.from_epoch_index,
                update.to_epoch_index,
                self.epoch
            );
            return UpdateOutcome::Applied(Vec::new());
        }

        let now = Instant::now();
        let hold_down = Duration::from_millis(u64::from(update.hold_down_time));
        let mut changed_prefixes = Vec::new();

        for prefix in update.withdrawn_routes.iter() {
            if self.routes.remove(prefix).is_some() {
                changed_prefixes.push(prefix.clone());
            }
            self.hold_downs.insert(prefix.clone(), now + hold_down);
        }

        for route in update.new_routes.into_iter() {
            if let Some(&held_until) = self.hold_downs.get(&route.prefix) {
                if now < held_until {
                    trace!(
                        "Ignoring re-advertisement of held-down prefix {}",
                        route.prefix
                    );
                    continue;
                }
                self.hold_downs.remove(&route.prefix);
            }
            let prefix = route.prefix.clone();
            let replaced = self.routes.insert(
                prefix.clone(),
                PeerRoute {
                    route,
                    refreshed_at: now,
                },
            );
            // a refresh of an identical route is not a change
            let changed = match replaced {
                Some(previous) => previous.route != self.routes[&prefix].route,
                None => true,
            };
            if changed {
                changed_prefixes.push(prefix);
            }
        }

        self.epoch = update.to_epoch_index;
        self.hold_downs.retain(|_, &mut held_until| now < held_until);

        UpdateOutcome::Applied(changed_prefixes)
    }

    /// Marks every live route as refreshed, e.g. when a heartbeat update
    /// arrives with no changes.
    pub fn refresh_all(&mut self) {
        let now = Instant::now();
        for entry in self.routes.values_mut() {
            entry.refreshed_at = now;
        }
    }

    /// Withdraws routes that have not been refreshed within
    /// `route_expiry`. Returns the expired prefixes.
    pub fn expire_stale_routes(&mut self, route_expiry: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.refreshed_at) > route_expiry)
            .map(|(prefix, _)| prefix.clone())
            .collect();
        for prefix in expired.iter() {
            debug!("Expiring unrefreshed route for prefix {}", prefix);
            self.routes.remove(prefix);
        }
        expired
    }
}
