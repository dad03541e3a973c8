use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_packet::Address;
use conductor_router::RoutingTable;
use conductor_service::{Account, AccountId};
use parking_lot::{Mutex, RwLock};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::packet::{Mode, Route, RouteControlRequest, RouteUpdateRequest};
use crate::peer_table::{PeerRoutes, UpdateOutcome};
use crate::RoutingAccount;

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ROUTE_EXPIRY: Duration = Duration::from_secs(45);
pub const DEFAULT_HOLD_DOWN_TIME: u32 = 45_000;

#[derive(Debug, Error)]
pub enum CcpTransportError {
    #[error("could not deliver routing message: {0}")]
    SendFailed(String),
}

#[derive(Debug, Error)]
pub enum CcpError {
    #[error("we are not configured to exchange routes with this account")]
    NotAuthorized,
    #[error("malformed routing message: {0}")]
    Malformed(String),
}

/// Delivers routing messages to a peer, normally over the account's link
/// as `ccp_control`/`ccp_update` sub-protocol frames.
#[async_trait]
pub trait CcpSender<A>: Clone + Send + Sync + 'static {
    async fn send_control(
        &self,
        to: &A,
        request: RouteControlRequest,
    ) -> Result<(), CcpTransportError>;

    async fn send_update(
        &self,
        to: &A,
        request: RouteUpdateRequest,
    ) -> Result<(), CcpTransportError>;
}

/// The routing state the manager reads from and publishes to.
pub trait RouteManagerStore: Clone + Send + Sync + 'static {
    type Account: RoutingAccount;

    /// Statically configured routes (including the accounts this node
    /// terminates). These always win over advertised routes.
    fn configured_routes(&self) -> Vec<(String, Self::Account)>;

    /// Every account that may take part in route exchange.
    fn routing_accounts(&self) -> Vec<Self::Account>;

    /// Publishes the selected prefix -> next-hop map for the switch.
    fn set_routes(&self, routes: Vec<(String, AccountId)>);
}

struct ForwardingTable {
    id: [u8; 16],
    epoch: u32,
    routes: RoutingTable<(AccountId, Route)>,
}

struct PeerCursor {
    /// All epochs below this have been acknowledged by the peer
    last_epoch_sent: u32,
    /// Broadcast intervals to skip before retrying a failing peer
    skip_intervals: u8,
    /// Current backoff ceiling for the peer
    backoff: u8,
}

impl Default for PeerCursor {
    fn default() -> Self {
        PeerCursor {
            last_epoch_sent: 0,
            skip_intervals: 0,
            backoff: 0,
        }
    }
}

/// The route manager.
///
/// Owns the per-peer advertised tables, the selected local table and the
/// forwarding table with its epoch log. Incoming CCP messages arrive via
/// `handle_route_control`/`handle_route_update`; the broadcast loop pushes
/// epoch diffs (and heartbeats) to every peer we send routes to.
pub struct RouteManager<S, T>
where
    S: RouteManagerStore,
    T: CcpSender<S::Account>,
{
    ilp_address: Address,
    store: S,
    sender: T,
    incoming_tables: Arc<RwLock<HashMap<AccountId, PeerRoutes>>>,
    local_table: Arc<RwLock<RoutingTable<(S::Account, Route)>>>,
    forwarding_table: Arc<RwLock<ForwardingTable>>,
    /// Index e holds the (added, withdrawn) pair of the transition from
    /// epoch e to epoch e+1
    forwarding_table_updates: Arc<RwLock<Vec<(Vec<Route>, Vec<String>)>>>,
    peer_cursors: Arc<Mutex<HashMap<AccountId, PeerCursor>>>,
    route_expiry: Duration,
    hold_down_time: u32,
}

impl<S, T> Clone for RouteManager<S, T>
where
    S: RouteManagerStore,
    T: CcpSender<S::Account>,
{
    fn clone(&self) -> Self {
        RouteManager {
            ilp_address: self.ilp_address.clone(),
            store: self.store.clone(),
            sender: self.sender.clone(),
            incoming_tables: self.incoming_tables.clone(),
            local_table: self.local_table.clone(),
            forwarding_table: self.forwarding_table.clone(),
            forwarding_table_updates: self.forwarding_table_updates.clone(),
            peer_cursors: self.peer_cursors.clone(),
            route_expiry: self.route_expiry,
            hold_down_time: self.hold_down_time,
        }
    }
}

fn random_table_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    SystemRandom::new()
        .fill(&mut id)
        .expect("system randomness unavailable");
    id
}

fn hash_auth(auth: &[u8; 32]) -> [u8; 32] {
    let mut hashed = [0u8; 32];
    hashed.copy_from_slice(digest(&SHA256, auth).as_ref());
    hashed
}

impl<S, T> RouteManager<S, T>
where
    S: RouteManagerStore,
    S::Account: Sync,
    T: CcpSender<S::Account>,
{
    pub fn new(ilp_address: Address, store: S, sender: T) -> Self {
        let manager = RouteManager {
            ilp_address,
            store,
            sender,
            incoming_tables: Arc::new(RwLock::new(HashMap::new())),
            local_table: Arc::new(RwLock::new(RoutingTable::new())),
            forwarding_table: Arc::new(RwLock::new(ForwardingTable {
                id: random_table_id(),
                epoch: 0,
                routes: RoutingTable::new(),
            })),
            forwarding_table_updates: Arc::new(RwLock::new(Vec::new())),
            peer_cursors: Arc::new(Mutex::new(HashMap::new())),
            route_expiry: DEFAULT_ROUTE_EXPIRY,
            hold_down_time: DEFAULT_HOLD_DOWN_TIME,
        };
        // seed the selection with the configured routes
        manager.update_best_routes(None);
        manager
    }

    pub fn route_expiry(mut self, route_expiry: Duration) -> Self {
        self.route_expiry = route_expiry;
        self
    }

    pub fn hold_down_time(mut self, hold_down_time: u32) -> Self {
        self.hold_down_time = hold_down_time;
        self
    }

    /// Kicks off route exchange with a freshly connected peer: ask it to
    /// start (or resume) sending us updates.
    pub async fn peer_connected(&self, account: &S::Account) {
        if !account.should_receive_routes() {
            return;
        }
        let (last_known_routing_table_id, last_known_epoch) = {
            let tables = self.incoming_tables.read();
            match tables.get(account.id()) {
                Some(table) => (table.id(), table.epoch()),
                None => ([0u8; 16], 0),
            }
        };
        self.send_control(account, last_known_routing_table_id, last_known_epoch)
            .await;
    }

    /// Forgets everything about a disconnected peer and withdraws its
    /// routes from the selection.
    pub fn peer_disconnected(&self, account_id: &AccountId) {
        self.incoming_tables.write().remove(account_id);
        self.peer_cursors.lock().remove(account_id);
        self.update_best_routes(None);
    }

    /// Handles a `ccp_control` payload: the peer tells us where it wants
    /// our updates to resume from.
    pub async fn handle_route_control(
        &self,
        from: &S::Account,
        control: RouteControlRequest,
    ) -> Result<(), CcpError> {
        if !from.should_send_routes() {
            return Err(CcpError::NotAuthorized);
        }
        debug!(
            "Got route control from account {}: mode {:?}, last known epoch {}",
            from.id(),
            control.mode,
            control.last_known_epoch
        );

        if control.mode != Mode::Sync {
            return Ok(());
        }

        let (from_epoch, to_epoch) = {
            let forwarding_table = self.forwarding_table.read();
            let from_epoch = if control.last_known_routing_table_id != forwarding_table.id {
                0
            } else {
                control.last_known_epoch.min(forwarding_table.epoch)
            };
            (from_epoch, forwarding_table.epoch)
        };

        {
            let mut cursors = self.peer_cursors.lock();
            let cursor = cursors.entry(from.id().clone()).or_default();
            cursor.last_epoch_sent = from_epoch;
            // a control message proves the peer is reachable again
            cursor.skip_intervals = 0;
            cursor.backoff = 0;
        }

        self.send_epoch_range(from, from_epoch, to_epoch).await;
        Ok(())
    }

    /// Handles a `ccp_update` payload: apply the diff to our view of the
    /// peer's table and reselect any prefixes it touched.
    pub async fn handle_route_update(
        &self,
        from: &S::Account,
        update: RouteUpdateRequest,
    ) -> Result<(), CcpError> {
        if !from.should_receive_routes() {
            return Err(CcpError::NotAuthorized);
        }
        trace!(
            "Got route update from account {} for epochs {}..{}",
            from.id(),
            update.from_epoch_index,
            update.to_epoch_index
        );

        let update = self.filter_routes(update);
        let routing_table_id = update.routing_table_id;
        let heartbeat = update.new_routes.is_empty() && update.withdrawn_routes.is_empty();

        let outcome = {
            let mut tables = self.incoming_tables.write();
            let table = tables
                .entry(from.id().clone())
                .or_insert_with(|| PeerRoutes::new(routing_table_id));
            let outcome = table.handle_update(update);
            if heartbeat && matches!(outcome, UpdateOutcome::Applied(_)) {
                table.refresh_all();
            }
            outcome
        };

        match outcome {
            UpdateOutcome::Applied(changed_prefixes) => {
                if !changed_prefixes.is_empty()
                    && self.update_best_routes(Some(changed_prefixes))
                {
                    // epoch advanced: offer the new range right away
                    // instead of waiting out the broadcast interval. Done
                    // off-task so this peer's response is not held up by a
                    // slow third peer.
                    let manager = self.clone();
                    tokio::spawn(async move { manager.push_updates().await });
                }
                Ok(())
            }
            UpdateOutcome::ResetRequired => {
                debug!(
                    "Resetting our view of account {} and requesting a fresh sync",
                    from.id()
                );
                self.incoming_tables
                    .write()
                    .insert(from.id().clone(), PeerRoutes::new(routing_table_id));
                self.update_best_routes(None);
                self.send_control(from, [0u8; 16], 0).await;
                Ok(())
            }
        }
    }

    /// Bilateral reset after a malformed routing message: discard our view
    /// of the peer and ask it to start over from epoch zero.
    pub async fn reset_peer(&self, from: &S::Account) {
        warn!("Resetting route exchange with account {}", from.id());
        self.incoming_tables.write().remove(from.id());
        self.update_best_routes(None);
        self.send_control(from, [0u8; 16], 0).await;
    }

    /// Drops advertised routes we will never accept: wrong address
    /// scheme, our own address space, or a path that already includes us
    /// (a loop).
    fn filter_routes(&self, mut update: RouteUpdateRequest) -> RouteUpdateRequest {
        let own_address = self.ilp_address.as_str();
        let scheme = self.ilp_address.scheme();
        update.new_routes.retain(|route| {
            let in_scheme = route.prefix == scheme
                || (route.prefix.starts_with(scheme)
                    && route.prefix[scheme.len()..].starts_with('.'));
            if !in_scheme {
                warn!("Ignoring route for a different address scheme: {}", route.prefix);
                false
            } else if route.prefix == scheme {
                warn!("Ignoring route for the bare scheme prefix: {}", route.prefix);
                false
            } else if route.prefix.starts_with(own_address) {
                debug!(
                    "Ignoring route inside our own address space: {}",
                    route.prefix
                );
                false
            } else if route.path.iter().any(|hop| hop == own_address) {
                debug!("Ignoring looped route for {} (we are on its path)", route.prefix);
                false
            } else {
                true
            }
        });
        update
    }

    /// Re-runs route selection, for the given prefixes or for every
    /// prefix any source knows about, and records the resulting changes
    /// as a new forwarding-table epoch. Returns whether the epoch
    /// advanced.
    pub fn update_best_routes(&self, prefixes: Option<Vec<String>>) -> bool {
        let configured: HashMap<String, S::Account> =
            self.store.configured_routes().into_iter().collect();
        let accounts: HashMap<AccountId, S::Account> = self
            .store
            .routing_accounts()
            .into_iter()
            .map(|account| (account.id().clone(), account))
            .collect();

        let (better_routes, withdrawn_prefixes) = {
            let local_table = self.local_table.read();
            let incoming_tables = self.incoming_tables.read();

            let prefixes_to_check: Vec<String> = match prefixes {
                Some(prefixes) => prefixes,
                None => {
                    let mut all: Vec<String> = configured.keys().cloned().collect();
                    for table in incoming_tables.values() {
                        all.extend(table.routes().map(|route| route.prefix.clone()));
                    }
                    all.extend(local_table.prefixes());
                    all.sort();
                    all.dedup();
                    all
                }
            };

            let mut better_routes: Vec<(String, S::Account, Route)> = Vec::new();
            let mut withdrawn_prefixes: Vec<String> = Vec::new();
            for prefix in prefixes_to_check {
                match best_route_for_prefix(&configured, &accounts, &incoming_tables, &prefix) {
                    Some((account, route)) => {
                        let unchanged = local_table
                            .get(&prefix)
                            .map(|(current, _)| current.id() == account.id())
                            .unwrap_or(false);
                        if !unchanged {
                            better_routes.push((prefix, account, route));
                        }
                    }
                    None => {
                        if local_table.get(&prefix).is_some() {
                            withdrawn_prefixes.push(prefix);
                        }
                    }
                }
            }
            (better_routes, withdrawn_prefixes)
        };

        if better_routes.is_empty() && withdrawn_prefixes.is_empty() {
            return false;
        }

        {
            let mut local_table = self.local_table.write();
            let mut forwarding_table = self.forwarding_table.write();
            let mut updates = self.forwarding_table_updates.write();

            let mut advertised_routes: Vec<Route> = Vec::with_capacity(better_routes.len());
            for (prefix, account, mut route) in better_routes {
                debug!(
                    "Setting route for prefix {} -> account {}",
                    prefix,
                    account.id()
                );
                local_table.insert(&prefix, (account.clone(), route.clone()));

                let changed_next_hop = forwarding_table
                    .routes
                    .get(&prefix)
                    .map(|(current, _)| current != account.id())
                    .unwrap_or(true);
                if changed_next_hop {
                    route.path.insert(0, self.ilp_address.to_string());
                    // each hop hashes the auth token before re-advertising
                    route.auth = hash_auth(&route.auth);
                    forwarding_table
                        .routes
                        .insert(&prefix, (account.id().clone(), route.clone()));
                    advertised_routes.push(route);
                }
            }

            for prefix in withdrawn_prefixes.iter() {
                debug!("Withdrawing route for prefix {}", prefix);
                local_table.delete(prefix);
                forwarding_table.routes.delete(prefix);
            }

            forwarding_table.epoch += 1;
            updates.push((advertised_routes, withdrawn_prefixes));
            debug_assert_eq!(forwarding_table.epoch as usize, updates.len());

            let selected: Vec<(String, AccountId)> = local_table
                .prefixes()
                .into_iter()
                .filter_map(|prefix| {
                    local_table
                        .get(&prefix)
                        .map(|(account, _)| (prefix.clone(), account.id().clone()))
                })
                .collect();
            self.store.set_routes(selected);
        }
        true
    }

    /// Sends every sending peer its missing epoch range, if it has one.
    /// Unlike the broadcast tick this neither heartbeats nor touches the
    /// failure backoff counters.
    async fn push_updates(&self) {
        let current_epoch = self.forwarding_table.read().epoch;
        for account in self.store.routing_accounts() {
            if !account.should_send_routes() {
                continue;
            }
            let from_epoch = {
                let mut cursors = self.peer_cursors.lock();
                let cursor = cursors.entry(account.id().clone()).or_default();
                if cursor.skip_intervals > 0 || cursor.last_epoch_sent >= current_epoch {
                    continue;
                }
                cursor.last_epoch_sent
            };
            self.send_epoch_range(&account, from_epoch, current_epoch)
                .await;
        }
    }

    /// Builds the update covering `[from_epoch, to_epoch)`, merging the
    /// per-epoch diffs so a route added and later withdrawn in the range
    /// nets out.
    fn create_route_update(&self, from_epoch: u32, to_epoch: u32) -> RouteUpdateRequest {
        let (routing_table_id, current_epoch_index) = {
            let table = self.forwarding_table.read();
            (table.id, table.epoch)
        };
        let updates = self.forwarding_table_updates.read();

        let mut new_routes: Vec<Route> = Vec::new();
        let mut withdrawn_routes: Vec<String> = Vec::new();

        // a peer starting from scratch also learns our own address
        if from_epoch == 0 {
            new_routes.push(Route {
                prefix: self.ilp_address.to_string(),
                path: Vec::new(),
                auth: [0u8; 32],
                props: Vec::new(),
            });
        }

        let range = (from_epoch as usize).min(updates.len())..(to_epoch as usize).min(updates.len());
        for (added, withdrawn) in updates[range].iter() {
            for route in added {
                withdrawn_routes.retain(|prefix| prefix != &route.prefix);
                new_routes.retain(|existing| existing.prefix != route.prefix);
                new_routes.push(route.clone());
            }
            for prefix in withdrawn {
                new_routes.retain(|existing| &existing.prefix != prefix);
                withdrawn_routes.push(prefix.clone());
            }
        }

        RouteUpdateRequest {
            routing_table_id,
            current_epoch_index,
            from_epoch_index: from_epoch,
            to_epoch_index: to_epoch,
            hold_down_time: self.hold_down_time,
            speaker: self.ilp_address.to_string(),
            new_routes,
            withdrawn_routes,
        }
    }

    async fn send_control(
        &self,
        to: &S::Account,
        last_known_routing_table_id: [u8; 16],
        last_known_epoch: u32,
    ) {
        let control = RouteControlRequest {
            mode: Mode::Sync,
            last_known_routing_table_id,
            last_known_epoch,
            features: Vec::new(),
        };
        if let Err(err) = self.sender.send_control(to, control).await {
            warn!("Error sending route control to account {}: {}", to.id(), err);
        }
    }

    /// Sends one update covering the peer's missing range; the cursor only
    /// advances when the send is acknowledged.
    async fn send_epoch_range(&self, to: &S::Account, from_epoch: u32, to_epoch: u32) {
        let update = self.create_route_update(from_epoch, to_epoch);
        trace!(
            "Sending route update for epochs {}..{} to account {}",
            from_epoch,
            to_epoch,
            to.id()
        );
        match self.sender.send_update(to, update).await {
            Ok(()) => {
                let mut cursors = self.peer_cursors.lock();
                let cursor = cursors.entry(to.id().clone()).or_default();
                cursor.last_epoch_sent = to_epoch;
                cursor.skip_intervals = 0;
                cursor.backoff = 0;
            }
            Err(err) => {
                warn!(
                    "Error sending route update to account {}: {}; will retry",
                    to.id(),
                    err
                );
                let mut cursors = self.peer_cursors.lock();
                let cursor = cursors.entry(to.id().clone()).or_default();
                cursor.backoff = cursor.backoff.saturating_add(1);
                cursor.skip_intervals = cursor.backoff;
            }
        }
    }

    /// One broadcast tick: expire stale routes, then offer every sending
    /// peer its missing epoch range (an empty range is still sent as a
    /// heartbeat).
    pub async fn broadcast(&self) {
        let expired: Vec<String> = {
            let mut tables = self.incoming_tables.write();
            tables
                .values_mut()
                .flat_map(|table| table.expire_stale_routes(self.route_expiry))
                .collect()
        };
        if !expired.is_empty() {
            debug!("Expired {} unrefreshed routes", expired.len());
            self.update_best_routes(Some(expired));
        }

        let current_epoch = self.forwarding_table.read().epoch;
        for account in self.store.routing_accounts() {
            if !account.should_send_routes() {
                continue;
            }
            let from_epoch = {
                let mut cursors = self.peer_cursors.lock();
                let cursor = cursors.entry(account.id().clone()).or_default();
                if cursor.skip_intervals > 0 {
                    cursor.skip_intervals -= 1;
                    trace!(
                        "Skipping route broadcast to backing-off account {}",
                        account.id()
                    );
                    continue;
                }
                cursor.last_epoch_sent
            };
            self.send_epoch_range(&account, from_epoch, current_epoch)
                .await;
        }
    }

    /// Runs `broadcast` forever on the given interval.
    pub async fn start_broadcast_loop(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.broadcast().await;
        }
    }

    #[cfg(test)]
    fn current_epoch(&self) -> u32 {
        self.forwarding_table.read().epoch
    }
}

/// Selection policy: configured routes always win; otherwise the shortest
/// advertised path, then the lowest peer weight, then the smallest account
/// id.
fn best_route_for_prefix<A: RoutingAccount>(
    configured: &HashMap<String, A>,
    accounts: &HashMap<AccountId, A>,
    incoming_tables: &HashMap<AccountId, PeerRoutes>,
    prefix: &str,
) -> Option<(A, Route)> {
    if let Some(account) = configured.get(prefix) {
        return Some((
            account.clone(),
            Route {
                prefix: prefix.to_string(),
                path: Vec::new(),
                auth: [0u8; 32],
                props: Vec::new(),
            },
        ));
    }

    incoming_tables
        .iter()
        .filter_map(|(account_id, table)| {
            let route = table.route(prefix)?;
            let account = accounts.get(account_id)?;
            Some((account, route))
        })
        .min_by(|(account_a, route_a), (account_b, route_b)| {
            route_a
                .path
                .len()
                .cmp(&route_b.path.len())
                .then_with(|| account_a.routing_weight().cmp(&account_b.routing_weight()))
                .then_with(|| account_a.id().cmp(account_b.id()))
        })
        .map(|(account, route)| (account.clone(), route.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use conductor_service::AccountRelation;
    use std::str::FromStr;

    #[derive(Clone, Debug)]
    struct TestAccount {
        id: AccountId,
        weight: u32,
        send_routes: bool,
        receive_routes: bool,
    }

    impl TestAccount {
        fn new(id: &str) -> Self {
            TestAccount {
                id: AccountId::from_str(id).unwrap(),
                weight: 0,
                send_routes: true,
                receive_routes: true,
            }
        }

        fn with_weight(id: &str, weight: u32) -> Self {
            TestAccount {
                weight,
                ..TestAccount::new(id)
            }
        }
    }

    impl Account for TestAccount {
        fn id(&self) -> &AccountId {
            &self.id
        }

        fn relation(&self) -> AccountRelation {
            AccountRelation::Peer
        }

        fn asset_code(&self) -> &str {
            "XYZ"
        }

        fn asset_scale(&self) -> u8 {
            9
        }
    }

    impl RoutingAccount for TestAccount {
        fn should_send_routes(&self) -> bool {
            self.send_routes
        }

        fn should_receive_routes(&self) -> bool {
            self.receive_routes
        }

        fn routing_weight(&self) -> u32 {
            self.weight
        }
    }

    #[derive(Clone, Default)]
    struct TestStore {
        configured: Vec<(String, TestAccount)>,
        accounts: Vec<TestAccount>,
        published: Arc<Mutex<Vec<(String, AccountId)>>>,
    }

    impl RouteManagerStore for TestStore {
        type Account = TestAccount;

        fn configured_routes(&self) -> Vec<(String, TestAccount)> {
            self.configured.clone()
        }

        fn routing_accounts(&self) -> Vec<TestAccount> {
            self.accounts.clone()
        }

        fn set_routes(&self, routes: Vec<(String, AccountId)>) {
            *self.published.lock() = routes;
        }
    }

    #[derive(Clone, Default)]
    struct TestSender {
        controls: Arc<Mutex<Vec<(AccountId, RouteControlRequest)>>>,
        updates: Arc<Mutex<Vec<(AccountId, RouteUpdateRequest)>>>,
        fail_sends: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl CcpSender<TestAccount> for TestSender {
        async fn send_control(
            &self,
            to: &TestAccount,
            request: RouteControlRequest,
        ) -> Result<(), CcpTransportError> {
            if *self.fail_sends.lock() {
                return Err(CcpTransportError::SendFailed("test failure".to_string()));
            }
            self.controls.lock().push((to.id.clone(), request));
            Ok(())
        }

        async fn send_update(
            &self,
            to: &TestAccount,
            request: RouteUpdateRequest,
        ) -> Result<(), CcpTransportError> {
            if *self.fail_sends.lock() {
                return Err(CcpTransportError::SendFailed("test failure".to_string()));
            }
            self.updates.lock().push((to.id.clone(), request));
            Ok(())
        }
    }

    fn own_address() -> Address {
        Address::from_str("example.connector").unwrap()
    }

    fn advertised(prefix: &str, path: Vec<&str>) -> Route {
        Route {
            prefix: prefix.to_string(),
            path: path.into_iter().map(str::to_string).collect(),
            auth: [7; 32],
            props: Vec::new(),
        }
    }

    fn update_with_routes(table_id: [u8; 16], to_epoch: u32, routes: Vec<Route>) -> RouteUpdateRequest {
        RouteUpdateRequest {
            routing_table_id: table_id,
            current_epoch_index: to_epoch,
            from_epoch_index: to_epoch.saturating_sub(1),
            to_epoch_index: to_epoch,
            hold_down_time: 30_000,
            speaker: "example.peer".to_string(),
            new_routes: routes,
            withdrawn_routes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn configured_routes_always_win() {
        let local = TestAccount::new("local-child");
        let peer = TestAccount::new("peer-a");
        let store = TestStore {
            configured: vec![("example.dest".to_string(), local)],
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store.clone(), TestSender::default());

        manager
            .handle_route_update(
                &peer,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();

        let published = store.published.lock();
        let route = published.iter().find(|(prefix, _)| prefix == "example.dest");
        assert_eq!(route.unwrap().1.as_str(), "local-child");
    }

    #[tokio::test]
    async fn selects_by_path_length_then_weight_then_id() {
        let near = TestAccount::with_weight("near", 5);
        let far = TestAccount::with_weight("far", 0);
        let store = TestStore {
            accounts: vec![near.clone(), far.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store.clone(), TestSender::default());

        // "far" advertises a longer path, so "near" wins despite its weight
        manager
            .handle_route_update(
                &near,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        manager
            .handle_route_update(
                &far,
                update_with_routes(
                    [2; 16],
                    1,
                    vec![advertised("example.dest", vec!["example.mid"])],
                ),
            )
            .await
            .unwrap();

        assert_eq!(
            store.published.lock()[0].1.as_str(),
            "near",
            "shorter path must win"
        );

        // equal paths: lower weight wins
        let light = TestAccount::with_weight("light", 1);
        let heavy = TestAccount::with_weight("heavy", 9);
        let store = TestStore {
            accounts: vec![light.clone(), heavy.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store.clone(), TestSender::default());
        manager
            .handle_route_update(
                &heavy,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        manager
            .handle_route_update(
                &light,
                update_with_routes([2; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        assert_eq!(store.published.lock()[0].1.as_str(), "light");

        // equal paths and weights: smallest account id wins
        let aaa = TestAccount::new("aaa");
        let zzz = TestAccount::new("zzz");
        let store = TestStore {
            accounts: vec![aaa.clone(), zzz.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store.clone(), TestSender::default());
        manager
            .handle_route_update(
                &zzz,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        manager
            .handle_route_update(
                &aaa,
                update_with_routes([2; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        assert_eq!(store.published.lock()[0].1.as_str(), "aaa");
    }

    #[tokio::test]
    async fn drops_looped_and_foreign_routes() {
        let peer = TestAccount::new("peer-a");
        let store = TestStore {
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store.clone(), TestSender::default());

        manager
            .handle_route_update(
                &peer,
                update_with_routes(
                    [1; 16],
                    1,
                    vec![
                        // our own address is already on the path
                        advertised("example.looped", vec!["example.connector"]),
                        // not our address scheme
                        advertised("test.elsewhere", vec![]),
                        // inside our own address space
                        advertised("example.connector.child", vec![]),
                    ],
                ),
            )
            .await
            .unwrap();

        assert!(store.published.lock().is_empty());
    }

    #[tokio::test]
    async fn epoch_gap_resets_the_peer_and_requests_sync_from_zero() {
        let peer = TestAccount::new("peer-a");
        let store = TestStore {
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let sender = TestSender::default();
        let manager = RouteManager::new(own_address(), store.clone(), sender.clone());

        // seed epochs 0..2
        manager
            .handle_route_update(
                &peer,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        manager
            .handle_route_update(
                &peer,
                update_with_routes([1; 16], 2, vec![advertised("example.other", vec![])]),
            )
            .await
            .unwrap();

        // an update starting at epoch 5 has a gap
        let mut gapped = update_with_routes([1; 16], 6, vec![advertised("example.new", vec![])]);
        gapped.from_epoch_index = 5;
        manager.handle_route_update(&peer, gapped).await.unwrap();

        // the peer's routes are gone from the selection
        assert!(store.published.lock().is_empty());
        // and we asked for a fresh sync from epoch 0
        let controls = sender.controls.lock();
        let (to, control) = controls.last().unwrap();
        assert_eq!(to.as_str(), "peer-a");
        assert_eq!(control.last_known_epoch, 0);
        assert_eq!(control.mode, Mode::Sync);
    }

    #[tokio::test]
    async fn unauthorized_peers_are_refused() {
        let mut peer = TestAccount::new("peer-a");
        peer.receive_routes = false;
        let store = TestStore {
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store, TestSender::default());

        let result = manager
            .handle_route_update(
                &peer,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await;
        assert!(matches!(result, Err(CcpError::NotAuthorized)));
    }

    #[tokio::test]
    async fn broadcast_sends_missing_epochs_and_advances_the_cursor() {
        let peer = TestAccount::new("peer-a");
        let child = TestAccount::new("local-child");
        let store = TestStore {
            configured: vec![("example.child".to_string(), child)],
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let sender = TestSender::default();
        let manager = RouteManager::new(own_address(), store, sender.clone());

        manager.broadcast().await;
        {
            let updates = sender.updates.lock();
            let (_, update) = updates.last().unwrap();
            assert_eq!(update.from_epoch_index, 0);
            assert_eq!(update.to_epoch_index, manager.current_epoch());
            // the first update includes our own address and the
            // configured route
            let prefixes: Vec<&str> = update
                .new_routes
                .iter()
                .map(|route| route.prefix.as_str())
                .collect();
            assert!(prefixes.contains(&"example.connector"));
            assert!(prefixes.contains(&"example.child"));
        }

        // nothing changed: the next tick sends a heartbeat for an empty
        // range
        manager.broadcast().await;
        let updates = sender.updates.lock();
        let (_, heartbeat) = updates.last().unwrap();
        assert_eq!(heartbeat.from_epoch_index, heartbeat.to_epoch_index);
        assert!(heartbeat.new_routes.is_empty());
        assert!(heartbeat.withdrawn_routes.is_empty());
    }

    #[tokio::test]
    async fn failed_broadcasts_back_off_and_do_not_advance_the_cursor() {
        let peer = TestAccount::new("peer-a");
        let child = TestAccount::new("local-child");
        let store = TestStore {
            configured: vec![("example.child".to_string(), child)],
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let sender = TestSender::default();
        let manager = RouteManager::new(own_address(), store, sender.clone());

        *sender.fail_sends.lock() = true;
        manager.broadcast().await;
        // next interval is skipped entirely
        manager.broadcast().await;
        assert!(sender.updates.lock().is_empty());

        // once the peer is reachable again the full range goes out
        *sender.fail_sends.lock() = false;
        manager.broadcast().await;
        let updates = sender.updates.lock();
        let (_, update) = updates.last().unwrap();
        assert_eq!(update.from_epoch_index, 0);
        assert_eq!(update.to_epoch_index, manager.current_epoch());
    }

    #[tokio::test]
    async fn withdrawn_then_readded_prefixes_net_out_in_merged_updates() {
        let peer = TestAccount::new("peer-a");
        let store = TestStore {
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let manager = RouteManager::new(own_address(), store, TestSender::default());

        manager
            .handle_route_update(
                &peer,
                update_with_routes([1; 16], 1, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();
        let mut withdrawal = update_with_routes([1; 16], 2, Vec::new());
        withdrawal.withdrawn_routes = vec!["example.dest".to_string()];
        // zero hold-down so the re-advertisement below is accepted
        withdrawal.hold_down_time = 0;
        manager.handle_route_update(&peer, withdrawal).await.unwrap();
        manager
            .handle_route_update(
                &peer,
                update_with_routes([1; 16], 3, vec![advertised("example.dest", vec![])]),
            )
            .await
            .unwrap();

        let merged = manager.create_route_update(0, manager.current_epoch());
        assert_eq!(
            merged
                .new_routes
                .iter()
                .filter(|route| route.prefix == "example.dest")
                .count(),
            1
        );
        assert!(merged.withdrawn_routes.is_empty());
    }

    #[tokio::test]
    async fn peer_connected_requests_resumption_from_known_state() {
        let peer = TestAccount::new("peer-a");
        let store = TestStore {
            accounts: vec![peer.clone()],
            ..TestStore::default()
        };
        let sender = TestSender::default();
        let manager = RouteManager::new(own_address(), store, sender.clone());

        manager.peer_connected(&peer).await;
        {
            let controls = sender.controls.lock();
            let (_, control) = controls.last().unwrap();
            assert_eq!(control.last_known_epoch, 0);
        }

        let mut from_scratch =
            update_with_routes([1; 16], 4, vec![advertised("example.dest", vec![])]);
        from_scratch.from_epoch_index = 0;
        manager
            .handle_route_update(&peer, from_scratch)
            .await
            .unwrap();
        manager.peer_connected(&peer).await;
        let controls = sender.controls.lock();
        let (_, control) = controls.last().unwrap();
        assert_eq!(control.last_known_epoch, 4);
        assert_eq!(control.last_known_routing_table_id, [1; 16]);
    }

    #[test]
    fn update_fixtures_survive_the_codec() {
        // shared fixtures stay wire-compatible with the manager's codec
        let bytes = UPDATE_REQUEST_SIMPLE.to_bytes();
        assert_eq!(
            RouteUpdateRequest::from_bytes(&bytes).unwrap(),
            *UPDATE_REQUEST_SIMPLE
        );
    }
}
