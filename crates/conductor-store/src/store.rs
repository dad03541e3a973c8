use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use conductor_ccp::RouteManagerStore;
use conductor_packet::Address;
use conductor_router::{RouterStore, RoutingTable};
use conductor_service::{AccountId, AccountStore, AccountStoreError, AddressStore};
use conductor_settlement::{
    AccountSnapshot, BalanceStore, BalanceTracker, SnapshotStore,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::account::ConnectorAccount;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account {0} already exists")]
    AccountExists(String),
    #[error("account {0} does not exist")]
    AccountNotFound(String),
    #[error("invalid account configuration: {0}")]
    InvalidAccount(String),
}

/// An async key -> bytes map with ordered writes and a synchronous read
/// cache.
pub trait Store: Clone + Send + Sync + 'static {
    /// Reads are served from the in-memory cache.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Updates the cache immediately and enqueues the durable write.
    /// Writes for the same key are applied in issue order.
    fn put(&self, key: &str, value: Bytes);
}

struct StoreInner {
    ilp_address: RwLock<Address>,
    cache: Mutex<HashMap<String, Bytes>>,
    durable: Mutex<HashMap<String, Bytes>>,
    write_queue: mpsc::UnboundedSender<(String, Bytes)>,
    write_receiver: Mutex<Option<mpsc::UnboundedReceiver<(String, Bytes)>>>,
    accounts: RwLock<HashMap<AccountId, ConnectorAccount>>,
    trackers: RwLock<HashMap<AccountId, BalanceTracker>>,
    /// The selected prefix -> next-hop map published by the route manager
    selected_routes: RwLock<RoutingTable<AccountId>>,
}

/// The process-wide in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(ilp_address: Address) -> Self {
        let (write_queue, write_receiver) = mpsc::unbounded_channel();
        MemoryStore {
            inner: Arc::new(StoreInner {
                ilp_address: RwLock::new(ilp_address),
                cache: Mutex::new(HashMap::new()),
                durable: Mutex::new(HashMap::new()),
                write_queue,
                write_receiver: Mutex::new(Some(write_receiver)),
                accounts: RwLock::new(HashMap::new()),
                trackers: RwLock::new(HashMap::new()),
                selected_routes: RwLock::new(RoutingTable::new()),
            }),
        }
    }

    /// Drains the write queue into the durable layer, in issue order. The
    /// node spawns this once at boot.
    ///
    /// # Panics
    ///
    /// Panics if called a second time.
    pub async fn process_writes(&self) {
        let mut receiver = self
            .inner
            .write_receiver
            .lock()
            .take()
            .expect("store writer can only be started once");
        while let Some((key, value)) = receiver.recv().await {
            trace!("Persisting {} ({} bytes)", key, value.len());
            self.inner.durable.lock().insert(key, value);
        }
    }

    /// The durable layer's view of a key, which trails the cache until the
    /// writer catches up.
    pub fn durable_get(&self, key: &str) -> Option<Bytes> {
        self.inner.durable.lock().get(key).cloned()
    }

    /// Registers an account and creates its balance tracker. Fails if the
    /// id is taken or the balance bounds are malformed.
    pub fn add_account(&self, account: ConnectorAccount) -> Result<(), StoreError> {
        use conductor_service::Account;
        use conductor_settlement::SettlementAccount;

        let id = account.id().clone();
        {
            let accounts = self.inner.accounts.read();
            if accounts.contains_key(&id) {
                return Err(StoreError::AccountExists(id.to_string()));
            }
        }

        let tracker = BalanceTracker::new(
            id.clone(),
            account.balance_limits().clone(),
            Arc::new(self.clone()),
        )
        .map_err(|err| StoreError::InvalidAccount(err.to_string()))?;

        debug!("Registered account {}", id);
        self.inner.trackers.write().insert(id.clone(), tracker);
        self.inner.accounts.write().insert(id, account);
        Ok(())
    }

    /// Removes an account, its tracker and any routes pointing at it.
    pub fn remove_account(&self, account_id: &AccountId) -> Result<ConnectorAccount, StoreError> {
        let account = self
            .inner
            .accounts
            .write()
            .remove(account_id)
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;
        self.inner.trackers.write().remove(account_id);

        let mut routes = self.inner.selected_routes.write();
        let stale: Vec<String> = routes
            .prefixes()
            .into_iter()
            .filter(|prefix| routes.get(prefix) == Some(account_id))
            .collect();
        for prefix in stale {
            routes.delete(&prefix);
        }
        debug!("Removed account {}", account_id);
        Ok(account)
    }

    pub fn account(&self, account_id: &AccountId) -> Option<ConnectorAccount> {
        self.inner.accounts.read().get(account_id).cloned()
    }

    pub fn accounts(&self) -> Vec<ConnectorAccount> {
        self.inner.accounts.read().values().cloned().collect()
    }

    pub fn set_ilp_address(&self, ilp_address: Address) {
        *self.inner.ilp_address.write() = ilp_address;
    }

    fn snapshot_key(account_id: &AccountId) -> String {
        format!("{}:account", account_id)
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.cache.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: Bytes) {
        self.inner
            .cache
            .lock()
            .insert(key.to_string(), value.clone());
        // ordering: the single queue keeps per-key writes in issue order
        if self.inner.write_queue.send((key.to_string(), value)).is_err() {
            error!("Store writer is gone; durable writes are being dropped");
        }
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    type Account = ConnectorAccount;

    async fn get_account(
        &self,
        account_id: &AccountId,
    ) -> Result<ConnectorAccount, AccountStoreError> {
        self.account(account_id)
            .ok_or_else(|| AccountStoreError::AccountNotFound(account_id.to_string()))
    }
}

impl AddressStore for MemoryStore {
    fn get_ilp_address(&self) -> Address {
        self.inner.ilp_address.read().clone()
    }
}

impl RouterStore for MemoryStore {
    fn resolve_route(&self, destination: &str) -> Option<AccountId> {
        self.inner.selected_routes.read().resolve(destination).cloned()
    }
}

impl RouteManagerStore for MemoryStore {
    type Account = ConnectorAccount;

    fn configured_routes(&self) -> Vec<(String, ConnectorAccount)> {
        self.inner
            .accounts
            .read()
            .values()
            .flat_map(|account| {
                account
                    .routes()
                    .iter()
                    .map(move |prefix| (prefix.clone(), account.clone()))
            })
            .collect()
    }

    fn routing_accounts(&self) -> Vec<ConnectorAccount> {
        self.accounts()
    }

    fn set_routes(&self, routes: Vec<(String, AccountId)>) {
        let mut table = RoutingTable::new();
        for (prefix, account_id) in routes {
            table.insert(&prefix, account_id);
        }
        *self.inner.selected_routes.write() = table;
    }
}

impl BalanceStore for MemoryStore {
    fn balance_tracker(&self, account_id: &AccountId) -> Option<BalanceTracker> {
        self.inner.trackers.read().get(account_id).cloned()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, account_id: &AccountId) -> Option<AccountSnapshot> {
        let bytes = self.get(&Self::snapshot_key(account_id))?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                error!(
                    "Discarding corrupt balance snapshot for account {}: {}",
                    account_id, err
                );
                None
            }
        }
    }

    fn persist_snapshot(&self, account_id: &AccountId, snapshot: &AccountSnapshot) {
        let bytes = serde_json::to_vec(snapshot)
            .expect("account snapshots always serialize");
        self.put(&Self::snapshot_key(account_id), Bytes::from(bytes));
    }
}

/// Convenience for tests and bootstrap code.
impl MemoryStore {
    pub fn with_address_str(ilp_address: &str) -> Self {
        MemoryStore::new(Address::from_str(ilp_address).expect("invalid ILP address"))
    }
}
