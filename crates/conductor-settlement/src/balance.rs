use std::sync::Arc;

use conductor_service::AccountId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Configured balance bounds for one account.
///
/// The balance is positive when the peer owes us and negative when we owe
/// the peer. `settle_threshold` is the level below which we initiate
/// settlement; `settle_to` is the level settlement aims for. An account
/// without a threshold never initiates settlement (receive-only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceLimits {
    pub minimum: i64,
    pub maximum: i64,
    #[serde(default)]
    pub settle_threshold: Option<i64>,
    #[serde(default)]
    pub settle_to: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid balance limits: minimum <= settle_threshold <= settle_to <= maximum must hold")]
pub struct BalanceLimitsError {}

impl BalanceLimits {
    pub fn validate(&self) -> Result<(), BalanceLimitsError> {
        let ordered = match self.settle_threshold {
            Some(threshold) => {
                self.minimum <= threshold
                    && threshold <= self.settle_to
                    && self.settle_to <= self.maximum
            }
            None => self.minimum <= self.maximum,
        };
        if ordered {
            Ok(())
        } else {
            Err(BalanceLimitsError {})
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("balance change would exceed the configured bounds")]
    InsufficientLiquidity,
}

/// The persisted view of one account's money state, stored as JSON under
/// `<account_id>:account`. Every tracker mutation rewrites it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Bilateral balance; positive means the peer owes us
    pub balance: i64,
    /// Cumulative amount settled out to the peer. Monotonic, so the peer
    /// can reconcile even when a payment result was lost.
    pub payout_amount: u64,
    /// Cumulative amount owed to the peer from forwarded payouts.
    /// Settlement budgets are capped by `owed_amount - payout_amount`.
    pub owed_amount: u64,
    /// The peer's settlement-engine identity, learned via the peering
    /// sub-protocol.
    #[serde(default)]
    pub remote_engine_identity: Option<String>,
    /// Ids of payment artifacts we issued that are still unconsumed.
    #[serde(default)]
    pub issued_invoices: Vec<String>,
}

/// Where trackers persist their snapshots: synchronously into the store's
/// cache, with the durable write queued behind it.
pub trait SnapshotStore: Send + Sync + 'static {
    fn load_snapshot(&self, account_id: &AccountId) -> Option<AccountSnapshot>;
    fn persist_snapshot(&self, account_id: &AccountId, snapshot: &AccountSnapshot);
}

/// The per-account credit balance.
///
/// All mutations go through the handful of methods here; each one holds
/// the account lock for the check and the write together, so concurrent
/// packets observe a linearizable balance, and each one persists the
/// updated snapshot before returning.
#[derive(Clone)]
pub struct BalanceTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    account_id: AccountId,
    limits: BalanceLimits,
    state: Mutex<AccountSnapshot>,
    store: Arc<dyn SnapshotStore>,
}

impl BalanceTracker {
    /// Creates a tracker, resuming from the persisted snapshot when one
    /// exists.
    pub fn new(
        account_id: AccountId,
        limits: BalanceLimits,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, BalanceLimitsError> {
        limits.validate()?;
        let state = store.load_snapshot(&account_id).unwrap_or_default();
        if state != AccountSnapshot::default() {
            debug!(
                "Resuming balance state for account {}: balance={} payout={} owed={}",
                account_id, state.balance, state.payout_amount, state.owed_amount
            );
        }
        Ok(BalanceTracker {
            inner: Arc::new(TrackerInner {
                account_id,
                limits,
                state: Mutex::new(state),
                store,
            }),
        })
    }

    pub fn account_id(&self) -> &AccountId {
        &self.inner.account_id
    }

    pub fn limits(&self) -> &BalanceLimits {
        &self.inner.limits
    }

    pub fn balance(&self) -> i64 {
        self.inner.state.lock().balance
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        self.inner.state.lock().clone()
    }

    /// Credits the account (the peer owes us more), e.g. when a prepare
    /// arrives from the peer. Fails when the result would exceed
    /// `maximum`.
    pub fn add_balance(&self, amount: u64) -> Result<(), BalanceError> {
        self.adjust(amount as i128, true)
    }

    /// Debits the account (we owe the peer more), e.g. when a forwarded
    /// packet is fulfilled or an incoming settlement credit arrives.
    /// Fails when the result would drop below `minimum`.
    pub fn sub_balance(&self, amount: u64) -> Result<(), BalanceError> {
        self.adjust(-(amount as i128), true)
    }

    /// Debits the account without a bounds check. This is the rollback
    /// path: undoing an optimistic `add_balance` restores a state that was
    /// legal moments ago, and a rollback must not itself be able to fail.
    pub fn debit_unchecked(&self, amount: u64) {
        self.adjust(-(amount as i128), false)
            .expect("unchecked adjustment cannot fail")
    }

    fn adjust(&self, delta: i128, check_bounds: bool) -> Result<(), BalanceError> {
        let mut state = self.inner.state.lock();
        let new_balance = state.balance as i128 + delta;
        let in_bounds = new_balance >= self.inner.limits.minimum as i128
            && new_balance <= self.inner.limits.maximum as i128;
        if check_bounds && !in_bounds {
            trace!(
                "Refusing balance change of {} for account {}: balance {} bounds [{}, {}]",
                delta,
                self.inner.account_id,
                state.balance,
                self.inner.limits.minimum,
                self.inner.limits.maximum
            );
            return Err(BalanceError::InsufficientLiquidity);
        }
        state.balance = new_balance as i64;
        self.persist(&state);
        Ok(())
    }

    /// Records `amount` as owed to the peer from a forwarded payout.
    pub fn add_owed(&self, amount: u64) {
        let mut state = self.inner.state.lock();
        state.owed_amount = state.owed_amount.saturating_add(amount);
        self.persist(&state);
    }

    /// Records `amount` as settled out to the peer. Monotonic.
    pub fn add_payout(&self, amount: u64) {
        let mut state = self.inner.state.lock();
        state.payout_amount = state.payout_amount.saturating_add(amount);
        self.persist(&state);
    }

    /// How much of what we owe the peer has not been settled yet.
    pub fn owed_remaining(&self) -> u64 {
        let state = self.inner.state.lock();
        state.owed_amount.saturating_sub(state.payout_amount)
    }

    /// Returns the settlement budget when the balance has crossed the
    /// settle threshold: `min(settle_to - balance, owed remaining)`, or
    /// `None` when no settlement is due (including for receive-only
    /// accounts).
    pub fn settlement_budget(&self) -> Option<u64> {
        let threshold = self.inner.limits.settle_threshold?;
        let state = self.inner.state.lock();
        if state.balance >= threshold {
            return None;
        }
        let to_settle_to = (self.inner.limits.settle_to as i128 - state.balance as i128).max(0);
        let owed = state.owed_amount.saturating_sub(state.payout_amount);
        let budget = (to_settle_to as u128).min(owed as u128) as u64;
        if budget > 0 {
            Some(budget)
        } else {
            None
        }
    }

    pub fn remote_engine_identity(&self) -> Option<String> {
        self.inner.state.lock().remote_engine_identity.clone()
    }

    pub fn set_remote_engine_identity(&self, identity: String) {
        let mut state = self.inner.state.lock();
        state.remote_engine_identity = Some(identity);
        self.persist(&state);
    }

    /// Remembers a payment artifact we issued to the peer, so the matching
    /// incoming credit can be validated exactly once.
    pub fn note_issued_invoice(&self, invoice_id: String) {
        let mut state = self.inner.state.lock();
        state.issued_invoices.push(invoice_id);
        self.persist(&state);
    }

    /// Applies an incoming settlement credit. When `invoice_id` is given
    /// it must match a previously-issued, unconsumed artifact; a repeated
    /// notification is ignored and reported as `Ok(false)`.
    pub fn receive_settlement(
        &self,
        invoice_id: Option<&str>,
        amount: u64,
    ) -> Result<bool, BalanceError> {
        if let Some(invoice_id) = invoice_id {
            let mut state = self.inner.state.lock();
            match state.issued_invoices.iter().position(|id| id == invoice_id) {
                Some(index) => {
                    state.issued_invoices.remove(index);
                    self.persist(&state);
                }
                None => {
                    warn!(
                        "Ignoring settlement notification for unknown or consumed artifact {} on account {}",
                        invoice_id, self.inner.account_id
                    );
                    return Ok(false);
                }
            }
        }
        self.sub_balance(amount)?;
        debug!(
            "Received settlement of {} for account {}; balance is now {}",
            amount,
            self.inner.account_id,
            self.balance()
        );
        Ok(true)
    }

    fn persist(&self, state: &AccountSnapshot) {
        self.inner
            .store
            .persist_snapshot(&self.inner.account_id, state);
    }
}


#[cfg(test)]
mod tests {
    use super::test_store::TestSnapshotStore;
    use super::*;
    use std::str::FromStr;

    fn limits(minimum: i64, maximum: i64) -> BalanceLimits {
        BalanceLimits {
            minimum,
            maximum,
            settle_threshold: None,
            settle_to: 0,
        }
    }

    fn tracker(limits: BalanceLimits) -> BalanceTracker {
        BalanceTracker::new(
            AccountId::from_str("peer-0").unwrap(),
            limits,
            Arc::new(TestSnapshotStore::default()),
        )
        .unwrap()
    }

    #[test]
    fn enforces_bounds_on_both_sides() {
        let tracker = tracker(limits(-100, 100));

        tracker.add_balance(100).unwrap();
        assert_eq!(
            tracker.add_balance(1),
            Err(BalanceError::InsufficientLiquidity)
        );
        assert_eq!(tracker.balance(), 100);

        tracker.sub_balance(200).unwrap();
        assert_eq!(
            tracker.sub_balance(1),
            Err(BalanceError::InsufficientLiquidity)
        );
        assert_eq!(tracker.balance(), -100);
    }

    #[test]
    fn rollbacks_are_unchecked() {
        let tracker = tracker(limits(0, 100));
        tracker.add_balance(100).unwrap();
        tracker.debit_unchecked(100);
        tracker.debit_unchecked(0);
        assert_eq!(tracker.balance(), 0);
    }

    #[test]
    fn validates_limit_ordering() {
        assert!(limits(-10, 10).validate().is_ok());
        assert!(BalanceLimits {
            minimum: -10,
            maximum: 10,
            settle_threshold: Some(-5),
            settle_to: 0,
        }
        .validate()
        .is_ok());
        // threshold below minimum
        assert!(BalanceLimits {
            minimum: -10,
            maximum: 10,
            settle_threshold: Some(-20),
            settle_to: 0,
        }
        .validate()
        .is_err());
        // settle_to above maximum
        assert!(BalanceLimits {
            minimum: -10,
            maximum: 10,
            settle_threshold: Some(-5),
            settle_to: 20,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn settlement_budget_needs_threshold_crossing_and_owed_value() {
        let tracker = tracker(BalanceLimits {
            minimum: -1000,
            maximum: 1000,
            settle_threshold: Some(-100),
            settle_to: 0,
        });

        // balance above threshold: nothing due
        assert_eq!(tracker.settlement_budget(), None);

        // we owe 150 from forwarded payouts
        tracker.sub_balance(150).unwrap();
        tracker.add_owed(150);
        assert_eq!(tracker.settlement_budget(), Some(150));

        // budget is capped by the owed amount
        tracker.sub_balance(100).unwrap();
        assert_eq!(tracker.settlement_budget(), Some(150));

        // and consumed by payouts
        tracker.add_payout(150);
        assert_eq!(tracker.settlement_budget(), None);
    }

    #[test]
    fn receive_only_accounts_never_settle() {
        let tracker = tracker(limits(-1000, 1000));
        tracker.sub_balance(500).unwrap();
        tracker.add_owed(500);
        assert_eq!(tracker.settlement_budget(), None);
    }

    #[test]
    fn resumes_from_the_persisted_snapshot() {
        let store = Arc::new(TestSnapshotStore::default());
        let id = AccountId::from_str("peer-0").unwrap();
        {
            let tracker =
                BalanceTracker::new(id.clone(), limits(-1000, 1000), store.clone()).unwrap();
            tracker.add_balance(42).unwrap();
            tracker.add_owed(7);
        }
        let resumed = BalanceTracker::new(id, limits(-1000, 1000), store).unwrap();
        assert_eq!(resumed.balance(), 42);
        assert_eq!(resumed.owed_remaining(), 7);
    }

    #[test]
    fn duplicate_settlement_notifications_are_ignored() {
        let tracker = tracker(limits(-1000, 1000));
        tracker.add_balance(100).unwrap();
        tracker.note_issued_invoice("inv-1".to_string());

        assert_eq!(tracker.receive_settlement(Some("inv-1"), 100), Ok(true));
        assert_eq!(tracker.balance(), 0);

        // the artifact was consumed; the duplicate changes nothing
        assert_eq!(tracker.receive_settlement(Some("inv-1"), 100), Ok(false));
        assert_eq!(tracker.balance(), 0);
    }

    #[test]
    fn untagged_settlements_apply_directly() {
        let tracker = tracker(limits(-1000, 1000));
        tracker.add_balance(50).unwrap();
        assert_eq!(tracker.receive_settlement(None, 50), Ok(true));
        assert_eq!(tracker.balance(), 0);
    }
}
