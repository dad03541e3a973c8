use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_service::AccountId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::balance::BalanceTracker;
use crate::engine::{InvoiceResponse, SettlementEngine};

const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("peer did not provide a payment artifact: {0}")]
    ArtifactUnavailable(String),
    #[error("artifact pays {actual}, expected the peer engine {expected}")]
    WrongDestination { expected: String, actual: String },
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("payment timed out")]
    PaymentTimedOut,
}

/// The controller's line to the peer, normally the account's link.
/// `request_artifact` sends an `invoiceRequest`; `notify_paid` sends the
/// money-protocol message crediting our balance in the peer's books after
/// a payment went through.
#[async_trait]
pub trait ArtifactRequester: Clone + Send + Sync + 'static {
    async fn request_artifact(
        &self,
        account_id: &AccountId,
        amount: u64,
    ) -> Result<InvoiceResponse, SettlementError>;

    async fn notify_paid(
        &self,
        account_id: &AccountId,
        invoice_id: &str,
        amount: u64,
    ) -> Result<(), SettlementError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Checking,
    Paying,
}

struct MachineState {
    state: State,
    /// A trigger arrived while a settlement was running; run one more
    /// check before going back to idle.
    recheck: bool,
}

/// Threshold-driven settlement for one account.
///
/// `trigger()` is cheap and may be called from anywhere (every fulfilled
/// packet does). Only an idle controller starts checking; triggers landing
/// mid-run just set the recheck flag, which keeps the engine's `pay`
/// strictly single-flight per account.
pub struct SettlementController<E, R> {
    tracker: BalanceTracker,
    engine: E,
    requester: R,
    machine: Arc<Mutex<MachineState>>,
    payment_timeout: Duration,
}

impl<E, R> Clone for SettlementController<E, R>
where
    E: Clone,
    R: Clone,
{
    fn clone(&self) -> Self {
        SettlementController {
            tracker: self.tracker.clone(),
            engine: self.engine.clone(),
            requester: self.requester.clone(),
            machine: self.machine.clone(),
            payment_timeout: self.payment_timeout,
        }
    }
}

impl<E, R> SettlementController<E, R>
where
    E: SettlementEngine,
    R: ArtifactRequester,
{
    pub fn new(tracker: BalanceTracker, engine: E, requester: R) -> Self {
        SettlementController {
            tracker,
            engine,
            requester,
            machine: Arc::new(Mutex::new(MachineState {
                state: State::Idle,
                recheck: false,
            })),
            payment_timeout: DEFAULT_PAYMENT_TIMEOUT,
        }
    }

    pub fn payment_timeout(mut self, payment_timeout: Duration) -> Self {
        self.payment_timeout = payment_timeout;
        self
    }

    /// Checks whether the balance calls for a settlement and runs it if
    /// so. Returns immediately when a check or payment is already in
    /// flight.
    pub async fn trigger(&self) {
        {
            let mut machine = self.machine.lock();
            if machine.state != State::Idle {
                machine.recheck = true;
                return;
            }
            machine.state = State::Checking;
        }

        loop {
            if let Some(budget) = self.tracker.settlement_budget() {
                self.settle(budget).await;
            }

            let mut machine = self.machine.lock();
            if machine.recheck {
                // a trigger arrived while we were busy; look again
                machine.recheck = false;
            } else {
                machine.state = State::Idle;
                return;
            }
        }
    }

    /// One settlement attempt. The balance is moved to its target level
    /// optimistically while the payment is in flight and rolled back if
    /// the payment fails; the payout counter is persisted before the
    /// engine is asked to pay, so a crash never double-pays.
    async fn settle(&self, budget: u64) {
        let account_id = self.tracker.account_id().clone();
        debug!(
            "Settling {} for account {} (balance: {})",
            budget,
            account_id,
            self.tracker.balance()
        );

        if self.tracker.add_balance(budget).is_err() {
            // only possible if the limits are misconfigured relative to
            // settle_to
            warn!(
                "Could not reserve settlement budget {} for account {}",
                budget, account_id
            );
            return;
        }
        self.machine.lock().state = State::Paying;

        let result = self.pay_budget(&account_id, budget).await;
        match result {
            Ok(()) => {
                info!("Settlement of {} for account {} succeeded", budget, account_id);
            }
            Err(err) => {
                warn!(
                    "Settlement of {} for account {} failed: {}",
                    budget, account_id, err
                );
                self.tracker.debit_unchecked(budget);
            }
        }
        self.machine.lock().state = State::Checking;
    }

    async fn pay_budget(&self, account_id: &AccountId, budget: u64) -> Result<(), SettlementError> {
        let invoice = self.requester.request_artifact(account_id, budget).await?;

        // the artifact must pay out to the engine the peer introduced
        // during peering; anything else is a misdirected or forged invoice
        if let Some(expected) = self.tracker.remote_engine_identity() {
            if invoice.destination_identity != expected {
                return Err(SettlementError::WrongDestination {
                    expected,
                    actual: invoice.destination_identity,
                });
            }
        }

        self.tracker.add_payout(budget);

        match timeout(self.payment_timeout, self.engine.pay(&invoice, budget)).await {
            Ok(Ok(())) => {
                // credit the remote view; a lost notification only delays
                // the peer until it reconciles against the payout counter
                if let Err(err) = self
                    .requester
                    .notify_paid(account_id, &invoice.id, budget)
                    .await
                {
                    warn!(
                        "Could not notify account {} of settlement {}: {}",
                        account_id, invoice.id, err
                    );
                }
                Ok(())
            }
            Ok(Err(err)) => Err(SettlementError::PaymentFailed(err.to_string())),
            // the engine may still complete after this; the monotonic
            // payout counter lets the peer reconcile either way
            Err(_elapsed) => Err(SettlementError::PaymentTimedOut),
        }
    }
}
