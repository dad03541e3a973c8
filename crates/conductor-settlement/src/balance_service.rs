use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_service::*;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::balance::{BalanceLimits, BalanceTracker};

/// Extension trait for [`Account`] with its settlement configuration.
pub trait SettlementAccount: Account {
    fn balance_limits(&self) -> &BalanceLimits;

    /// Run a settlement check as soon as the account connects.
    fn settle_on_connect(&self) -> bool {
        false
    }
}

/// Hands out the per-account balance trackers.
pub trait BalanceStore {
    fn balance_tracker(&self, account_id: &AccountId) -> Option<BalanceTracker>;
}

/// # Balance Service
///
/// Outgoing middleware doing the bilateral accounting around each
/// forwarded packet:
///
/// - before forwarding, credit the ingress account by the original amount
///   (the sender owes us for the packet we are about to pay for); reject
///   T04 when that would blow through the account's maximum;
/// - on FULFILL, debit the egress account by the outgoing amount (we owe
///   them for paying out downstream), record it as owed, and nudge the
///   settlement controller;
/// - on REJECT or timeout, revert the ingress credit.
///
/// At every quiescent point the two balances conserve: a fulfilled packet
/// moved `original_amount` in and `prepare.amount` out, a failed one moved
/// nothing.
#[derive(Clone)]
pub struct BalanceService<S, O, A> {
    store: S,
    next: O,
    settle_notify: Option<mpsc::UnboundedSender<AccountId>>,
    account_type: PhantomData<A>,
}

impl<S, O, A> BalanceService<S, O, A>
where
    S: AddressStore + BalanceStore,
    O: OutgoingService<A>,
    A: SettlementAccount,
{
    /// `settle_notify` feeds account ids whose balance may need settling
    /// to the controller loop; `None` disables settlement entirely (e.g.
    /// in pure-forwarding tests).
    pub fn new(
        store: S,
        settle_notify: Option<mpsc::UnboundedSender<AccountId>>,
        next: O,
    ) -> Self {
        BalanceService {
            store,
            next,
            settle_notify,
            account_type: PhantomData,
        }
    }

    fn nudge_settlement(&self, account_id: &AccountId) {
        if let Some(sender) = &self.settle_notify {
            // a full or closed channel only delays settlement until the
            // next trigger
            if sender.send(account_id.clone()).is_err() {
                trace!("Settlement notification channel closed");
            }
        }
    }
}

#[async_trait]
impl<S, O, A> OutgoingService<A> for BalanceService<S, O, A>
where
    S: AddressStore + BalanceStore + Clone + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Sync + 'static,
    A: SettlementAccount + Sync + 'static,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let incoming_amount = request.original_amount;
        let outgoing_amount = request.prepare.amount();
        // zero-value packets (e.g. quotes, protocol chatter) skip the
        // ledger entirely
        if incoming_amount == 0 && outgoing_amount == 0 {
            return self.next.send_request(request).await;
        }

        let ilp_address = self.store.get_ilp_address();
        let from_tracker = self.store.balance_tracker(request.from.id());
        let to_tracker = self.store.balance_tracker(request.to.id());
        let (from_tracker, to_tracker) = match (from_tracker, to_tracker) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                error!(
                    "Missing balance tracker for account {} or {}",
                    request.from.id(),
                    request.to.id()
                );
                return Err(RejectBuilder {
                    code: ErrorCode::T00_INTERNAL_ERROR,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build());
            }
        };

        if from_tracker.add_balance(incoming_amount).is_err() {
            debug!(
                "Rejecting packet from account {}: balance limit would be exceeded",
                request.from.id()
            );
            return Err(RejectBuilder {
                code: ErrorCode::T04_INSUFFICIENT_LIQUIDITY,
                message: &[],
                triggered_by: Some(&ilp_address),
                data: &[],
            }
            .build());
        }

        let to_account_id = request.to.id().clone();
        match self.next.send_request(request).await {
            Ok(fulfill) => {
                if outgoing_amount > 0 {
                    // the fulfillment is already binding upstream, so the
                    // egress debit must go through even at the bound
                    if to_tracker.sub_balance(outgoing_amount).is_err() {
                        error!(
                            "Egress debit of {} for account {} breaches its minimum; applying anyway",
                            outgoing_amount, to_account_id
                        );
                        to_tracker.debit_unchecked(outgoing_amount);
                    }
                    to_tracker.add_owed(outgoing_amount);
                    self.nudge_settlement(&to_account_id);
                }
                Ok(fulfill)
            }
            Err(reject) => {
                from_tracker.debit_unchecked(incoming_amount);
                Err(reject)
            }
        }
    }
}
