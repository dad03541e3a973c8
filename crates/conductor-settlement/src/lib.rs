//! # conductor-settlement
//!
//! Everything about money that is not packet forwarding.
//!
//! Each account has a [`BalanceTracker`]: the only write paths to the
//! bilateral balance, enforcing the configured bounds and persisting a
//! snapshot on every mutation. The [`BalanceService`] middleware drives the
//! tracker from the packet pipeline (optimistic add on prepare, commit on
//! fulfill, revert on reject). The [`SettlementController`] watches the
//! balance and, when it crosses the settle threshold, requests a payment
//! artifact from the peer and pays it through the [`SettlementEngine`]
//! capability, with at most one outstanding payment per account.

mod balance;
mod balance_service;
mod controller;
mod engine;

pub use balance::{
    AccountSnapshot, BalanceError, BalanceLimits, BalanceLimitsError, BalanceTracker,
    SnapshotStore,
};
pub use balance_service::{BalanceService, BalanceStore, SettlementAccount};
pub use controller::{ArtifactRequester, SettlementController, SettlementError};
pub use engine::{EngineError, EngineIdentity, InvoiceRequest, InvoiceResponse, SettlementEngine};
