//! # conductor-rates
//!
//! Quotes exchange rates for ordered asset pairs.
//!
//! Rates are rationals rather than floats so that the forwarding pipeline
//! can floor exactly: the outgoing amount of a packet is
//! `floor(amount * numer * 10^to_scale / (denom * 10^from_scale))`, all in
//! u128 arithmetic. The backend is read-only between reloads and a reload
//! swaps the whole table atomically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// An exchange rate as a ratio of destination units per source unit,
/// before asset-scale normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub numer: u64,
    pub denom: u64,
}

impl Rate {
    pub const ONE: Rate = Rate { numer: 1, denom: 1 };

    pub fn new(numer: u64, denom: u64) -> Self {
        debug_assert!(denom > 0);
        Rate { numer, denom }
    }

    /// The same rate looking the other way down the pair.
    pub fn invert(self) -> Self {
        Rate {
            numer: self.denom,
            denom: self.numer,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("no rate configured for pair {0}/{1}")]
    PairNotFound(String, String),
    #[error("conversion overflowed")]
    Overflow,
}

/// Quotes a rate for an ordered asset pair.
///
/// Implementations must be cheap to clone and safe to call from every
/// packet in flight; the static backend below keeps the table behind an
/// `Arc` swap.
pub trait RateBackend: Clone {
    /// Returns the rate for converting `from_code` units into `to_code`
    /// units, or `None` when the pair is unknown. Identical codes always
    /// quote 1/1.
    fn rate(&self, from_code: &str, to_code: &str) -> Option<Rate>;
}

/// Converts `amount` of the source asset into destination units, flooring
/// toward zero. The caller decides what a zero result means (the switch
/// rejects R01 when a positive amount floors to zero).
pub fn convert(
    amount: u64,
    rate: Rate,
    from_scale: u8,
    to_scale: u8,
) -> Result<u64, ConversionError> {
    if rate.denom == 0 {
        return Err(ConversionError::Overflow);
    }
    let numer_scale = pow10(to_scale)?;
    let denom_scale = pow10(from_scale)?;

    let numerator = (amount as u128)
        .checked_mul(rate.numer as u128)
        .and_then(|n| n.checked_mul(numer_scale))
        .ok_or(ConversionError::Overflow)?;
    let denominator = (rate.denom as u128)
        .checked_mul(denom_scale)
        .ok_or(ConversionError::Overflow)?;

    let converted = numerator / denominator;
    if converted > u64::max_value() as u128 {
        Err(ConversionError::Overflow)
    } else {
        Ok(converted as u64)
    }
}

fn pow10(scale: u8) -> Result<u128, ConversionError> {
    10u128
        .checked_pow(scale as u32)
        .ok_or(ConversionError::Overflow)
}

/// A rate backend loaded from configuration.
///
/// Lookups check the pair as configured and then the inverted pair, so
/// `BTC/USD` only needs to be configured once.
#[derive(Clone, Default)]
pub struct StaticRateBackend {
    rates: Arc<RwLock<Arc<HashMap<(String, String), Rate>>>>,
}

impl StaticRateBackend {
    pub fn new(rates: HashMap<(String, String), Rate>) -> Self {
        StaticRateBackend {
            rates: Arc::new(RwLock::new(Arc::new(rates))),
        }
    }

    /// Atomically replaces the whole table. In-flight lookups keep reading
    /// the table they already resolved.
    pub fn reload(&self, rates: HashMap<(String, String), Rate>) {
        debug!("Reloading rate table with {} pairs", rates.len());
        *self.rates.write() = Arc::new(rates);
    }
}

impl RateBackend for StaticRateBackend {
    fn rate(&self, from_code: &str, to_code: &str) -> Option<Rate> {
        if from_code == to_code {
            return Some(Rate::ONE);
        }
        let rates = self.rates.read().clone();
        if let Some(rate) = rates.get(&(from_code.to_string(), to_code.to_string())) {
            return Some(*rate);
        }
        rates
            .get(&(to_code.to_string(), from_code.to_string()))
            .map(|rate| rate.invert())
    }
}
