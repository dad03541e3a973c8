//! # conductor-service-util
//!
//! The standard middlewares. Each one wraps a `next` service and is
//! assembled into a per-account chain once, at account-connect time:
//!
//! - incoming data: validator (expiry) -> rate limit -> max packet -> throughput
//! - outgoing data: exchange rate -> expiry shortener -> deduplicate ->
//!   balance (from `conductor-settlement`) -> throughput -> validator
//!   (hop timeout + fulfillment check) -> link
//!
//! Middlewares share no mutable state with one another; each owns its own
//! collaborator (bucket, cache) keyed by account id.

mod deduplicate_service;
mod exchange_rates_service;
mod expiry_shortener_service;
mod max_packet_amount_service;
mod rate_limit_service;
mod throughput_service;
mod validator_service;

pub use deduplicate_service::{DeduplicateAccount, DeduplicateService};
pub use exchange_rates_service::ExchangeRateService;
pub use expiry_shortener_service::{ExpiryShortenerService, DEFAULT_MAX_EXPIRY_DURATION};
pub use max_packet_amount_service::{MaxPacketAmountAccount, MaxPacketAmountService};
pub use rate_limit_service::{RateLimitAccount, RateLimitParams, RateLimiter, RateLimitService};
pub use throughput_service::{ThroughputAccount, ThroughputService};
pub use validator_service::ValidatorService;

#[cfg(test)]
mod test_helpers;
