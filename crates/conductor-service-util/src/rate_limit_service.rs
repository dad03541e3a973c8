use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_service::*;
use parking_lot::Mutex;
use tracing::debug;

/// Token-bucket parameters for one account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitParams {
    /// How often tokens are added
    pub refill_period: Duration,
    /// How many tokens each refill adds
    pub refill_count: u64,
    /// Upper bound on accumulated tokens (burst size)
    pub capacity: u64,
}

/// Extension trait for [`Account`] with its rate-limit configuration.
/// `None` disables limiting for the account.
pub trait RateLimitAccount: Account {
    fn rate_limit(&self) -> Option<RateLimitParams> {
        None
    }
}

struct TokenBucket {
    tokens: u64,
    last_refill: Instant,
}

/// Per-account token buckets, shared between the data and money chains so
/// a peer cannot dodge its limit by switching protocols.
#[derive(Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<AccountId, TokenBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter::default()
    }

    /// Takes one token from the account's bucket. Returns false when the
    /// bucket is empty.
    pub fn check(&self, account_id: &AccountId, params: &RateLimitParams) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(account_id.clone()).or_insert(TokenBucket {
            tokens: params.capacity,
            last_refill: Instant::now(),
        });

        if params.refill_period > Duration::from_millis(0) {
            let elapsed_periods =
                (bucket.last_refill.elapsed().as_millis() / params.refill_period.as_millis()) as u64;
            if elapsed_periods > 0 {
                bucket.tokens = bucket
                    .tokens
                    .saturating_add(elapsed_periods.saturating_mul(params.refill_count))
                    .min(params.capacity);
                bucket.last_refill += params.refill_period * elapsed_periods as u32;
            }
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// # Rate Limit Service
///
/// Incoming middleware rejecting packets from accounts that have drained
/// their token bucket. One packet costs one token regardless of amount
/// (amount-based limiting is the throughput service's job).
#[derive(Clone)]
pub struct RateLimitService<S, I> {
    store: S,
    limiter: RateLimiter,
    next: I,
}

impl<S, I> RateLimitService<S, I> {
    pub fn new(store: S, limiter: RateLimiter, next: I) -> Self {
        RateLimitService {
            store,
            limiter,
            next,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for RateLimitService<S, I>
where
    S: AddressStore + Send + Sync + 'static,
    I: IncomingService<A> + Send + Sync + 'static,
    A: RateLimitAccount + Send + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        if let Some(params) = request.from.rate_limit() {
            if !self.limiter.check(request.from.id(), &params) {
                debug!(
                    "Rejecting packet from account {}: rate limit exceeded",
                    request.from.id()
                );
                return Err(RejectBuilder {
                    code: ErrorCode::T05_RATE_LIMITED,
                    message: &[],
                    triggered_by: Some(&self.store.get_ilp_address()),
                    data: &[],
                }
                .build());
            }
        }
        self.next.handle_request(request).await
    }
}
