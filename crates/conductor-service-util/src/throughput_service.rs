use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_service::*;
use parking_lot::Mutex;
use tracing::debug;

/// Extension trait for [`Account`] with an optional cap on forwarded value,
/// in asset units per second.
pub trait ThroughputAccount: Account {
    fn throughput_limit(&self) -> Option<u64> {
        None
    }
}

struct AmountBucket {
    available: u64,
    last_refill: Instant,
}

#[derive(Clone, Default)]
struct AmountLimiter {
    buckets: Arc<Mutex<HashMap<AccountId, AmountBucket>>>,
}

impl AmountLimiter {
    /// Draws `amount` units from the account's bucket, refilling
    /// `limit`/second up to one second's worth of burst.
    fn check(&self, account_id: &AccountId, limit: u64, amount: u64) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(account_id.clone()).or_insert(AmountBucket {
            available: limit,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let refill = (elapsed.as_millis() as u64 / 1000).saturating_mul(limit);
            bucket.available = bucket.available.saturating_add(refill).min(limit);
            bucket.last_refill = Instant::now();
        }

        if bucket.available >= amount {
            bucket.available -= amount;
            true
        } else {
            false
        }
    }
}

/// # Throughput Service
///
/// Optional value-bandwidth cap, usable on either chain. The incoming
/// service draws from the sender's bucket, the outgoing one from the
/// receiver's.
#[derive(Clone)]
pub struct ThroughputService<S, IO> {
    store: S,
    limiter: AmountLimiter,
    next: IO,
}

impl<S, IO> ThroughputService<S, IO> {
    pub fn new(store: S, next: IO) -> Self {
        ThroughputService {
            store,
            limiter: AmountLimiter::default(),
            next,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for ThroughputService<S, I>
where
    S: AddressStore + Send + Sync + 'static,
    I: IncomingService<A> + Send + Sync + 'static,
    A: ThroughputAccount + Send + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        if let Some(limit) = request.from.throughput_limit() {
            if !self
                .limiter
                .check(request.from.id(), limit, request.prepare.amount())
            {
                debug!(
                    "Rejecting packet from account {}: throughput limit exceeded",
                    request.from.id()
                );
                return Err(RejectBuilder {
                    code: ErrorCode::T03_CONNECTOR_BUSY,
                    message: b"throughput limit exceeded",
                    triggered_by: Some(&self.store.get_ilp_address()),
                    data: &[],
                }
                .build());
            }
        }
        self.next.handle_request(request).await
    }
}

#[async_trait]
impl<S, O, A> OutgoingService<A> for ThroughputService<S, O>
where
    S: AddressStore + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Sync + 'static,
    A: ThroughputAccount + Send + Sync + 'static,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        if let Some(limit) = request.to.throughput_limit() {
            if !self
                .limiter
                .check(request.to.id(), limit, request.prepare.amount())
            {
                debug!(
                    "Rejecting packet to account {}: throughput limit exceeded",
                    request.to.id()
                );
                return Err(RejectBuilder {
                    code: ErrorCode::T03_CONNECTOR_BUSY,
                    message: b"throughput limit exceeded",
                    triggered_by: Some(&self.store.get_ilp_address()),
                    data: &[],
                }
                .build());
            }
        }
        self.next.send_request(request).await
    }
}
