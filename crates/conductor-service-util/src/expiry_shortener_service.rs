use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_service::*;
use tracing::trace;

/// Never let a packet stay pending for longer than this, whatever expiry
/// the sender asked for.
pub const DEFAULT_MAX_EXPIRY_DURATION: Duration = Duration::from_secs(30);

/// # Expiry Shortener Service
///
/// Every hop subtracts its message window from the expiry before
/// forwarding, so that when a fulfillment comes back just before the
/// downstream deadline there is still time to relay it upstream. A packet
/// whose shortened expiry is not in the future is rejected with R02
/// without ever being sent.
#[derive(Clone)]
pub struct ExpiryShortenerService<S, O> {
    store: S,
    next: O,
    min_message_window: Duration,
    max_expiry_duration: Duration,
}

impl<S, O> ExpiryShortenerService<S, O> {
    pub fn new(store: S, min_message_window: Duration, next: O) -> Self {
        ExpiryShortenerService {
            store,
            next,
            min_message_window,
            max_expiry_duration: DEFAULT_MAX_EXPIRY_DURATION,
        }
    }

    pub fn max_expiry_duration(mut self, duration: Duration) -> Self {
        self.max_expiry_duration = duration;
        self
    }
}

#[async_trait]
impl<S, O, A> OutgoingService<A> for ExpiryShortenerService<S, O>
where
    S: AddressStore + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Sync + 'static,
    A: Account + Sync + 'static,
{
    async fn send_request(&mut self, mut request: OutgoingRequest<A>) -> IlpResult {
        let now = SystemTime::now();
        let shortened = request
            .prepare
            .expires_at()
            .checked_sub(self.min_message_window)
            .unwrap_or(std::time::UNIX_EPOCH);

        let latest_allowed = now + self.max_expiry_duration;
        let new_expiry = if shortened > latest_allowed {
            trace!(
                "Clamping packet expiry to {:?} in the future",
                self.max_expiry_duration
            );
            latest_allowed
        } else {
            shortened
        };

        if new_expiry <= now {
            trace!(
                "Rejecting packet to account {}: remaining timeout too small",
                request.to.id()
            );
            return Err(RejectBuilder {
                code: ErrorCode::R02_INSUFFICIENT_TIMEOUT,
                message: b"insufficient timeout for the next hop",
                triggered_by: Some(&self.store.get_ilp_address()),
                data: &[],
            }
            .build());
        }

        request.prepare.set_expires_at(new_expiry);
        self.next.send_request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{prepare, TestAccount, TestStore};
    use conductor_packet::FulfillBuilder;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn capture_expiry_next(
        captured: Arc<Mutex<Option<SystemTime>>>,
    ) -> impl OutgoingService<TestAccount> + Send + Sync + Clone {
        outgoing_service_fn(move |request: OutgoingRequest<TestAccount>| {
            *captured.lock() = Some(request.prepare.expires_at());
            Ok(FulfillBuilder {
                fulfillment: &[0; 32],
                data: &[],
            }
            .build())
        })
    }

    #[tokio::test]
    async fn shortens_expiry_by_the_message_window() {
        let captured = Arc::new(Mutex::new(None));
        let mut service = ExpiryShortenerService::new(
            TestStore,
            Duration::from_secs(1),
            capture_expiry_next(captured.clone()),
        );

        let prepare = prepare(10, Duration::from_secs(10));
        let original_expiry = prepare.expires_at();
        service
            .send_request(OutgoingRequest {
                from: TestAccount::default(),
                to: TestAccount::default(),
                original_amount: 10,
                prepare,
            })
            .await
            .unwrap();

        let forwarded = captured.lock().take().unwrap();
        assert_eq!(original_expiry.duration_since(forwarded).unwrap(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn clamps_to_the_max_expiry_duration() {
        let captured = Arc::new(Mutex::new(None));
        let mut service = ExpiryShortenerService::new(
            TestStore,
            Duration::from_secs(1),
            capture_expiry_next(captured.clone()),
        );

        service
            .send_request(OutgoingRequest {
                from: TestAccount::default(),
                to: TestAccount::default(),
                original_amount: 10,
                prepare: prepare(10, Duration::from_secs(90)),
            })
            .await
            .unwrap();

        let forwarded = captured.lock().take().unwrap();
        let remaining = forwarded.duration_since(SystemTime::now()).unwrap();
        assert!(remaining <= DEFAULT_MAX_EXPIRY_DURATION);
    }

    #[tokio::test]
    async fn rejects_r02_when_no_timeout_remains() {
        let mut service = ExpiryShortenerService::new(
            TestStore,
            Duration::from_secs(2),
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| {
                panic!("expired packet must not be forwarded")
            }),
        );

        let reject = service
            .send_request(OutgoingRequest {
                from: TestAccount::default(),
                to: TestAccount::default(),
                original_amount: 10,
                prepare: prepare(10, Duration::from_secs(1)),
            })
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::R02_INSUFFICIENT_TIMEOUT);
    }
}
