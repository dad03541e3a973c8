use std::marker::PhantomData;
use std::time::SystemTime;

use async_trait::async_trait;
use conductor_packet::{ErrorCode, Reject, RejectBuilder};
use conductor_service::*;
use ring::digest::{digest, SHA256};
use tokio::time::timeout;
use tracing::{debug, warn};

/// # Validator Service
///
/// The paranoid bookends of a pipeline.
///
/// The incoming half refuses packets that are already expired. The
/// outgoing half enforces the hop deadline (answering R00 locally even if
/// the downstream never does), verifies that a returned fulfillment is the
/// SHA-256 preimage of the execution condition, and stamps `triggered_by`
/// onto rejects that arrived without one.
#[derive(Clone)]
pub struct ValidatorService<S, IO, A> {
    store: S,
    next: IO,
    account_type: PhantomData<A>,
}

impl<S, I, A> ValidatorService<S, I, A>
where
    S: AddressStore,
    I: IncomingService<A>,
    A: Account,
{
    pub fn incoming(store: S, next: I) -> Self {
        ValidatorService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

impl<S, O, A> ValidatorService<S, O, A>
where
    S: AddressStore,
    O: OutgoingService<A>,
    A: Account,
{
    pub fn outgoing(store: S, next: O) -> Self {
        ValidatorService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for ValidatorService<S, I, A>
where
    S: AddressStore + Send + Sync + 'static,
    I: IncomingService<A> + Send + Sync + 'static,
    A: Account + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let expires_at = request.prepare.expires_at();
        if expires_at >= SystemTime::now() {
            self.next.handle_request(request).await
        } else {
            debug!(
                "Rejecting expired packet from account {} (expired at {:?})",
                request.from.id(),
                expires_at
            );
            Err(RejectBuilder {
                code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                message: &[],
                triggered_by: Some(&self.store.get_ilp_address()),
                data: &[],
            }
            .build())
        }
    }
}

#[async_trait]
impl<S, O, A> OutgoingService<A> for ValidatorService<S, O, A>
where
    S: AddressStore + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Sync + 'static,
    A: Account + Sync + 'static,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let mut condition: [u8; 32] = [0; 32];
        condition.copy_from_slice(request.prepare.execution_condition());
        let ilp_address = self.store.get_ilp_address();

        let time_left = match request
            .prepare
            .expires_at()
            .duration_since(SystemTime::now())
        {
            Ok(time_left) => time_left,
            Err(_) => {
                debug!(
                    "Not forwarding already-expired packet to account {}",
                    request.to.id()
                );
                return Err(RejectBuilder {
                    code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build());
            }
        };

        let destination = request.to.id().clone();
        let result = match timeout(time_left, self.next.send_request(request)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                debug!(
                    "Request to account {} timed out after {:?}",
                    destination, time_left
                );
                return Err(RejectBuilder {
                    code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build());
            }
        };

        match result {
            Ok(fulfill) => {
                let preimage_digest = digest(&SHA256, fulfill.fulfillment());
                if preimage_digest.as_ref() == condition {
                    Ok(fulfill)
                } else {
                    warn!(
                        "Fulfillment from account {} did not match condition. fulfillment: {}, condition: {}",
                        destination,
                        hex::encode(fulfill.fulfillment()),
                        hex::encode(&condition[..])
                    );
                    Err(RejectBuilder {
                        code: ErrorCode::F05_WRONG_CONDITION,
                        message: b"fulfillment did not match condition",
                        triggered_by: Some(&ilp_address),
                        data: &[],
                    }
                    .build())
                }
            }
            Err(reject) => Err(restamp_triggered_by(reject, &ilp_address)),
        }
    }
}

/// Downstream rejects are relayed unchanged except that an absent
/// `triggered_by` is filled in with our own address, so the original
/// sender always learns where the failure surfaced.
fn restamp_triggered_by(reject: Reject, ilp_address: &conductor_packet::Address) -> Reject {
    if reject.triggered_by().is_some() {
        reject
    } else {
        RejectBuilder {
            code: reject.code(),
            message: reject.message(),
            triggered_by: Some(ilp_address),
            data: reject.data(),
        }
        .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{prepare, TestAccount, TestStore};
    use conductor_packet::FulfillBuilder;
    use std::time::Duration;

    fn outgoing_request(expires_in: Duration) -> OutgoingRequest<TestAccount> {
        OutgoingRequest {
            from: TestAccount::default(),
            to: TestAccount::default(),
            original_amount: 10,
            prepare: prepare(10, expires_in),
        }
    }

    #[tokio::test]
    async fn incoming_rejects_expired_packets() {
        let mut validator = ValidatorService::incoming(
            TestStore,
            incoming_service_fn(|_: IncomingRequest<TestAccount>| {
                panic!("expired packet must not pass")
            }),
        );

        let mut old = prepare(10, Duration::from_secs(30));
        old.set_expires_at(SystemTime::now() - Duration::from_secs(1));
        let reject = validator
            .handle_request(IncomingRequest {
                from: TestAccount::default(),
                prepare: old,
            })
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::R00_TRANSFER_TIMED_OUT);
    }

    #[tokio::test]
    async fn outgoing_accepts_matching_fulfillments() {
        // the all-zero preimage hashes to this condition
        let condition: [u8; 32] = {
            let mut condition = [0; 32];
            condition.copy_from_slice(digest(&SHA256, &[0u8; 32]).as_ref());
            condition
        };

        let mut validator = ValidatorService::outgoing(
            TestStore,
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| {
                Ok(FulfillBuilder {
                    fulfillment: &[0; 32],
                    data: &[],
                }
                .build())
            }),
        );

        let mut request = outgoing_request(Duration::from_secs(5));
        let destination = request.prepare.destination();
        request.prepare = conductor_packet::PrepareBuilder {
            destination,
            amount: 10,
            execution_condition: &condition,
            expires_at: SystemTime::now() + Duration::from_secs(5),
            data: &[],
        }
        .build();

        assert!(validator.send_request(request).await.is_ok());
    }

    #[tokio::test]
    async fn outgoing_rejects_f05_on_wrong_fulfillment() {
        let mut validator = ValidatorService::outgoing(
            TestStore,
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| {
                Ok(FulfillBuilder {
                    fulfillment: &[9; 32],
                    data: &[],
                }
                .build())
            }),
        );

        let reject = validator
            .send_request(outgoing_request(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::F05_WRONG_CONDITION);
    }

    #[tokio::test]
    async fn outgoing_rejects_r00_when_the_downstream_is_slow() {
        let mut validator = ValidatorService::outgoing(
            TestStore,
            TestSlowService,
        );

        let reject = validator
            .send_request(outgoing_request(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::R00_TRANSFER_TIMED_OUT);
    }

    #[derive(Clone)]
    struct TestSlowService;

    #[async_trait]
    impl OutgoingService<TestAccount> for TestSlowService {
        async fn send_request(&mut self, _request: OutgoingRequest<TestAccount>) -> IlpResult {
            tokio::time::delay_for(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn restamps_missing_triggered_by() {
        let mut validator = ValidatorService::outgoing(
            TestStore,
            outgoing_service_fn(|_: OutgoingRequest<TestAccount>| {
                Err(RejectBuilder {
                    code: ErrorCode::F02_UNREACHABLE,
                    message: b"downstream failure",
                    triggered_by: None,
                    data: &[],
                }
                .build())
            }),
        );

        let reject = validator
            .send_request(outgoing_request(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::F02_UNREACHABLE);
        assert_eq!(
            reject.triggered_by().unwrap().as_str(),
            "example.connector"
        );
        assert_eq!(reject.message(), b"downstream failure");
    }
}
