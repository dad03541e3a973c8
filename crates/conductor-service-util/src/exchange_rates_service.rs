use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_rates::{convert, ConversionError, RateBackend};
use conductor_service::*;
use std::marker::PhantomData;
use tracing::{error, trace};

/// # Exchange Rate Service
///
/// Outgoing middleware that rewrites the prepare amount from the source
/// asset into the destination asset: multiply by the quoted rational rate,
/// re-scale by the two asset scales and floor toward zero. A positive
/// amount that floors to zero is rejected with R01 so the sender can send
/// more per packet instead of silently donating value.
#[derive(Clone)]
pub struct ExchangeRateService<S, R, O, A> {
    store: S,
    rates: R,
    next: O,
    account_type: PhantomData<A>,
}

impl<S, R, O, A> ExchangeRateService<S, R, O, A>
where
    S: AddressStore,
    R: RateBackend,
    O: OutgoingService<A>,
    A: Account,
{
    pub fn new(store: S, rates: R, next: O) -> Self {
        ExchangeRateService {
            store,
            rates,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, R, O, A> OutgoingService<A> for ExchangeRateService<S, R, O, A>
where
    S: AddressStore + Send + Sync + 'static,
    R: RateBackend + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Sync + 'static,
    A: Account + Sync + 'static,
{
    async fn send_request(&mut self, mut request: OutgoingRequest<A>) -> IlpResult {
        if request.prepare.amount() > 0 {
            let ilp_address = self.store.get_ilp_address();
            let rate = match self
                .rates
                .rate(request.from.asset_code(), request.to.asset_code())
            {
                Some(rate) => rate,
                None => {
                    error!(
                        "No exchange rate available for pair {}/{}",
                        request.from.asset_code(),
                        request.to.asset_code()
                    );
                    return Err(RejectBuilder {
                        code: ErrorCode::T00_INTERNAL_ERROR,
                        message: format!(
                            "no exchange rate available from asset: {} to: {}",
                            request.from.asset_code(),
                            request.to.asset_code()
                        )
                        .as_bytes(),
                        triggered_by: Some(&ilp_address),
                        data: &[],
                    }
                    .build());
                }
            };

            let outgoing_amount = match convert(
                request.prepare.amount(),
                rate,
                request.from.asset_scale(),
                request.to.asset_scale(),
            ) {
                Ok(0) => {
                    return Err(RejectBuilder {
                        code: ErrorCode::R01_INSUFFICIENT_SOURCE_AMOUNT,
                        message: b"source amount too small after conversion",
                        triggered_by: Some(&ilp_address),
                        data: &[],
                    }
                    .build());
                }
                Ok(amount) => amount,
                Err(ConversionError::Overflow) => {
                    return Err(RejectBuilder {
                        code: ErrorCode::F08_AMOUNT_TOO_LARGE,
                        message: b"amount overflowed during conversion",
                        triggered_by: Some(&ilp_address),
                        data: &[],
                    }
                    .build());
                }
                Err(err) => {
                    return Err(RejectBuilder {
                        code: ErrorCode::T00_INTERNAL_ERROR,
                        message: err.to_string().as_bytes(),
                        triggered_by: Some(&ilp_address),
                        data: &[],
                    }
                    .build());
                }
            };

            trace!(
                "Converted {} {} (scale {}) to {} {} (scale {})",
                request.original_amount,
                request.from.asset_code(),
                request.from.asset_scale(),
                outgoing_amount,
                request.to.asset_code(),
                request.to.asset_scale()
            );
            request.prepare.set_amount(outgoing_amount);
        }

        self.next.send_request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{prepare, TestAccount, TestStore};
    use conductor_packet::FulfillBuilder;
    use conductor_rates::{Rate, StaticRateBackend};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn rates() -> StaticRateBackend {
        let mut rates = HashMap::new();
        rates.insert(("ABC".to_string(), "XYZ".to_string()), Rate::new(1, 2));
        StaticRateBackend::new(rates)
    }

    fn account(code: &str, scale: u8) -> TestAccount {
        TestAccount {
            asset_code: code.to_string(),
            asset_scale: scale,
            ..TestAccount::default()
        }
    }

    async fn run(
        from: TestAccount,
        to: TestAccount,
        amount: u64,
    ) -> (IlpResult, Arc<Mutex<Option<u64>>>) {
        let forwarded = Arc::new(Mutex::new(None));
        let forwarded_clone = forwarded.clone();
        let mut service = ExchangeRateService::new(
            TestStore,
            rates(),
            outgoing_service_fn(move |request: OutgoingRequest<TestAccount>| {
                *forwarded_clone.lock() = Some(request.prepare.amount());
                Ok(FulfillBuilder {
                    fulfillment: &[0; 32],
                    data: &[],
                }
                .build())
            }),
        );
        let result = service
            .send_request(OutgoingRequest {
                from,
                to,
                original_amount: amount,
                prepare: prepare(amount, Duration::from_secs(30)),
            })
            .await;
        (result, forwarded)
    }

    #[tokio::test]
    async fn applies_the_pair_rate() {
        let (result, forwarded) = run(account("ABC", 0), account("XYZ", 0), 200).await;
        assert!(result.is_ok());
        assert_eq!(forwarded.lock().take(), Some(100));
    }

    #[tokio::test]
    async fn same_asset_is_identity() {
        let (result, forwarded) = run(account("XYZ", 0), account("XYZ", 0), 100).await;
        assert!(result.is_ok());
        assert_eq!(forwarded.lock().take(), Some(100));
    }

    #[tokio::test]
    async fn applies_scale_differences() {
        let (result, forwarded) = run(account("XYZ", 0), account("XYZ", 2), 3).await;
        assert!(result.is_ok());
        assert_eq!(forwarded.lock().take(), Some(300));
    }

    #[tokio::test]
    async fn rejects_r01_when_the_amount_floors_to_zero() {
        let (result, forwarded) = run(account("ABC", 0), account("XYZ", 0), 1).await;
        let reject = result.unwrap_err();
        assert_eq!(reject.code(), ErrorCode::R01_INSUFFICIENT_SOURCE_AMOUNT);
        assert_eq!(forwarded.lock().take(), None);
    }

    #[tokio::test]
    async fn rejects_t00_for_unknown_pairs() {
        let (result, _) = run(account("QQQ", 0), account("XYZ", 0), 100).await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::T00_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn zero_amount_packets_skip_conversion() {
        let (result, forwarded) = run(account("QQQ", 0), account("XYZ", 0), 0).await;
        assert!(result.is_ok());
        assert_eq!(forwarded.lock().take(), Some(0));
    }
}
