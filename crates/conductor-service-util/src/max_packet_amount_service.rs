use async_trait::async_trait;
use conductor_packet::{ErrorCode, MaxPacketAmountDetails, RejectBuilder};
use conductor_service::*;
use tracing::debug;

/// Extension trait for [`Account`] with the maximum packet value this node
/// will forward for the account.
pub trait MaxPacketAmountAccount: Account {
    fn max_packet_amount(&self) -> u64;
}

/// # MaxPacketAmount Service
///
/// Incoming middleware enforcing the per-account packet value ceiling.
/// Over-limit packets are rejected with F08 and a data field encoding the
/// received amount and the ceiling, so senders can right-size their
/// packets instead of probing.
#[derive(Clone)]
pub struct MaxPacketAmountService<S, I> {
    store: S,
    next: I,
}

impl<S, I> MaxPacketAmountService<S, I> {
    pub fn new(store: S, next: I) -> Self {
        MaxPacketAmountService { store, next }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for MaxPacketAmountService<S, I>
where
    S: AddressStore + Send + Sync + 'static,
    I: IncomingService<A> + Send + Sync + 'static,
    A: MaxPacketAmountAccount + Send + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let max_packet_amount = request.from.max_packet_amount();
        if request.prepare.amount() <= max_packet_amount {
            return self.next.handle_request(request).await;
        }

        debug!(
            "Rejecting packet from account {}: amount {} exceeds max packet amount {}",
            request.from.id(),
            request.prepare.amount(),
            max_packet_amount
        );
        let details =
            MaxPacketAmountDetails::new(request.prepare.amount(), max_packet_amount).to_bytes();
        Err(RejectBuilder {
            code: ErrorCode::F08_AMOUNT_TOO_LARGE,
            message: &[],
            triggered_by: Some(&self.store.get_ilp_address()),
            data: &details[..],
        }
        .build())
    }
}
