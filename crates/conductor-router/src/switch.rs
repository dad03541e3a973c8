use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_service::{
    Account, AccountId, AccountStore, AddressStore, IlpResult, IncomingRequest, IncomingService,
    OutgoingService,
};
use tracing::{error, trace};

/// The routing view the switch needs: the selected-route map maintained by
/// the route manager, plus account lookup and our own address.
pub trait RouterStore: AddressStore + AccountStore {
    /// Longest-prefix-match resolution of `destination` to the next-hop
    /// account, or `None` when no route covers it.
    fn resolve_route(&self, destination: &str) -> Option<AccountId>;
}

/// The packet switch.
///
/// Implements the incoming half of end-to-end forwarding: resolve the
/// destination to an egress account, refuse to hairpin the packet back to
/// its sender unless reflection is enabled, and hand the request to the
/// outgoing chain. Everything downstream of the routing decision (rate
/// conversion, expiry math, response validation, balances) belongs to the
/// outgoing services.
#[derive(Clone)]
pub struct Switch<S, O> {
    store: S,
    next: O,
    reflect_payments: bool,
}

impl<S, O> Switch<S, O>
where
    S: RouterStore,
    O: OutgoingService<<S as AccountStore>::Account>,
{
    pub fn new(store: S, next: O) -> Self {
        Switch {
            store,
            next,
            reflect_payments: false,
        }
    }

    /// Allows routing a packet back out the account it arrived on.
    pub fn with_reflect_payments(mut self, reflect_payments: bool) -> Self {
        self.reflect_payments = reflect_payments;
        self
    }

    fn no_route(&self, destination: &str) -> conductor_packet::Reject {
        trace!("No route found for destination: {}", destination);
        RejectBuilder {
            code: ErrorCode::F02_UNREACHABLE,
            message: b"no route to destination",
            triggered_by: Some(&self.store.get_ilp_address()),
            data: &[],
        }
        .build()
    }
}

#[async_trait]
impl<S, O, A> IncomingService<A> for Switch<S, O>
where
    S: RouterStore + AccountStore<Account = A> + Send + Sync + 'static,
    O: OutgoingService<A> + Clone + Send + Sync + 'static,
    A: Account + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let destination = request.prepare.destination();

        let next_hop = match self.store.resolve_route(destination.as_str()) {
            Some(account_id) => account_id,
            None => return Err(self.no_route(destination.as_str())),
        };

        if &next_hop == request.from.id() && !self.reflect_payments {
            trace!(
                "Refusing to reflect packet for {} back to account {}",
                destination,
                next_hop
            );
            return Err(self.no_route(destination.as_str()));
        }

        let to = match self.store.get_account(&next_hop).await {
            Ok(account) => account,
            Err(err) => {
                // the routing table should only ever name live accounts
                error!("Route for {} names unknown account: {}", destination, err);
                return Err(self.no_route(destination.as_str()));
            }
        };

        trace!(
            "Forwarding packet for {} from account {} to account {}",
            destination,
            request.from.id(),
            to.id()
        );
        let mut next = self.next.clone();
        next.send_request(request.into_outgoing(to)).await
    }
}
