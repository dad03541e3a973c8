use std::time::Duration;

use conductor_ccp::RoutingAccount;
use conductor_service::{Account, AccountId, AccountRelation};
use conductor_service_util::{
    DeduplicateAccount, MaxPacketAmountAccount, RateLimitAccount, RateLimitParams,
    ThroughputAccount,
};
use conductor_settlement::{BalanceLimits, SettlementAccount};

/// A peer account with every configured attribute the pipelines read.
#[derive(Clone, Debug)]
pub struct ConnectorAccount {
    id: AccountId,
    relation: AccountRelation,
    asset_code: String,
    asset_scale: u8,
    /// Address prefixes this account terminates; they become configured
    /// routes that always beat advertised ones
    routes: Vec<String>,
    max_packet_amount: u64,
    rate_limit: Option<RateLimitParams>,
    throughput_limit: Option<u64>,
    deduplicate_window: Duration,
    balance_limits: BalanceLimits,
    settle_on_connect: bool,
    send_routes: bool,
    receive_routes: bool,
    routing_weight: u32,
}

impl ConnectorAccount {
    pub fn routes(&self) -> &[String] {
        &self.routes
    }
}

impl Account for ConnectorAccount {
    fn id(&self) -> &AccountId {
        &self.id
    }

    fn relation(&self) -> AccountRelation {
        self.relation
    }

    fn asset_code(&self) -> &str {
        &self.asset_code
    }

    fn asset_scale(&self) -> u8 {
        self.asset_scale
    }
}

impl MaxPacketAmountAccount for ConnectorAccount {
    fn max_packet_amount(&self) -> u64 {
        self.max_packet_amount
    }
}

impl RateLimitAccount for ConnectorAccount {
    fn rate_limit(&self) -> Option<RateLimitParams> {
        self.rate_limit.clone()
    }
}

impl ThroughputAccount for ConnectorAccount {
    fn throughput_limit(&self) -> Option<u64> {
        self.throughput_limit
    }
}

impl DeduplicateAccount for ConnectorAccount {
    fn deduplicate_window(&self) -> Duration {
        self.deduplicate_window
    }
}

impl RoutingAccount for ConnectorAccount {
    fn should_send_routes(&self) -> bool {
        self.send_routes
    }

    fn should_receive_routes(&self) -> bool {
        self.receive_routes
    }

    fn routing_weight(&self) -> u32 {
        self.routing_weight
    }
}

impl SettlementAccount for ConnectorAccount {
    fn balance_limits(&self) -> &BalanceLimits {
        &self.balance_limits
    }

    fn settle_on_connect(&self) -> bool {
        self.settle_on_connect
    }
}

/// Builder for [`ConnectorAccount`]. Everything but the id, asset and
/// relation has a workable default.
pub struct AccountBuilder {
    account: ConnectorAccount,
}

impl AccountBuilder {
    pub fn new(id: AccountId, asset_code: &str, asset_scale: u8) -> Self {
        AccountBuilder {
            account: ConnectorAccount {
                id,
                relation: AccountRelation::Peer,
                asset_code: asset_code.to_string(),
                asset_scale,
                routes: Vec::new(),
                max_packet_amount: u64::max_value(),
                rate_limit: None,
                throughput_limit: None,
                deduplicate_window: Duration::from_secs(30),
                balance_limits: BalanceLimits {
                    minimum: i64::min_value(),
                    maximum: i64::max_value(),
                    settle_threshold: None,
                    settle_to: 0,
                },
                settle_on_connect: false,
                send_routes: true,
                receive_routes: true,
                routing_weight: 0,
            },
        }
    }

    pub fn relation(mut self, relation: AccountRelation) -> Self {
        self.account.relation = relation;
        self
    }

    pub fn route(mut self, prefix: &str) -> Self {
        self.account.routes.push(prefix.to_string());
        self
    }

    pub fn max_packet_amount(mut self, max_packet_amount: u64) -> Self {
        self.account.max_packet_amount = max_packet_amount;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitParams) -> Self {
        self.account.rate_limit = Some(rate_limit);
        self
    }

    pub fn throughput_limit(mut self, throughput_limit: u64) -> Self {
        self.account.throughput_limit = Some(throughput_limit);
        self
    }

    pub fn deduplicate_window(mut self, window: Duration) -> Self {
        self.account.deduplicate_window = window;
        self
    }

    pub fn balance_limits(mut self, balance_limits: BalanceLimits) -> Self {
        self.account.balance_limits = balance_limits;
        self
    }

    pub fn settle_on_connect(mut self, settle_on_connect: bool) -> Self {
        self.account.settle_on_connect = settle_on_connect;
        self
    }

    pub fn send_routes(mut self, send_routes: bool) -> Self {
        self.account.send_routes = send_routes;
        self
    }

    pub fn receive_routes(mut self, receive_routes: bool) -> Self {
        self.account.receive_routes = receive_routes;
        self
    }

    pub fn routing_weight(mut self, routing_weight: u32) -> Self {
        self.account.routing_weight = routing_weight;
        self
    }

    pub fn build(self) -> ConnectorAccount {
        self.account
    }
}
