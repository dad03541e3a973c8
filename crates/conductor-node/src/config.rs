use std::collections::HashMap;
use std::time::Duration;

use conductor_packet::Address;
use conductor_rates::Rate;
use conductor_service::{AccountId, AccountRelation};
use conductor_service_util::RateLimitParams;
use conductor_settlement::BalanceLimits;
use conductor_store::{AccountBuilder, ConnectorAccount};
use serde::Deserialize;

fn default_min_message_window_ms() -> u64 {
    1_000
}
fn default_route_broadcast_interval_ms() -> u64 {
    30_000
}
fn default_route_expiry_interval_ms() -> u64 {
    45_000
}
fn default_hold_down_time_ms() -> u32 {
    45_000
}
fn default_max_packet_amount() -> u64 {
    u64::max_value()
}
fn default_deduplicate_window_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

/// Process-wide configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectorConfig {
    pub ilp_address: Address,
    #[serde(default = "default_min_message_window_ms")]
    pub min_message_window_ms: u64,
    #[serde(default = "default_route_broadcast_interval_ms")]
    pub route_broadcast_interval_ms: u64,
    #[serde(default = "default_route_expiry_interval_ms")]
    pub route_expiry_interval_ms: u64,
    #[serde(default = "default_hold_down_time_ms")]
    pub hold_down_time_ms: u32,
    #[serde(default)]
    pub reflect_payments: bool,
    #[serde(default)]
    pub rates: Vec<RatePairConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl ConnectorConfig {
    pub fn new(ilp_address: Address) -> Self {
        ConnectorConfig {
            ilp_address,
            min_message_window_ms: default_min_message_window_ms(),
            route_broadcast_interval_ms: default_route_broadcast_interval_ms(),
            route_expiry_interval_ms: default_route_expiry_interval_ms(),
            hold_down_time_ms: default_hold_down_time_ms(),
            reflect_payments: false,
            rates: Vec::new(),
            accounts: Vec::new(),
        }
    }

    pub fn min_message_window(&self) -> Duration {
        Duration::from_millis(self.min_message_window_ms)
    }

    pub fn route_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.route_broadcast_interval_ms)
    }

    pub fn route_expiry_interval(&self) -> Duration {
        Duration::from_millis(self.route_expiry_interval_ms)
    }

    pub fn rate_table(&self) -> HashMap<(String, String), Rate> {
        self.rates
            .iter()
            .map(|pair| {
                (
                    (pair.from.clone(), pair.to.clone()),
                    Rate::new(pair.numer, pair.denom),
                )
            })
            .collect()
    }
}

/// One configured exchange rate: `numer/denom` destination units per
/// source unit, before scale normalization.
#[derive(Clone, Debug, Deserialize)]
pub struct RatePairConfig {
    pub from: String,
    pub to: String,
    pub numer: u64,
    pub denom: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BalanceConfig {
    pub minimum: i64,
    pub maximum: i64,
    #[serde(default)]
    pub settle_threshold: Option<i64>,
    #[serde(default)]
    pub settle_to: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitConfig {
    pub refill_period_ms: u64,
    pub refill_count: u64,
    pub capacity: u64,
}

/// Per-account configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountConfig {
    pub id: AccountId,
    pub relation: AccountRelation,
    pub asset_code: String,
    pub asset_scale: u8,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub balance: Option<BalanceConfig>,
    #[serde(default = "default_max_packet_amount")]
    pub max_packet_amount: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub throughput_limit: Option<u64>,
    #[serde(default = "default_deduplicate_window_ms")]
    pub deduplicate_window_ms: u64,
    #[serde(default)]
    pub settle_on_connect: bool,
    #[serde(default = "default_true")]
    pub send_routes: bool,
    #[serde(default = "default_true")]
    pub receive_routes: bool,
    #[serde(default)]
    pub routing_weight: u32,
}

impl AccountConfig {
    pub fn into_account(self) -> ConnectorAccount {
        let mut builder = AccountBuilder::new(self.id, &self.asset_code, self.asset_scale)
            .relation(self.relation)
            .max_packet_amount(self.max_packet_amount)
            .deduplicate_window(Duration::from_millis(self.deduplicate_window_ms))
            .settle_on_connect(self.settle_on_connect)
            .send_routes(self.send_routes)
            .receive_routes(self.receive_routes)
            .routing_weight(self.routing_weight);
        for prefix in self.routes {
            builder = builder.route(&prefix);
        }
        if let Some(balance) = self.balance {
            builder = builder.balance_limits(BalanceLimits {
                minimum: balance.minimum,
                maximum: balance.maximum,
                settle_threshold: balance.settle_threshold,
                settle_to: balance.settle_to,
            });
        }
        if let Some(rate_limit) = self.rate_limit {
            builder = builder.rate_limit(RateLimitParams {
                refill_period: Duration::from_millis(rate_limit.refill_period_ms),
                refill_count: rate_limit.refill_count,
                capacity: rate_limit.capacity,
            });
        }
        if let Some(throughput_limit) = self.throughput_limit {
            builder = builder.throughput_limit(throughput_limit);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_service::Account;
    use conductor_service_util::{MaxPacketAmountAccount, RateLimitAccount};
    use conductor_settlement::SettlementAccount;

    #[test]
    fn parses_a_full_config() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{
                "ilp_address": "example.connector",
                "min_message_window_ms": 2000,
                "reflect_payments": true,
                "rates": [
                    {"from": "ABC", "to": "XYZ", "numer": 2, "denom": 1}
                ],
                "accounts": [
                    {
                        "id": "bob",
                        "relation": "child",
                        "asset_code": "XYZ",
                        "asset_scale": 9,
                        "routes": ["example.connector.bob"],
                        "balance": {
                            "minimum": -1000,
                            "maximum": 1000,
                            "settle_threshold": -100,
                            "settle_to": 0
                        },
                        "max_packet_amount": 50,
                        "rate_limit": {
                            "refill_period_ms": 1000,
                            "refill_count": 10,
                            "capacity": 10
                        },
                        "settle_on_connect": true
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.ilp_address.as_str(), "example.connector");
        assert_eq!(config.min_message_window(), Duration::from_secs(2));
        assert!(config.reflect_payments);
        assert_eq!(
            config.rate_table()[&("ABC".to_string(), "XYZ".to_string())],
            Rate::new(2, 1)
        );

        let account = config.accounts[0].clone().into_account();
        assert_eq!(account.id().as_str(), "bob");
        assert_eq!(account.relation(), AccountRelation::Child);
        assert_eq!(account.max_packet_amount(), 50);
        assert_eq!(account.balance_limits().settle_threshold, Some(-100));
        assert_eq!(
            account.rate_limit().unwrap().refill_period,
            Duration::from_secs(1)
        );
        assert!(account.settle_on_connect());
    }

    #[test]
    fn defaults_cover_the_optional_surface() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{
                "ilp_address": "example.connector",
                "accounts": [
                    {"id": "bob", "relation": "peer", "asset_code": "XYZ", "asset_scale": 9}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.min_message_window(), Duration::from_secs(1));
        assert_eq!(config.route_broadcast_interval(), Duration::from_secs(30));
        assert!(!config.reflect_payments);

        let account = config.accounts[0].clone().into_account();
        assert_eq!(account.max_packet_amount(), u64::max_value());
        assert!(account.rate_limit().is_none());
    }
}
