use std::str::FromStr;
use std::time::{Duration, SystemTime};

use conductor_packet::{Address, PrepareBuilder};
use conductor_service::{Account, AccountId, AccountRelation, AddressStore};

use crate::{
    DeduplicateAccount, MaxPacketAmountAccount, RateLimitAccount, RateLimitParams,
    ThroughputAccount,
};

#[derive(Clone, Debug)]
pub struct TestAccount {
    pub id: AccountId,
    pub asset_code: String,
    pub asset_scale: u8,
    pub max_packet_amount: u64,
    pub rate_limit: Option<RateLimitParams>,
    pub throughput_limit: Option<u64>,
    pub deduplicate_window: Duration,
}

impl Default for TestAccount {
    fn default() -> Self {
        TestAccount {
            id: AccountId::from_str("test-peer").unwrap(),
            asset_code: "XYZ".to_string(),
            asset_scale: 9,
            max_packet_amount: u64::max_value(),
            rate_limit: None,
            throughput_limit: None,
            deduplicate_window: Duration::from_secs(30),
        }
    }
}

impl Account for TestAccount {
    fn id(&self) -> &AccountId {
        &self.id
    }

    fn relation(&self) -> AccountRelation {
        AccountRelation::Peer
    }

    fn asset_code(&self) -> &str {
        &self.asset_code
    }

    fn asset_scale(&self) -> u8 {
        self.asset_scale
    }
}

impl MaxPacketAmountAccount for TestAccount {
    fn max_packet_amount(&self) -> u64 {
        self.max_packet_amount
    }
}

impl RateLimitAccount for TestAccount {
    fn rate_limit(&self) -> Option<RateLimitParams> {
        self.rate_limit.clone()
    }
}

impl ThroughputAccount for TestAccount {
    fn throughput_limit(&self) -> Option<u64> {
        self.throughput_limit
    }
}

impl DeduplicateAccount for TestAccount {
    fn deduplicate_window(&self) -> Duration {
        self.deduplicate_window
    }
}

#[derive(Clone)]
pub struct TestStore;

impl AddressStore for TestStore {
    fn get_ilp_address(&self) -> Address {
        Address::from_str("example.connector").unwrap()
    }
}

pub fn prepare(amount: u64, expires_in: Duration) -> conductor_packet::Prepare {
    PrepareBuilder {
        destination: Address::from_str("example.destination").unwrap(),
        amount,
        execution_condition: &[0; 32],
        expires_at: SystemTime::now() + expires_in,
        data: b"test data",
    }
    .build()
}
