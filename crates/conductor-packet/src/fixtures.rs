//! Hand-checked wire vectors shared by the packet tests.

use std::str::FromStr;
use std::time::SystemTime;

use chrono::{TimeZone, Utc};
use hex_literal::hex;
use once_cell::sync::Lazy;

use super::{Address, ErrorCode};
use super::{Fulfill, FulfillBuilder, Prepare, PrepareBuilder, Reject, RejectBuilder};

pub static DATA: &[u8] = b"abc";
pub static EXECUTION_CONDITION: [u8; 32] = [0xdd; 32];
pub static FULFILLMENT: [u8; 32] = [0xff; 32];

pub static DESTINATION: Lazy<Address> = Lazy::new(|| Address::from_str("example.bob").unwrap());
pub static TRIGGERED_BY: Lazy<Address> =
    Lazy::new(|| Address::from_str("example.connector").unwrap());

// 2018-06-21T18:23:38.558Z, i.e. the generalized-time stamp "20180621182338558"
pub static EXPIRES_AT: Lazy<SystemTime> =
    Lazy::new(|| Utc.ymd(2018, 6, 21).and_hms_milli(18, 23, 38, 558).into());

pub static PREPARE_BUILDER: Lazy<PrepareBuilder<'static>> = Lazy::new(|| PrepareBuilder {
    amount: 107,
    expires_at: *EXPIRES_AT,
    execution_condition: &EXECUTION_CONDITION,
    destination: DESTINATION.clone(),
    data: DATA,
});
pub static PREPARE: Lazy<Prepare> = Lazy::new(|| PREPARE_BUILDER.build());
// type 12, length 73, amount 107, expiry, condition, "example.bob", "abc"
pub static PREPARE_BYTES: Lazy<Vec<u8>> = Lazy::new(|| {
    hex!("0c49000000000000006b3230313830363231313832333338353538dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd0b6578616d706c652e626f6203616263")
    .to_vec()
});

pub static FULFILL_BUILDER: Lazy<FulfillBuilder<'static>> = Lazy::new(|| FulfillBuilder {
    fulfillment: &FULFILLMENT,
    data: DATA,
});
pub static FULFILL: Lazy<Fulfill> = Lazy::new(|| FULFILL_BUILDER.build());
// type 13, length 36, fulfillment, "abc"
pub static FULFILL_BYTES: Lazy<Vec<u8>> = Lazy::new(|| {
    hex!("0d24ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff03616263")
        .to_vec()
});

pub static REJECT_BUILDER: Lazy<RejectBuilder<'static>> = Lazy::new(|| RejectBuilder {
    code: ErrorCode::F02_UNREACHABLE,
    message: b"no route found",
    triggered_by: Some(&*TRIGGERED_BY),
    data: DATA,
});
pub static REJECT: Lazy<Reject> = Lazy::new(|| REJECT_BUILDER.build());
// type 14, length 40, "F02", "example.connector", "no route found", "abc"
pub static REJECT_BYTES: Lazy<Vec<u8>> = Lazy::new(|| {
    hex!("0e28463032116578616d706c652e636f6e6e6563746f720e6e6f20726f75746520666f756e6403616263")
        .to_vec()
});
