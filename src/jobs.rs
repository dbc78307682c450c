use super::*;

mod btc;
pub(crate) mod eth;

pub(crate) use {
    btc::JobBtc,
    eth::{JobEth, JobIdRing, diff_to_target_eth, is_fake_pow_hash},
};
