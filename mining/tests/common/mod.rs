// Shared fixtures; not every test target uses every helper.
#![allow(dead_code)]

use std::path::PathBuf;

use mining::{Config, FactorConstants, ForkSchedule, PoolAddresses, Round};
use rust_decimal::Decimal;

pub const ETH_SHARE: &str = "0xaaaa000000000000000000000000000000000001";
pub const LINK_SHARE: &str = "0xaaaa000000000000000000000000000000000002";
pub const BTC_SHARE: &str = "0xaaaa000000000000000000000000000000000006";
pub const UNISWAP_MCB_ETH_SHARE: &str = "0xbbbb000000000000000000000000000000000001";
pub const UNISWAP_MCB_USDC_SHARE: &str = "0xbbbb000000000000000000000000000000000002";
pub const MCB_TOKEN: &str = "0x4e352cf164e64adcbad318c3a1e222e9eba4ce42";

pub fn dec(s: &str) -> Decimal {
    s.parse().expect("decimal literal")
}

/// A config whose forks are all far in the future; tests move the ones they
/// exercise.
pub fn base_config(round: Round) -> Config {
    Config {
        store_path: PathBuf::from("unused.db"),
        rpc_url: "http://127.0.0.1:8545".into(),
        rpc_timeout_secs: 1,
        wait_timeout_secs: 1,
        receipt_poll_secs: 1,
        chain_id: 1,
        eth_gas_url: "http://127.0.0.1:9/gas".into(),
        gas_level: "fast".into(),
        disperse_address: "0xd152f549545093347a162dce210e7293f1452150".into(),
        mcb_token_address: MCB_TOKEN.into(),
        payer_address: "0x1111111111111111111111111111111111111111".into(),
        payer_key: "0x0101010101010101010101010101010101010101010101010101010101010101".into(),
        mining_round: round,
        begin_block: 0,
        end_block: u64::MAX,
        reward_per_block: Decimal::ONE,
        maturity_blocks: 0,
        chainlink_btc_usd_address: "0xf4030086522a5beea4988f8ca5b36dbc97bee88c".into(),
        pools: PoolAddresses {
            eth_perp_share_token: ETH_SHARE.into(),
            link_perp_share_token: LINK_SHARE.into(),
            comp_perp_share_token: "0xaaaa000000000000000000000000000000000003".into(),
            lend_perp_share_token: "0xaaaa000000000000000000000000000000000004".into(),
            snx_perp_share_token: "0xaaaa000000000000000000000000000000000005".into(),
            btc_perp_share_token: BTC_SHARE.into(),
            uniswap_mcb_eth_share_token: UNISWAP_MCB_ETH_SHARE.into(),
            uniswap_mcb_usdc_share_token: UNISWAP_MCB_USDC_SHARE.into(),
        },
        forks: ForkSchedule {
            xia_rebalance_hard_fork_block: u64::MAX,
            shang_reward_link_pool_block: u64::MAX,
            shang_reward_btc_pool_block: u64::MAX,
            zhou_begin_block: u64::MAX,
            zhou_reward_comp_pool_block: u64::MAX,
            zhou_reward_lend_pool_block: u64::MAX,
            zhou_reward_snx_pool_block: u64::MAX,
            qin_begin_block: u64::MAX,
            qin_reduce_reward_block: u64::MAX,
            qin_reward_btc_pool_block: u64::MAX,
        },
        factors: FactorConstants {
            zhou_m: Decimal::TWO,
            zhou_n: Decimal::from(102_500),
            qin_m: Decimal::TWO,
            qin_n: Decimal::from(102_500),
        },
    }
}
