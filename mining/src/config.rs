use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};
use crate::round::Round;

/// Share-token addresses of every pool that ever earned rewards, lowercased
/// on load so they compare equal to watcher-populated rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolAddresses {
    pub eth_perp_share_token: String,
    pub link_perp_share_token: String,
    pub comp_perp_share_token: String,
    pub lend_perp_share_token: String,
    pub snx_perp_share_token: String,
    pub btc_perp_share_token: String,
    pub uniswap_mcb_eth_share_token: String,
    pub uniswap_mcb_usdc_share_token: String,
}

/// Block numbers of every hard fork that changed pool composition or the
/// reward formula. All comparisons against these are `>=`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForkSchedule {
    pub xia_rebalance_hard_fork_block: u64,
    pub shang_reward_link_pool_block: u64,
    pub shang_reward_btc_pool_block: u64,
    pub zhou_begin_block: u64,
    pub zhou_reward_comp_pool_block: u64,
    pub zhou_reward_lend_pool_block: u64,
    pub zhou_reward_snx_pool_block: u64,
    pub qin_begin_block: u64,
    pub qin_reduce_reward_block: u64,
    pub qin_reward_btc_pool_block: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FactorConstants {
    pub zhou_m: Decimal,
    pub zhou_n: Decimal,
    pub qin_m: Decimal,
    pub qin_n: Decimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub store_path: PathBuf,

    pub rpc_url: String,
    pub rpc_timeout_secs: u64,
    pub wait_timeout_secs: u64,
    pub receipt_poll_secs: u64,
    pub chain_id: u64,

    pub eth_gas_url: String,
    pub gas_level: String,

    pub disperse_address: String,
    pub mcb_token_address: String,
    pub payer_address: String,
    pub payer_key: String,

    pub mining_round: Round,
    pub begin_block: u64,
    pub end_block: u64,
    pub reward_per_block: Decimal,
    pub maturity_blocks: u64,

    pub chainlink_btc_usd_address: String,

    pub pools: PoolAddresses,
    pub forks: ForkSchedule,
    pub factors: FactorConstants,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> MiningResult<Self> {
        let bytes = fs::read(path.as_ref())
            .map_err(|err| MiningError::Config(format!("read {}: {err}", path.as_ref().display())))?;
        let mut config: Config = serde_json::from_slice(&bytes)
            .map_err(|err| MiningError::Config(format!("parse config: {err}")))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for addr in [
            &mut self.disperse_address,
            &mut self.mcb_token_address,
            &mut self.payer_address,
            &mut self.chainlink_btc_usd_address,
            &mut self.pools.eth_perp_share_token,
            &mut self.pools.link_perp_share_token,
            &mut self.pools.comp_perp_share_token,
            &mut self.pools.lend_perp_share_token,
            &mut self.pools.snx_perp_share_token,
            &mut self.pools.btc_perp_share_token,
            &mut self.pools.uniswap_mcb_eth_share_token,
            &mut self.pools.uniswap_mcb_usdc_share_token,
        ] {
            *addr = addr.trim().to_ascii_lowercase();
        }
    }

    pub fn validate(&self) -> MiningResult<()> {
        if self.begin_block > self.end_block {
            return Err(MiningError::Config(format!(
                "mining window is empty: begin_block {} > end_block {}",
                self.begin_block, self.end_block
            )));
        }
        if self.reward_per_block.is_sign_negative() {
            return Err(MiningError::Config(
                "reward_per_block must not be negative".into(),
            ));
        }
        for (name, addr) in [
            ("disperse_address", &self.disperse_address),
            ("mcb_token_address", &self.mcb_token_address),
            ("payer_address", &self.payer_address),
        ] {
            validate_address(name, addr)?;
        }
        let key = self.payer_key.trim_start_matches("0x");
        if hex::decode(key).map(|raw| raw.len() != 32).unwrap_or(true) {
            return Err(MiningError::Config(
                "payer_key must be a 32-byte hex string".into(),
            ));
        }
        Ok(())
    }
}

fn validate_address(name: &str, addr: &str) -> MiningResult<()> {
    let hexpart = addr.strip_prefix("0x").unwrap_or(addr);
    if hexpart.len() != 40 || hex::decode(hexpart).is_err() {
        return Err(MiningError::Config(format!(
            "{name} is not a 20-byte hex address: {addr}"
        )));
    }
    Ok(())
}
