//! Mining rounds and their pool composition.
//!
//! A round is a named era with its own pool set, reward split and factor
//! policy. Everything era-dependent hangs off [`Round`] so the engine never
//! compares round names as strings.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{FactorConstants, ForkSchedule, PoolAddresses};

/// Reward override voted in by governance proposal 14: blocks in
/// `[11_601_000, 11_685_000)` pay 0.1875 per block regardless of round.
const VOTE_WINDOW_BEGIN: u64 = 11_601_000;
const VOTE_WINDOW_END: u64 = 11_685_000;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Round {
    Xia,
    Shang,
    Zhou,
    Qin,
    Han,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PoolName {
    EthPerp,
    LinkPerp,
    CompPerp,
    LendPerp,
    SnxPerp,
    BtcPerp,
    UniswapMcbEth,
    UniswapMcbUsdc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Amm,
    Uniswap,
}

/// One pool's identity within a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolSpec {
    Amm {
        share_token: String,
        inverse: bool,
        /// Static reward proportion, set from QIN onward.
        proportion: Option<Decimal>,
    },
    Uniswap {
        share_token: String,
    },
}

impl PoolSpec {
    pub fn kind(&self) -> PoolKind {
        match self {
            PoolSpec::Amm { .. } => PoolKind::Amm,
            PoolSpec::Uniswap { .. } => PoolKind::Uniswap,
        }
    }

    pub fn share_token(&self) -> &str {
        match self {
            PoolSpec::Amm { share_token, .. } | PoolSpec::Uniswap { share_token } => share_token,
        }
    }
}

/// One group of pools rewarded together with a common percent of the block
/// budget. A sync runs the pool-calculation pass once per group.
#[derive(Clone, Debug)]
pub struct PoolPass {
    pub reward_percent: Decimal,
    pub pools: Vec<(PoolName, PoolSpec)>,
}

impl Round {
    pub fn as_str(&self) -> &'static str {
        match self {
            Round::Xia => "XIA",
            Round::Shang => "SHANG",
            Round::Zhou => "ZHOU",
            Round::Qin => "QIN",
            Round::Han => "HAN",
        }
    }

    /// The block budget, after the QIN reduction and the governance-vote
    /// override. `base` is the configured per-block reward.
    pub fn reward_per_block(&self, block: u64, base: Decimal, forks: &ForkSchedule) -> Decimal {
        if (VOTE_WINDOW_BEGIN..VOTE_WINDOW_END).contains(&block) {
            return Decimal::new(1875, 4);
        }
        if *self == Round::Qin {
            if block < forks.qin_reduce_reward_block {
                return Decimal::TWO;
            }
            return Decimal::new(2, 1);
        }
        base
    }

    /// Pool groups active at `block`, in the order they are rewarded.
    pub fn pool_passes(&self, block: u64, pools: &PoolAddresses, forks: &ForkSchedule) -> Vec<PoolPass> {
        let amm = |share: &str, proportion: Option<Decimal>| PoolSpec::Amm {
            share_token: share.to_string(),
            inverse: true,
            proportion,
        };
        let uniswap = |share: &str| PoolSpec::Uniswap {
            share_token: share.to_string(),
        };

        match self {
            Round::Xia => vec![PoolPass {
                reward_percent: Decimal::ONE,
                pools: vec![(PoolName::EthPerp, amm(&pools.eth_perp_share_token, None))],
            }],
            Round::Shang => {
                let mut amm_pools = vec![(PoolName::EthPerp, amm(&pools.eth_perp_share_token, None))];
                if block >= forks.shang_reward_link_pool_block {
                    amm_pools.push((PoolName::LinkPerp, amm(&pools.link_perp_share_token, None)));
                }
                vec![
                    PoolPass {
                        reward_percent: Decimal::new(75, 2),
                        pools: amm_pools,
                    },
                    PoolPass {
                        reward_percent: Decimal::new(25, 2),
                        pools: vec![(
                            PoolName::UniswapMcbEth,
                            uniswap(&pools.uniswap_mcb_eth_share_token),
                        )],
                    },
                ]
            }
            Round::Zhou => {
                let mut amm_pools = vec![
                    (PoolName::EthPerp, amm(&pools.eth_perp_share_token, None)),
                    (PoolName::LinkPerp, amm(&pools.link_perp_share_token, None)),
                ];
                if block >= forks.zhou_reward_comp_pool_block {
                    amm_pools.push((PoolName::CompPerp, amm(&pools.comp_perp_share_token, None)));
                }
                if block >= forks.zhou_reward_lend_pool_block {
                    amm_pools.push((PoolName::LendPerp, amm(&pools.lend_perp_share_token, None)));
                }
                if block >= forks.zhou_reward_snx_pool_block {
                    amm_pools.push((PoolName::SnxPerp, amm(&pools.snx_perp_share_token, None)));
                }
                vec![
                    PoolPass {
                        reward_percent: Decimal::new(75, 2),
                        pools: amm_pools,
                    },
                    PoolPass {
                        reward_percent: Decimal::new(25, 2),
                        pools: vec![(
                            PoolName::UniswapMcbEth,
                            uniswap(&pools.uniswap_mcb_eth_share_token),
                        )],
                    },
                ]
            }
            Round::Qin => {
                let with_btc = block >= forks.qin_reward_btc_pool_block;
                let little_pool_num = if with_btc { 5 } else { 4 };
                let little_proportion = Decimal::new(2, 1) / Decimal::from(little_pool_num);
                let mut amm_pools = vec![(
                    PoolName::EthPerp,
                    amm(&pools.eth_perp_share_token, Some(Decimal::new(8, 1))),
                )];
                for (name, share) in [
                    (PoolName::LinkPerp, &pools.link_perp_share_token),
                    (PoolName::CompPerp, &pools.comp_perp_share_token),
                    (PoolName::LendPerp, &pools.lend_perp_share_token),
                    (PoolName::SnxPerp, &pools.snx_perp_share_token),
                ] {
                    amm_pools.push((name, amm(share, Some(little_proportion))));
                }
                if with_btc {
                    amm_pools.push((
                        PoolName::BtcPerp,
                        PoolSpec::Amm {
                            share_token: pools.btc_perp_share_token.clone(),
                            inverse: false,
                            proportion: Some(little_proportion),
                        },
                    ));
                }
                vec![
                    PoolPass {
                        reward_percent: Decimal::new(5, 1),
                        pools: amm_pools,
                    },
                    PoolPass {
                        reward_percent: Decimal::new(5, 1),
                        pools: vec![(
                            PoolName::UniswapMcbEth,
                            uniswap(&pools.uniswap_mcb_eth_share_token),
                        )],
                    },
                ]
            }
            Round::Han => vec![PoolPass {
                reward_percent: Decimal::ONE,
                pools: vec![
                    (
                        PoolName::UniswapMcbEth,
                        uniswap(&pools.uniswap_mcb_eth_share_token),
                    ),
                    (
                        PoolName::UniswapMcbUsdc,
                        uniswap(&pools.uniswap_mcb_usdc_share_token),
                    ),
                ],
            }],
        }
    }

    /// (M, N) of the MCB-holdings boost. Rounds without their own constants
    /// share the historical default.
    pub fn factor_constants(&self, factors: &FactorConstants) -> (Decimal, Decimal) {
        match self {
            Round::Zhou => (factors.zhou_m, factors.zhou_n),
            Round::Qin => (factors.qin_m, factors.qin_n),
            _ => (Decimal::TWO, Decimal::from(102_500)),
        }
    }

    /// Imbalance penalty applied to a holder's share before the ZHOU
    /// rebalance retirement. The breakpoints are exact rationals.
    pub fn effective_share_multiplier(&self, imbalance: Decimal) -> Decimal {
        match self {
            Round::Xia => {
                if imbalance <= Decimal::new(1, 1) {
                    Decimal::ONE
                } else if imbalance >= Decimal::new(9, 1) {
                    Decimal::new(1, 1)
                } else {
                    Decimal::from(89) / Decimal::from(80)
                        - imbalance * Decimal::from(9) / Decimal::from(8)
                }
            }
            Round::Shang => {
                if imbalance <= Decimal::new(2, 1) {
                    Decimal::ONE
                } else if imbalance >= Decimal::new(9, 1) {
                    Decimal::new(1, 1)
                } else {
                    Decimal::from(44) / Decimal::from(35)
                        - imbalance * Decimal::from(9) / Decimal::from(7)
                }
            }
            _ => Decimal::ONE,
        }
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PoolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolName::EthPerp => "ETH_PERP",
            PoolName::LinkPerp => "LINK_PERP",
            PoolName::CompPerp => "COMP_PERP",
            PoolName::LendPerp => "LEND_PERP",
            PoolName::SnxPerp => "SNX_PERP",
            PoolName::BtcPerp => "BTC_PERP",
            PoolName::UniswapMcbEth => "UNISWAP_MCB_ETH",
            PoolName::UniswapMcbUsdc => "UNISWAP_MCB_USDC",
        }
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    fn dec(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    #[test]
    fn qin_reward_drops_at_reduce_block() {
        let mut config = test_config();
        config.forks.qin_reduce_reward_block = 1_000;
        let round = Round::Qin;
        assert_eq!(
            round.reward_per_block(999, Decimal::ONE, &config.forks),
            Decimal::TWO
        );
        assert_eq!(
            round.reward_per_block(1_000, Decimal::ONE, &config.forks),
            dec("0.2")
        );
    }

    #[test]
    fn vote_window_overrides_every_round() {
        let config = test_config();
        for round in [Round::Xia, Round::Shang, Round::Zhou, Round::Qin, Round::Han] {
            assert_eq!(
                round.reward_per_block(11_601_000, Decimal::TEN, &config.forks),
                dec("0.1875"),
                "round {round}"
            );
            assert_eq!(
                round.reward_per_block(11_684_999, Decimal::TEN, &config.forks),
                dec("0.1875")
            );
        }
        assert_eq!(
            Round::Xia.reward_per_block(11_685_000, Decimal::TEN, &config.forks),
            Decimal::TEN
        );
    }

    #[test]
    fn shang_adds_link_pool_at_threshold() {
        let mut config = test_config();
        config.forks.shang_reward_link_pool_block = 500;
        let before = Round::Shang.pool_passes(499, &config.pools, &config.forks);
        assert_eq!(before[0].pools.len(), 1);
        let after = Round::Shang.pool_passes(500, &config.pools, &config.forks);
        assert_eq!(after[0].pools.len(), 2);
        assert_eq!(after[0].pools[1].0, PoolName::LinkPerp);
    }

    #[test]
    fn qin_little_pool_proportion_depends_on_btc() {
        let mut config = test_config();
        config.forks.qin_reward_btc_pool_block = 2_000;
        let without_btc = Round::Qin.pool_passes(1_999, &config.pools, &config.forks);
        assert_eq!(without_btc[0].pools.len(), 5);
        for (name, spec) in &without_btc[0].pools[1..] {
            match spec {
                PoolSpec::Amm { proportion, .. } => {
                    assert_eq!(proportion.unwrap(), dec("0.05"), "pool {name}")
                }
                _ => panic!("expected AMM pool"),
            }
        }
        let with_btc = Round::Qin.pool_passes(2_000, &config.pools, &config.forks);
        assert_eq!(with_btc[0].pools.len(), 6);
        let (_, btc) = with_btc[0]
            .pools
            .iter()
            .find(|(name, _)| *name == PoolName::BtcPerp)
            .expect("btc pool");
        match btc {
            PoolSpec::Amm {
                inverse,
                proportion,
                ..
            } => {
                assert!(!inverse);
                assert_eq!(proportion.unwrap(), dec("0.04"));
            }
            _ => panic!("expected AMM pool"),
        }
    }

    #[test]
    fn han_splits_between_two_uniswap_pools() {
        let config = test_config();
        let passes = Round::Han.pool_passes(0, &config.pools, &config.forks);
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].reward_percent, Decimal::ONE);
        assert_eq!(passes[0].pools.len(), 2);
        assert!(passes[0]
            .pools
            .iter()
            .all(|(_, spec)| spec.kind() == PoolKind::Uniswap));
    }

    #[test]
    fn effective_share_curves_use_exact_fractions() {
        assert_eq!(Round::Xia.effective_share_multiplier(dec("0.1")), Decimal::ONE);
        assert_eq!(
            Round::Xia.effective_share_multiplier(dec("0.9")),
            dec("0.1")
        );
        assert_eq!(
            Round::Xia.effective_share_multiplier(dec("0.5")),
            Decimal::from(89) / Decimal::from(80) - dec("0.5") * Decimal::from(9) / Decimal::from(8)
        );
        assert_eq!(Round::Shang.effective_share_multiplier(dec("0.2")), Decimal::ONE);
        assert_eq!(
            Round::Shang.effective_share_multiplier(dec("0.3")),
            Decimal::from(44) / Decimal::from(35) - dec("0.3") * Decimal::from(9) / Decimal::from(7)
        );
        assert_eq!(Round::Zhou.effective_share_multiplier(dec("5")), Decimal::ONE);
    }

    #[test]
    fn factor_constants_fall_back_outside_zhou_and_qin() {
        let mut config = test_config();
        config.factors.zhou_m = dec("3");
        config.factors.zhou_n = dec("5");
        config.factors.qin_m = dec("4");
        config.factors.qin_n = dec("7");
        assert_eq!(
            Round::Zhou.factor_constants(&config.factors),
            (dec("3"), dec("5"))
        );
        assert_eq!(
            Round::Qin.factor_constants(&config.factors),
            (dec("4"), dec("7"))
        );
        assert_eq!(
            Round::Shang.factor_constants(&config.factors),
            (Decimal::TWO, Decimal::from(102_500))
        );
    }

    #[test]
    fn round_names_render_uppercase() {
        assert_eq!(Round::Qin.to_string(), "QIN");
        let parsed: Round = serde_json::from_str("\"SHANG\"").expect("round");
        assert_eq!(parsed, Round::Shang);
    }
}
