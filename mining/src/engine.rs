//! Per-block reward computation.
//!
//! The engine is driven by the external block watcher: one [`BlockSyncer::sync`]
//! per new block, one [`BlockSyncer::rollback`] per chain reorganization.
//! A sync values every active pool (raw balances → effective shares → USD
//! value → pool reward), weights holders by the era's factor policy and
//! appends one immature reward row per (pool, holder), keeping the running
//! summaries in step. Everything runs on one store session; the caller
//! commits or discards it.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{MiningError, MiningResult};
use crate::round::{PoolKind, PoolName, PoolPass, PoolSpec};
use crate::store::StoreSession;

/// Watcher plugin surface: called once per observed block, and once per
/// reorganization with the last block to keep.
pub trait BlockSyncer {
    fn sync(
        &self,
        block_number: u64,
        block_hash: &str,
        session: &mut StoreSession<'_>,
    ) -> MiningResult<()>;

    fn rollback(&self, block_number: u64, session: &mut StoreSession<'_>) -> MiningResult<()>;
}

pub struct ShareMining {
    config: Config,
}

/// Effective share-token amounts of one AMM pool after the imbalance
/// penalty. `total` is zero when the pool has no eligible holder.
struct EffectiveShares {
    shares: BTreeMap<String, Decimal>,
    total: Decimal,
}

/// One pool carried through the valuation pipeline of a single pass.
struct PoolValuation {
    name: PoolName,
    spec: PoolSpec,
    total_share: Decimal,
    holders: Vec<(String, Decimal)>,
    effective: Option<EffectiveShares>,
    effective_usd_value: Decimal,
    reward: Decimal,
}

enum WeightMode {
    /// XIA, SHANG, HAN: raw shares, no factor.
    Unweighted,
    /// ZHOU: one cross-pool weight per holder.
    Pooled(BTreeMap<String, Decimal>),
    /// QIN: a weight per holder within each pool.
    PerPool(BTreeMap<PoolName, BTreeMap<String, Decimal>>),
}

impl WeightMode {
    fn weight(&self, pool: PoolName, holder: &str) -> Decimal {
        match self {
            WeightMode::Unweighted => Decimal::ONE,
            WeightMode::Pooled(weights) => {
                weights.get(holder).copied().unwrap_or(Decimal::ONE)
            }
            WeightMode::PerPool(pools) => pools
                .get(&pool)
                .and_then(|weights| weights.get(holder))
                .copied()
                .unwrap_or(Decimal::ONE),
        }
    }
}

impl BlockSyncer for ShareMining {
    fn sync(
        &self,
        block_number: u64,
        _block_hash: &str,
        session: &mut StoreSession<'_>,
    ) -> MiningResult<()> {
        let round = self.config.mining_round;
        if block_number < self.config.begin_block || block_number > self.config.end_block {
            info!(
                %round,
                block_number,
                "block not in mining window, nothing to reward"
            );
            return Ok(());
        }
        if session.has_immature_rewards_at(block_number, round) {
            info!(%round, block_number, "rewards already synced for block");
            return Ok(());
        }
        for pass in round.pool_passes(block_number, &self.config.pools, &self.config.forks) {
            self.calculate_pools_reward(block_number, &pass, session)?;
        }
        Ok(())
    }

    fn rollback(&self, block_number: u64, session: &mut StoreSession<'_>) -> MiningResult<()> {
        let round = self.config.mining_round;
        info!(%round, block_number, "rolling back immature rewards above block");
        for (pool, holder, amount) in session.aggregate_immature_above(block_number, round) {
            if session.immature_summary(round, pool, &holder).is_some() {
                session.upsert_immature_summary(round, pool, &holder, -amount);
            } else {
                error!(
                    %pool,
                    %holder,
                    "no summary row for rolled-back rewards, skipping"
                );
            }
        }
        session.delete_immature_above(block_number, round);
        Ok(())
    }
}

impl ShareMining {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs the full pipeline for one pool group and writes its rows.
    fn calculate_pools_reward(
        &self,
        block_number: u64,
        pass: &PoolPass,
        session: &mut StoreSession<'_>,
    ) -> MiningResult<()> {
        let round = self.config.mining_round;
        let forks = &self.config.forks;
        let pools = self.pool_valuations(block_number, pass, session)?;
        info!(
            %round,
            block_number,
            pools = %pass
                .pools
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            "sync mining reward"
        );

        let mode = if block_number >= forks.qin_begin_block {
            WeightMode::PerPool(self.per_pool_weights(&pools, session))
        } else if block_number >= forks.zhou_begin_block {
            WeightMode::Pooled(self.pooled_weights(&pools, session))
        } else {
            WeightMode::Unweighted
        };

        for valuation in &pools {
            if valuation.total_share.is_zero() {
                warn!(
                    pool = %valuation.name,
                    "share token total amount is zero, skipping pool"
                );
                continue;
            }
            for (holder, balance) in &valuation.holders {
                let reward = match &valuation.effective {
                    Some(effective) => {
                        if effective.total.is_zero() {
                            continue;
                        }
                        let share = effective.shares.get(holder).copied().unwrap_or(Decimal::ZERO);
                        mode.weight(valuation.name, holder) * valuation.reward * share
                            / effective.total
                    }
                    None => valuation.reward * *balance / valuation.total_share,
                };
                if reward.is_zero() {
                    continue;
                }
                session.insert_immature_reward(block_number, round, valuation.name, holder, reward);
                session.upsert_immature_summary(round, valuation.name, holder, reward);
            }
        }
        Ok(())
    }

    /// Raw → effective → USD → reward for every pool of one pass.
    fn pool_valuations(
        &self,
        block_number: u64,
        pass: &PoolPass,
        session: &StoreSession<'_>,
    ) -> MiningResult<Vec<PoolValuation>> {
        let round = self.config.mining_round;
        let forks = &self.config.forks;
        let reward_per_block =
            round.reward_per_block(block_number, self.config.reward_per_block, forks);
        let uniswap_proportions = self.uniswap_pool_proportions(pass, session);

        let mut valuations = Vec::with_capacity(pass.pools.len());
        let mut total_effective_usd = Decimal::ZERO;
        for (name, spec) in &pass.pools {
            let total_share = session.total_token_balance(spec.share_token());
            let holders = session.list_token_holders(spec.share_token());
            let mut valuation = PoolValuation {
                name: *name,
                spec: spec.clone(),
                total_share,
                holders,
                effective: None,
                effective_usd_value: Decimal::ZERO,
                reward: Decimal::ZERO,
            };

            let rebalanced_amm = spec.kind() == PoolKind::Amm
                && block_number >= forks.xia_rebalance_hard_fork_block;
            if rebalanced_amm {
                let effective = self.effective_shares(
                    block_number,
                    *name,
                    spec,
                    &valuation.holders,
                    total_share,
                    session,
                );
                if total_share.is_zero() {
                    warn!(
                        pool = %name,
                        "share token total amount is zero, effective value is zero"
                    );
                } else {
                    let usd_value = self.pool_usd_value(block_number, *name, spec, session)?;
                    valuation.effective_usd_value =
                        usd_value * effective.total / total_share;
                }
                total_effective_usd += valuation.effective_usd_value;
                valuation.effective = Some(effective);
            } else {
                let proportion = uniswap_proportions
                    .get(name)
                    .copied()
                    .unwrap_or(Decimal::ONE);
                valuation.reward = pass.reward_percent * reward_per_block * proportion;
            }
            valuations.push(valuation);
        }

        for valuation in &mut valuations {
            if valuation.effective.is_none() {
                continue;
            }
            valuation.reward = if block_number >= forks.qin_begin_block {
                let proportion = match &valuation.spec {
                    PoolSpec::Amm { proportion, .. } => proportion.unwrap_or(Decimal::ONE),
                    PoolSpec::Uniswap { .. } => Decimal::ONE,
                };
                pass.reward_percent * reward_per_block * proportion
            } else if total_effective_usd.is_zero() {
                Decimal::ZERO
            } else {
                pass.reward_percent * reward_per_block * valuation.effective_usd_value
                    / total_effective_usd
            };
        }
        Ok(valuations)
    }

    /// Each UNISWAP pool's slice of the group budget: its share of the MCB
    /// held across the pass's UNISWAP share-token addresses, refreshed every
    /// block. Defaults to 1 per pool when those pools hold no MCB at all.
    fn uniswap_pool_proportions(
        &self,
        pass: &PoolPass,
        session: &StoreSession<'_>,
    ) -> BTreeMap<PoolName, Decimal> {
        let mcb_balances = self.holder_mcb_balances(session);
        let mut held = BTreeMap::new();
        let mut total = Decimal::ZERO;
        for (name, spec) in &pass.pools {
            if spec.kind() != PoolKind::Uniswap {
                continue;
            }
            let balance = mcb_balances
                .get(spec.share_token())
                .copied()
                .unwrap_or(Decimal::ZERO);
            held.insert(*name, balance);
            total += balance;
        }
        held.into_iter()
            .map(|(name, balance)| {
                let proportion = if total.is_zero() {
                    Decimal::ONE
                } else {
                    balance / total
                };
                (name, proportion)
            })
            .collect()
    }

    /// Every holder's MCB: direct balance plus a pro-rata share of the MCB
    /// reserve sitting in the UNISWAP MCB/ETH pool.
    fn holder_mcb_balances(&self, session: &StoreSession<'_>) -> BTreeMap<String, Decimal> {
        let mut balances: BTreeMap<String, Decimal> = session
            .list_token_holders(&self.config.mcb_token_address)
            .into_iter()
            .collect();
        let uniswap_share = &self.config.pools.uniswap_mcb_eth_share_token;
        let pool_total_mcb = balances
            .get(uniswap_share)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let total_share = session.total_token_balance(uniswap_share);
        if !pool_total_mcb.is_zero() && !total_share.is_zero() {
            for (holder, share) in session.list_token_holders(uniswap_share) {
                *balances.entry(holder).or_insert(Decimal::ZERO) +=
                    pool_total_mcb * share / total_share;
            }
        }
        balances
    }

    fn effective_shares(
        &self,
        block_number: u64,
        name: PoolName,
        spec: &PoolSpec,
        holders: &[(String, Decimal)],
        total_share: Decimal,
        session: &StoreSession<'_>,
    ) -> EffectiveShares {
        let round = self.config.mining_round;
        let share_balances: BTreeMap<&str, Decimal> = holders
            .iter()
            .map(|(holder, balance)| (holder.as_str(), *balance))
            .collect();

        // The imbalance penalty was retired with ZHOU.
        if block_number >= self.config.forks.zhou_begin_block {
            return EffectiveShares {
                shares: holders.iter().cloned().collect(),
                total: total_share,
            };
        }

        let Some((perp_addr, proxy_addr)) = session
            .lookup_share_map(spec.share_token())
            .map(|map| (map.perp_addr.clone(), map.amm_proxy_addr.clone()))
        else {
            warn!(
                pool = %name,
                share_token = %spec.share_token(),
                "no perpetual mapping for share token, pool earns nothing this block"
            );
            return EffectiveShares {
                shares: BTreeMap::new(),
                total: Decimal::ZERO,
            };
        };

        let positions = session.list_position_holders(&perp_addr);
        let amm_position = positions
            .iter()
            .find(|(holder, _)| *holder == proxy_addr)
            .map(|(_, balance)| *balance)
            .unwrap_or(Decimal::ZERO);

        let mut shares = BTreeMap::new();
        let mut total = Decimal::ZERO;
        for (holder, margin_position) in &positions {
            let Some(share) = share_balances.get(holder.as_str()).copied() else {
                continue;
            };
            if share.is_zero() || total_share.is_zero() {
                continue;
            }
            let position_in_amm = amm_position * share / total_share;
            let imbalance = if position_in_amm.is_zero() {
                if margin_position.is_zero() {
                    Decimal::ZERO
                } else {
                    Decimal::ONE
                }
            } else {
                ((position_in_amm + margin_position) / position_in_amm).abs()
            };
            let effective = share * round.effective_share_multiplier(imbalance);
            shares.insert(holder.clone(), effective);
            total += effective;
        }
        EffectiveShares { shares, total }
    }

    /// |amm position| for inverse contracts, |amm position × oracle price|
    /// for vanilla ones.
    fn pool_usd_value(
        &self,
        block_number: u64,
        name: PoolName,
        spec: &PoolSpec,
        session: &StoreSession<'_>,
    ) -> MiningResult<Decimal> {
        let inverse = match spec {
            PoolSpec::Amm { inverse, .. } => *inverse,
            PoolSpec::Uniswap { .. } => true,
        };
        let Some((perp_addr, proxy_addr)) = session
            .lookup_share_map(spec.share_token())
            .map(|map| (map.perp_addr.clone(), map.amm_proxy_addr.clone()))
        else {
            return Ok(Decimal::ZERO);
        };
        let amm_position = session
            .position_balance(&perp_addr, &proxy_addr)
            .unwrap_or(Decimal::ZERO);
        if inverse {
            return Ok(amm_position.abs());
        }
        let feed = match name {
            PoolName::BtcPerp => &self.config.chainlink_btc_usd_address,
            other => {
                return Err(MiningError::Inconsistency(format!(
                    "no price feed configured for vanilla pool {other}"
                )))
            }
        };
        let price = session.latest_chainlink_price(feed, block_number)?;
        Ok((amm_position * price).abs())
    }

    /// ZHOU weighting: one global weight per holder from the cross-pool
    /// reward distribution and the MCB boost.
    fn pooled_weights(
        &self,
        pools: &[PoolValuation],
        session: &mut StoreSession<'_>,
    ) -> BTreeMap<String, Decimal> {
        let mut holder_rewards: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut pools_total_reward = Decimal::ZERO;
        for valuation in pools {
            if valuation.total_share.is_zero() {
                continue;
            }
            pools_total_reward += valuation.reward;
            let Some(effective) = &valuation.effective else {
                continue;
            };
            if effective.total.is_zero() {
                continue;
            }
            for (holder, _) in &valuation.holders {
                let share = effective.shares.get(holder).copied().unwrap_or(Decimal::ZERO);
                *holder_rewards.entry(holder.clone()).or_insert(Decimal::ZERO) +=
                    valuation.reward * share / effective.total;
            }
        }
        self.save_theory_rewards(&holder_rewards, session);

        if pools_total_reward.is_zero() {
            return BTreeMap::new();
        }
        let mcb_balances = self.holder_mcb_balances(session);
        let (m, n) = self.config.mining_round.factor_constants(&self.config.factors);
        let mut total_weight = Decimal::ZERO;
        for (holder, reward) in &holder_rewards {
            let percent = *reward / pools_total_reward;
            let factor = reward_factor(
                *reward,
                mcb_balances.get(holder).copied().unwrap_or(Decimal::ZERO),
                m,
                n,
            );
            total_weight += percent * factor;
        }
        if total_weight.is_zero() {
            return BTreeMap::new();
        }
        holder_rewards
            .iter()
            .map(|(holder, reward)| {
                let factor = reward_factor(
                    *reward,
                    mcb_balances.get(holder).copied().unwrap_or(Decimal::ZERO),
                    m,
                    n,
                );
                (holder.clone(), factor / total_weight)
            })
            .collect()
    }

    /// QIN weighting: weights are normalized within each pool, while the
    /// factor argument stays the holder's cross-pool AMM total.
    fn per_pool_weights(
        &self,
        pools: &[PoolValuation],
        session: &mut StoreSession<'_>,
    ) -> BTreeMap<PoolName, BTreeMap<String, Decimal>> {
        let mut holder_totals: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut per_pool_rewards: BTreeMap<PoolName, BTreeMap<String, Decimal>> = BTreeMap::new();
        for valuation in pools {
            if valuation.total_share.is_zero() {
                continue;
            }
            let mut pool_rewards = BTreeMap::new();
            if let Some(effective) = &valuation.effective {
                if !effective.total.is_zero() {
                    for (holder, _) in &valuation.holders {
                        let share =
                            effective.shares.get(holder).copied().unwrap_or(Decimal::ZERO);
                        let reward = valuation.reward * share / effective.total;
                        pool_rewards.insert(holder.clone(), reward);
                        *holder_totals.entry(holder.clone()).or_insert(Decimal::ZERO) += reward;
                    }
                }
            }
            per_pool_rewards.insert(valuation.name, pool_rewards);
        }
        self.save_theory_rewards(&holder_totals, session);

        let mcb_balances = self.holder_mcb_balances(session);
        let (m, n) = self.config.mining_round.factor_constants(&self.config.factors);
        let mut weights = BTreeMap::new();
        for valuation in pools {
            let Some(pool_rewards) = per_pool_rewards.get(&valuation.name) else {
                continue;
            };
            if valuation.reward.is_zero() || pool_rewards.is_empty() {
                continue;
            }
            let mut pool_total_weight = Decimal::ZERO;
            for (holder, reward) in pool_rewards {
                let percent = *reward / valuation.reward;
                let factor = reward_factor(
                    holder_totals.get(holder).copied().unwrap_or(Decimal::ZERO),
                    mcb_balances.get(holder).copied().unwrap_or(Decimal::ZERO),
                    m,
                    n,
                );
                pool_total_weight += percent * factor;
            }
            if pool_total_weight.is_zero() {
                continue;
            }
            let pool_weights = pool_rewards
                .keys()
                .map(|holder| {
                    let factor = reward_factor(
                        holder_totals.get(holder).copied().unwrap_or(Decimal::ZERO),
                        mcb_balances.get(holder).copied().unwrap_or(Decimal::ZERO),
                        m,
                        n,
                    );
                    (holder.clone(), factor / pool_total_weight)
                })
                .collect();
            weights.insert(valuation.name, pool_weights);
        }
        weights
    }

    /// Audit snapshot of the pre-factor AMM rewards, overwritten each block.
    fn save_theory_rewards(
        &self,
        holder_rewards: &BTreeMap<String, Decimal>,
        session: &mut StoreSession<'_>,
    ) {
        let round = self.config.mining_round;
        for (holder, reward) in holder_rewards {
            session.upsert_theory_reward(round, PoolKind::Amm, holder, *reward);
        }
    }
}

/// `1 + min(mcb_balance / (reward × N), 1) × M`, the MCB-holdings boost.
fn reward_factor(reward: Decimal, mcb_balance: Decimal, m: Decimal, n: Decimal) -> Decimal {
    let mcb_weight = if reward.is_zero() {
        Decimal::ZERO
    } else {
        mcb_balance / (reward * n)
    };
    if mcb_weight < Decimal::ONE {
        Decimal::ONE + mcb_weight * m
    } else {
        Decimal::ONE + m
    }
}
