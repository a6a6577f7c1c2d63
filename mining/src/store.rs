//! Persistent store and data-access gateway.
//!
//! All rows live in one snapshot file. Readers and writers go through a
//! [`StoreSession`]: the session clones the committed state, every gateway
//! operation mutates the clone, and [`StoreSession::commit`] atomically
//! swaps it in and rewrites the snapshot. Dropping a session without
//! committing discards its writes, which is what gives each engine sync and
//! each payer phase its transaction boundary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};
use crate::round::{PoolKind, PoolName, Round};

const FILE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpShareAmmMap {
    pub share_addr: String,
    pub perp_addr: String,
    pub amm_addr: String,
    pub amm_proxy_addr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Init,
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    /// Open transactions are the ones a reconcile pass still has to settle.
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Init | PaymentStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: u64,
    pub transaction_nonce: u64,
    pub transaction_hash: String,
    /// JSON payload with the `miners` and `amounts` of the disperse call.
    pub transaction_data: String,
    pub status: PaymentStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: u64,
    pub holder: String,
    pub amount: Decimal,
    pub pay_time: DateTime<Utc>,
    pub transaction_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundPayment {
    pub id: u64,
    pub mining_round: Round,
    pub holder: String,
    pub amount: Decimal,
    pub payment_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TheoryMiningReward {
    pub mining_round: Round,
    pub pool_kind: PoolKind,
    pub holder: String,
    pub mcb_balance: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImmatureMiningReward {
    pub block_number: u64,
    pub mining_round: Round,
    pub pool_name: PoolName,
    pub holder: String,
    pub mcb_balance: Decimal,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreState {
    token_balances: BTreeMap<String, BTreeMap<String, Decimal>>,
    position_balances: BTreeMap<String, BTreeMap<String, Decimal>>,
    share_maps: BTreeMap<String, PerpShareAmmMap>,
    chainlink_prices: BTreeMap<String, BTreeMap<u64, Decimal>>,
    immature_rewards: BTreeMap<(u64, Round, PoolName, String), Decimal>,
    immature_summaries: BTreeMap<(Round, PoolName, String), Decimal>,
    theory_rewards: BTreeMap<(Round, PoolKind, String), Decimal>,
    payment_transactions: Vec<PaymentTransaction>,
    payments: Vec<Payment>,
    round_payments: Vec<RoundPayment>,
    next_payment_transaction_id: u64,
    next_payment_id: u64,
    next_round_payment_id: u64,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    state: StoreState,
}

pub struct MiningStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl MiningStore {
    /// Opens an existing snapshot or starts empty when the file is absent.
    pub fn open(path: impl AsRef<Path>) -> MiningResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let file: StoreFile = bincode::deserialize(&bytes)?;
            if file.version != FILE_VERSION {
                return Err(MiningError::Store(format!(
                    "unsupported store file version {}",
                    file.version
                )));
            }
            file.state
        } else {
            StoreState::default()
        };
        Ok(MiningStore {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn session(&self) -> StoreSession<'_> {
        StoreSession {
            store: self,
            state: self.state.lock().clone(),
        }
    }

    fn persist(&self, state: &StoreState) -> MiningResult<()> {
        let file = StoreFile {
            version: FILE_VERSION,
            state: state.clone(),
        };
        let bytes = bincode::serialize(&file)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

pub struct StoreSession<'a> {
    store: &'a MiningStore,
    state: StoreState,
}

impl StoreSession<'_> {
    /// Persists the session's state and makes it the committed state.
    pub fn commit(self) -> MiningResult<()> {
        self.store.persist(&self.state)?;
        *self.store.state.lock() = self.state;
        Ok(())
    }

    // --- balances and prices (populated by the external watcher) ---

    pub fn set_token_balance(&mut self, token: &str, holder: &str, balance: Decimal) {
        self.state
            .token_balances
            .entry(token.to_string())
            .or_default()
            .insert(holder.to_string(), balance);
    }

    pub fn set_position_balance(&mut self, perpetual: &str, holder: &str, balance: Decimal) {
        self.state
            .position_balances
            .entry(perpetual.to_string())
            .or_default()
            .insert(holder.to_string(), balance);
    }

    pub fn put_share_map(&mut self, map: PerpShareAmmMap) {
        self.state.share_maps.insert(map.share_addr.clone(), map);
    }

    pub fn insert_chainlink_price(&mut self, feed: &str, block: u64, price: Decimal) {
        self.state
            .chainlink_prices
            .entry(feed.to_string())
            .or_default()
            .insert(block, price);
    }

    pub fn total_token_balance(&self, token: &str) -> Decimal {
        self.state
            .token_balances
            .get(token)
            .map(|holders| holders.values().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    /// Holders of `token` with a nonzero balance.
    pub fn list_token_holders(&self, token: &str) -> Vec<(String, Decimal)> {
        self.state
            .token_balances
            .get(token)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|(_, balance)| !balance.is_zero())
                    .map(|(holder, balance)| (holder.clone(), *balance))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_position_holders(&self, perpetual: &str) -> Vec<(String, Decimal)> {
        self.state
            .position_balances
            .get(perpetual)
            .map(|holders| {
                holders
                    .iter()
                    .map(|(holder, balance)| (holder.clone(), *balance))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn lookup_share_map(&self, share_addr: &str) -> Option<&PerpShareAmmMap> {
        self.state.share_maps.get(share_addr)
    }

    pub fn position_balance(&self, perpetual: &str, holder: &str) -> Option<Decimal> {
        self.state
            .position_balances
            .get(perpetual)
            .and_then(|holders| holders.get(holder))
            .copied()
    }

    /// The latest price event for `feed` at or before `block`.
    pub fn latest_chainlink_price(&self, feed: &str, block: u64) -> MiningResult<Decimal> {
        self.state
            .chainlink_prices
            .get(feed)
            .and_then(|events| events.range(..=block).next_back())
            .map(|(_, price)| *price)
            .ok_or_else(|| MiningError::PriceNotSynced {
                feed: feed.to_string(),
                block,
            })
    }

    // --- reward rows ---

    pub fn list_theory_rewards(&self, round: Round) -> Vec<TheoryMiningReward> {
        self.state
            .theory_rewards
            .range((round, PoolKind::Amm, String::new())..)
            .take_while(|((r, _, _), _)| *r == round)
            .map(|((_, kind, holder), amount)| TheoryMiningReward {
                mining_round: round,
                pool_kind: *kind,
                holder: holder.clone(),
                mcb_balance: *amount,
            })
            .collect()
    }

    pub fn upsert_theory_reward(
        &mut self,
        round: Round,
        kind: PoolKind,
        holder: &str,
        amount: Decimal,
    ) {
        self.state
            .theory_rewards
            .insert((round, kind, holder.to_string()), amount);
    }

    pub fn insert_immature_reward(
        &mut self,
        block: u64,
        round: Round,
        pool: PoolName,
        holder: &str,
        amount: Decimal,
    ) {
        self.state
            .immature_rewards
            .insert((block, round, pool, holder.to_string()), amount);
    }

    pub fn list_immature_rewards(&self, round: Round) -> Vec<ImmatureMiningReward> {
        self.state
            .immature_rewards
            .iter()
            .filter(|((_, r, _, _), _)| *r == round)
            .map(|((block, _, pool, holder), amount)| ImmatureMiningReward {
                block_number: *block,
                mining_round: round,
                pool_name: *pool,
                holder: holder.clone(),
                mcb_balance: *amount,
            })
            .collect()
    }

    pub fn has_immature_rewards_at(&self, block: u64, round: Round) -> bool {
        self.state
            .immature_rewards
            .range((block, Round::Xia, PoolName::EthPerp, String::new())..)
            .take_while(|((b, _, _, _), _)| *b == block)
            .any(|((_, r, _, _), _)| *r == round)
    }

    pub fn list_immature_summaries(&self, round: Round, pool: PoolName) -> BTreeMap<String, Decimal> {
        self.state
            .immature_summaries
            .iter()
            .filter(|((r, p, _), _)| *r == round && *p == pool)
            .map(|((_, _, holder), amount)| (holder.clone(), *amount))
            .collect()
    }

    pub fn immature_summary(&self, round: Round, pool: PoolName, holder: &str) -> Option<Decimal> {
        self.state
            .immature_summaries
            .get(&(round, pool, holder.to_string()))
            .copied()
    }

    /// Folds `delta` into the summary row, creating it when absent.
    pub fn upsert_immature_summary(
        &mut self,
        round: Round,
        pool: PoolName,
        holder: &str,
        delta: Decimal,
    ) {
        *self
            .state
            .immature_summaries
            .entry((round, pool, holder.to_string()))
            .or_insert(Decimal::ZERO) += delta;
    }

    /// Sums immature rows with a block number above `block`, grouped by
    /// (pool, holder).
    pub fn aggregate_immature_above(
        &self,
        block: u64,
        round: Round,
    ) -> Vec<(PoolName, String, Decimal)> {
        let mut grouped: BTreeMap<(PoolName, String), Decimal> = BTreeMap::new();
        for ((block_number, r, pool, holder), amount) in &self.state.immature_rewards {
            if *block_number > block && *r == round {
                *grouped
                    .entry((*pool, holder.clone()))
                    .or_insert(Decimal::ZERO) += *amount;
            }
        }
        grouped
            .into_iter()
            .map(|((pool, holder), amount)| (pool, holder, amount))
            .collect()
    }

    pub fn delete_immature_above(&mut self, block: u64, round: Round) {
        self.state
            .immature_rewards
            .retain(|(block_number, r, _, _), _| !(*block_number > block && *r == round));
    }

    pub fn latest_reward_block(&self, round: Round) -> Option<u64> {
        self.state
            .immature_rewards
            .keys()
            .filter(|(_, r, _, _)| *r == round)
            .map(|(block, _, _, _)| *block)
            .next_back()
    }

    // --- maturation projection ---

    /// Per holder, the sum of immature rewards old enough to be payable:
    /// rows whose block is at most `latest reward block - maturity_blocks`.
    pub fn mature_rewards(&self, round: Round, maturity_blocks: u64) -> BTreeMap<String, Decimal> {
        let mut mature: BTreeMap<String, Decimal> = BTreeMap::new();
        let Some(latest) = self.latest_reward_block(round) else {
            return mature;
        };
        let threshold = latest.saturating_sub(maturity_blocks);
        for ((block, r, _, holder), amount) in &self.state.immature_rewards {
            if *r == round && *block <= threshold {
                *mature.entry(holder.clone()).or_insert(Decimal::ZERO) += *amount;
            }
        }
        mature
    }

    pub fn round_payment_totals(&self, round: Round) -> BTreeMap<String, Decimal> {
        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for payment in &self.state.round_payments {
            if payment.mining_round == round {
                *totals
                    .entry(payment.holder.clone())
                    .or_insert(Decimal::ZERO) += payment.amount;
            }
        }
        totals
    }

    /// Holders still owed something: mature reward minus what earlier
    /// successful transactions already paid, kept when positive.
    pub fn unpaid_rewards(&self, round: Round, maturity_blocks: u64) -> Vec<(String, Decimal)> {
        let paid = self.round_payment_totals(round);
        self.mature_rewards(round, maturity_blocks)
            .into_iter()
            .filter_map(|(holder, mature)| {
                let unpaid = mature - paid.get(&holder).copied().unwrap_or(Decimal::ZERO);
                (unpaid > Decimal::ZERO).then_some((holder, unpaid))
            })
            .collect()
    }

    // --- payment transactions ---

    /// The transaction with the highest nonce, if any.
    pub fn latest_payment_transaction(&self) -> Option<&PaymentTransaction> {
        self.state
            .payment_transactions
            .iter()
            .max_by_key(|tx| tx.transaction_nonce)
    }

    pub fn insert_payment_transaction(
        &mut self,
        nonce: u64,
        tx_hash: &str,
        tx_data: String,
    ) -> u64 {
        self.state.next_payment_transaction_id += 1;
        let id = self.state.next_payment_transaction_id;
        self.state.payment_transactions.push(PaymentTransaction {
            id,
            transaction_nonce: nonce,
            transaction_hash: tx_hash.to_string(),
            transaction_data: tx_data,
            status: PaymentStatus::Init,
        });
        id
    }

    /// Updates a transaction's status by hash and returns its id.
    pub fn update_payment_transaction_status(
        &mut self,
        tx_hash: &str,
        status: PaymentStatus,
    ) -> MiningResult<u64> {
        let tx = self
            .state
            .payment_transactions
            .iter_mut()
            .find(|tx| tx.transaction_hash == tx_hash)
            .ok_or_else(|| {
                MiningError::Inconsistency(format!("no payment transaction with hash {tx_hash}"))
            })?;
        tx.status = status;
        Ok(tx.id)
    }

    pub fn list_pending_payment_transactions(&self) -> Vec<PaymentTransaction> {
        self.state
            .payment_transactions
            .iter()
            .filter(|tx| tx.status.is_open())
            .cloned()
            .collect()
    }

    pub fn list_payments(&self) -> &[Payment] {
        &self.state.payments
    }

    /// Records one Payment and one RoundPayment per holder for a settled
    /// transaction. Only called once a SUCCESS receipt has been observed.
    pub fn insert_payments(
        &mut self,
        tx_id: u64,
        round: Round,
        entries: &[(String, Decimal)],
        pay_time: DateTime<Utc>,
    ) {
        for (holder, amount) in entries {
            self.state.next_payment_id += 1;
            let payment_id = self.state.next_payment_id;
            self.state.payments.push(Payment {
                id: payment_id,
                holder: holder.clone(),
                amount: *amount,
                pay_time,
                transaction_id: tx_id,
            });
            self.state.next_round_payment_id += 1;
            self.state.round_payments.push(RoundPayment {
                id: self.state.next_round_payment_id,
                mining_round: round,
                holder: holder.clone(),
                amount: *amount,
                payment_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dec(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    #[test]
    fn uncommitted_sessions_are_discarded() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        {
            let mut session = store.session();
            session.set_token_balance("0xtoken", "0xholder", dec("5"));
        }
        let session = store.session();
        assert!(session.list_token_holders("0xtoken").is_empty());
    }

    #[test]
    fn committed_state_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mining.db");
        {
            let store = MiningStore::open(&path).expect("open");
            let mut session = store.session();
            session.set_token_balance("0xtoken", "0xholder", dec("5"));
            session.insert_immature_reward(7, Round::Xia, PoolName::EthPerp, "0xholder", dec("1.5"));
            session.upsert_immature_summary(Round::Xia, PoolName::EthPerp, "0xholder", dec("1.5"));
            session.commit().expect("commit");
        }
        let store = MiningStore::open(&path).expect("reopen");
        let session = store.session();
        assert_eq!(session.total_token_balance("0xtoken"), dec("5"));
        assert_eq!(
            session.immature_summary(Round::Xia, PoolName::EthPerp, "0xholder"),
            Some(dec("1.5"))
        );
        assert_eq!(session.latest_reward_block(Round::Xia), Some(7));
    }

    #[test]
    fn zero_balances_are_not_listed_but_counted() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        let mut session = store.session();
        session.set_token_balance("0xtoken", "0xa", dec("3"));
        session.set_token_balance("0xtoken", "0xb", Decimal::ZERO);
        assert_eq!(session.list_token_holders("0xtoken").len(), 1);
        assert_eq!(session.total_token_balance("0xtoken"), dec("3"));
    }

    #[test]
    fn chainlink_price_picks_latest_at_or_before_block() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        let mut session = store.session();
        session.insert_chainlink_price("0xfeed", 10, dec("100"));
        session.insert_chainlink_price("0xfeed", 20, dec("110"));
        assert_eq!(session.latest_chainlink_price("0xfeed", 15).unwrap(), dec("100"));
        assert_eq!(session.latest_chainlink_price("0xfeed", 20).unwrap(), dec("110"));
        assert!(matches!(
            session.latest_chainlink_price("0xfeed", 9),
            Err(MiningError::PriceNotSynced { block: 9, .. })
        ));
        assert!(matches!(
            session.latest_chainlink_price("0xother", 50),
            Err(MiningError::PriceNotSynced { .. })
        ));
    }

    #[test]
    fn unpaid_is_mature_minus_paid_and_positive() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        let mut session = store.session();
        for block in [1u64, 2, 3] {
            session.insert_immature_reward(block, Round::Xia, PoolName::EthPerp, "0xa", dec("1"));
            session.insert_immature_reward(block, Round::Xia, PoolName::EthPerp, "0xb", dec("2"));
        }
        // Maturity 1 leaves block 3 immature.
        let mature = session.mature_rewards(Round::Xia, 1);
        assert_eq!(mature["0xa"], dec("2"));
        assert_eq!(mature["0xb"], dec("4"));

        let tx_id = session.insert_payment_transaction(1, "0xhash", "{}".into());
        session.insert_payments(
            tx_id,
            Round::Xia,
            &[("0xa".to_string(), dec("2")), ("0xb".to_string(), dec("1"))],
            Utc::now(),
        );
        let unpaid = session.unpaid_rewards(Round::Xia, 1);
        assert_eq!(unpaid, vec![("0xb".to_string(), dec("3"))]);
    }

    #[test]
    fn rollback_primitives_aggregate_and_delete() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        let mut session = store.session();
        for block in [5u64, 6, 7] {
            session.insert_immature_reward(block, Round::Shang, PoolName::EthPerp, "0xa", dec("1"));
        }
        session.insert_immature_reward(7, Round::Xia, PoolName::EthPerp, "0xa", dec("9"));
        let aggregated = session.aggregate_immature_above(5, Round::Shang);
        assert_eq!(
            aggregated,
            vec![(PoolName::EthPerp, "0xa".to_string(), dec("2"))]
        );
        session.delete_immature_above(5, Round::Shang);
        assert_eq!(session.list_immature_rewards(Round::Shang).len(), 1);
        // Other rounds are untouched.
        assert_eq!(session.list_immature_rewards(Round::Xia).len(), 1);
    }

    #[test]
    fn latest_payment_transaction_orders_by_nonce() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        let mut session = store.session();
        assert!(session.latest_payment_transaction().is_none());
        session.insert_payment_transaction(4, "0xaa", "{}".into());
        session.insert_payment_transaction(9, "0xbb", "{}".into());
        session.insert_payment_transaction(6, "0xcc", "{}".into());
        assert_eq!(
            session.latest_payment_transaction().unwrap().transaction_nonce,
            9
        );
        session
            .update_payment_transaction_status("0xbb", PaymentStatus::Success)
            .expect("update");
        assert_eq!(session.list_pending_payment_transactions().len(), 2);
    }
}
