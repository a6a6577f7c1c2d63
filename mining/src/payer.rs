//! The payout state machine.
//!
//! One cycle is reconcile-then-pay: first settle every transaction the
//! store still considers open, then pay whatever mature rewards remain
//! unpaid with a single batched disperse call. Payment rows are written
//! only once a SUCCESS receipt has been observed, and every transaction
//! carries a fresh, strictly monotonic nonce, which together give
//! at-most-once settlement across restarts and failures.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::chain::{ChainGateway, TxReceipt};
use crate::config::Config;
use crate::error::{MiningError, MiningResult};
use crate::gas::GasOracle;
use crate::store::{MiningStore, PaymentStatus, StoreSession};
use crate::wad::Wad;

/// Owns the nonce invariants: seeded once from the store (or the chain when
/// the store has never paid), then strictly monotonic for the process
/// lifetime.
pub struct NonceSource {
    current: Option<u64>,
}

impl NonceSource {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// The nonce for the next submission.
    pub fn next<C: ChainGateway>(
        &mut self,
        session: &StoreSession<'_>,
        chain: &C,
        payer_address: &str,
    ) -> MiningResult<u64> {
        let current = match self.current {
            Some(current) => current,
            None => match session.latest_payment_transaction() {
                Some(tx) => tx.transaction_nonce,
                None => chain.transaction_count(payer_address)? + 1,
            },
        };
        let next = current + 1;
        self.current = Some(next);
        Ok(next)
    }
}

impl Default for NonceSource {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON payload persisted with every payment transaction; replayed by
/// reconcile to write Payment rows once the receipt lands.
#[derive(Debug, Serialize, Deserialize)]
struct TransactionPayload {
    miners: Vec<String>,
    amounts: Vec<Decimal>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    /// Open transactions settled during reconcile.
    pub reconciled: usize,
    /// Hash of the disperse transaction submitted this cycle, if any.
    pub submitted: Option<String>,
}

pub struct Payer<'a, C: ChainGateway> {
    store: &'a MiningStore,
    chain: C,
    gas: GasOracle,
    config: Config,
    nonce: NonceSource,
}

impl<'a, C: ChainGateway> Payer<'a, C> {
    pub fn new(store: &'a MiningStore, chain: C, gas: GasOracle, config: Config) -> Self {
        Self {
            store,
            chain,
            gas,
            config,
            nonce: NonceSource::new(),
        }
    }

    /// One payout cycle. Safe to re-run at any time.
    pub fn run(&mut self) -> MiningResult<CycleReport> {
        let reconciled = self.reconcile()?;
        let submitted = self.pay()?;
        Ok(CycleReport {
            reconciled,
            submitted,
        })
    }

    /// Settles every INIT/PENDING transaction before anything new is
    /// submitted. A receipt failure aborts the cycle so the next run
    /// retries instead of racing a stale nonce.
    fn reconcile(&mut self) -> MiningResult<usize> {
        let pending = self.store.session().list_pending_payment_transactions();
        let count = pending.len();
        for tx in pending {
            match self
                .chain
                .wait_for_receipt(&tx.transaction_hash, self.wait_timeout())
            {
                Ok(receipt) => {
                    self.save_payments_info(&tx.transaction_hash, &tx.transaction_data, &receipt)?
                }
                Err(err) => {
                    if matches!(err, MiningError::ReceiptTimeout(_)) {
                        let mut session = self.store.session();
                        session.update_payment_transaction_status(
                            &tx.transaction_hash,
                            PaymentStatus::Pending,
                        )?;
                        session.commit()?;
                    }
                    error!(
                        tx_hash = %tx.transaction_hash,
                        ?err,
                        "could not settle open transaction, aborting cycle"
                    );
                    return Err(err);
                }
            }
        }
        Ok(count)
    }

    /// Pays the current unpaid set with one batched disperse call.
    fn pay(&mut self) -> MiningResult<Option<String>> {
        let round = self.config.mining_round;
        let unpaid = self
            .store
            .session()
            .unpaid_rewards(round, self.config.maturity_blocks);
        if unpaid.is_empty() {
            info!(%round, "no mature unpaid rewards, nothing to pay");
            return Ok(None);
        }

        self.gas.refresh();
        let nonce = {
            let session = self.store.session();
            self.nonce
                .next(&session, &self.chain, &self.config.payer_address)?
        };

        let mut holders = Vec::with_capacity(unpaid.len());
        let mut amounts = Vec::with_capacity(unpaid.len());
        for (holder, amount) in &unpaid {
            holders.push(holder.clone());
            amounts.push(Wad::from_decimal(*amount)?);
        }

        let tx_hash = self.chain.disperse_token(
            &self.config.mcb_token_address,
            &holders,
            &amounts,
            nonce,
            self.gas.price_wei(),
        )?;
        let payload = TransactionPayload {
            miners: holders.clone(),
            // What the chain will actually transfer, not the exact decimal.
            amounts: amounts.iter().map(|amount| amount.to_decimal()).collect(),
        };
        let tx_data = serde_json::to_string(&payload)?;
        let mut session = self.store.session();
        session.insert_payment_transaction(nonce, &tx_hash, tx_data.clone());
        session.commit()?;
        info!(
            %tx_hash,
            nonce,
            holders = holders.len(),
            "submitted disperse transaction"
        );

        match self.chain.wait_for_receipt(&tx_hash, self.wait_timeout()) {
            Ok(receipt) => self.save_payments_info(&tx_hash, &tx_data, &receipt)?,
            Err(err) => {
                if matches!(err, MiningError::ReceiptTimeout(_)) {
                    let mut session = self.store.session();
                    session
                        .update_payment_transaction_status(&tx_hash, PaymentStatus::Pending)?;
                    session.commit()?;
                }
                error!(
                    %tx_hash,
                    ?err,
                    "submitted but receipt unavailable, leaving for next reconcile"
                );
                return Err(err);
            }
        }
        Ok(Some(tx_hash))
    }

    /// Applies a receipt: status transition, plus Payment/RoundPayment rows
    /// only for a successful transaction.
    fn save_payments_info(
        &self,
        tx_hash: &str,
        tx_data: &str,
        receipt: &TxReceipt,
    ) -> MiningResult<()> {
        let mut session = self.store.session();
        let status = if receipt.succeeded {
            PaymentStatus::Success
        } else {
            PaymentStatus::Failed
        };
        let tx_id = session.update_payment_transaction_status(tx_hash, status)?;
        if receipt.succeeded {
            let payload: TransactionPayload = serde_json::from_str(tx_data)?;
            let entries: Vec<(String, Decimal)> = payload
                .miners
                .into_iter()
                .zip(payload.amounts)
                .collect();
            session.insert_payments(tx_id, self.config.mining_round, &entries, Utc::now());
            info!(%tx_hash, holders = entries.len(), "transaction succeeded, payments recorded");
        } else {
            warn!(%tx_hash, "transaction failed, holders remain unpaid");
        }
        session.commit()
    }

    fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.config.wait_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MiningStore;
    use tempfile::tempdir;

    struct CountingChain {
        count: u64,
    }

    impl ChainGateway for CountingChain {
        fn transaction_count(&self, _address: &str) -> MiningResult<u64> {
            Ok(self.count)
        }

        fn disperse_token(
            &self,
            _token: &str,
            _holders: &[String],
            _amounts: &[Wad],
            _nonce: u64,
            _gas_price_wei: u128,
        ) -> MiningResult<String> {
            unreachable!("not used in nonce tests")
        }

        fn wait_for_receipt(&self, _tx_hash: &str, _timeout: Duration) -> MiningResult<TxReceipt> {
            unreachable!("not used in nonce tests")
        }
    }

    #[test]
    fn nonce_seeds_from_chain_when_store_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        let chain = CountingChain { count: 41 };
        let mut nonce = NonceSource::new();
        let session = store.session();
        assert_eq!(nonce.next(&session, &chain, "0xpayer").unwrap(), 43);
        assert_eq!(nonce.next(&session, &chain, "0xpayer").unwrap(), 44);
    }

    #[test]
    fn nonce_seeds_from_persisted_transactions() {
        let dir = tempdir().expect("tempdir");
        let store = MiningStore::open(dir.path().join("mining.db")).expect("open");
        {
            let mut session = store.session();
            session.insert_payment_transaction(17, "0xaa", "{}".into());
            session.commit().expect("commit");
        }
        let chain = CountingChain { count: 0 };
        let mut nonce = NonceSource::new();
        let session = store.session();
        assert_eq!(nonce.next(&session, &chain, "0xpayer").unwrap(), 18);
        assert_eq!(nonce.next(&session, &chain, "0xpayer").unwrap(), 19);
    }
}
