//! Ethereum JSON-RPC client and transaction signing.
//!
//! The payer talks to a single node endpoint over HTTP with an explicit
//! request timeout. Transactions are legacy EIP-155: RLP-encoded, hashed
//! with keccak256 and signed locally with the payer key, so the node never
//! needs an unlocked account.

use std::thread;
use std::time::{Duration, Instant};

use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::disperse::{disperse_token_calldata, parse_address};
use crate::error::{MiningError, MiningResult};
use crate::wad::Wad;

/// The only receipt fields the payer acts on.
#[derive(Clone, Debug)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub succeeded: bool,
}

/// Seam between the payer and the chain; tests drive the payer through a
/// scripted implementation.
pub trait ChainGateway {
    fn transaction_count(&self, address: &str) -> MiningResult<u64>;

    /// Submits one batched `disperseToken` call and returns its hash.
    fn disperse_token(
        &self,
        token: &str,
        holders: &[String],
        amounts: &[Wad],
        nonce: u64,
        gas_price_wei: u128,
    ) -> MiningResult<String>;

    /// Blocks on the receipt up to `timeout`.
    fn wait_for_receipt(&self, tx_hash: &str, timeout: Duration) -> MiningResult<TxReceipt>;
}

pub struct EthChain {
    client: reqwest::blocking::Client,
    endpoint: Url,
    chain_id: u64,
    payer_address: String,
    disperse_address: String,
    signer: SigningKey,
    receipt_poll: Duration,
}

impl EthChain {
    pub fn new(config: &Config) -> MiningResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_secs))
            .build()?;
        let endpoint = Url::parse(&config.rpc_url)
            .map_err(|err| MiningError::Config(format!("bad rpc_url {}: {err}", config.rpc_url)))?;
        let key_bytes = hex::decode(config.payer_key.trim_start_matches("0x"))
            .map_err(|err| MiningError::Config(format!("payer_key is not hex: {err}")))?;
        let signer = SigningKey::from_slice(&key_bytes)
            .map_err(|err| MiningError::Config(format!("payer_key rejected: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            chain_id: config.chain_id,
            payer_address: config.payer_address.clone(),
            disperse_address: config.disperse_address.clone(),
            signer,
            receipt_poll: Duration::from_secs(config.receipt_poll_secs.max(1)),
        })
    }

    fn call(&self, method: &str, params: Value) -> MiningResult<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()?;
        if !response.status().is_success() {
            return Err(MiningError::ChainRpc(format!(
                "{method} returned {}",
                response.status()
            )));
        }
        let body: Value = response.json()?;
        if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
            return Err(MiningError::ChainRpc(format!("{method} failed: {error}")));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    fn estimate_gas(&self, to: &str, data: &[u8]) -> MiningResult<u64> {
        let result = self.call(
            "eth_estimateGas",
            json!([{
                "from": self.payer_address,
                "to": to,
                "data": format!("0x{}", hex::encode(data)),
            }]),
        )?;
        parse_quantity(&result)
    }
}

impl ChainGateway for EthChain {
    fn transaction_count(&self, address: &str) -> MiningResult<u64> {
        let result = self.call("eth_getTransactionCount", json!([address, "latest"]))?;
        parse_quantity(&result)
    }

    fn disperse_token(
        &self,
        token: &str,
        holders: &[String],
        amounts: &[Wad],
        nonce: u64,
        gas_price_wei: u128,
    ) -> MiningResult<String> {
        let data = disperse_token_calldata(token, holders, amounts)?;
        let gas_limit = match self.estimate_gas(&self.disperse_address, &data) {
            Ok(estimate) => estimate,
            Err(err) => {
                let fallback = fallback_gas_limit(holders.len());
                warn!(?err, fallback, "gas estimate failed, using fallback limit");
                fallback
            }
        };
        let tx = LegacyTransaction {
            nonce,
            gas_price: gas_price_wei,
            gas_limit,
            to: parse_address(&self.disperse_address)?,
            value: 0,
            data,
        };
        let raw = sign_legacy(&tx, &self.signer, self.chain_id)?;
        let result = self.call(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MiningError::ChainRpc("eth_sendRawTransaction returned no hash".into()))
    }

    fn wait_for_receipt(&self, tx_hash: &str, timeout: Duration) -> MiningResult<TxReceipt> {
        let deadline = Instant::now() + timeout;
        loop {
            let result = self.call("eth_getTransactionReceipt", json!([tx_hash]))?;
            if !result.is_null() {
                let succeeded = result
                    .get("status")
                    .and_then(Value::as_str)
                    .map(|status| parse_quantity(&Value::String(status.to_string())))
                    .transpose()?
                    .unwrap_or(0)
                    == 1;
                return Ok(TxReceipt {
                    transaction_hash: tx_hash.to_string(),
                    succeeded,
                });
            }
            if Instant::now() >= deadline {
                return Err(MiningError::ReceiptTimeout(tx_hash.to_string()));
            }
            debug!(%tx_hash, "receipt not available yet");
            thread::sleep(
                self.receipt_poll
                    .min(deadline.saturating_duration_since(Instant::now())),
            );
        }
    }
}

struct LegacyTransaction {
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: [u8; 20],
    value: u128,
    data: Vec<u8>,
}

/// RLP-encodes and signs per EIP-155: the sighash covers
/// `(nonce, gasPrice, gas, to, value, data, chainId, 0, 0)` and the final
/// `v` folds the chain id in.
fn sign_legacy(tx: &LegacyTransaction, signer: &SigningKey, chain_id: u64) -> MiningResult<Vec<u8>> {
    let mut unsigned = RlpStream::new_list(9);
    append_payload(&mut unsigned, tx);
    unsigned.append(&rlp_uint(chain_id as u128));
    unsigned.append(&rlp_uint(0));
    unsigned.append(&rlp_uint(0));
    let sighash = Keccak256::digest(unsigned.out());

    let (signature, recovery_id) = signer
        .sign_prehash_recoverable(&sighash)
        .map_err(|err| MiningError::ChainRpc(format!("transaction signing failed: {err}")))?;
    let (r, s) = signature.split_bytes();
    let v = chain_id * 2 + 35 + u64::from(recovery_id.to_byte());

    let mut signed = RlpStream::new_list(9);
    append_payload(&mut signed, tx);
    signed.append(&rlp_uint(v as u128));
    signed.append(&strip_leading_zeros(&r));
    signed.append(&strip_leading_zeros(&s));
    Ok(signed.out().to_vec())
}

fn append_payload(stream: &mut RlpStream, tx: &LegacyTransaction) {
    stream.append(&rlp_uint(tx.nonce as u128));
    stream.append(&rlp_uint(tx.gas_price));
    stream.append(&rlp_uint(tx.gas_limit as u128));
    stream.append(&tx.to.to_vec());
    stream.append(&rlp_uint(tx.value));
    stream.append(&tx.data);
}

/// RLP integers are their minimal big-endian bytes; zero is the empty
/// string.
fn rlp_uint(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|byte| *byte != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|byte| *byte != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

/// A disperse loop costs roughly a transfer per recipient; leave headroom.
fn fallback_gas_limit(recipients: usize) -> u64 {
    100_000 + 60_000 * recipients as u64
}

fn parse_quantity(value: &Value) -> MiningResult<u64> {
    let text = value
        .as_str()
        .ok_or_else(|| MiningError::ChainRpc(format!("expected quantity, got {value}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|err| MiningError::ChainRpc(format!("bad quantity {text}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[0x42u8; 32]).expect("key")
    }

    #[test]
    fn signed_transaction_is_a_nine_item_list() {
        let tx = LegacyTransaction {
            nonce: 7,
            gas_price: 20_000_000_000,
            gas_limit: 150_000,
            to: [0x11; 20],
            value: 0,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let raw = sign_legacy(&tx, &test_key(), 1).expect("sign");
        let rlp = rlp::Rlp::new(&raw);
        assert!(rlp.is_list());
        assert_eq!(rlp.item_count().expect("items"), 9);
        // v encodes the chain id per EIP-155: 37 or 38 on mainnet.
        let v: u64 = rlp.val_at(6).expect("v");
        assert!(v == 37 || v == 38);
        let nonce: u64 = rlp.val_at(0).expect("nonce");
        assert_eq!(nonce, 7);
    }

    #[test]
    fn rlp_uint_is_minimal() {
        assert!(rlp_uint(0).is_empty());
        assert_eq!(rlp_uint(1), vec![1]);
        assert_eq!(rlp_uint(256), vec![1, 0]);
    }

    #[test]
    fn quantities_parse_hex() {
        assert_eq!(parse_quantity(&Value::String("0x1a".into())).unwrap(), 26);
        assert_eq!(parse_quantity(&Value::String("0x0".into())).unwrap(), 0);
        assert!(parse_quantity(&Value::Null).is_err());
    }
}
