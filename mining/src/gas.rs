//! Gas-price oracle client.
//!
//! The oracle serves a JSON object keyed by speed label, in tenths of gwei.
//! Any failure leaves the previously cached price in place, so a flaky
//! oracle can never stall a payout cycle.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{MiningError, MiningResult};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_GAS_PRICE_WEI: u128 = 10_000_000_000; // 10 gwei
const WEI_PER_TENTH_GWEI: f64 = 100_000_000.0;

pub struct GasOracle {
    client: reqwest::blocking::Client,
    url: String,
    level: String,
    price_wei: u128,
}

impl GasOracle {
    pub fn new(url: impl Into<String>, level: impl Into<String>) -> MiningResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            level: level.into(),
            price_wei: DEFAULT_GAS_PRICE_WEI,
        })
    }

    pub fn price_wei(&self) -> u128 {
        self.price_wei
    }

    /// Fetches a fresh price; keeps the cached one on any failure.
    pub fn refresh(&mut self) {
        match self.fetch() {
            Ok(price_wei) => {
                self.price_wei = price_wei;
                info!(price_wei, "refreshed gas price");
            }
            Err(err) => {
                warn!(?err, price_wei = self.price_wei, "gas price refresh failed, keeping cached value");
            }
        }
    }

    fn fetch(&self) -> MiningResult<u128> {
        let response = self.client.get(&self.url).send()?;
        if !response.status().is_success() {
            return Err(MiningError::Http(format!(
                "gas oracle returned {}",
                response.status()
            )));
        }
        let body: Value = response.json()?;
        parse_gas_price(&body, &self.level).ok_or_else(|| {
            MiningError::Http(format!("gas level {} missing from oracle response", self.level))
        })
    }
}

/// The oracle reports tenths of gwei; the chain wants wei.
fn parse_gas_price(body: &Value, level: &str) -> Option<u128> {
    let tenths_of_gwei = body.get(level)?.as_f64()?;
    if !tenths_of_gwei.is_finite() || tenths_of_gwei < 0.0 {
        return None;
    }
    Some((tenths_of_gwei * WEI_PER_TENTH_GWEI) as u128)
}
