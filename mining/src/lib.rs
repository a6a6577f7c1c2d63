pub mod chain;
pub mod config;
pub mod disperse;
pub mod engine;
pub mod error;
pub mod gas;
pub mod payer;
pub mod round;
pub mod store;
pub mod wad;

pub use chain::{ChainGateway, EthChain, TxReceipt};
pub use config::{Config, FactorConstants, ForkSchedule, PoolAddresses};
pub use engine::{BlockSyncer, ShareMining};
pub use error::{MiningError, MiningResult};
pub use gas::GasOracle;
pub use payer::{CycleReport, NonceSource, Payer};
pub use round::{PoolKind, PoolName, PoolPass, PoolSpec, Round};
pub use store::{
    ImmatureMiningReward, MiningStore, Payment, PaymentStatus, PaymentTransaction,
    PerpShareAmmMap, RoundPayment, StoreSession, TheoryMiningReward,
};
pub use wad::{Wad, WAD_DECIMALS};
