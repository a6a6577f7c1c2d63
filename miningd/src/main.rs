use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mining::{
    BlockSyncer, Config, EthChain, GasOracle, MiningError, MiningStore, Payer, ShareMining,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Liquidity-mining daemon: reward-engine hooks for the block watcher and
/// the one-shot payout cycle.
#[derive(Parser)]
#[command(name = "miningd", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "MINING_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute and persist rewards for one observed block.
    Sync {
        #[arg(long)]
        block: u64,
        #[arg(long, default_value = "")]
        block_hash: String,
    },
    /// Drop rewards above a block after a chain reorganization.
    Rollback {
        #[arg(long)]
        block: u64,
    },
    /// Run one payout cycle: reconcile open transactions, then pay.
    Pay,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(?err, path = %cli.config.display(), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Configuration problems are fatal; everything else is retried
            // by the scheduler or the watcher on the next invocation.
            if err
                .downcast_ref::<MiningError>()
                .is_some_and(|err| matches!(err, MiningError::Config(_)))
            {
                error!(?err, "fatal configuration error");
                return ExitCode::FAILURE;
            }
            error!(?err, "cycle failed, will retry on next invocation");
            ExitCode::SUCCESS
        }
    }
}

fn run(config: Config, command: Command) -> anyhow::Result<()> {
    let store = MiningStore::open(&config.store_path)
        .with_context(|| format!("open store {}", config.store_path.display()))?;

    match command {
        Command::Sync { block, block_hash } => {
            let engine = ShareMining::new(config);
            let mut session = store.session();
            engine.sync(block, &block_hash, &mut session)?;
            session.commit()?;
            info!(block, "reward sync complete");
        }
        Command::Rollback { block } => {
            let engine = ShareMining::new(config);
            let mut session = store.session();
            engine.rollback(block, &mut session)?;
            session.commit()?;
            info!(block, "reward rollback complete");
        }
        Command::Pay => {
            let chain = EthChain::new(&config)?;
            let gas = GasOracle::new(config.eth_gas_url.clone(), config.gas_level.clone())?;
            let mut payer = Payer::new(&store, chain, gas, config);
            let report = payer.run()?;
            info!(
                reconciled = report.reconciled,
                submitted = report.submitted.as_deref().unwrap_or("none"),
                "payout cycle complete"
            );
        }
    }
    Ok(())
}
