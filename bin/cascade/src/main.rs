//! Cascade Node Binary
//!
//! Usage:
//!   cascade genesis --validators 4 --output genesis.json
//!   cascade simulate --validators 4 --rounds 50 --seed 7

#![allow(missing_docs)]

mod simulation;

use cascade_dag::BlockSigner;
use cascade_genesis::GenesisBuilder;
use cascade_node::InMemoryExecutor;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Cascade CBC Casper consensus tools
#[derive(Debug, Parser)]
#[command(name = "cascade", version)]
#[command(about = "Correct-by-construction Casper over a block DAG")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a devnet genesis file bonding the deterministic validator keys
    Genesis(GenesisArgs),
    /// Run several validators in one process with shuffled, delayed delivery
    Simulate(simulation::SimulateArgs),
}

#[derive(Debug, Args)]
struct GenesisArgs {
    /// Number of validators
    #[arg(long, short = 'n', default_value = "4", env = "CASCADE_VALIDATORS")]
    validators: u8,

    /// Output file
    #[arg(long, short = 'o', default_value = "genesis.json", env = "CASCADE_GENESIS")]
    output: PathBuf,
}

/// Deterministic devnet validator keys
fn validator_signers(count: u8) -> eyre::Result<Vec<BlockSigner>> {
    (0..count)
        .map(|index| {
            BlockSigner::from_seed(format!("cascade-validator-{index}").as_bytes())
                .map_err(Into::into)
        })
        .collect()
}

fn write_genesis(args: GenesisArgs) -> eyre::Result<()> {
    eyre::ensure!(args.validators > 0, "at least one validator is required");

    let validators: Vec<_> =
        validator_signers(args.validators)?.iter().map(BlockSigner::address).collect();
    let genesis = GenesisBuilder::devnet(&validators)
        .write_json(&InMemoryExecutor::new(), &args.output)?;

    info!(
        target: "cascade::cli",
        path = %args.output.display(),
        hash = %genesis.block.hash,
        post_state = %genesis.block.post_state_hash,
        validators = validators.len(),
        "Genesis written"
    );
    for validator in validators {
        info!(target: "cascade::cli", %validator, "Validator bonded");
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    match Cli::parse().command {
        Command::Genesis(args) => write_genesis(args),
        Command::Simulate(args) => simulation::run(args),
    }
}
