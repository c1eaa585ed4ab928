//! In-process multi-validator simulation
//!
//! Every validator owns an executor, a [`Casper`] engine and a [`BlockGossip`] front end. Each
//! round one validator proposes; the block lands in every other inbox, and inboxes are delivered
//! in shuffled order with some blocks held back, so nodes see the DAG grow out of order and
//! fork. Fetch requests are answered from the set of published blocks. After the last round all
//! inboxes are drained; every node must hold every block and no two finalized blocks may conflict.

use alloy_primitives::{Address, B256, U256};
use cascade_consensus::Executor;
use cascade_dag::{Block, BlockSigner, Deploy, DeployOp};
use cascade_finality::FinalityConfig;
use cascade_genesis::{Genesis, GenesisBuilder, GenesisConfig, GenesisError};
use cascade_gossip::{fetch_channel, BlockGossip, FetchReceiver, GossipConfig};
use cascade_node::{Casper, CasperBuilder, CasperConfig, InMemoryExecutor};
use clap::Args;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tracing::{debug, info};

/// Distinct state keys deploys touch
const KEY_SPACE: u8 = 16;

#[derive(Debug, Args)]
pub(crate) struct SimulateArgs {
    /// Number of validators
    #[arg(long, short = 'n', default_value = "4", env = "CASCADE_VALIDATORS")]
    validators: u8,

    /// Number of proposals
    #[arg(long, short = 'r', default_value = "40")]
    rounds: u64,

    /// RNG seed for proposers, deploys and delivery order
    #[arg(long, default_value = "42", env = "CASCADE_SEED")]
    seed: u64,

    /// Probability that a block is held back for another round
    #[arg(long, default_value = "0.3")]
    delay: f64,

    /// Deploys per proposed block
    #[arg(long, default_value = "2")]
    deploys: usize,

    /// Maximum parents per block
    #[arg(long, default_value_t = cascade_node::config::DEFAULT_MAX_PARENTS)]
    max_parents: usize,

    /// Fault tolerance above which a pending block counts as final
    #[arg(long, default_value_t = cascade_finality::config::DEFAULT_FAULT_TOLERANCE_THRESHOLD)]
    fault_tolerance_threshold: f64,

    /// Start from a genesis file instead of a fresh devnet
    #[arg(long, env = "CASCADE_GENESIS")]
    genesis: Option<PathBuf>,
}

enum GenesisSource {
    File(PathBuf),
    Devnet(GenesisConfig),
}

impl GenesisSource {
    fn build(&self, executor: &dyn Executor) -> Result<Genesis, GenesisError> {
        match self {
            Self::File(path) => GenesisBuilder::load(executor, path),
            Self::Devnet(config) => GenesisBuilder::new(config.clone()).build(executor),
        }
    }
}

struct SimNode {
    address: Address,
    casper: Arc<Casper>,
    gossip: BlockGossip,
    fetch_rx: FetchReceiver,
    inbox: Vec<Arc<Block>>,
}

impl SimNode {
    fn new(
        signer: BlockSigner,
        genesis: &GenesisSource,
        config: CasperConfig,
    ) -> eyre::Result<Self> {
        let address = signer.address();
        let executor = Arc::new(InMemoryExecutor::new());
        let genesis = genesis.build(executor.as_ref())?;
        eyre::ensure!(
            genesis.block.bonds.contains_key(&address),
            "validator {address} is not bonded in genesis"
        );

        let casper = Arc::new(
            CasperBuilder::new(executor).with_signer(signer).with_config(config).build(&genesis)?,
        );
        let gossip_config = GossipConfig::default();
        let (fetch_tx, fetch_rx) = fetch_channel(gossip_config.channel_size);
        let gossip = BlockGossip::new(casper.clone(), fetch_tx, gossip_config);

        Ok(Self { address, casper, gossip, fetch_rx, inbox: Vec::new() })
    }

    /// Hand the inbox to gossip in random order, keeping each block back with `delay` odds
    fn deliver(&mut self, rng: &mut StdRng, delay: f64) -> eyre::Result<()> {
        let mut inbox = std::mem::take(&mut self.inbox);
        inbox.shuffle(rng);
        for block in inbox {
            if rng.random_bool(delay) {
                self.inbox.push(block);
            } else {
                self.gossip.process_block(block)?;
            }
        }
        Ok(())
    }

    /// Queue every requested block that has been published
    fn serve_fetches(&mut self, published: &HashMap<B256, Arc<Block>>) {
        while let Ok(request) = self.fetch_rx.try_recv() {
            if let Some(block) = published.get(&request.hash) {
                debug!(
                    target: "cascade::sim",
                    node = %self.address,
                    hash = %request.hash,
                    "Fetch served"
                );
                self.inbox.push(Arc::clone(block));
            }
        }
    }
}

fn random_deploys(rng: &mut StdRng, account: Address, round: u64, count: usize) -> Vec<Deploy> {
    (0..count as u64)
        .map(|index| {
            let key = B256::with_last_byte(rng.random_range(0..KEY_SPACE));
            // Adds commute with each other, writes conflict with everything
            let op = if rng.random_bool(0.7) {
                DeployOp::Add(key, U256::from(rng.random_range(1..100u64)))
            } else {
                DeployOp::Write(key, U256::from(rng.random_range(0..1_000u64)))
            };
            Deploy::new(account, round * 1_000 + index, vec![op])
        })
        .collect()
}

pub(crate) fn run(args: SimulateArgs) -> eyre::Result<()> {
    eyre::ensure!(args.validators > 0, "at least one validator is required");
    eyre::ensure!((0.0..=1.0).contains(&args.delay), "delay must be a probability");

    let signers = crate::validator_signers(args.validators)?;
    let genesis = match args.genesis {
        Some(path) => GenesisSource::File(path),
        None => {
            let validators: Vec<_> = signers.iter().map(BlockSigner::address).collect();
            GenesisSource::Devnet(GenesisConfig::devnet(&validators))
        }
    };
    let config = CasperConfig::default().with_max_parents(args.max_parents).with_finality(
        FinalityConfig::default().with_fault_tolerance_threshold(args.fault_tolerance_threshold),
    );
    let mut nodes = signers
        .into_iter()
        .map(|signer| SimNode::new(signer, &genesis, config))
        .collect::<eyre::Result<Vec<_>>>()?;

    info!(
        target: "cascade::sim",
        validators = nodes.len(),
        rounds = args.rounds,
        seed = args.seed,
        delay = args.delay,
        "Starting simulation"
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut published = HashMap::new();
    for round in 0..args.rounds {
        let proposer = rng.random_range(0..nodes.len());
        let deploys = random_deploys(&mut rng, nodes[proposer].address, round, args.deploys);
        let block = nodes[proposer].casper.propose(deploys)?;
        info!(
            target: "cascade::sim",
            round,
            proposer = %nodes[proposer].address,
            hash = %block.hash,
            rank = block.rank,
            parents = block.parents.len(),
            "Block proposed"
        );

        published.insert(block.hash, Arc::clone(&block));
        for (index, node) in nodes.iter_mut().enumerate() {
            if index != proposer {
                node.inbox.push(Arc::clone(&block));
            }
        }
        for node in &mut nodes {
            node.deliver(&mut rng, args.delay)?;
            node.serve_fetches(&published);
        }
    }

    // Drain everything still in flight
    while nodes.iter().any(|node| !node.inbox.is_empty()) {
        for node in &mut nodes {
            node.deliver(&mut rng, 0.0)?;
            node.serve_fetches(&published);
        }
    }

    report(&nodes, published.len())
}

fn report(nodes: &[SimNode], published: usize) -> eyre::Result<()> {
    let mut outcomes = Vec::with_capacity(nodes.len());
    for node in nodes {
        let snapshot = node.casper.snapshot();
        let lfb = node.casper.last_finalized_block();
        let tips = node.casper.estimator()?;
        let lfb_rank = snapshot.lookup(&lfb).map(|meta| meta.rank).unwrap_or_default();

        info!(
            target: "cascade::sim",
            node = %node.address,
            blocks = snapshot.len(),
            pending = node.gossip.pending_len(),
            equivocators = snapshot.equivocators().len(),
            %lfb,
            lfb_rank,
            tips = tips.len(),
            "Node state"
        );
        outcomes.push((snapshot.len(), lfb, tips.first().copied()));
    }

    let snapshot = nodes[0].casper.snapshot();
    eyre::ensure!(
        outcomes.iter().all(|(blocks, _, _)| *blocks == published + 1),
        "not every published block was imported"
    );
    // Finalized blocks of any two nodes must lie on one main chain
    for (_, a, _) in &outcomes {
        for (_, b, _) in &outcomes {
            eyre::ensure!(
                snapshot.is_in_main_chain(a, b) || snapshot.is_in_main_chain(b, a),
                "conflicting finalized blocks {a} and {b}"
            );
        }
    }

    let (_, lfb, tip) = outcomes[0];
    let agreed = outcomes.iter().all(|(_, other, other_tip)| (*other, *other_tip) == (lfb, tip));
    info!(
        target: "cascade::sim",
        %lfb,
        tip = ?tip,
        lfb_fault_tolerance = nodes[0].casper.normalized_fault_tolerance(&lfb)?,
        agreed,
        "Simulation complete"
    );
    Ok(())
}
