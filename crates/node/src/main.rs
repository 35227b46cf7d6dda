//! Random beacon node.
//!
//! This binary provides commands for:
//! - Simulating an epoch (DKG plus beacon rounds) with N in-process nodes
//! - Inspecting a stored epoch checkpoint

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use group::Curve;
use tracing::info;

use beacon_coordinator::{CheckpointStore, FileCheckpointStore};
use beacon_crypto::bls::compress_g2;
use beacon_crypto::threshold::public_key_share;
use beacon_node::{load_config, simulate, ConfigOverrides, SimulationOptions};
use beacon_types::PartyId;

#[derive(Parser)]
#[command(name = "beacon-node")]
#[command(about = "Threshold BLS random beacon node")]
struct Cli {
    /// Protocol configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the signing threshold
    #[arg(short = 't', long)]
    threshold: Option<u32>,

    /// Override the participant list (comma separated node ids)
    #[arg(long, value_delimiter = ',')]
    participants: Option<Vec<String>>,

    /// Override the expected network delay in milliseconds
    #[arg(long)]
    network_delay_ms: Option<u64>,

    /// Directory holding epoch checkpoints and metadata
    #[arg(long, default_value = "./beacon-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every participant in-process through the DKG and some beacon rounds
    Simulate {
        /// Epoch (magic block) number
        #[arg(long, default_value = "1")]
        epoch: i64,

        /// First round to run
        #[arg(long, default_value = "1")]
        start_round: u64,

        /// Number of rounds
        #[arg(short, long, default_value = "5")]
        rounds: u64,

        /// PartyIDs whose messages are dropped after the DKG
        #[arg(long, value_delimiter = ',')]
        silent: Vec<u32>,

        /// Deliver every message twice
        #[arg(long)]
        duplicate: bool,

        /// Give up on the DKG or a round after this many milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// Run the DKG even if checkpoints exist
        #[arg(long)]
        fresh_dkg: bool,
    },

    /// Show a stored checkpoint (the secret share is never printed)
    ShowCheckpoint {
        /// Epoch (magic block) number
        #[arg(long)]
        epoch: i64,

        /// PartyID of the node
        #[arg(long)]
        party: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("beacon_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    ConfigOverrides {
        threshold: cli.threshold,
        participants: cli.participants,
        network_delay_ms: cli.network_delay_ms,
    }
    .apply(&mut config);

    match cli.command {
        Commands::Simulate {
            epoch,
            start_round,
            rounds,
            silent,
            duplicate,
            timeout_ms,
            fresh_dkg,
        } => {
            let silent = silent
                .into_iter()
                .map(|id| PartyId::new(id).ok_or_else(|| anyhow!("PartyIDs start at 1")))
                .collect::<Result<Vec<_>>>()?;
            let options = SimulationOptions {
                epoch,
                start_round,
                rounds,
                silent,
                duplicate,
                timeout: Duration::from_millis(timeout_ms),
                fresh_dkg,
            };

            info!(
                participants = config.participants.len(),
                threshold = config.threshold,
                epoch,
                "Starting simulation"
            );
            let report = simulate(&config, &cli.data_dir, &options).await?;

            if report.restored {
                println!("Epoch {} restored from checkpoints", epoch);
            }
            for beacon in &report.beacons {
                println!(
                    "round {:>6}  seed {:>20}  beacon {}",
                    beacon.round,
                    beacon.seed,
                    hex::encode(beacon.output)
                );
            }
            if let Some(round) = report.stalled_round {
                println!("round {:>6}  stalled below threshold", round);
            }
        }

        Commands::ShowCheckpoint { epoch, party } => {
            let party = PartyId::new(party).ok_or_else(|| anyhow!("PartyIDs start at 1"))?;
            let store = FileCheckpointStore::open(cli.data_dir.join(format!("party-{party}")))?;
            let checkpoint = store
                .get(epoch)?
                .ok_or_else(|| anyhow!("No checkpoint for epoch {} at party {}", epoch, party))?;

            println!("Epoch {}:", checkpoint.epoch_id);
            println!("  Party: {}", party);
            println!("  Last random seed: {}", checkpoint.last_random_seed);

            let shared = FileCheckpointStore::open(&cli.data_dir)?;
            if let Some(metadata) = shared.load_metadata(epoch)? {
                let group_vvec = metadata.group_vvec()?.to_points()?;
                let public_share = public_key_share(&group_vvec, party)?;
                println!("  Threshold: {}/{}", metadata.threshold, metadata.participants.len());
                if let Some(group_key) = group_vvec.first() {
                    println!(
                        "  Group public key: {}",
                        compress_g2(&group_key.to_affine()).to_hex()
                    );
                }
                println!(
                    "  Public key share: {}",
                    compress_g2(&public_share.to_affine()).to_hex()
                );
            }
        }
    }

    Ok(())
}
