//! N beacon nodes in one process.
//!
//! Every node gets its own router task and checkpoint directory
//! (`<data_dir>/party-<id>`); the epoch metadata is shared under
//! `<data_dir>`. If every node already has a checkpoint for the epoch the
//! DKG is skipped and the signer is rebuilt from the stored metadata.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rand::rngs::OsRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use beacon_coordinator::{
    CheckpointStore, EpochMetadata, FileCheckpointStore, InMemoryNetwork, MessageRouter,
    NetworkEndpoint, PartyVvec, ProtocolConfig, RoundBeacon, RoundSignatureCoordinator,
    ShareExchangeCoordinator, SignerIdentity,
};
use beacon_dkg::{DkgConfig, DkgEngine, GroupSecretShare, PartyRoster};
use beacon_types::{EpochId, PartyId, RandomSeed, Round, GENESIS_RANDOM_SEED};

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub epoch: EpochId,
    /// First round to run; later rounds chain from the checkpoint's last seed
    pub start_round: Round,
    pub rounds: u64,
    /// Parties whose outbound traffic is dropped once the DKG is done
    pub silent: Vec<PartyId>,
    /// Deliver every message twice
    pub duplicate: bool,
    /// How long the DKG and each round may take before the run gives up
    pub timeout: Duration,
    /// Ignore existing checkpoints
    pub fresh_dkg: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            epoch: 1,
            start_round: 1,
            rounds: 3,
            silent: Vec::new(),
            duplicate: false,
            timeout: Duration::from_secs(10),
            fresh_dkg: false,
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// The DKG was skipped in favour of stored checkpoints
    pub restored: bool,
    pub beacons: Vec<RoundBeacon>,
    /// First round that did not reach the threshold in time
    pub stalled_round: Option<Round>,
}

struct Node {
    party: PartyId,
    endpoint: Arc<NetworkEndpoint>,
    router: Arc<MessageRouter>,
    store: FileCheckpointStore,
}

struct EpochKeys {
    metadata: EpochMetadata,
    secrets: Vec<GroupSecretShare>,
    last_seed: RandomSeed,
}

pub async fn simulate(
    config: &ProtocolConfig,
    data_dir: &Path,
    options: &SimulationOptions,
) -> Result<SimulationReport> {
    config.validate()?;
    let roster = PartyRoster::from_node_ids(&config.participants);
    if !roster.excluded().is_empty() {
        warn!(excluded = ?roster.excluded(), "Some participants were excluded from the epoch");
    }
    let n = u32::try_from(roster.len())?;
    let dkg_config = DkgConfig::new(n, config.threshold, options.epoch)?;
    let shared = FileCheckpointStore::open(data_dir)?;

    let network = InMemoryNetwork::new();
    network.set_duplicate_delivery(options.duplicate);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let mut nodes = Vec::with_capacity(roster.len());
    for party in roster.parties() {
        let inbox = network.register(party);
        let router = Arc::new(MessageRouter::new(party, n));
        tasks.push(tokio::spawn({
            let router = router.clone();
            let shutdown = shutdown_rx.clone();
            async move { router.run(inbox, shutdown).await }
        }));
        nodes.push(Node {
            party,
            endpoint: Arc::new(network.endpoint(party)),
            router,
            store: FileCheckpointStore::open(data_dir.join(format!("party-{party}")))?,
        });
    }

    let restored = if options.fresh_dkg {
        None
    } else {
        restore(&shared, &nodes, &roster, options.epoch)?
    };
    let is_restored = restored.is_some();
    let keys = match restored {
        Some(keys) => keys,
        None => {
            let keys = run_dkg(
                &nodes,
                &roster,
                dkg_config,
                config,
                options,
                &shutdown_rx,
                &mut tasks,
            )
            .await?;
            shared.save_metadata(&keys.metadata)?;
            for (node, secret) in nodes.iter().zip(&keys.secrets) {
                node.store.save(options.epoch, secret, keys.last_seed)?;
            }
            keys
        }
    };

    let signer = keys.metadata.signer()?;
    let mut coordinators = Vec::with_capacity(nodes.len());
    for (node, secret) in nodes.iter().zip(&keys.secrets) {
        let identity = SignerIdentity {
            epoch: options.epoch,
            party: node.party,
            n,
        };
        let coordinator = Arc::new(RoundSignatureCoordinator::new(
            identity,
            signer.clone(),
            secret.clone(),
            node.endpoint.clone(),
            config.max_buffered_rounds,
        )?);
        node.router.attach_rounds(coordinator.clone());
        coordinators.push(coordinator);
    }

    for party in &options.silent {
        info!(party = party.get(), "Silencing party");
        network.silence(*party);
    }

    let mut report = SimulationReport {
        restored: is_restored,
        beacons: Vec::new(),
        stalled_round: None,
    };
    let mut previous = keys.last_seed;
    for round in options.start_round..options.start_round.saturating_add(options.rounds) {
        for coordinator in &coordinators {
            coordinator.begin_round(round, Some(previous))?;
        }
        match timeout(
            options.timeout,
            wait_for_agreement(&coordinators, round, shutdown_rx.clone()),
        )
        .await
        {
            Ok(beacon) => {
                let beacon = beacon?;
                previous = beacon.seed;
                report.beacons.push(beacon);
            }
            Err(_) => {
                warn!(round, "Round stalled below threshold, cancelling");
                report.stalled_round = Some(round);
                break;
            }
        }
    }

    if !report.beacons.is_empty() {
        for (node, secret) in nodes.iter().zip(&keys.secrets) {
            node.store.save(options.epoch, secret, previous)?;
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(report)
}

/// Load every node's checkpoint, or `None` if any is missing.
fn restore(
    shared: &FileCheckpointStore,
    nodes: &[Node],
    roster: &PartyRoster,
    epoch: EpochId,
) -> Result<Option<EpochKeys>> {
    let Some(metadata) = shared.load_metadata(epoch)? else {
        return Ok(None);
    };
    if metadata.participants != roster.node_ids() {
        warn!(epoch, "Stored metadata has a different participant list, running DKG");
        return Ok(None);
    }

    let mut secrets = Vec::with_capacity(nodes.len());
    let mut last_seed = None;
    for node in nodes {
        let Some((secret, seed)) = node.store.load(epoch)? else {
            return Ok(None);
        };
        if last_seed.is_some_and(|last| last != seed) {
            warn!(party = node.party.get(), "Checkpoints disagree on the last seed");
        }
        last_seed.get_or_insert(seed);
        secrets.push(secret);
    }

    info!(epoch, "Restored epoch from checkpoints");
    Ok(Some(EpochKeys {
        metadata,
        secrets,
        last_seed: last_seed.unwrap_or(GENESIS_RANDOM_SEED),
    }))
}

async fn run_dkg(
    nodes: &[Node],
    roster: &PartyRoster,
    dkg_config: DkgConfig,
    config: &ProtocolConfig,
    options: &SimulationOptions,
    shutdown: &watch::Receiver<bool>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<EpochKeys> {
    let mut exchanges = Vec::with_capacity(nodes.len());
    for node in nodes {
        let engine = DkgEngine::initialize(dkg_config, node.party, &mut OsRng)?;
        let exchange = Arc::new(ShareExchangeCoordinator::new(engine, node.endpoint.clone()));
        node.router.attach_shares(exchange.clone());
        exchanges.push(exchange);
    }

    // Verification vectors are published out of band before shares flow.
    let vvecs: Vec<PartyVvec> = exchanges
        .iter()
        .map(|exchange| PartyVvec {
            party: exchange.party(),
            vvec: exchange.publish_vvec(),
        })
        .collect();
    for exchange in &exchanges {
        for entry in vvecs.iter().filter(|entry| entry.party != exchange.party()) {
            exchange.register_peer_vvec(entry.party, &entry.vvec)?;
        }
    }

    for exchange in &exchanges {
        tasks.push(tokio::spawn({
            let exchange = exchange.clone();
            let interval = config.retransmit_interval();
            let shutdown = shutdown.clone();
            async move { exchange.run_retransmission(interval, shutdown).await }
        }));
        exchange.start()?;
    }

    let mut secrets = Vec::with_capacity(exchanges.len());
    for exchange in &exchanges {
        let secret = timeout(options.timeout, exchange.wait_for_group_share(shutdown.clone()))
            .await
            .map_err(|_| anyhow!("DKG timed out for party {}", exchange.party()))??;
        secrets.push(secret);
    }
    info!(epoch = dkg_config.epoch, parties = exchanges.len(), "DKG complete");

    Ok(EpochKeys {
        metadata: EpochMetadata {
            epoch: dkg_config.epoch,
            threshold: dkg_config.threshold,
            participants: roster.node_ids().to_vec(),
            vvecs,
        },
        secrets,
        last_seed: GENESIS_RANDOM_SEED,
    })
}

/// Wait until every node recovered `round` and check they agree.
async fn wait_for_agreement(
    coordinators: &[Arc<RoundSignatureCoordinator>],
    round: Round,
    shutdown: watch::Receiver<bool>,
) -> Result<RoundBeacon> {
    let mut agreed: Option<RoundBeacon> = None;
    for coordinator in coordinators {
        let beacon = coordinator.wait_for_beacon(round, shutdown.clone()).await?;
        match &agreed {
            Some(first) if *first != beacon => bail!(
                "party {} derived a different beacon for round {round}",
                coordinator.party()
            ),
            Some(_) => {}
            None => agreed = Some(beacon),
        }
    }
    agreed.ok_or_else(|| anyhow!("no participants"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(n: usize, t: u32) -> ProtocolConfig {
        ProtocolConfig {
            threshold: t,
            participants: (1..=n).map(|i| format!("miner-{i}")).collect(),
            network_delay_ms: 5,
            retransmit_factor: 2,
            max_buffered_rounds: 4,
        }
    }

    #[tokio::test]
    async fn test_simulate_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(3, 2);
        let options = SimulationOptions {
            rounds: 2,
            ..Default::default()
        };

        let first = simulate(&config, dir.path(), &options).await.unwrap();
        assert!(!first.restored);
        assert_eq!(first.beacons.len(), 2);
        assert_eq!(first.stalled_round, None);

        let resumed = SimulationOptions {
            start_round: 3,
            rounds: 1,
            ..Default::default()
        };
        let second = simulate(&config, dir.path(), &resumed).await.unwrap();
        assert!(second.restored);
        assert_eq!(second.beacons[0].round, 3);
    }

    #[tokio::test]
    async fn test_too_many_silent_parties_stall() {
        let dir = tempfile::tempdir().unwrap();
        let options = SimulationOptions {
            rounds: 2,
            silent: vec![PartyId::new(2).unwrap(), PartyId::new(3).unwrap()],
            timeout: Duration::from_millis(300),
            ..Default::default()
        };

        let report = simulate(&config(3, 2), dir.path(), &options).await.unwrap();
        assert_eq!(report.stalled_round, Some(1));
        assert!(report.beacons.is_empty());
    }
}
