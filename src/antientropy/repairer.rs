use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::client::ReplicaClient;
use super::{Decision, RepairPhase, RepairReport, choose_authority};
use crate::cluster::Cluster;
use crate::config::AntiEntropyConfig;
use crate::error::RepairError;
use crate::membership::types::Node;
use crate::shard::ShardId;
use crate::storage::{ShardDelta, ShardDigest, ShardStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardOutcome {
    InSync,
    Repaired { transfers: usize, failed: usize },
    Skipped,
    Conflict,
    Failed,
    /// Another task is already repairing this shard.
    Busy,
}

/// Removes the shard from the in-flight set when its repair ends.
struct InFlight {
    set: Arc<DashMap<ShardId, ()>>,
    shard: ShardId,
}

impl InFlight {
    fn acquire(set: &Arc<DashMap<ShardId, ()>>, shard: &ShardId) -> Option<Self> {
        if set.insert(shard.clone(), ()).is_some() {
            return None;
        }
        Some(Self {
            set: set.clone(),
            shard: shard.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.shard);
    }
}

/// Result of comparing one shard: either settled, or a transfer still to run.
enum Compared {
    Done(ShardOutcome),
    Repair(PendingRepair),
}

struct PendingRepair {
    shard: ShardId,
    authority: Node,
    targets: Vec<Node>,
    _guard: InFlight,
}

pub struct Repairer {
    cluster: Arc<Cluster>,
    store: Arc<dyn ShardStore>,
    client: Arc<dyn ReplicaClient>,
    config: AntiEntropyConfig,
    phase: AtomicU8,
    workers: Arc<Semaphore>,
    in_flight: Arc<DashMap<ShardId, ()>>,
}

impl Repairer {
    pub fn new(
        cluster: Arc<Cluster>,
        store: Arc<dyn ShardStore>,
        client: Arc<dyn ReplicaClient>,
        config: AntiEntropyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            store,
            client,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            phase: AtomicU8::new(RepairPhase::Idle.as_u8()),
            in_flight: Arc::new(DashMap::new()),
        })
    }

    pub fn phase(&self) -> RepairPhase {
        RepairPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: RepairPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Runs cycles every `interval` until shutdown. A zero interval disables the loop.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.config.interval_secs == 0 {
            tracing::info!("Anti-entropy disabled");
            return None;
        }

        let repairer = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(repairer.config.interval());
            // The first tick fires immediately; wait a full period before the first cycle.
            interval.tick().await;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let report = repairer.run_cycle().await;
                tracing::info!("Anti-entropy cycle finished: {:?}", report);
            }

            tracing::info!("Anti-entropy loop stopped");
        }))
    }

    /// One full Scanning -> Comparing -> Repairing pass. Every shard is compared
    /// before the first transfer starts.
    pub async fn run_cycle(self: &Arc<Self>) -> RepairReport {
        self.set_phase(RepairPhase::Scanning);
        let shards = self.scan();
        let mut report = RepairReport {
            scanned: shards.len(),
            ..RepairReport::default()
        };

        self.set_phase(RepairPhase::Comparing);
        let mut pending = Vec::new();
        let mut tasks = JoinSet::new();
        for shard in shards {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                break;
            };
            let repairer = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                repairer.compare_shard(shard).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Compared::Done(outcome)) => Self::record(&mut report, outcome),
                Ok(Compared::Repair(repair)) => pending.push(repair),
                Err(e) => {
                    tracing::error!("Compare task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        if !pending.is_empty() {
            self.set_phase(RepairPhase::Repairing);
            let mut tasks = JoinSet::new();
            for repair in pending {
                let Ok(permit) = self.workers.clone().acquire_owned().await else {
                    break;
                };
                let repairer = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    repairer.transfer(&repair).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => Self::record(&mut report, outcome),
                    Err(e) => {
                        tracing::error!("Repair task panicked: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        self.set_phase(RepairPhase::Idle);
        report
    }

    fn record(report: &mut RepairReport, outcome: ShardOutcome) {
        if !matches!(outcome, ShardOutcome::Skipped | ShardOutcome::Busy) {
            report.compared += 1;
        }
        match outcome {
            ShardOutcome::InSync => report.in_sync += 1,
            ShardOutcome::Repaired { transfers, failed } => {
                report.repaired += 1;
                report.transfers += transfers;
                report.failed += failed;
            }
            ShardOutcome::Skipped | ShardOutcome::Busy => report.skipped += 1,
            ShardOutcome::Conflict => report.conflicts += 1,
            ShardOutcome::Failed => report.failed += 1,
        }
    }

    /// Shards known to the schema or held locally that this node co-owns, checked
    /// against a single topology snapshot.
    fn scan(&self) -> Vec<ShardId> {
        let topology = self.cluster.topology();
        let local = self.cluster.local_node();
        let owned = |shard: u64| topology.owners_of(shard).contains(&local);

        let mut candidates: BTreeSet<ShardId> =
            self.cluster.state().schema().shards_where(&owned).into_iter().collect();
        candidates.extend(self.store.shards().into_iter().filter(|id| owned(id.shard)));

        tracing::debug!("Anti-entropy scanning {} local shard(s)", candidates.len());
        candidates.into_iter().collect()
    }

    async fn compare_shard(&self, shard: ShardId) -> Compared {
        let Some(guard) = InFlight::acquire(&self.in_flight, &shard) else {
            tracing::debug!("Shard {} already under repair", shard);
            return Compared::Done(ShardOutcome::Busy);
        };

        let local = self.cluster.local_node();
        let owners = self.cluster.shard_owners(&shard);

        let digests = match self.collect_digests(&shard, &local, &owners).await {
            Ok(digests) => digests,
            Err(e) => {
                tracing::warn!("Skipping shard {} this cycle: {}", shard, e);
                return Compared::Done(ShardOutcome::Skipped);
            }
        };

        match choose_authority(&digests) {
            Decision::InSync => Compared::Done(ShardOutcome::InSync),
            Decision::Conflict => {
                tracing::error!(
                    "Shard {}: every replica reports corruption, operator attention required",
                    shard
                );
                Compared::Done(ShardOutcome::Conflict)
            }
            Decision::Repair { authority, targets } => Compared::Repair(PendingRepair {
                shard,
                authority,
                targets,
                _guard: guard,
            }),
        }
    }

    async fn collect_digests(
        &self,
        shard: &ShardId,
        local: &Node,
        owners: &[Node],
    ) -> Result<Vec<(Node, ShardDigest)>, RepairError> {
        let peers: Vec<&Node> = owners.iter().filter(|node| *node != local).collect();

        let answers = futures::future::join_all(
            peers
                .iter()
                .map(|peer| self.with_timeout(peer, self.client.digest(peer, shard))),
        )
        .await;

        let mut digests = vec![(local.clone(), self.store.digest_of(shard))];
        for (peer, answer) in peers.into_iter().zip(answers) {
            digests.push((peer.clone(), answer?));
        }
        Ok(digests)
    }

    async fn transfer(&self, repair: &PendingRepair) -> ShardOutcome {
        let PendingRepair {
            shard,
            authority,
            targets,
            ..
        } = repair;
        let local = &self.cluster.local_node();
        tracing::info!(
            "Repairing shard {} from {} to {:?}",
            shard,
            authority,
            targets
        );

        let snapshot = if authority == local {
            self.store.export(shard).map_err(RepairError::from)
        } else {
            self.with_timeout(authority, self.client.fetch(authority, shard))
                .await
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Could not read shard {} from {}: {}", shard, authority, e);
                return ShardOutcome::Failed;
            }
        };

        let mut transfers = 0;
        let mut failed = 0;
        for target in targets {
            match self.install(shard, local, target, &snapshot).await {
                Ok(()) => transfers += 1,
                Err(e) => {
                    tracing::warn!("Could not repair shard {} on {}: {}", shard, target, e);
                    failed += 1;
                }
            }
        }

        ShardOutcome::Repaired { transfers, failed }
    }

    async fn install(
        &self,
        shard: &ShardId,
        local: &Node,
        target: &Node,
        snapshot: &ShardDelta,
    ) -> Result<(), RepairError> {
        if target == local {
            self.store.apply_delta(shard, snapshot)?;
            Ok(())
        } else {
            self.with_timeout(target, self.client.push(target, shard, snapshot))
                .await
        }
    }

    async fn with_timeout<T, F>(&self, peer: &Node, call: F) -> Result<T, RepairError>
    where
        F: Future<Output = Result<T, RepairError>>,
    {
        match tokio::time::timeout(self.config.peer_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RepairError::Timeout {
                peer: peer.host.clone(),
                millis: self.config.peer_timeout_ms,
            }),
        }
    }
}
