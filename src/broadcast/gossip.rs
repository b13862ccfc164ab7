use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use uuid::Uuid;

use super::Broadcaster;
use super::types::{BroadcastReport, ClusterEvent, EventEnvelope};
use crate::cluster::state::ClusterState;
use crate::config::MembershipKind;
use crate::error::BroadcastError;

/// Pending events beyond this are dropped oldest first.
const MAX_PENDING: usize = 1024;
/// Remembered event ids before the de-duplication table is reset.
const SEEN_CAPACITY: usize = 10_000;

struct QueuedEvent {
    envelope: EventEnvelope,
    transmits: u32,
}

/// Events waiting to ride on outgoing gossip messages.
///
/// Each event is handed out at most `retransmit_mult * ceil(log2(n + 1))` times,
/// enough for an epidemic to reach every node with high probability.
pub struct EventQueue {
    retransmit_mult: u32,
    cluster_size: AtomicUsize,
    pending: Mutex<VecDeque<QueuedEvent>>,
}

impl EventQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            retransmit_mult: retransmit_mult.max(1),
            cluster_size: AtomicUsize::new(1),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_cluster_size(&self, nodes: usize) {
        self.cluster_size.store(nodes.max(1), Ordering::Relaxed);
    }

    pub fn retransmit_limit(&self) -> u32 {
        let n = self.cluster_size.load(Ordering::Relaxed) as u64;
        let rounds = 64 - n.leading_zeros();
        self.retransmit_mult * rounds.max(1)
    }

    pub fn push(&self, envelope: EventEnvelope) {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING {
            if let Some(dropped) = pending.pop_front() {
                tracing::warn!("Gossip queue full, dropping {}", dropped.envelope.event.kind());
            }
        }
        pending.push_back(QueuedEvent {
            envelope,
            transmits: 0,
        });
    }

    /// Takes up to `max` events for one message, least transmitted first, and retires
    /// the ones that reached their retransmit limit.
    pub fn take_batch(&self, max: usize) -> Vec<EventEnvelope> {
        let limit = self.retransmit_limit();
        let mut pending = self.pending.lock();

        pending.make_contiguous().sort_by_key(|queued| queued.transmits);

        let batch: Vec<EventEnvelope> = pending
            .iter_mut()
            .take(max)
            .map(|queued| {
                queued.transmits += 1;
                queued.envelope.clone()
            })
            .collect();

        pending.retain(|queued| queued.transmits < limit);
        batch
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Disseminates events by piggybacking them on gossip traffic.
///
/// Also the sink for everything the gossip node set learns: received envelopes and
/// locally detected membership transitions are applied to the cluster state here.
pub struct GossipBroadcaster {
    state: Arc<ClusterState>,
    queue: Arc<EventQueue>,
    seen: DashMap<Uuid, Instant>,
}

impl GossipBroadcaster {
    pub fn new(state: Arc<ClusterState>, queue: Arc<EventQueue>) -> Self {
        Self {
            state,
            queue,
            seen: DashMap::new(),
        }
    }

    /// Returns true the first time `id` is seen.
    fn mark_seen(&self, id: Uuid) -> bool {
        if self.seen.len() >= SEEN_CAPACITY {
            self.seen.clear();
        }
        self.seen.insert(id, Instant::now()).is_none()
    }

    /// Handles an envelope that arrived on a gossip message: apply once, then keep
    /// spreading it. Returns whether the event changed local state.
    pub fn receive(&self, envelope: EventEnvelope) -> bool {
        if !self.mark_seen(envelope.id) {
            return false;
        }
        tracing::debug!(
            "Gossip delivered {} from {}",
            envelope.event.kind(),
            envelope.origin
        );
        let applied = self.state.apply(&envelope.event);
        self.queue.set_cluster_size(self.state.topology().nodes.len());
        self.queue.push(envelope);
        applied
    }

    /// Applies a membership transition the local failure detector observed.
    pub fn notify(&self, event: ClusterEvent) {
        self.state.apply(&event);
        self.queue.set_cluster_size(self.state.topology().nodes.len());
    }
}

#[async_trait]
impl Broadcaster for GossipBroadcaster {
    async fn send(&self, event: ClusterEvent) -> Result<(), BroadcastError> {
        let envelope = EventEnvelope::new(self.state.local().host.clone(), event);
        self.mark_seen(envelope.id);
        self.queue.set_cluster_size(self.state.topology().nodes.len());
        tracing::debug!("Queued {} for gossip", envelope.event.kind());
        self.queue.push(envelope);
        Ok(())
    }

    async fn send_sync(&self, event: ClusterEvent) -> Result<BroadcastReport, BroadcastError> {
        self.send(event).await?;
        Ok(BroadcastReport {
            eventual: true,
            ..BroadcastReport::default()
        })
    }

    fn kind(&self) -> MembershipKind {
        MembershipKind::Gossip
    }
}
