use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::NodeSet;
use super::types::{GossipMessage, Member, Node, NodeState};
use crate::broadcast::gossip::{EventQueue, GossipBroadcaster};
use crate::broadcast::types::{ClusterEvent, EventEnvelope};
use crate::config::{GossipConfig, MembershipKind};
use crate::error::MembershipError;
use crate::shard::ShardWidth;

/// Most events carried by one gossip message.
const MAX_PIGGYBACK: usize = 16;
const RECV_BUFFER: usize = 65536;
/// Tombstones outlive the reap timeout by this factor, then are forgotten.
const TOMBSTONE_REAPS: u32 = 4;

/// Epidemic membership over UDP.
///
/// Each tick pings one random live peer (or the seeds when nobody is known) and the
/// peer answers with its full member table. Direct contact refreshes `last_seen`;
/// the failure detector turns silence into `Suspect` and then `Dead`.
pub struct GossipNodeSet {
    host: String,
    gossip_addr: SocketAddr,
    seeds: Vec<SocketAddr>,
    members: DashMap<String, Member>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    replica_n: AtomicUsize,
    shard_width: ShardWidth,
    config: GossipConfig,
    queue: Arc<EventQueue>,
    broadcaster: RwLock<Option<Arc<GossipBroadcaster>>>,
    /// Refused peers: advertised width and when we last heard from them.
    rejected: DashMap<String, (u32, Instant)>,
    /// Highest dead incarnation of every reaped member and when it was reaped.
    tombstones: DashMap<String, (u64, Instant)>,
    joined: Notify,
    join_error: Mutex<Option<MembershipError>>,
}

impl GossipNodeSet {
    /// Binds the gossip socket. `host` is the node's API address and its identity.
    pub async fn new(
        host: String,
        bind_addr: SocketAddr,
        seeds: Vec<SocketAddr>,
        config: GossipConfig,
        shard_width: ShardWidth,
        replica_n: usize,
    ) -> Result<Arc<Self>, MembershipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;

        let node_set = Arc::new(Self {
            host,
            gossip_addr,
            seeds,
            members: DashMap::new(),
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            replica_n: AtomicUsize::new(replica_n),
            shard_width,
            queue: Arc::new(EventQueue::new(config.retransmit_mult)),
            config,
            broadcaster: RwLock::new(None),
            rejected: DashMap::new(),
            tombstones: DashMap::new(),
            joined: Notify::new(),
            join_error: Mutex::new(None),
        });
        node_set.refresh_self();

        tracing::info!(
            "Gossip node set for {} listening on {}",
            node_set.host,
            node_set.gossip_addr
        );
        Ok(node_set)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Queue the gossip broadcaster feeds; outgoing messages drain it.
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// Routes membership transitions and received events to `broadcaster`.
    pub fn attach_broadcaster(&self, broadcaster: Arc<GossipBroadcaster>) {
        *self.broadcaster.write() = Some(broadcaster);
    }

    pub fn member(&self, host: &str) -> Option<Member> {
        self.members.get(host).map(|entry| entry.value().clone())
    }

    /// Full table including suspect and dead members, sorted by host.
    pub fn members_snapshot(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        members.sort_by(|a, b| a.host.cmp(&b.host));
        members
    }

    fn local_member(&self) -> Member {
        Member {
            host: self.host.clone(),
            gossip_addr: self.gossip_addr,
            state: NodeState::Alive,
            incarnation: self.incarnation(),
            replica_n: self.replica_n.load(Ordering::Relaxed),
            shard_width: self.shard_width.exponent(),
            last_seen: Some(Instant::now()),
        }
    }

    fn refresh_self(&self) {
        self.members.insert(self.host.clone(), self.local_member());
    }

    /// Spawns the gossip, receive and failure-detection loops. They exit when
    /// `shutdown` flips to true.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting gossip membership...");

        let gossip_handle = {
            let node_set = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                node_set.gossip_loop(shutdown).await;
            })
        };

        let receive_handle = {
            let node_set = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                node_set.receive_loop(shutdown).await;
            })
        };

        let failure_detection_handle = {
            let node_set = self.clone();
            tokio::spawn(async move {
                node_set.failure_detection_loop(shutdown).await;
            })
        };

        vec![gossip_handle, receive_handle, failure_detection_handle]
    }

    async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.gossip_round().await;
        }

        tracing::info!("Gossip loop stopped");
    }

    async fn gossip_round(&self) {
        match self.pick_peer() {
            Some(target) => {
                let msg = GossipMessage::Ping {
                    from: self.local_member(),
                    events: self.queue.take_batch(MAX_PIGGYBACK),
                };
                self.send(&msg, target).await;
            }
            None => {
                let msg = GossipMessage::Join {
                    member: self.local_member(),
                };
                for seed in self.seeds.iter().filter(|s| **s != self.gossip_addr) {
                    self.send(&msg, *seed).await;
                }
            }
        }
    }

    fn pick_peer(&self) -> Option<SocketAddr> {
        let peers: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| entry.key() != &self.host && entry.value().state.is_live())
            .map(|entry| entry.value().gossip_addr)
            .collect();

        peers.choose(&mut rand::thread_rng()).copied()
    }

    async fn receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        tracing::info!("Gossip receive loop stopped");
    }

    pub(crate) async fn handle_message(
        &self,
        msg: GossipMessage,
        src: SocketAddr,
    ) -> Result<(), MembershipError> {
        match msg {
            GossipMessage::Ping { from, events } => {
                if !self.accept_peer(&from) {
                    return Ok(());
                }
                tracing::debug!("Received ping from {}", from.host);
                self.touch(from, src).await;
                self.receive_events(events);

                let reply = GossipMessage::Ack {
                    from: self.local_member(),
                    members: self.members_snapshot(),
                    events: self.queue.take_batch(MAX_PIGGYBACK),
                };
                self.send_checked(&reply, src).await?;
            }

            GossipMessage::Ack {
                from,
                members,
                events,
            } => {
                if !self.accept_peer(&from) {
                    return Ok(());
                }
                tracing::debug!("Received ack from {} with {} members", from.host, members.len());
                self.touch(from, src).await;
                for member in members {
                    self.merge_member(member).await;
                }
                self.receive_events(events);
            }

            GossipMessage::Join { member } => {
                tracing::info!("Node {} joining through us from {}", member.host, src);
                let accepted = self.accept_peer(&member);
                if accepted {
                    self.touch(member, src).await;
                }
                let reply = GossipMessage::JoinAck {
                    from: self.local_member(),
                    members: if accepted {
                        self.members_snapshot()
                    } else {
                        Vec::new()
                    },
                };
                self.send_checked(&reply, src).await?;
            }

            GossipMessage::JoinAck { from, members } => {
                if from.shard_width != self.shard_width.exponent() {
                    self.rejected
                        .insert(from.host.clone(), (from.shard_width, Instant::now()));
                    *self.join_error.lock() = Some(MembershipError::ShardWidthMismatch {
                        peer: from.host.clone(),
                        theirs: from.shard_width,
                        ours: self.shard_width.exponent(),
                    });
                    self.joined.notify_one();
                    return Ok(());
                }
                tracing::info!("Joined through {} ({} members)", from.host, members.len());
                self.touch(from, src).await;
                for member in members {
                    self.merge_member(member).await;
                }
                self.joined.notify_one();
            }

            GossipMessage::Suspect { host, incarnation } => {
                self.handle_suspect(host, incarnation).await;
            }

            GossipMessage::Alive { host, incarnation } => {
                self.handle_alive(host, incarnation);
            }
        }

        Ok(())
    }

    fn accept_peer(&self, member: &Member) -> bool {
        if member.shard_width == self.shard_width.exponent() {
            return true;
        }
        if self
            .rejected
            .insert(member.host.clone(), (member.shard_width, Instant::now()))
            .is_none()
        {
            tracing::error!(
                "Refusing {}: shard width {} does not match ours ({})",
                member.host,
                member.shard_width,
                self.shard_width.exponent()
            );
        }
        false
    }

    /// Merges a member we heard from directly and refreshes its contact time.
    ///
    /// A member we hold as dead (or already reaped) at its current incarnation is told
    /// so, which makes it refute with a newer incarnation.
    async fn touch(&self, mut from: Member, src: SocketAddr) {
        if let Some(buried) = self.buried_incarnation(&from.host) {
            if from.incarnation <= buried {
                tracing::debug!("{} is dead to us, asking it to refute", from.host);
                let msg = GossipMessage::Suspect {
                    host: from.host,
                    incarnation: buried,
                };
                self.send(&msg, src).await;
                return;
            }
        }

        from.gossip_addr = src;
        let host = from.host.clone();
        self.merge_member(from).await;
        if let Some(mut member) = self.members.get_mut(&host) {
            member.last_seen = Some(Instant::now());
        }
    }

    fn buried_incarnation(&self, host: &str) -> Option<u64> {
        if let Some(member) = self.members.get(host) {
            return (member.state == NodeState::Dead).then_some(member.incarnation);
        }
        self.tombstones.get(host).map(|tombstone| tombstone.0)
    }

    pub(crate) async fn merge_member(&self, incoming: Member) {
        if incoming.host == self.host {
            if incoming.state != NodeState::Alive && incoming.incarnation >= self.incarnation() {
                self.refute(incoming.incarnation).await;
            }
            return;
        }
        if !self.accept_peer(&incoming) {
            return;
        }
        if let Some(event) = self.apply_member(incoming) {
            self.notify(event);
        }
    }

    /// Last-write-wins on `(incarnation, state rank)`. Returns the membership event
    /// when the member enters or leaves the live set.
    fn apply_member(&self, incoming: Member) -> Option<ClusterEvent> {
        let now = Instant::now();

        match self.members.get_mut(&incoming.host) {
            Some(mut existing) => {
                if !incoming.supersedes(&existing) {
                    return None;
                }
                tracing::debug!(
                    "Updating {}: inc {} -> {}, {:?} -> {:?}",
                    incoming.host,
                    existing.incarnation,
                    incoming.incarnation,
                    existing.state,
                    incoming.state
                );

                let was_live = existing.state.is_live();
                if incoming.incarnation > existing.incarnation {
                    existing.last_seen = Some(now);
                }
                existing.state = incoming.state;
                existing.incarnation = incoming.incarnation;
                existing.gossip_addr = incoming.gossip_addr;
                existing.replica_n = incoming.replica_n;
                existing.shard_width = incoming.shard_width;

                let node = existing.to_node();
                match (was_live, existing.state.is_live()) {
                    (true, false) => Some(ClusterEvent::NodeLeft { node }),
                    (false, true) => Some(ClusterEvent::NodeJoined { node }),
                    _ => None,
                }
            }
            None => {
                if let Some(buried) = self.tombstones.get(&incoming.host) {
                    if incoming.incarnation <= buried.0 {
                        return None;
                    }
                }
                self.tombstones.remove(&incoming.host);

                let mut member = incoming;
                member.last_seen = Some(now);
                let event = if member.state.is_live() {
                    tracing::info!(
                        "Discovered new member: {} at {}",
                        member.host,
                        member.gossip_addr
                    );
                    Some(ClusterEvent::NodeJoined {
                        node: member.to_node(),
                    })
                } else {
                    None
                };
                self.members.insert(member.host.clone(), member);
                event
            }
        }
    }

    async fn handle_suspect(&self, host: String, incarnation: u64) {
        if host == self.host {
            if incarnation >= self.incarnation() {
                self.refute(incarnation).await;
            }
            return;
        }

        let Some(mut candidate) = self.member(&host) else {
            tracing::debug!("Suspected node {} doesn't exist", host);
            return;
        };
        candidate.state = NodeState::Suspect;
        candidate.incarnation = incarnation;
        if let Some(event) = self.apply_member(candidate) {
            self.notify(event);
        }
    }

    fn handle_alive(&self, host: String, incarnation: u64) {
        if host == self.host {
            return;
        }

        let Some(mut candidate) = self.member(&host) else {
            tracing::debug!("Alive message for unknown node {}", host);
            return;
        };
        candidate.state = NodeState::Alive;
        candidate.incarnation = incarnation;
        if let Some(event) = self.apply_member(candidate) {
            self.notify(event);
        }
    }

    /// Someone thinks we are suspect or dead: outbid them and tell everyone.
    async fn refute(&self, seen: u64) {
        let next = self.incarnation.fetch_max(seen + 1, Ordering::SeqCst).max(seen + 1);
        self.refresh_self();
        tracing::info!("Refuting suspicion with incarnation {}", next);

        let msg = GossipMessage::Alive {
            host: self.host.clone(),
            incarnation: next,
        };
        self.broadcast_message(msg).await;
    }

    async fn failure_detection_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let (suspicions, events) = self.detect_failures(Instant::now());
            for msg in suspicions {
                self.broadcast_message(msg).await;
            }
            for event in events {
                self.notify(event);
            }
        }

        tracing::info!("Failure detector stopped");
    }

    /// One failure-detector pass. Returns suspicion messages to broadcast and
    /// membership events for members declared dead.
    pub(crate) fn detect_failures(&self, now: Instant) -> (Vec<GossipMessage>, Vec<ClusterEvent>) {
        let mut suspicions = Vec::new();
        let mut events = Vec::new();
        let mut reaped = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            if member.host == self.host {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive if elapsed > self.config.suspect_timeout() => {
                    tracing::warn!("Node {} suspected (no contact for {:?})", member.host, elapsed);
                    member.state = NodeState::Suspect;
                    suspicions.push(GossipMessage::Suspect {
                        host: member.host.clone(),
                        incarnation: member.incarnation,
                    });
                }
                NodeState::Suspect if elapsed > self.config.dead_timeout() => {
                    tracing::warn!("Node {} declared dead (no contact for {:?})", member.host, elapsed);
                    member.state = NodeState::Dead;
                    events.push(ClusterEvent::NodeLeft {
                        node: member.to_node(),
                    });
                }
                NodeState::Dead if elapsed > self.config.reap_timeout() => {
                    reaped.push((member.host.clone(), member.incarnation));
                }
                _ => {}
            }
        }

        for (host, incarnation) in reaped {
            tracing::info!("Forgetting dead node {}", host);
            self.members.remove(&host);
            self.tombstones.insert(host, (incarnation, now));
        }

        let tombstone_ttl = self.config.reap_timeout() * TOMBSTONE_REAPS;
        self.tombstones.retain(|host, tombstone| {
            let keep = now.saturating_duration_since(tombstone.1) <= tombstone_ttl;
            if !keep {
                tracing::debug!("Dropping tombstone of {}", host);
            }
            keep
        });
        self.rejected.retain(|_, refused| {
            now.saturating_duration_since(refused.1) <= self.config.reap_timeout()
        });

        if !events.is_empty() {
            tracing::info!("Cluster size now: {} live nodes", self.nodes().len());
        }

        (suspicions, events)
    }

    fn notify(&self, event: ClusterEvent) {
        let broadcaster = self.broadcaster.read().clone();
        match broadcaster {
            Some(broadcaster) => broadcaster.notify(event),
            None => tracing::debug!("No broadcaster attached; dropping {}", event.kind()),
        }
    }

    fn receive_events(&self, events: Vec<EventEnvelope>) {
        if events.is_empty() {
            return;
        }
        let broadcaster = self.broadcaster.read().clone();
        match broadcaster {
            Some(broadcaster) => {
                for envelope in events {
                    let resized = match envelope.event {
                        ClusterEvent::ClusterResized { replica_n } => Some(replica_n),
                        _ => None,
                    };
                    if broadcaster.receive(envelope) {
                        if let Some(replica_n) = resized {
                            self.advertise_replica_factor(replica_n);
                        }
                    }
                }
            }
            None => tracing::debug!("No broadcaster attached; dropping {} events", events.len()),
        }
    }

    async fn send(&self, msg: &GossipMessage, target: SocketAddr) {
        if let Err(e) = self.send_checked(msg, target).await {
            tracing::warn!("Failed to send gossip to {}: {}", target, e);
        }
    }

    async fn send_checked(
        &self,
        msg: &GossipMessage,
        target: SocketAddr,
    ) -> Result<(), MembershipError> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, target).await?;
        Ok(())
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| entry.key() != &self.host && entry.value().state.is_live())
            .map(|entry| entry.value().gossip_addr)
            .collect();

        for target in targets {
            self.send(&msg, target).await;
        }
    }
}

#[async_trait]
impl NodeSet for GossipNodeSet {
    /// Sends a join to every seed and waits up to the join timeout for an answer.
    /// The receive loop must already be running. Silence is not an error: the gossip
    /// loop keeps retrying the seeds until someone answers.
    async fn join(&self, initial: Vec<Node>) -> Result<(), MembershipError> {
        let seeds: Vec<SocketAddr> = self
            .seeds
            .iter()
            .filter(|seed| **seed != self.gossip_addr)
            .copied()
            .collect();

        if seeds.is_empty() {
            tracing::info!(
                "Starting as seed node ({} configured nodes ignored by gossip)",
                initial.len()
            );
            return Ok(());
        }

        let msg = GossipMessage::Join {
            member: self.local_member(),
        };
        for seed in &seeds {
            self.send(&msg, *seed).await;
            tracing::info!("Sent join request to {}", seed);
        }

        if tokio::time::timeout(self.config.join_timeout(), self.joined.notified())
            .await
            .is_err()
        {
            tracing::warn!(
                "No seed answered within {:?}; gossip will keep retrying",
                self.config.join_timeout()
            );
        }

        match self.join_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .map(|entry| entry.value().to_node())
            .collect();
        nodes.sort();
        nodes
    }

    fn kind(&self) -> MembershipKind {
        MembershipKind::Gossip
    }

    fn rejected_peers(&self) -> Vec<(String, u32)> {
        self.rejected
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().0))
            .collect()
    }

    /// A metadata change is a new version of ourselves, so it takes a new incarnation.
    fn advertise_replica_factor(&self, replica_n: usize) {
        self.replica_n.store(replica_n, Ordering::Relaxed);
        self.incarnation.fetch_add(1, Ordering::SeqCst);
        self.refresh_self();
    }
}
