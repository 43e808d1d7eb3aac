use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::info;

use super::types::{ClusterNode, GossipMessage, MembershipEvent, Node, NodeId, NodeState};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipService {
    pub async fn new(
        gossip_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(gossip_addr).await?;
        let gossip_addr = socket.local_addr()?;

        // Join order is the start time; ties are broken by id when members are sorted.
        let order = SystemTime::now().duration_since(UNIX_EPOCH)?.as_micros() as u64;

        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            http_addr,
            order,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join {
                node: local_node.clone(),
            })?;

            for seed in seed_nodes.iter() {
                socket.send_to(&encoded, seed).await?;
                info!("Sent join request to {}", seed);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            events,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        info!("Starting membership service...");

        let service = self.clone();
        tokio::spawn(async move { service.gossip_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.receive_loop().await });

        let service = self.clone();
        tokio::spawn(async move { service.failure_detection_loop().await });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Alive members as the cache core sees them, oldest first.
    pub fn cluster_nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self
            .members
            .iter()
            .filter(|entry| matches!(entry.value().state, NodeState::Alive | NodeState::Suspect))
            .map(|entry| entry.value().cluster_node())
            .collect();
        nodes.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        nodes
    }

    /// Announces a graceful departure to every alive member.
    pub async fn leave(&self) {
        info!("Leaving cluster");
        self.broadcast_message(GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
        })
        .await;
    }

    fn publish(&self, event: MembershipEvent) {
        // No receivers simply means nobody is listening yet.
        let _ = self.events.send(event);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let peers: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if peers.is_empty() {
                continue;
            }

            use rand::Rng;
            let target = &peers[rand::thread_rng().gen_range(0..peers.len())];

            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to deserialize gossip from {}: {}", src, e),
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => self.handle_ping(from, incarnation, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.touch(&from, incarnation);
                for member in members {
                    self.merge_member(member);
                }
                Ok(())
            }
            GossipMessage::Join { node } => {
                self.handle_join(node);
                Ok(())
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => self.handle_suspect(node_id, incarnation).await,
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
                Ok(())
            }
            GossipMessage::Leave { node_id } => {
                self.mark_departed(&node_id, NodeState::Left);
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, from: NodeId, incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::debug!("Received ping from {}", from);

        // Unknown pingers are learned from the next ack they receive from a seed.
        self.touch(&from, incarnation);

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            members: self.members.iter().map(|e| e.value().clone()).collect(),
        };

        self.socket.send_to(&bincode::serialize(&reply)?, src).await?;
        Ok(())
    }

    fn touch(&self, id: &NodeId, incarnation: u64) {
        if let Some(mut member) = self.members.get_mut(id) {
            member.last_seen = Some(Instant::now());
            if incarnation > member.incarnation {
                member.incarnation = incarnation;
            }
        }
    }

    fn merge_member(&self, incoming: Node) {
        if incoming.id == self.local_node.id {
            return;
        }

        let mut departed = None;
        let mut joined = None;

        match self.members.get_mut(&incoming.id) {
            Some(mut existing) => {
                if matches!(existing.state, NodeState::Dead | NodeState::Left) {
                    return;
                }

                if incoming.incarnation > existing.incarnation {
                    existing.incarnation = incoming.incarnation;
                    existing.last_seen = Some(Instant::now());

                    if matches!(incoming.state, NodeState::Dead | NodeState::Left) {
                        existing.state = incoming.state.clone();
                        departed = Some(existing.clone());
                    } else {
                        existing.state = incoming.state;
                    }
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", incoming.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if incoming.state != NodeState::Alive {
                    return;
                }
                tracing::info!("Discovered new member {} at {}", incoming.id, incoming.gossip_addr);

                let mut node = incoming;
                node.last_seen = Some(Instant::now());
                self.members.insert(node.id.clone(), node.clone());
                joined = Some(node);
            }
        }

        if let Some(node) = joined {
            self.publish(MembershipEvent::Joined(node));
        }
        if let Some(node) = departed {
            self.publish(match node.state {
                NodeState::Left => MembershipEvent::Left(node),
                _ => MembershipEvent::Failed(node),
            });
        }
    }

    fn handle_join(&self, mut node: Node) {
        tracing::info!("Node {} joining cluster at {}", node.id, node.gossip_addr);

        node.last_seen = Some(Instant::now());
        node.state = NodeState::Alive;

        let is_new = self.members.insert(node.id.clone(), node.clone()).is_none();
        if is_new {
            self.publish(MembershipEvent::Joined(node));
        }

        tracing::info!("Cluster size now: {}", self.members.len());
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            // Refute by bumping our incarnation past the accusation.
            let next = self.incarnation.fetch_max(incarnation + 1, Ordering::SeqCst).max(incarnation + 1);
            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: next,
            })
            .await;
            return Ok(());
        }

        if let Some(mut existing) = self.members.get_mut(&node_id)
            && incarnation >= existing.incarnation
            && existing.state == NodeState::Alive
        {
            tracing::info!("Node {} suspected", existing.id);
            existing.state = NodeState::Suspect;
            existing.incarnation = incarnation;
        }

        Ok(())
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        if let Some(mut existing) = self.members.get_mut(&node_id)
            && incarnation > existing.incarnation
            && existing.state == NodeState::Suspect
        {
            tracing::info!("Node {} is alive again (inc={})", existing.id, incarnation);
            existing.state = NodeState::Alive;
            existing.incarnation = incarnation;
            existing.last_seen = Some(Instant::now());
        }
    }

    fn mark_departed(&self, node_id: &NodeId, state: NodeState) {
        let departed = match self.members.get_mut(node_id) {
            Some(mut member) if !matches!(member.state, NodeState::Dead | NodeState::Left) => {
                member.state = state;
                Some(member.clone())
            }
            _ => None,
        };

        if let Some(node) = departed {
            tracing::info!("Node {} departed ({:?})", node.id, node.state);
            self.publish(match node.state {
                NodeState::Left => MembershipEvent::Left(node),
                _ => MembershipEvent::Failed(node),
            });
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut suspects = Vec::new();
            let mut dead = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();
                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Suspect;
                        suspects.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        dead.push(member.id.clone());
                    }
                    _ => {}
                }
            }

            for id in dead {
                self.mark_departed(&id, NodeState::Dead);
            }

            for msg in suspects {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip: {}", e);
                return;
            }
        };

        let targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|e| e.value().id != self.local_node.id && e.value().state == NodeState::Alive)
            .map(|e| e.value().gossip_addr)
            .collect();

        for addr in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", addr, e);
            }
        }
    }
}
