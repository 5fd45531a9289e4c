//! libp2p transport configuration and swarm task
//!
//! Builds the NodeSwarm with multi-transport support (QUIC + TCP/Noise/Yamux),
//! mDNS discovery, Kademlia content routing, gossip broadcast and the
//! request-response command protocol. The swarm is owned by a single task that
//! serves `SwarmCommand`s and forwards `NodeEvent`s to the coordinator.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    gossipsub, identify, identity, kad, mdns, noise, request_response, tcp, yamux, Multiaddr,
    PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::content::content_key;
use super::peers::{PeerBook, PeerRecord, PendingAdvertisements};
use super::protocols::{CommandCodec, WireResponse, COMMAND_PROTOCOL, IDENTIFY_PROTOCOL};
use crate::config::P2PConfig;
use crate::error::{NodeError, NodeResult};

/// Combined libp2p behaviour for data nodes.
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub request_response: request_response::Behaviour<CommandCodec>,
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
}

/// Events emitted by the swarm for the coordinator to process.
#[derive(Debug)]
pub enum NodeEvent {
    /// First connection to a peer was established.
    PeerConnected { peer_id: PeerId },
    /// Last connection to a peer closed.
    PeerDisconnected { peer_id: PeerId },
    /// A remote peer sent us a command.
    InboundCommand {
        peer_id: PeerId,
        payload: Vec<u8>,
        channel: request_response::ResponseChannel<WireResponse>,
    },
    /// A message arrived on the broadcast topic.
    BroadcastReceived {
        source: Option<PeerId>,
        data: Vec<u8>,
    },
}

impl NodeEvent {
    fn kind(&self) -> &'static str {
        match self {
            NodeEvent::PeerConnected { .. } => "peer connected",
            NodeEvent::PeerDisconnected { .. } => "peer disconnected",
            NodeEvent::InboundCommand { .. } => "inbound command",
            NodeEvent::BroadcastReceived { .. } => "broadcast",
        }
    }
}

/// Hand an event to the coordinator without waiting for room in the channel.
///
/// The coordinator calls back into the swarm task, so the swarm task must
/// never park on a full event channel. Returns false when the event was dropped.
pub fn forward(event_tx: &mpsc::Sender<NodeEvent>, event: NodeEvent) -> bool {
    match event_tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(kind = event.kind(), "Coordinator is falling behind, dropping swarm event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            debug!(kind = event.kind(), "Coordinator gone, dropping swarm event");
            false
        }
    }
}

/// Commands served by the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Send a command to a peer and wait for its response.
    SendRequest {
        peer_id: PeerId,
        payload: Vec<u8>,
        reply: oneshot::Sender<NodeResult<WireResponse>>,
    },
    /// Answer an inbound command.
    SendResponse {
        channel: request_response::ResponseChannel<WireResponse>,
        response: WireResponse,
    },
    /// Provide a document id; replies `true` when it was queued instead.
    Advertise {
        id: String,
        reply: oneshot::Sender<NodeResult<bool>>,
    },
    /// Retry every queued advertisement once.
    FlushPendingAdvertisements,
    /// Stream providers of a document id into `found` until the query ends.
    FindProviders {
        id: String,
        found: mpsc::UnboundedSender<PeerId>,
    },
    /// Publish on the broadcast topic.
    Broadcast {
        data: Vec<u8>,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    /// Current subscribers of the broadcast topic.
    TopicPeers { reply: oneshot::Sender<Vec<PeerId>> },
    /// Known record of a connected peer.
    PeerRecord {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<PeerRecord>>,
    },
}

/// Wrapper around the libp2p Swarm with node-specific state.
pub struct NodeSwarm {
    swarm: Swarm<NodeBehaviour>,
    local_peer_id: PeerId,
    public_key: identity::PublicKey,
    topic: gossipsub::IdentTopic,
    pending_requests: HashMap<request_response::OutboundRequestId, oneshot::Sender<NodeResult<WireResponse>>>,
    provider_queries: HashMap<kad::QueryId, mpsc::UnboundedSender<PeerId>>,
    pending_ads: PendingAdvertisements,
    book: PeerBook,
}

impl NodeSwarm {
    /// Get our local peer ID.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Hex of the protobuf-encoded identity public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.encode_protobuf())
    }

    /// Run the swarm task until the command channel closes.
    pub async fn run(
        mut self,
        event_tx: mpsc::Sender<NodeEvent>,
        mut commands: mpsc::Receiver<SwarmCommand>,
    ) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event, &event_tx);
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("Swarm command channel closed, stopping swarm task");
                        break;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::SendRequest {
                peer_id,
                payload,
                reply,
            } => {
                if !self.is_known(&peer_id) {
                    debug!(%peer_id, "No connection or address for peer");
                    let _ = reply.send(Err(NodeError::PeerNotFound(peer_id.to_string())));
                    return;
                }
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .request_response
                    .send_request(&peer_id, payload);
                self.pending_requests.insert(request_id, reply);
            }

            SwarmCommand::SendResponse { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .request_response
                    .send_response(channel, response)
                    .is_err()
                {
                    warn!("Response channel closed before the response was sent");
                }
            }

            SwarmCommand::Advertise { id, reply } => {
                let result = if self.swarm.connected_peers().next().is_none() {
                    debug!(%id, "No peers connected, queueing advertisement");
                    self.pending_ads.push(id);
                    Ok(true)
                } else {
                    self.start_providing(&id).map(|_| false)
                };
                let _ = reply.send(result);
            }

            SwarmCommand::FlushPendingAdvertisements => {
                let pending = self.pending_ads.take_all();
                if !pending.is_empty() {
                    info!(count = pending.len(), "Retrying queued advertisements");
                }
                for id in pending {
                    if let Err(e) = self.start_providing(&id) {
                        warn!(%id, error = %e, "Queued advertisement failed");
                    }
                }
            }

            SwarmCommand::FindProviders { id, found } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(content_key(&id));
                debug!(%id, ?query_id, "Looking up providers");
                self.provider_queries.insert(query_id, found);
            }

            SwarmCommand::Broadcast { data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), data)
                    .map(|_| ())
                    .map_err(|e| NodeError::Protocol(format!("broadcast failed: {:?}", e)));
                let _ = reply.send(result);
            }

            SwarmCommand::TopicPeers { reply } => {
                let hash = self.topic.hash();
                let peers = self
                    .swarm
                    .behaviour()
                    .gossipsub
                    .all_peers()
                    .filter(|(_, topics)| topics.iter().any(|t| **t == hash))
                    .map(|(peer, _)| *peer)
                    .collect();
                let _ = reply.send(peers);
            }

            SwarmCommand::PeerRecord { peer_id, reply } => {
                let _ = reply.send(self.book.get(&peer_id.to_string()).cloned());
            }
        }
    }

    /// Connected, identified, or present in the routing table.
    fn is_known(&mut self, peer_id: &PeerId) -> bool {
        if self.swarm.is_connected(peer_id) || self.book.get(&peer_id.to_string()).is_some() {
            return true;
        }
        self.swarm
            .behaviour_mut()
            .kademlia
            .kbuckets()
            .any(|bucket| bucket.iter().any(|entry| entry.node.key.preimage() == peer_id))
    }

    fn start_providing(&mut self, id: &str) -> NodeResult<()> {
        self.swarm
            .behaviour_mut()
            .kademlia
            .start_providing(content_key(id))
            .map(|_| ())
            .map_err(|e| NodeError::Protocol(format!("start providing {}: {:?}", id, e)))
    }

    fn handle_swarm_event(
        &mut self,
        event: libp2p::swarm::SwarmEvent<NodeBehaviourEvent>,
        event_tx: &mpsc::Sender<NodeEvent>,
    ) {
        use libp2p::swarm::SwarmEvent as LibSwarmEvent;

        match event {
            // mDNS discovery
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS: peer discovered");
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    if !self.swarm.is_connected(&peer_id) {
                        if let Err(e) = self.swarm.dial(addr) {
                            debug!(%peer_id, error = %e, "mDNS: dial failed");
                        }
                    }
                }
            }
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _addr) in peers {
                    debug!(%peer_id, "mDNS: peer expired");
                }
            }

            // Request-response events
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::RequestResponse(
                request_response::Event::Message { peer, message },
            )) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    debug!(%peer, bytes = request.len(), "Incoming command");
                    forward(
                        event_tx,
                        NodeEvent::InboundCommand {
                            peer_id: peer,
                            payload: request,
                            channel,
                        },
                    );
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    debug!(%peer, status = response.status.http_status, "Command response received");
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::RequestResponse(
                request_response::Event::OutboundFailure {
                    peer,
                    request_id,
                    error,
                },
            )) => {
                warn!(%peer, ?error, "Outbound command failed");
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let err = match error {
                        request_response::OutboundFailure::DialFailure => {
                            NodeError::DialFailed(peer.to_string())
                        }
                        request_response::OutboundFailure::Timeout => {
                            NodeError::Timeout(format!("command to {}", peer))
                        }
                        other => NodeError::Protocol(format!("{:?}", other)),
                    };
                    let _ = reply.send(Err(err));
                }
            }
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::RequestResponse(
                request_response::Event::InboundFailure { peer, error, .. },
            )) => {
                warn!(%peer, ?error, "Inbound command failed");
            }

            // Gossip
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                forward(
                    event_tx,
                    NodeEvent::BroadcastReceived {
                        source: message.source,
                        data: message.data,
                    },
                );
            }
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(event)) => {
                debug!(?event, "Gossipsub event");
            }

            // Identify
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
            })) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
                self.book
                    .set_public_key(&peer_id.to_string(), hex::encode(info.public_key.encode_protobuf()));
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.book.add_addr(&peer_id.to_string(), addr.to_string());
                }
            }

            // Kademlia
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed { id, result, step, .. },
            )) => self.handle_query_progress(id, result, step.last),
            LibSwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(event)) => {
                debug!(?event, "Kademlia event");
            }

            // Connection events
            LibSwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening on");
            }
            LibSwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                self.book
                    .add_addr(&peer_id.to_string(), endpoint.get_remote_address().to_string());
                if num_established.get() == 1 {
                    debug!(%peer_id, "Connection established");
                    forward(event_tx, NodeEvent::PeerConnected { peer_id });
                }
            }
            LibSwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!(%peer_id, "Connection closed");
                    self.book.remove(&peer_id.to_string());
                    forward(event_tx, NodeEvent::PeerDisconnected { peer_id });
                }
            }

            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                if let Some(found) = self.provider_queries.get(&id) {
                    for provider in providers {
                        let _ = found.send(provider);
                    }
                }
                if last {
                    self.provider_queries.remove(&id);
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                self.provider_queries.remove(&id);
            }
            kad::QueryResult::GetProviders(Err(e)) => {
                debug!(?e, "Provider lookup ended with error");
                self.provider_queries.remove(&id);
            }
            kad::QueryResult::StartProviding(Ok(ok)) => {
                debug!(key = ?ok.key, "Provider record published");
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                warn!(?e, "Publishing provider record failed");
            }
            other => {
                debug!(?other, "Kademlia query progressed");
            }
        }
    }
}

/// Build the libp2p swarm from config.
///
/// Creates or loads an Ed25519 identity keypair, configures transports,
/// constructs the composite behaviour and subscribes to the broadcast topic.
pub fn build_swarm(config: &P2PConfig, data_dir: &Path) -> Result<NodeSwarm> {
    let keypair = load_or_generate_keypair(data_dir)?;
    let public_key = keypair.public();
    let local_peer_id = PeerId::from(public_key.clone());
    info!(%local_peer_id, "Node identity");

    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let enable_mdns = config.enable_mdns;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("TCP transport")?
        .with_quic()
        .with_behaviour(|key| -> Result<NodeBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let protocol = StreamProtocol::new(COMMAND_PROTOCOL);
            let rr_config = request_response::Config::default().with_request_timeout(request_timeout);
            let request_response = request_response::Behaviour::with_codec(
                CommandCodec,
                [(protocol, request_response::ProtocolSupport::Full)],
                rr_config,
            );

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub::Config::default(),
            )
            .map_err(|e| e.to_string())?;

            let mdns = if enable_mdns {
                Some(mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?)
            } else {
                None
            };

            let store = kad::store::MemoryStore::new(key.public().to_peer_id());
            let mut kademlia = kad::Behaviour::new(key.public().to_peer_id(), store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify = identify::Behaviour::new(
                identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                    .with_agent_version(format!("datanode/{}", env!("CARGO_PKG_VERSION"))),
            );

            Ok(NodeBehaviour {
                request_response,
                gossipsub,
                mdns: Toggle::from(mdns),
                kademlia,
                identify,
            })
        })
        .context("swarm behaviour")?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let topic = gossipsub::IdentTopic::new(config.broadcast_topic.clone());
    let mut node_swarm = NodeSwarm {
        swarm,
        local_peer_id,
        public_key,
        topic,
        pending_requests: HashMap::new(),
        provider_queries: HashMap::new(),
        pending_ads: PendingAdvertisements::default(),
        book: PeerBook::default(),
    };

    node_swarm
        .swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&node_swarm.topic)
        .map_err(|e| anyhow!("subscribing to broadcast topic: {:?}", e))?;

    for addr_str in &config.listen_addrs {
        let addr: Multiaddr = addr_str
            .parse()
            .with_context(|| format!("invalid listen address: {}", addr_str))?;
        node_swarm
            .swarm
            .listen_on(addr)
            .with_context(|| format!("failed to listen on {}", addr_str))?;
    }

    let mut has_bootstrap = false;
    for node_str in &config.bootstrap_nodes {
        if let Some((peer_id, addr)) = parse_peer_addr(node_str) {
            node_swarm
                .swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr);
            has_bootstrap = true;
            info!(%peer_id, "Added bootstrap node");
        } else {
            warn!(addr = %node_str, "Invalid bootstrap node address, skipping");
        }
    }
    if has_bootstrap {
        if let Err(e) = node_swarm.swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(?e, "Kademlia bootstrap failed");
        }
    }

    Ok(node_swarm)
}

/// Load an Ed25519 keypair from disk, or generate and persist a new one.
///
/// The keypair is stored as protobuf-encoded bytes at `{data_dir}/node_key`.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<identity::Keypair> {
    let key_path = data_dir.join("node_key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("reading node key")?;
        let keypair =
            identity::Keypair::from_protobuf_encoding(&bytes).context("decoding node key")?;
        info!("Loaded existing node identity");
        Ok(keypair)
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let bytes = keypair
            .to_protobuf_encoding()
            .context("encoding node key")?;
        std::fs::write(&key_path, &bytes).context("writing node key")?;
        info!("Generated new node identity");
        Ok(keypair)
    }
}

/// Parse a multiaddr string like `/ip4/1.2.3.4/tcp/9000/p2p/12D3Koo...`
/// into a (PeerId, Multiaddr) pair.
pub fn parse_peer_addr(addr_str: &str) -> Option<(PeerId, Multiaddr)> {
    let addr: Multiaddr = addr_str.parse().ok()?;
    let peer_id = addr.iter().find_map(|p| {
        if let libp2p::multiaddr::Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })?;
    let addr_without_p2p: Multiaddr = addr
        .iter()
        .filter(|p| !matches!(p, libp2p::multiaddr::Protocol::P2p(_)))
        .collect();
    Some((peer_id, addr_without_p2p))
}
