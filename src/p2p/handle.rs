//! Client side of the swarm task: peer messaging and content routing over channels

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::content::ContentRouter;
use super::peers::PeerRecord;
use super::transport::SwarmCommand;
use crate::dispatcher::CommandResponse;
use crate::error::{NodeError, NodeResult};
use crate::stream;

/// Messaging primitive over the node's command protocol.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer_id(&self) -> String;

    /// Hex-encoded identity public key, when the transport has one.
    fn local_public_key(&self) -> Option<String> {
        None
    }

    /// Send a command payload to `peer_id` and return its status and payload.
    async fn send_to(&self, peer_id: &str, payload: Vec<u8>) -> NodeResult<CommandResponse>;

    /// Publish to every subscriber of the broadcast topic. No acknowledgement.
    async fn broadcast(&self, payload: Vec<u8>) -> NodeResult<()>;

    /// Peers currently subscribed to the broadcast topic.
    async fn topic_peers(&self) -> NodeResult<Vec<String>>;

    fn is_target_peer_self(&self, peer_id: &str) -> bool {
        self.local_peer_id() == peer_id
    }
}

/// Cloneable handle to the swarm task.
#[derive(Clone)]
pub struct P2pHandle {
    local_peer_id: PeerId,
    public_key: Option<String>,
    commands: mpsc::Sender<SwarmCommand>,
    send_timeout: Duration,
}

impl P2pHandle {
    pub fn new(local_peer_id: PeerId, commands: mpsc::Sender<SwarmCommand>, send_timeout: Duration) -> Self {
        Self {
            local_peer_id,
            public_key: None,
            commands,
            send_timeout,
        }
    }

    pub fn with_public_key(mut self, public_key: String) -> Self {
        self.public_key = Some(public_key);
        self
    }

    /// Ask the swarm task to retry queued advertisements.
    pub async fn flush_pending_advertisements(&self) -> NodeResult<()> {
        self.submit(SwarmCommand::FlushPendingAdvertisements).await
    }

    pub async fn peer_record(&self, peer_id: &str) -> NodeResult<Option<PeerRecord>> {
        let peer_id = parse_peer(peer_id)?;
        let (reply, rx) = oneshot::channel();
        self.submit(SwarmCommand::PeerRecord { peer_id, reply }).await?;
        rx.await.map_err(|_| swarm_gone())
    }

    async fn submit(&self, command: SwarmCommand) -> NodeResult<()> {
        self.commands.send(command).await.map_err(|_| swarm_gone())
    }
}

fn swarm_gone() -> NodeError {
    NodeError::Internal("swarm task is not running".to_string())
}

fn parse_peer(peer_id: &str) -> NodeResult<PeerId> {
    PeerId::from_str(peer_id).map_err(|_| NodeError::PeerNotFound(peer_id.to_string()))
}

#[async_trait]
impl PeerTransport for P2pHandle {
    fn local_peer_id(&self) -> String {
        self.local_peer_id.to_string()
    }

    fn local_public_key(&self) -> Option<String> {
        self.public_key.clone()
    }

    async fn send_to(&self, peer_id: &str, payload: Vec<u8>) -> NodeResult<CommandResponse> {
        let peer = parse_peer(peer_id)?;
        let (reply, rx) = oneshot::channel();
        self.submit(SwarmCommand::SendRequest {
            peer_id: peer,
            payload,
            reply,
        })
        .await?;

        let response = tokio::time::timeout(self.send_timeout, rx)
            .await
            .map_err(|_| NodeError::Timeout(format!("command to {}", peer_id)))?
            .map_err(|_| swarm_gone())??;

        Ok(CommandResponse {
            status: response.status,
            stream: Some(stream::once(response.body)),
        })
    }

    async fn broadcast(&self, payload: Vec<u8>) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(SwarmCommand::Broadcast { data: payload, reply }).await?;
        rx.await.map_err(|_| swarm_gone())?
    }

    async fn topic_peers(&self) -> NodeResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.submit(SwarmCommand::TopicPeers { reply }).await?;
        let peers = rx.await.map_err(|_| swarm_gone())?;
        Ok(peers.into_iter().map(|p| p.to_string()).collect())
    }
}

#[async_trait]
impl ContentRouter for P2pHandle {
    async fn advertise(&self, id: &str) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(SwarmCommand::Advertise {
            id: id.to_string(),
            reply,
        })
        .await?;
        let queued = rx.await.map_err(|_| swarm_gone())??;
        if queued {
            debug!(%id, "Advertisement queued until a peer joins");
        }
        Ok(())
    }

    async fn find_providers(&self, id: &str, timeout: Duration) -> NodeResult<Vec<String>> {
        let (found, mut rx) = mpsc::unbounded_channel();
        self.submit(SwarmCommand::FindProviders {
            id: id.to_string(),
            found,
        })
        .await?;

        let mut providers: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(peer)) => {
                    let peer = peer.to_string();
                    if !providers.contains(&peer) {
                        providers.push(peer);
                    }
                }
                // Query finished
                Ok(None) => break,
                Err(_) => {
                    debug!(%id, found = providers.len(), "Provider lookup timed out");
                    break;
                }
            }
        }
        Ok(providers)
    }
}
