//! Network coordinator - consumes swarm events and runs the periodic overlay chores
//!
//! Owns the peer-set view. Inbound commands are handed to the dispatcher on
//! their own task so a slow handler never stalls event processing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::handle::{P2pHandle, PeerTransport};
use super::peers::{PeerChange, PeerSet};
use super::protocols::MAX_RESPONSE_BODY;
use super::transport::{NodeEvent, SwarmCommand};
use crate::config::Config;
use crate::dispatcher::Dispatcher;

pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    handle: P2pHandle,
    swarm_commands: mpsc::Sender<SwarmCommand>,
    peers: PeerSet,
    peer_poll: Duration,
    pending_flush: Duration,
    republish: Duration,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        dispatcher: Arc<Dispatcher>,
        handle: P2pHandle,
        swarm_commands: mpsc::Sender<SwarmCommand>,
    ) -> Self {
        Self {
            dispatcher,
            handle,
            swarm_commands,
            peers: PeerSet::default(),
            peer_poll: Duration::from_millis(config.p2p.peer_poll_interval_ms),
            pending_flush: Duration::from_secs(config.p2p.pending_advertise_interval_secs),
            republish: Duration::from_secs(config.ddo.republish_interval_secs),
        }
    }

    /// Run until the swarm's event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<NodeEvent>) {
        let mut peer_timer = interval(self.peer_poll);
        peer_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush_timer = interval_at(Instant::now() + self.pending_flush, self.pending_flush);
        let mut republish_timer = interval_at(Instant::now() + self.republish, self.republish);
        republish_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Swarm event channel closed, stopping coordinator");
                        break;
                    }
                },
                _ = peer_timer.tick() => {
                    self.poll_peers().await;
                }
                _ = flush_timer.tick() => {
                    if let Err(e) = self.handle.flush_pending_advertisements().await {
                        warn!(error = %e, "Failed to flush pending advertisements");
                    }
                }
                _ = republish_timer.tick() => {
                    let resolver = self.dispatcher.context().resolver.clone();
                    tokio::spawn(async move {
                        if let Err(e) = resolver.republish().await {
                            warn!(error = %e, "Republish sweep failed");
                        }
                    });
                }
            }
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::PeerConnected { peer_id } => {
                debug!(%peer_id, "Peer connected");
            }
            NodeEvent::PeerDisconnected { peer_id } => {
                debug!(%peer_id, "Peer disconnected");
            }
            NodeEvent::InboundCommand {
                peer_id,
                payload,
                channel,
            } => {
                let dispatcher = self.dispatcher.clone();
                let swarm_commands = self.swarm_commands.clone();
                tokio::spawn(async move {
                    let caller = peer_id.to_string();
                    let response = dispatcher
                        .dispatch_bytes(&caller, &payload)
                        .await
                        .into_wire(MAX_RESPONSE_BODY as usize)
                        .await;
                    debug!(%caller, status = response.status.http_status, "Answering inbound command");
                    if swarm_commands
                        .send(SwarmCommand::SendResponse { channel, response })
                        .await
                        .is_err()
                    {
                        warn!(%caller, "Swarm task gone, response dropped");
                    }
                });
            }
            NodeEvent::BroadcastReceived { source, data } => {
                debug!(source = ?source, bytes = data.len(), "Broadcast received");
            }
        }
    }

    /// Diff topic subscribers against the last view; joins flush queued ads once.
    async fn poll_peers(&mut self) {
        let current = match self.handle.topic_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                debug!(error = %e, "Could not read topic peers");
                return;
            }
        };
        let mut joined = false;
        for change in self.peers.update(current) {
            match change {
                PeerChange::Joined(peer) => {
                    match self.handle.peer_record(&peer).await {
                        Ok(Some(record)) => info!(%peer, addrs = ?record.addrs, "Peer joined"),
                        _ => info!(%peer, "Peer joined"),
                    }
                    joined = true;
                }
                PeerChange::Left(peer) => info!(%peer, "Peer left"),
            }
        }
        if joined {
            if let Err(e) = self.handle.flush_pending_advertisements().await {
                warn!(error = %e, "Failed to flush pending advertisements");
            }
        }
    }
}
