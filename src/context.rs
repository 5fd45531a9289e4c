//! Node context - every collaborator a command handler can reach
//!
//! Built once at startup and shared as `Arc<NodeContext>`; nothing in the
//! crate looks these up globally.

use std::sync::Arc;
use std::time::Instant;

use crate::compute::ComputeEngines;
use crate::config::Config;
use crate::ddo::{DdoResolver, DocumentStore};
use crate::nonce::NonceStore;
use crate::p2p::{ContentRouter, PeerTransport};
use crate::storage::StorageClient;

pub struct NodeContext {
    pub config: Config,
    pub store: Arc<dyn DocumentStore>,
    pub resolver: Arc<DdoResolver>,
    pub storage: StorageClient,
    pub compute: ComputeEngines,
    pub transport: Arc<dyn PeerTransport>,
    pub router: Arc<dyn ContentRouter>,
    pub nonces: Arc<NonceStore>,
    pub started_at: Instant,
}

impl NodeContext {
    pub fn local_peer_id(&self) -> String {
        self.transport.local_peer_id()
    }
}
