//! Peer bookkeeping - known peer records, peer-set diffing, queued advertisements

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

/// What we know about a peer while it is connected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    pub addrs: Vec<String>,
    /// Hex of the protobuf-encoded public key, once identified
    pub public_key: Option<String>,
}

/// Address book of connected peers, evicted on disconnect.
#[derive(Debug, Default)]
pub struct PeerBook {
    records: HashMap<String, PeerRecord>,
}

impl PeerBook {
    pub fn add_addr(&mut self, peer_id: &str, addr: String) {
        let record = self.entry(peer_id);
        if !record.addrs.contains(&addr) {
            record.addrs.push(addr);
        }
    }

    pub fn set_public_key(&mut self, peer_id: &str, public_key: String) {
        self.entry(peer_id).public_key = Some(public_key);
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.records.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.records.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn entry(&mut self, peer_id: &str) -> &mut PeerRecord {
        self.records
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord {
                peer_id: peer_id.to_string(),
                addrs: vec![],
                public_key: None,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Joined(String),
    Left(String),
}

/// Last observed peer set; each poll is diffed against it.
#[derive(Debug, Default)]
pub struct PeerSet {
    known: BTreeSet<String>,
}

impl PeerSet {
    /// Replace the known set with `current`, returning additions then removals.
    pub fn update<I>(&mut self, current: I) -> Vec<PeerChange>
    where
        I: IntoIterator<Item = String>,
    {
        let current: BTreeSet<String> = current.into_iter().collect();
        let mut changes: Vec<PeerChange> = current
            .difference(&self.known)
            .cloned()
            .map(PeerChange::Joined)
            .collect();
        changes.extend(self.known.difference(&current).cloned().map(PeerChange::Left));
        self.known = current;
        changes
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.known.contains(peer_id)
    }
}

/// Document ids whose advertisement waits for a peer to show up.
#[derive(Debug, Default)]
pub struct PendingAdvertisements {
    queue: Vec<String>,
}

impl PendingAdvertisements {
    pub fn push(&mut self, id: String) {
        if !self.queue.contains(&id) {
            self.queue.push(id);
        }
    }

    /// Drain the queue; each id gets one retry and is dropped regardless of outcome.
    pub fn take_all(&mut self) -> Vec<String> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
