//! Content routing - provider records keyed by content ids derived from document ids

use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use libp2p::kad::RecordKey;
use multihash_codetable::{Code, MultihashDigest};

use crate::error::NodeResult;

/// Multicodec `raw`
const RAW_CODEC: u64 = 0x55;

/// CIDv1 (raw codec, sha2-256) of a document id.
pub fn content_cid(document_id: &str) -> Cid {
    Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(document_id.as_bytes()))
}

/// Binary form of [`content_cid`].
pub fn content_id(document_id: &str) -> Vec<u8> {
    content_cid(document_id).to_bytes()
}

/// Kademlia provider key for a document id.
pub fn content_key(document_id: &str) -> RecordKey {
    RecordKey::new(&content_id(document_id))
}

/// Provide / find-providers abstraction over the DHT.
#[async_trait]
pub trait ContentRouter: Send + Sync {
    /// Announce this node as a provider for `id`. Best-effort: with no peers
    /// connected the id is queued and retried later.
    async fn advertise(&self, id: &str) -> NodeResult<()>;

    /// Providers found for `id` before `timeout` elapses. Never errors on timeout.
    async fn find_providers(&self, id: &str, timeout: Duration) -> NodeResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_content_id_layout() {
        let cid = content_id("did:op:abc");
        assert_eq!(cid.len(), 36);
        assert_eq!(&cid[..4], &[0x01, 0x55, 0x12, 0x20]);
        assert_eq!(&cid[4..], Sha256::digest(b"did:op:abc").as_slice());
    }

    #[test]
    fn test_content_cid_is_raw_v1() {
        let cid = content_cid("did:op:abc");
        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), RAW_CODEC);
        assert_eq!(cid.hash().code(), 0x12);
        assert!(cid.to_string().starts_with("bafkrei"));
    }

    #[test]
    fn test_content_key_deterministic() {
        assert_eq!(content_key("did:op:1"), content_key("did:op:1"));
        assert_ne!(content_key("did:op:1"), content_key("did:op:2"));
    }
}
