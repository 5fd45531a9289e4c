//! DDO layer - metadata documents, their resolution across peers and local storage
//!
//! Handles:
//! - Field access on opaque DDO JSON (ids, chain, event, update time)
//! - Identifier validation and DID derivation
//! - Cache, legitimacy checks, local store and network resolution (submodules)

pub mod cache;
pub mod legitimacy;
pub mod resolver;
pub mod store;

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::error::{NodeError, NodeResult};

pub use cache::DdoCache;
pub use legitimacy::{Blockchain, JsonRpcBlockchain, LegitimacyChecker, Rejection};
pub use resolver::{DdoLookup, DdoResolver, ResolverSettings};
pub use store::{DocumentStore, SqliteDocumentStore};

pub const DID_PREFIX: &str = "did:op";

/// Resolved, externally visible record of where and when a DDO was last updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindDdoResult {
    pub id: String,
    pub last_update_tx: String,
    pub last_update_time: String,
    /// Peer id of the node that served the record
    pub provider: String,
}

impl FindDdoResult {
    pub fn updated_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_time(&self.last_update_time)
    }

    /// Whether `self` is strictly more recent than `other`.
    pub fn is_newer_than(&self, other: &FindDdoResult) -> bool {
        match (self.updated_at(), other.updated_at()) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

fn parse_time(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).ok()
}

/// Sort most recent first; equal timestamps keep insertion order.
pub fn sort_results(results: &mut [FindDdoResult]) {
    results.sort_by(|a, b| match (a.updated_at(), b.updated_at()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Reject identifiers that are not DIDs of this network.
pub fn validate_ddo_identifier(id: &str) -> NodeResult<()> {
    if id.starts_with(DID_PREFIX) {
        Ok(())
    } else {
        Err(NodeError::BadRequest(format!(
            "Invalid DDO identifier: {} (must start with \"{}\")",
            id, DID_PREFIX
        )))
    }
}

/// EIP-55 mixed-case checksum form of a hex address.
pub fn to_checksum_address(address: &str) -> Option<String> {
    let hex_part = address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")).unwrap_or(address);
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let lower = hex_part.to_ascii_lowercase();
    let hash = hex::encode(Keccak256::digest(lower.as_bytes()));
    let checksummed: String = lower
        .chars()
        .zip(hash.chars())
        .map(|(c, h)| {
            if c.is_ascii_alphabetic() && h.to_digit(16).unwrap_or(0) >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect();
    Some(format!("0x{}", checksummed))
}

/// Deterministic DDO id for an NFT contract on a chain.
pub fn make_did(nft_address: &str, chain_id: u64) -> Option<String> {
    let checksummed = to_checksum_address(nft_address)?;
    let digest = Sha256::digest(format!("{}{}", checksummed, chain_id).as_bytes());
    Some(format!("{}:{}", DID_PREFIX, hex::encode(digest)))
}

/// Read-only accessors over a DDO document.
#[derive(Debug, Clone, PartialEq)]
pub struct Ddo(pub Value);

impl Ddo {
    pub fn id(&self) -> Option<&str> {
        self.0.get("id")?.as_str()
    }

    pub fn nft_address(&self) -> Option<&str> {
        self.0.get("nftAddress")?.as_str()
    }

    pub fn chain_id(&self) -> Option<u64> {
        let value = self.0.get("chainId")?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }

    fn event(&self) -> Option<&Value> {
        self.0.get("indexedMetadata")?.get("event")
    }

    pub fn event_tx(&self) -> Option<&str> {
        let event = self.event()?;
        event
            .get("tx")
            .or_else(|| event.get("txid"))
            .and_then(Value::as_str)
    }

    pub fn event_block(&self) -> Option<i64> {
        self.event()?.get("block")?.as_i64()
    }

    pub fn updated(&self) -> Option<&str> {
        self.0.get("metadata")?.get("updated")?.as_str()
    }

    /// Result record for this document as served by `provider`.
    pub fn result_for(&self, provider: &str) -> Option<FindDdoResult> {
        Some(FindDdoResult {
            id: self.id()?.to_string(),
            last_update_tx: self.event_tx().unwrap_or_default().to_string(),
            last_update_time: self.updated()?.to_string(),
            provider: provider.to_string(),
        })
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

const SERVICE_FIELDS: &[&str] = &[
    "id",
    "type",
    "name",
    "description",
    "files",
    "datatokenAddress",
    "serviceEndpoint",
    "timeout",
    "compute",
    "consumerParameters",
    "additionalInformation",
];

const DDO_FIELDS: &[&str] = &[
    "@context",
    "id",
    "version",
    "nftAddress",
    "chainId",
    "metadata",
    "credentials",
    "indexedMetadata",
];

fn pick(source: &Value, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|f| source.get(*f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

/// Caller-facing shape of a DDO: known top-level fields and normalised services.
pub fn format_ddo(ddo: &Value) -> Value {
    let mut out = pick(ddo, DDO_FIELDS);
    let services: Vec<Value> = ddo
        .get("services")
        .and_then(Value::as_array)
        .map(|list| list.iter().map(|s| Value::Object(pick(s, SERVICE_FIELDS))).collect())
        .unwrap_or_default();
    out.insert("services".to_string(), Value::Array(services));
    Value::Object(out)
}
