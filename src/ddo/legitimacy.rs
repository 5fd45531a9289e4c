//! Legitimacy checks for DDOs served by remote peers
//!
//! A remote record is trusted only when its id matches the hash of its NFT
//! address and chain, the chain is supported, the NFT came from the configured
//! factory, the claimed event block exists and matches the mined receipt, and
//! the event transaction carries a metadata created/updated log emitted by the
//! NFT itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use super::{make_did, Ddo};
use crate::config::ChainConfig;

/// topic0 of `MetadataCreated(address,uint8,string,bytes,bytes,bytes32,uint256,uint256)`
pub const METADATA_CREATED_TOPIC: &str =
    "0x5463569dcc320958360074a9ab27e809e8a6942c394fb151d139b5f7b4ecb1bd";
/// topic0 of `MetadataUpdated(address,uint8,string,bytes,bytes,bytes32,uint256,uint256)`
pub const METADATA_UPDATED_TOPIC: &str =
    "0xe5c4cf86b1815151e6f453e1e133d4454ae3b0b07145db39f2e0178685deac84";
/// Selector of `erc721List(address)` on the NFT factory
const ERC721_LIST_SELECTOR: &str = "72f670f0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLog {
    pub address: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub block_number: Option<u64>,
    pub logs: Vec<ReceiptLog>,
}

/// On-chain reads needed to verify a DDO.
#[async_trait]
pub trait Blockchain: Send + Sync {
    fn supports_chain(&self, chain_id: u64) -> bool;

    /// Whether the configured factory deployed `nft_address`.
    async fn nft_deployed_by_factory(&self, chain_id: u64, nft_address: &str) -> Result<bool>;

    /// Current chain height.
    async fn block_number(&self, chain_id: u64) -> Result<u64>;

    async fn transaction_receipt(&self, chain_id: u64, tx: &str) -> Result<Option<TransactionReceipt>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("id {actual} does not match hash of nftAddress and chainId ({expected})")]
    IdMismatch { expected: String, actual: String },

    #[error("chain {0} is not supported")]
    UnsupportedChain(u64),

    #[error("NFT {0} was not deployed by the data NFT factory")]
    NotDeployedByFactory(String),

    #[error("event block {block:?} is missing or beyond chain height {height}")]
    InvalidBlock { block: Option<i64>, height: u64 },

    #[error("DDO event is missing transaction data")]
    MissingTransaction,

    #[error("transaction {0} has no metadata created/updated event")]
    NoMetadataEvent(String),

    #[error("transaction {tx} was mined in block {mined}, not {claimed}")]
    BlockMismatch { tx: String, claimed: i64, mined: u64 },

    #[error("chain query failed: {0}")]
    Chain(String),
}

/// Runs the checks and counts rejections.
pub struct LegitimacyChecker {
    chain: Arc<dyn Blockchain>,
    rejected: AtomicU64,
}

impl LegitimacyChecker {
    pub fn new(chain: Arc<dyn Blockchain>) -> Self {
        Self {
            chain,
            rejected: AtomicU64::new(0),
        }
    }

    /// Number of responses rejected since start.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub async fn check(&self, ddo: &Ddo) -> Result<(), Rejection> {
        let result = self.run_checks(ddo).await;
        if let Err(rejection) = &result {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = ddo.id().unwrap_or("<none>"),
                reason = %rejection,
                "Cannot confirm validity of DDO from remote node, skipping it"
            );
        }
        result
    }

    async fn run_checks(&self, ddo: &Ddo) -> Result<(), Rejection> {
        let id = ddo.id().ok_or(Rejection::MissingField("id"))?;
        let nft_address = ddo.nft_address().ok_or(Rejection::MissingField("nftAddress"))?;
        let chain_id = ddo.chain_id().ok_or(Rejection::MissingField("chainId"))?;

        let expected = make_did(nft_address, chain_id).ok_or(Rejection::MissingField("nftAddress"))?;
        if expected != id {
            return Err(Rejection::IdMismatch {
                expected,
                actual: id.to_string(),
            });
        }

        if !self.chain.supports_chain(chain_id) {
            return Err(Rejection::UnsupportedChain(chain_id));
        }

        let deployed = self
            .chain
            .nft_deployed_by_factory(chain_id, nft_address)
            .await
            .map_err(|e| Rejection::Chain(format!("{:#}", e)))?;
        if !deployed {
            return Err(Rejection::NotDeployedByFactory(nft_address.to_string()));
        }

        let height = self
            .chain
            .block_number(chain_id)
            .await
            .map_err(|e| Rejection::Chain(format!("{:#}", e)))?;
        let block = ddo.event_block();
        match block {
            Some(b) if b >= 0 && (b as u64) <= height => {}
            _ => return Err(Rejection::InvalidBlock { block, height }),
        }

        let tx = ddo.event_tx().ok_or(Rejection::MissingTransaction)?;
        let receipt = self
            .chain
            .transaction_receipt(chain_id, tx)
            .await
            .map_err(|e| Rejection::Chain(format!("{:#}", e)))?;
        let Some(receipt) = receipt else {
            return Err(Rejection::NoMetadataEvent(tx.to_string()));
        };
        if let (Some(mined), Some(claimed)) = (receipt.block_number, block) {
            if mined as i64 != claimed {
                return Err(Rejection::BlockMismatch {
                    tx: tx.to_string(),
                    claimed,
                    mined,
                });
            }
        }
        if !receipt.logs.iter().any(|log| is_metadata_event(log, nft_address)) {
            return Err(Rejection::NoMetadataEvent(tx.to_string()));
        }

        Ok(())
    }
}

/// A MetadataCreated/MetadataUpdated log emitted by the DDO's own NFT contract.
fn is_metadata_event(log: &ReceiptLog, nft_address: &str) -> bool {
    if !log.address.eq_ignore_ascii_case(nft_address) {
        return false;
    }
    log.topics.first().is_some_and(|topic| {
        let topic = topic.to_ascii_lowercase();
        topic == METADATA_CREATED_TOPIC || topic == METADATA_UPDATED_TOPIC
    })
}

/// Ethereum JSON-RPC backed chain reader.
pub struct JsonRpcBlockchain {
    http: reqwest::Client,
    chains: HashMap<u64, ChainConfig>,
}

impl JsonRpcBlockchain {
    pub fn new(chains: &[ChainConfig]) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building RPC HTTP client")?;
        Ok(Self {
            http,
            chains: chains.iter().map(|c| (c.chain_id, c.clone())).collect(),
        })
    }

    fn chain(&self, chain_id: u64) -> Result<&ChainConfig> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| anyhow!("chain {} is not configured", chain_id))
    }

    async fn rpc(&self, chain_id: u64, method: &str, params: Value) -> Result<Value> {
        let chain = self.chain(chain_id)?;
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
        let response: Value = self
            .http
            .post(&chain.rpc_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} on chain {}", method, chain_id))?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.get("error") {
            bail!("{} returned error: {}", method, err);
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn parse_hex_u64(value: &str) -> Option<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

fn strip_hex(value: &str) -> String {
    value.trim_start_matches("0x").to_ascii_lowercase()
}

#[async_trait]
impl Blockchain for JsonRpcBlockchain {
    fn supports_chain(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    async fn nft_deployed_by_factory(&self, chain_id: u64, nft_address: &str) -> Result<bool> {
        let factory = self.chain(chain_id)?.nft_factory_address.clone();
        let nft = strip_hex(nft_address);
        let data = format!("0x{}{:0>64}", ERC721_LIST_SELECTOR, nft);
        let result = self
            .rpc(chain_id, "eth_call", json!([{"to": factory, "data": data}, "latest"]))
            .await?;
        let word = strip_hex(result.as_str().unwrap_or_default());
        if word.len() < 40 {
            return Ok(false);
        }
        Ok(word[word.len() - 40..] == nft)
    }

    async fn block_number(&self, chain_id: u64) -> Result<u64> {
        let result = self.rpc(chain_id, "eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| anyhow!("unexpected eth_blockNumber result: {}", result))
    }

    async fn transaction_receipt(&self, chain_id: u64, tx: &str) -> Result<Option<TransactionReceipt>> {
        let result = self
            .rpc(chain_id, "eth_getTransactionReceipt", json!([tx]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let block_number = result
            .get("blockNumber")
            .and_then(Value::as_str)
            .and_then(parse_hex_u64);
        let logs = result
            .get("logs")
            .and_then(Value::as_array)
            .map(|logs| {
                logs.iter()
                    .map(|log| ReceiptLog {
                        address: log
                            .get("address")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        topics: log
                            .get("topics")
                            .and_then(Value::as_array)
                            .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(TransactionReceipt { block_number, logs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NFT: &str = "0x181e8a7f8767808bea51F61044E27C5F8bf7C939";
    const DID: &str = "did:op:12b17ee47536dc342f67a5fab2f014ddeb10be04018bc6bc53953655e2f7f8ff";

    struct FakeChain {
        height: u64,
        deployed: bool,
        topic: &'static str,
        emitter: &'static str,
        mined: u64,
    }

    #[async_trait]
    impl Blockchain for FakeChain {
        fn supports_chain(&self, chain_id: u64) -> bool {
            chain_id == 8996
        }
        async fn nft_deployed_by_factory(&self, _: u64, _: &str) -> Result<bool> {
            Ok(self.deployed)
        }
        async fn block_number(&self, _: u64) -> Result<u64> {
            Ok(self.height)
        }
        async fn transaction_receipt(&self, _: u64, _: &str) -> Result<Option<TransactionReceipt>> {
            Ok(Some(TransactionReceipt {
                block_number: Some(self.mined),
                logs: vec![ReceiptLog {
                    address: self.emitter.to_string(),
                    topics: vec![self.topic.to_string()],
                }],
            }))
        }
    }

    fn ddo(id: &str, chain_id: u64, block: i64) -> Ddo {
        Ddo(json!({
            "id": id,
            "nftAddress": NFT,
            "chainId": chain_id,
            "metadata": {"updated": "2024-01-01T00:00:00Z"},
            "indexedMetadata": {"event": {"tx": "0xabc", "block": block}}
        }))
    }

    fn checker(height: u64, deployed: bool, topic: &'static str) -> LegitimacyChecker {
        LegitimacyChecker::new(Arc::new(FakeChain {
            height,
            deployed,
            topic,
            emitter: NFT,
            mined: 100,
        }))
    }

    #[tokio::test]
    async fn test_legit_ddo_accepted() {
        let c = checker(200, true, METADATA_UPDATED_TOPIC);
        assert!(c.check(&ddo(DID, 8996, 100)).await.is_ok());
        assert_eq!(c.rejected_count(), 0);
    }

    #[tokio::test]
    async fn test_each_check_rejects() {
        let c = checker(200, true, METADATA_CREATED_TOPIC);
        assert!(matches!(
            c.check(&ddo("did:op:forged", 8996, 100)).await,
            Err(Rejection::IdMismatch { .. })
        ));
        assert!(matches!(
            c.check(&ddo(&make_did(NFT, 1).unwrap(), 1, 100)).await,
            Err(Rejection::UnsupportedChain(1))
        ));
        assert!(matches!(
            c.check(&ddo(DID, 8996, 201)).await,
            Err(Rejection::InvalidBlock { .. })
        ));
        assert_eq!(c.rejected_count(), 3);

        let c = checker(200, false, METADATA_CREATED_TOPIC);
        assert!(matches!(
            c.check(&ddo(DID, 8996, 100)).await,
            Err(Rejection::NotDeployedByFactory(_))
        ));

        let c = checker(200, true, "0xdeadbeef");
        assert!(matches!(
            c.check(&ddo(DID, 8996, 100)).await,
            Err(Rejection::NoMetadataEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_event_must_come_from_the_nft_in_the_claimed_block() {
        let foreign = LegitimacyChecker::new(Arc::new(FakeChain {
            height: 200,
            deployed: true,
            topic: METADATA_CREATED_TOPIC,
            emitter: "0x0000000000000000000000000000000000000001",
            mined: 100,
        }));
        assert!(matches!(
            foreign.check(&ddo(DID, 8996, 100)).await,
            Err(Rejection::NoMetadataEvent(_))
        ));

        let lowercase = LegitimacyChecker::new(Arc::new(FakeChain {
            height: 200,
            deployed: true,
            topic: METADATA_CREATED_TOPIC,
            emitter: "0x181e8a7f8767808bea51f61044e27c5f8bf7c939",
            mined: 100,
        }));
        assert!(lowercase.check(&ddo(DID, 8996, 100)).await.is_ok());

        let c = checker(200, true, METADATA_CREATED_TOPIC);
        assert!(matches!(
            c.check(&ddo(DID, 8996, 99)).await,
            Err(Rejection::BlockMismatch { claimed: 99, mined: 100, .. })
        ));
    }
}
