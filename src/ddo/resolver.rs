//! DDO resolution across the local store, the cache and remote providers
//!
//! `find_ddo` walks:
//! 1. Cache fast path (whole cache refreshed within the TTL)
//! 2. Local store
//! 3. Provider lookup through the content router, capped and excluding self
//! 4. Sequential `getDDO` queries, each bounded by its own wait, all bounded
//!    by a global ceiling after which partial results are returned

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::cache::DdoCache;
use super::legitimacy::LegitimacyChecker;
use super::store::DocumentStore;
use super::{format_ddo, sort_results, Ddo, FindDdoResult};
use crate::config::{Config, DdoConfig};
use crate::error::{NodeError, NodeResult};
use crate::p2p::protocols::MAX_RESPONSE_BODY;
use crate::p2p::{ContentRouter, PeerTransport};
use crate::stream;

/// Timing and fan-out knobs for resolution.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub cache_ttl: Duration,
    pub max_providers: usize,
    pub per_provider_wait: Duration,
    pub max_response_wait: Duration,
    pub find_providers_timeout: Duration,
    pub has_indexer: bool,
}

impl ResolverSettings {
    pub fn from_config(config: &Config) -> Self {
        let DdoConfig {
            cache_ttl_secs,
            max_providers,
            per_provider_wait_secs,
            max_response_wait_secs,
            ..
        } = config.ddo;
        Self {
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            max_providers,
            per_provider_wait: Duration::from_secs(per_provider_wait_secs),
            max_response_wait: Duration::from_secs(max_response_wait_secs),
            find_providers_timeout: Duration::from_millis(config.p2p.find_providers_timeout_ms),
            has_indexer: config.node.has_indexer,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Fetches full DDO documents by id, wherever they live.
#[async_trait]
pub trait DdoLookup: Send + Sync {
    async fn lookup_ddo(&self, id: &str) -> Option<Value>;
}

pub struct DdoResolver {
    settings: ResolverSettings,
    cache: DdoCache,
    store: Arc<dyn DocumentStore>,
    router: Arc<dyn ContentRouter>,
    transport: Arc<dyn PeerTransport>,
    legitimacy: LegitimacyChecker,
}

impl DdoResolver {
    pub fn new(
        settings: ResolverSettings,
        store: Arc<dyn DocumentStore>,
        router: Arc<dyn ContentRouter>,
        transport: Arc<dyn PeerTransport>,
        legitimacy: LegitimacyChecker,
    ) -> Self {
        Self {
            cache: DdoCache::new(settings.cache_ttl),
            settings,
            store,
            router,
            transport,
            legitimacy,
        }
    }

    pub fn cache(&self) -> &DdoCache {
        &self.cache
    }

    /// Remote responses dropped by the legitimacy checks so far.
    pub fn rejected_responses(&self) -> u64 {
        self.legitimacy.rejected_count()
    }

    fn retrieve_local(&self, id: &str) -> Option<Value> {
        match self.store.retrieve(id) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%id, error = %e, "Local DDO lookup failed");
                None
            }
        }
    }

    /// Best-known update records for `id`, most recent first.
    pub async fn find_ddo(&self, id: &str) -> Vec<FindDdoResult> {
        self.resolve(id, false).await
    }

    /// Like [`find_ddo`](Self::find_ddo) but always asks the network, even
    /// when the cache is fresh.
    pub async fn refresh_ddo(&self, id: &str) -> Vec<FindDdoResult> {
        self.resolve(id, true).await
    }

    async fn resolve(&self, id: &str, force: bool) -> Vec<FindDdoResult> {
        if !force {
            if let Some(hit) = self.cache.fresh(id).await {
                debug!(%id, provider = %hit.provider, "DDO served from cache");
                return vec![hit];
            }
        }

        let mut results = Vec::new();
        let local_peer = self.transport.local_peer_id();
        if let Some(result) = self.retrieve_local(id).and_then(|doc| Ddo(doc).result_for(&local_peer)) {
            self.cache.upsert(result.clone()).await;
            results.push(result);
        }

        let deadline = Instant::now() + self.settings.max_response_wait;
        if timeout_at(deadline, self.query_providers(id, &mut results)).await.is_err() {
            warn!(
                %id,
                gathered = results.len(),
                "DDO resolution hit the response ceiling, returning partial results"
            );
        }

        self.cache.touch().await;
        sort_results(&mut results);
        results
    }

    async fn query_providers(&self, id: &str, results: &mut Vec<FindDdoResult>) {
        let providers = match self
            .router
            .find_providers(id, self.settings.find_providers_timeout)
            .await
        {
            Ok(providers) => providers,
            Err(e) => {
                warn!(%id, error = %e, "Provider lookup failed, continuing without providers");
                Vec::new()
            }
        };

        let candidates: Vec<String> = providers
            .into_iter()
            .filter(|p| !self.transport.is_target_peer_self(p))
            .take(self.settings.max_providers)
            .collect();
        debug!(%id, candidates = candidates.len(), "Querying DDO providers");

        for peer in candidates {
            match timeout(self.settings.per_provider_wait, self.fetch_remote(&peer, id)).await {
                Ok(Ok(Some(ddo))) => self.accept_remote(ddo, &peer, results).await,
                Ok(Ok(None)) => debug!(%id, %peer, "Provider did not return the DDO"),
                Ok(Err(e)) => debug!(%id, %peer, error = %e, "getDDO request failed"),
                Err(_) => debug!(%id, %peer, "Provider did not answer in time, moving on"),
            }
        }
    }

    /// Ask `peer` for the full document via `getDDO`.
    async fn fetch_remote(&self, peer: &str, id: &str) -> NodeResult<Option<Ddo>> {
        let payload = serde_json::to_vec(&json!({"command": "getDDO", "id": id}))?;
        let response = self.transport.send_to(peer, payload).await?;
        if !response.status.is_ok() {
            return Ok(None);
        }
        let Some(body) = response.stream else {
            return Ok(None);
        };
        let bytes = stream::collect(body, MAX_RESPONSE_BODY as usize).await?;
        let ddo = Ddo(serde_json::from_slice(&bytes)?);
        if ddo.id() != Some(id) {
            return Err(NodeError::Protocol(format!(
                "{} answered getDDO {} with a different document",
                peer, id
            )));
        }
        Ok(Some(ddo))
    }

    async fn accept_remote(&self, ddo: Ddo, peer: &str, results: &mut Vec<FindDdoResult>) {
        if self.legitimacy.check(&ddo).await.is_err() {
            return;
        }
        let Some(result) = ddo.result_for(peer) else {
            debug!(%peer, "Legitimate DDO has no update time, ignoring");
            return;
        };
        self.cache.upsert(result.clone()).await;
        results.push(result);

        let id = ddo.id().unwrap_or_default();
        if self.settings.has_indexer && self.retrieve_local(id).is_none() {
            match self.store.create(&ddo.0) {
                Ok(()) => info!(%id, %peer, "Persisted DDO resolved from peer"),
                Err(e) => warn!(error = %e, "Failed to persist resolved DDO"),
            }
        }
    }

    /// Caller-facing DDO for `id`. Without `force` a local copy short-circuits
    /// the cache and network.
    pub async fn find_and_format_ddo(&self, id: &str, force: bool) -> NodeResult<Option<Value>> {
        if !force {
            if let Some(doc) = self.store.retrieve(id)? {
                return Ok(Some(format_ddo(&doc)));
            }
        }

        let results = self.find_ddo(id).await;
        let Some(best) = results.first() else {
            return Ok(None);
        };

        if let Some(doc) = self.retrieve_local(id) {
            if Ddo(doc.clone()).updated() == Some(best.last_update_time.as_str())
                || self.transport.is_target_peer_self(&best.provider)
            {
                return Ok(Some(format_ddo(&doc)));
            }
        }

        let fetched = match timeout(self.settings.per_provider_wait, self.fetch_remote(&best.provider, id)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!(%id, provider = %best.provider, error = %e, "Fetching resolved DDO failed");
                None
            }
            Err(_) => None,
        };
        let Some(ddo) = fetched else {
            return Ok(None);
        };
        if self.legitimacy.check(&ddo).await.is_err() {
            return Ok(None);
        }
        Ok(Some(format_ddo(&ddo.0)))
    }

    /// Persist (when indexing), cache and advertise each document.
    pub async fn store_and_advertise(&self, ddos: Vec<Value>) -> NodeResult<usize> {
        let local_peer = self.transport.local_peer_id();
        let mut stored = 0;
        for doc in ddos {
            let ddo = Ddo(doc);
            let Some(id) = ddo.id().map(str::to_string) else {
                warn!("Skipping DDO without id");
                continue;
            };
            if self.settings.has_indexer {
                if self.store.retrieve(&id)?.is_some() {
                    self.store.update(&ddo.0)?;
                } else {
                    self.store.create(&ddo.0)?;
                }
            }
            if let Some(result) = ddo.result_for(&local_peer) {
                self.cache.upsert(result).await;
            }
            if let Err(e) = self.router.advertise(&id).await {
                warn!(%id, error = %e, "Advertising DDO failed");
            }
            stored += 1;
        }
        Ok(stored)
    }

    /// Re-advertise every stored DDO and refresh the cache timestamp.
    pub async fn republish(&self) -> NodeResult<usize> {
        let local_peer = self.transport.local_peer_id();
        let ids = self.store.ids()?;
        for id in &ids {
            if let Err(e) = self.router.advertise(id).await {
                warn!(%id, error = %e, "Re-advertising DDO failed");
            }
            if let Some(result) = self.retrieve_local(id).and_then(|doc| Ddo(doc).result_for(&local_peer)) {
                self.cache.upsert(result).await;
            }
        }
        self.cache.touch().await;
        info!(count = ids.len(), "Republished local DDOs");
        Ok(ids.len())
    }
}

#[async_trait]
impl DdoLookup for DdoResolver {
    async fn lookup_ddo(&self, id: &str) -> Option<Value> {
        match self.find_and_format_ddo(id, false).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%id, error = %e, "DDO lookup failed");
                None
            }
        }
    }
}
