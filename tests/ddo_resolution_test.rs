//! DDO resolution across store, cache and remote providers

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use datanode::ddo::{DocumentStore, ResolverSettings};

fn settings() -> ResolverSettings {
    ResolverSettings {
        has_indexer: false,
        ..Default::default()
    }
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn test_second_lookup_served_from_cache() {
    let r = resolver_with(settings(), FakeRouter::with_providers(&["peerA"]), FakeChain::default());
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    let first = r.resolver.find_ddo(DID).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].provider, "peerA");
    assert_eq!(first[0].last_update_tx, "0xfeed");

    let second = r.resolver.find_ddo(DID).await;
    assert_eq!(second, first);
    assert_eq!(r.transport.sent().len(), 1);
    assert_eq!(r.router.lookups(), 1);
}

#[tokio::test]
async fn test_refresh_bypasses_fresh_cache() {
    let r = resolver_with(settings(), FakeRouter::with_providers(&["peerA"]), FakeChain::default());
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    r.resolver.find_ddo(DID).await;
    r.transport.serve("peerA", ddo("2024-06-01T00:00:00Z", 10));
    let cached = r.resolver.find_ddo(DID).await;
    assert_eq!(cached[0].last_update_time, "2024-01-01T00:00:00Z");

    let refreshed = r.resolver.refresh_ddo(DID).await;

    assert_eq!(refreshed[0].last_update_time, "2024-06-01T00:00:00Z");
    assert_eq!(r.router.lookups(), 2);
    assert_eq!(r.transport.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cache_expires_after_ttl() {
    let s = ResolverSettings {
        cache_ttl: Duration::from_secs(60),
        ..settings()
    };
    let r = resolver_with(s, FakeRouter::with_providers(&["peerA"]), FakeChain::default());
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    r.resolver.find_ddo(DID).await;
    tokio::time::advance(Duration::from_secs(61)).await;
    r.resolver.find_ddo(DID).await;

    assert_eq!(r.router.lookups(), 2);
}

async fn resolve_two(first: (&str, &str), second: (&str, &str)) -> Resolution {
    let r = resolver_with(
        settings(),
        FakeRouter::with_providers(&[first.0, second.0]),
        FakeChain::default(),
    );
    r.transport.serve(first.0, ddo(first.1, 10));
    r.transport.serve(second.0, ddo(second.1, 10));
    let results = r.resolver.find_ddo(DID).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].last_update_time, "2024-06-01T00:00:00Z");
    r
}

#[tokio::test]
async fn test_newest_record_wins_regardless_of_arrival_order() {
    let r = resolve_two(("old", "2024-01-01T00:00:00Z"), ("new", "2024-06-01T00:00:00Z")).await;
    assert_eq!(r.resolver.cache().get(DID).await.unwrap().provider, "new");

    let r = resolve_two(("new", "2024-06-01T00:00:00Z"), ("old", "2024-01-01T00:00:00Z")).await;
    assert_eq!(r.resolver.cache().get(DID).await.unwrap().provider, "new");
}

// =============================================================================
// Provider selection
// =============================================================================

#[tokio::test]
async fn test_at_most_five_providers_queried() {
    let peers = ["p1", "p2", "p3", "p4", "p5", "p6", "p7"];
    let r = resolver_with(settings(), FakeRouter::with_providers(&peers), FakeChain::default());
    for peer in peers {
        r.transport.serve(peer, ddo("2024-01-01T00:00:00Z", 10));
    }

    let results = r.resolver.find_ddo(DID).await;

    assert_eq!(results.len(), 5);
    assert_eq!(r.transport.sent(), vec!["p1", "p2", "p3", "p4", "p5"]);
}

#[tokio::test]
async fn test_self_is_never_queried() {
    let r = resolver_with(
        settings(),
        FakeRouter::with_providers(&[LOCAL_PEER, "peerA"]),
        FakeChain::default(),
    );
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    r.resolver.find_ddo(DID).await;

    assert_eq!(r.transport.sent(), vec!["peerA"]);
}

#[tokio::test]
async fn test_router_failure_falls_back_to_local_copy() {
    let router = FakeRouter {
        fail: true,
        ..Default::default()
    };
    let r = resolver_with(settings(), router, FakeChain::default());
    r.store.create(&ddo("2024-01-01T00:00:00Z", 10)).unwrap();

    let results = r.resolver.find_ddo(DID).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].provider, LOCAL_PEER);
    assert!(r.transport.sent().is_empty());
}

// =============================================================================
// Legitimacy
// =============================================================================

#[tokio::test]
async fn test_forged_id_is_rejected() {
    let r = resolver_with(settings(), FakeRouter::with_providers(&["liar"]), FakeChain::default());
    let mut forged = ddo("2024-01-01T00:00:00Z", 10);
    forged["nftAddress"] = json!("0x0000000000000000000000000000000000000001");
    r.transport.serve("liar", forged);

    let results = r.resolver.find_ddo(DID).await;

    assert!(results.is_empty());
    assert_eq!(r.resolver.rejected_responses(), 1);
    assert!(r.resolver.cache().get(DID).await.is_none());
}

#[tokio::test]
async fn test_event_block_beyond_chain_height_is_rejected() {
    let r = resolver_with(
        settings(),
        FakeRouter::with_providers(&["peerA"]),
        FakeChain { height: 5 },
    );
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    assert!(r.resolver.find_ddo(DID).await.is_empty());
    assert_eq!(r.resolver.rejected_responses(), 1);
}

#[tokio::test]
async fn test_indexer_persists_accepted_remote_ddo() {
    let s = ResolverSettings {
        has_indexer: true,
        ..settings()
    };
    let r = resolver_with(s, FakeRouter::with_providers(&["peerA"]), FakeChain::default());
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    r.resolver.find_ddo(DID).await;

    let stored = r.store.retrieve(DID).unwrap().unwrap();
    assert_eq!(stored["nftAddress"], NFT);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_provider_is_skipped() {
    let r = resolver_with(
        settings(),
        FakeRouter::with_providers(&["slow", "fast"]),
        FakeChain::default(),
    );
    r.transport.serve("slow", ddo("2024-06-01T00:00:00Z", 10));
    r.transport.delay("slow", Duration::from_secs(30));
    r.transport.serve("fast", ddo("2024-01-01T00:00:00Z", 10));

    let results = r.resolver.find_ddo(DID).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].provider, "fast");
}

#[tokio::test(start_paused = true)]
async fn test_response_ceiling_returns_partial_results() {
    let s = ResolverSettings {
        max_response_wait: Duration::from_secs(3),
        ..settings()
    };
    let r = resolver_with(s, FakeRouter::with_providers(&["fast", "slow"]), FakeChain::default());
    r.transport.serve("fast", ddo("2024-01-01T00:00:00Z", 10));
    r.transport.serve("slow", ddo("2024-06-01T00:00:00Z", 10));
    r.transport.delay("slow", Duration::from_secs(4));

    let started = tokio::time::Instant::now();
    let results = r.resolver.find_ddo(DID).await;

    assert!(started.elapsed() <= Duration::from_secs(3) + Duration::from_millis(10));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].provider, "fast");
}

// =============================================================================
// Formatting and advertising
// =============================================================================

#[tokio::test]
async fn test_find_and_format_prefers_local_copy() {
    let r = resolver_with(settings(), FakeRouter::with_providers(&["peerA"]), FakeChain::default());
    r.store.create(&ddo("2024-01-01T00:00:00Z", 10)).unwrap();

    let doc = r.resolver.find_and_format_ddo(DID, false).await.unwrap().unwrap();

    assert_eq!(doc["id"], DID);
    assert!(doc["services"][0].get("extra").is_none());
    assert!(r.transport.sent().is_empty());
}

#[tokio::test]
async fn test_find_and_format_fetches_from_best_provider() {
    let r = resolver_with(settings(), FakeRouter::with_providers(&["peerA"]), FakeChain::default());
    r.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    let doc = r.resolver.find_and_format_ddo(DID, true).await.unwrap().unwrap();

    assert_eq!(doc["metadata"]["name"], "weather");
    assert_eq!(r.transport.sent(), vec!["peerA", "peerA"]);
}

#[tokio::test]
async fn test_unknown_ddo_is_none() {
    let r = resolver_with(settings(), FakeRouter::default(), FakeChain::default());
    assert!(r.resolver.find_and_format_ddo(DID, false).await.unwrap().is_none());
}

#[tokio::test]
async fn test_store_and_advertise() {
    let s = ResolverSettings {
        has_indexer: true,
        ..settings()
    };
    let r = resolver_with(s, FakeRouter::default(), FakeChain::default());

    let stored = r
        .resolver
        .store_and_advertise(vec![ddo("2024-01-01T00:00:00Z", 10), json!({"no": "id"})])
        .await
        .unwrap();

    assert_eq!(stored, 1);
    assert_eq!(*r.router.advertised.lock().unwrap(), vec![DID.to_string()]);
    assert!(r.store.retrieve(DID).unwrap().is_some());
    assert_eq!(r.resolver.cache().get(DID).await.unwrap().provider, LOCAL_PEER);
}
