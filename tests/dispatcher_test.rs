//! Command dispatch end to end: decoding, admission, handlers and wire shape

mod common;

use serde_json::{json, Value};
use tempfile::TempDir;

use common::*;
use datanode::config::{ChainConfig, Config, SecurityConfig};
use datanode::dispatcher::{CommandResponse, Dispatcher};
use datanode::p2p::protocols::WireResponse;

const LIMIT: usize = 1024 * 1024;

async fn wire(response: CommandResponse) -> WireResponse {
    response.into_wire(LIMIT).await
}

async fn call(dispatcher: &Dispatcher, command: Value) -> WireResponse {
    wire(dispatcher.dispatch_bytes("caller", command.to_string().as_bytes()).await).await
}

fn body_json(response: &WireResponse) -> Value {
    serde_json::from_slice(&response.body).unwrap()
}

fn node(dir: &TempDir, config: Config) -> (TestNode, Dispatcher) {
    let node = test_node(dir.path(), config);
    let dispatcher = Dispatcher::new(node.ctx.clone());
    (node, dispatcher)
}

// =============================================================================
// Decoding
// =============================================================================

#[tokio::test]
async fn test_echo() {
    let dir = TempDir::new().unwrap();
    let (_node, dispatcher) = node(&dir, Config::default());

    let response = call(&dispatcher, json!({"command": "echo"})).await;

    assert_eq!(response.status.http_status, 200);
    assert_eq!(response.body, b"OK");
}

#[tokio::test]
async fn test_malformed_and_unknown_commands() {
    let dir = TempDir::new().unwrap();
    let (_node, dispatcher) = node(&dir, Config::default());

    let garbage = wire(dispatcher.dispatch_bytes("caller", b"{not json").await).await;
    assert_eq!(garbage.status.http_status, 400);
    assert_eq!(garbage.status.error.as_deref(), Some("Invalid command"));

    let nameless = call(&dispatcher, json!({"id": DID})).await;
    assert_eq!(nameless.status.http_status, 400);

    let unknown = call(&dispatcher, json!({"command": "teleport"})).await;
    assert_eq!(unknown.status.http_status, 501);

    let missing = call(&dispatcher, json!({"command": "getComputeResult", "jobId": "x"})).await;
    assert_eq!(missing.status.http_status, 400);
    assert_eq!(
        missing.status.error.as_deref(),
        Some("Missing required parameter(s): consumerAddress, index")
    );
}

// =============================================================================
// Node commands
// =============================================================================

#[tokio::test]
async fn test_status_reports_identity_and_chains() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.node.has_indexer = true;
    config.storage.ipfs_gateway = Some("https://ipfs.example".to_string());
    config.storage.arweave_gateway = None;
    config.chains = vec![ChainConfig {
        chain_id: CHAIN,
        rpc_url: "http://127.0.0.1:8545".to_string(),
        nft_factory_address: NFT.to_string(),
        network: Some("development".to_string()),
    }];
    let (_node, dispatcher) = node(&dir, config);

    let response = call(&dispatcher, json!({"command": "status"})).await;
    assert_eq!(response.status.http_status, 200);
    let status = body_json(&response);
    assert_eq!(status["id"], LOCAL_PEER);
    assert_eq!(status["publicKey"], LOCAL_PUBLIC_KEY);
    assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(status["p2p"], true);
    assert_eq!(status["provider"], json!([{"chainId": CHAIN, "network": "development"}]));
    assert_eq!(status["indexer"][0]["block"], "0");
    assert_eq!(status["supportedStorage"], json!({"url": true, "arwave": false, "ipfs": true}));
    assert!(status["platform"]["cpus"].as_u64().unwrap() >= 1);
    assert_eq!(status["platform"]["platform"], std::env::consts::OS);
    assert_eq!(status["platform"]["loadavg"].as_array().unwrap().len(), 3);

    let named = call(&dispatcher, json!({"command": "status", "node": "12D3KooWOther"})).await;
    assert_eq!(body_json(&named)["id"], "12D3KooWOther");
}

#[tokio::test]
async fn test_status_without_indexer_lists_no_indexers() {
    let dir = TempDir::new().unwrap();
    let (_node, dispatcher) = node(&dir, Config::default());

    let status = body_json(&call(&dispatcher, json!({"command": "status"})).await);
    assert_eq!(status["indexer"], json!([]));
}

#[tokio::test]
async fn test_nonce_is_plain_text_and_starts_at_zero() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());
    let address = "0xBE5449a6A97aD46c8558A3356267Ee5D2731ab5e";

    let first = call(&dispatcher, json!({"command": "nonce", "address": address})).await;
    assert_eq!(first.status.http_status, 200);
    assert_eq!(first.body, b"0");
    assert_eq!(
        first.status.headers.as_ref().and_then(|h| h.get("Content-Type")).map(String::as_str),
        Some("text/plain")
    );

    node.ctx.nonces.advance(address, 3).unwrap();
    let later = call(&dispatcher, json!({"command": "nonce", "address": address.to_lowercase()})).await;
    assert_eq!(later.body, b"3");

    let missing = call(&dispatcher, json!({"command": "nonce"})).await;
    assert_eq!(missing.status.http_status, 400);
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_denied_caller_is_refused() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        security: SecurityConfig {
            deny_list: vec!["mallory".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let (_node, dispatcher) = node(&dir, config);

    let denied = wire(dispatcher.dispatch_bytes("mallory", br#"{"command":"echo"}"#).await).await;
    assert_eq!(denied.status.http_status, 403);
    assert!(denied.body.is_empty());

    let allowed = wire(dispatcher.dispatch_bytes("alice", br#"{"command":"echo"}"#).await).await;
    assert_eq!(allowed.status.http_status, 200);
}

#[tokio::test]
async fn test_rate_limit_per_caller() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        security: SecurityConfig {
            rate_limit_per_second: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (_node, dispatcher) = node(&dir, config);
    let echo = br#"{"command":"echo"}"#;

    for _ in 0..2 {
        assert_eq!(wire(dispatcher.dispatch_bytes("alice", echo).await).await.status.http_status, 200);
    }
    let limited = wire(dispatcher.dispatch_bytes("alice", echo).await).await;
    assert_eq!(limited.status.http_status, 403);
    assert_eq!(limited.status.error.as_deref(), Some("Rate limit exceeded"));

    // Other callers have their own budget
    assert_eq!(wire(dispatcher.dispatch_bytes("bob", echo).await).await.status.http_status, 200);
}

// =============================================================================
// DDO commands
// =============================================================================

#[tokio::test]
async fn test_get_ddo() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());

    let absent = call(&dispatcher, json!({"command": "getDDO", "id": DID})).await;
    assert_eq!(absent.status.http_status, 404);

    node.ctx.store.create(&ddo("2024-01-01T00:00:00Z", 10)).unwrap();
    let present = call(&dispatcher, json!({"command": "getDDO", "id": DID})).await;
    assert_eq!(present.status.http_status, 200);
    assert_eq!(body_json(&present)["nftAddress"], NFT);

    let invalid = call(&dispatcher, json!({"command": "getDDO", "id": "0xabc"})).await;
    assert_eq!(invalid.status.http_status, 400);
}

#[tokio::test]
async fn test_find_ddo_returns_local_record() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());
    node.ctx.store.create(&ddo("2024-01-01T00:00:00Z", 10)).unwrap();

    let response = call(&dispatcher, json!({"command": "findDDO", "id": DID})).await;

    assert_eq!(response.status.http_status, 200);
    let records = body_json(&response);
    assert_eq!(records[0]["provider"], LOCAL_PEER);
    assert_eq!(records[0]["lastUpdateTx"], "0xfeed");
}

#[tokio::test]
async fn test_find_ddo_force_skips_cache() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());
    node.ctx.store.create(&ddo("2024-01-01T00:00:00Z", 10)).unwrap();

    call(&dispatcher, json!({"command": "findDDO", "id": DID})).await;
    call(&dispatcher, json!({"command": "findDDO", "id": DID})).await;
    assert_eq!(node.resolution.router.lookups(), 1);

    let forced = call(&dispatcher, json!({"command": "findDDO", "id": DID, "force": true})).await;

    assert_eq!(forced.status.http_status, 200);
    assert_eq!(body_json(&forced)[0]["provider"], LOCAL_PEER);
    assert_eq!(node.resolution.router.lookups(), 2);
}

// =============================================================================
// Compute commands
// =============================================================================

fn start_command(owner: &str) -> Value {
    json!({
        "command": "freeStartCompute",
        "consumerAddress": owner,
        "algorithm": {
            "meta": {
                "rawcode": "print(1)",
                "container": {"image": "python", "tag": "3.11", "entrypoint": "python $ALGO"}
            }
        },
        "datasets": []
    })
}

#[tokio::test]
async fn test_free_compute_flow() {
    let dir = TempDir::new().unwrap();
    let (_node, dispatcher) = node(&dir, Config::default());

    let envs = call(&dispatcher, json!({"command": "getComputeEnvironments"})).await;
    assert_eq!(envs.status.http_status, 200);
    let envs = body_json(&envs);
    assert_eq!(envs.as_array().unwrap().len(), 1);
    assert_eq!(envs[0]["free"], true);

    let started = call(&dispatcher, start_command("0xAlice")).await;
    assert_eq!(started.status.http_status, 200);
    let job = body_json(&started)[0].clone();
    let job_id = job["jobId"].as_str().unwrap().to_string();
    assert_eq!(job["status"], 0);
    assert_eq!(job["containerImage"], "python:3.11");
    assert_eq!(job["environment"], envs[0]["id"]);

    let status = call(&dispatcher, json!({"command": "getComputeStatus", "consumerAddress": "0xAlice"})).await;
    assert_eq!(body_json(&status)[0]["jobId"], job_id.as_str());

    let unfiltered = call(&dispatcher, json!({"command": "getComputeStatus"})).await;
    assert_eq!(unfiltered.status.http_status, 400);

    let stolen = call(
        &dispatcher,
        json!({"command": "getComputeResult", "consumerAddress": "0xBob", "jobId": job_id, "index": 0}),
    )
    .await;
    assert_eq!(stolen.status.http_status, 404);

    let stop = call(
        &dispatcher,
        json!({"command": "stopCompute", "consumerAddress": "0xBob", "jobId": job_id}),
    )
    .await;
    assert_eq!(stop.status.http_status, 403);

    let logs = call(
        &dispatcher,
        json!({"command": "getComputeStreamableLogs", "consumerAddress": "0xAlice", "jobId": job_id}),
    )
    .await;
    assert_eq!(logs.status.http_status, 404);
}

#[tokio::test]
async fn test_compute_result_carries_content_type() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());
    let started = call(&dispatcher, start_command("0xAlice")).await;
    let job_id = body_json(&started)[0]["jobId"].as_str().unwrap().to_string();

    drive(&node.engine, &node.jobs, &job_id, 50, |j| {
        j.status >= datanode::compute::ComputeJobStatus::ConfiguringVolumes
    })
    .await;

    let result = call(
        &dispatcher,
        json!({"command": "getComputeResult", "consumerAddress": "0xAlice", "jobId": job_id, "index": 0}),
    )
    .await;
    assert_eq!(result.status.http_status, 200);
    let headers = result.status.headers.unwrap();
    assert_eq!(headers["Content-Type"], "text/plain");
    assert!(String::from_utf8(result.body).unwrap().contains("python:3.11"));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (_node, dispatcher) = node(&dir, Config::default());

    let response = call(
        &dispatcher,
        json!({"command": "stopCompute", "consumerAddress": "0xAlice", "jobId": "missing"}),
    )
    .await;

    assert_eq!(response.status.http_status, 404);
}

// =============================================================================
// Outbound
// =============================================================================

#[tokio::test]
async fn test_send_to_self_dispatches_directly() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());

    let response = wire(dispatcher.send_to(LOCAL_PEER, json!({"command": "echo"})).await).await;

    assert_eq!(response.status.http_status, 200);
    assert_eq!(response.body, b"OK");
    assert!(node.resolution.transport.sent().is_empty());
}

#[tokio::test]
async fn test_send_to_remote_peer_uses_transport() {
    let dir = TempDir::new().unwrap();
    let (node, dispatcher) = node(&dir, Config::default());
    node.resolution.transport.serve("peerA", ddo("2024-01-01T00:00:00Z", 10));

    let found = wire(dispatcher.send_to("peerA", json!({"command": "getDDO", "id": DID})).await).await;
    assert_eq!(found.status.http_status, 200);
    assert_eq!(body_json(&found)["id"], DID);

    let missing = wire(dispatcher.send_to("peerB", json!({"command": "getDDO", "id": DID})).await).await;
    assert_eq!(missing.status.http_status, 404);
    assert_eq!(node.resolution.transport.sent(), vec!["peerA", "peerB"]);
}
