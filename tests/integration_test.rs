use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use evernode_enhanced::command::{CommandError, CommandOutput, CommandRunner};
use evernode_enhanced::discovery::{HostSource, PeerClient, PeersResponse};
use evernode_enhanced::hosts::{Host, HostOrigin, HostStatus, InstanceStats};
use evernode_enhanced::ledger::{RpcClient, RpcError};
use evernode_enhanced::rates::{Currency, PriceSource};
use evernode_enhanced::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

const LICENSE_ACCOUNT: &str = "rLicenseAccount1111111111111111111";
const BUYER: &str = "rBuyer22222222222222222222222222";
const TOKEN_ID: &str = "000800006203F49C21D5D6E022CB16DE3538F248662FC73C00000000000000AB";
const TX_GOOD: &str = "C0FFEE00C0FFEE00C0FFEE00C0FFEE00C0FFEE00C0FFEE00C0FFEE00C0FFEE00";
const TX_SMALL: &str = "5A115A115A115A115A115A115A115A115A115A115A115A115A115A115A115A11";
const TX_MISSING: &str = "0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD0BAD";

struct FixedPrices;

#[async_trait]
impl PriceSource for FixedPrices {
    async fn fetch_usd(
        &self,
        _currencies: &[Currency],
    ) -> Result<HashMap<Currency, f64>, Box<dyn std::error::Error + Send + Sync>> {
        Ok([(Currency::Evr, 0.25), (Currency::Xah, 0.05), (Currency::Xrp, 0.5)]
            .into_iter()
            .collect())
    }
}

struct DownPrices;

#[async_trait]
impl PriceSource for DownPrices {
    async fn fetch_usd(
        &self,
        _currencies: &[Currency],
    ) -> Result<HashMap<Currency, f64>, Box<dyn std::error::Error + Send + Sync>> {
        Err("coingecko unreachable".into())
    }
}

/// Ledger returning canned `tx` results
#[derive(Default)]
struct FakeLedger {
    txs: HashMap<String, Value>,
}

#[async_trait]
impl RpcClient for FakeLedger {
    async fn call(&self, _url: &str, _method: &str, params: Value) -> Result<Value, RpcError> {
        let hash = params["transaction"].as_str().unwrap_or_default();
        self.txs.get(hash).cloned().ok_or_else(|| RpcError::Remote {
            code: "txnNotFound".to_string(),
            message: "Transaction not found.".to_string(),
        })
    }
}

/// Command runner answering by program name and recording every call
#[derive(Clone, Default)]
struct FakeRunner {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().cloned());
        self.calls.lock().unwrap().push(argv);

        let stdout = match program {
            "sashi" => "[{\"name\":\"i1\"},{\"name\":\"i2\"}]".to_string(),
            "mint" => format!("minting...\n{}\n", TOKEN_ID),
            "extend" if args.iter().any(|a| a == "broken") => {
                return Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "lease not found".to_string(),
                })
            }
            "extend" => "ok".to_string(),
            _ => {
                return Err(CommandError::Spawn {
                    program: program.to_string(),
                    message: "not found".to_string(),
                })
            }
        };
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

struct NoPeers;

#[async_trait]
impl PeerClient for NoPeers {
    async fn peers(
        &self,
        _domain: &str,
    ) -> Result<PeersResponse, Box<dyn std::error::Error + Send + Sync>> {
        Err("connection refused".into())
    }
}

struct Registry(Vec<Host>);

#[async_trait]
impl HostSource for Registry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn fetch(&self) -> Result<Vec<Host>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.clone())
    }
}

fn registry_hosts() -> Vec<Host> {
    vec![
        Host {
            address: Some("rAlpha".into()),
            domain: Some("alpha.example.com".into()),
            status: HostStatus::Online,
            instances: Some(InstanceStats { total: 4, available: 2 }),
            reputation: Some(200),
            country_code: Some("DE".into()),
            ..Host::from_origin(HostOrigin::Registry)
        },
        Host {
            address: Some("rBeta".into()),
            domain: Some("beta.example.com".into()),
            status: HostStatus::Offline,
            instances: Some(InstanceStats { total: 4, available: 0 }),
            country_code: Some("US".into()),
            ..Host::from_origin(HostOrigin::Registry)
        },
    ]
}

fn native_payment(drops: &str) -> Value {
    json!({
        "TransactionType": "Payment",
        "Account": BUYER,
        "Destination": LICENSE_ACCOUNT,
        "Amount": drops,
        "validated": true,
        "meta": {"TransactionResult": "tesSUCCESS", "delivered_amount": drops}
    })
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.data_dir = dir.path().to_path_buf();
    config.identity.address = Some("rSelf".into());
    config.identity.domain = Some("self.example.com".into());
    config.identity.max_instances = Some(5);
    config.discovery.crawl_peers = false;
    config.discovery.announce_rate_limit = 2;
    config.rates.license_price_usd = 50.0;
    config.ledger.payment_address = Some(LICENSE_ACCOUNT.into());
    config.license.mint_command = vec!["mint".into(), "{owner}".into(), "{uri}".into()];
    config.cluster.extend_command = vec![
        "extend".into(),
        "{host}".into(),
        "{instance}".into(),
        "{moments}".into(),
    ];
    config
}

struct TestApp {
    router: Router,
    state: AppState,
    runner: FakeRunner,
    _dir: TempDir,
}

fn build_app(prices: Box<dyn PriceSource>, ledger: FakeLedger, tweak: impl FnOnce(&mut Config)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);

    let runner = FakeRunner::default();
    let backends = Backends {
        prices,
        rpc: Box::new(ledger),
        runner: Arc::new(runner.clone()),
        peers: Box::new(NoPeers),
        sources: vec![Box::new(Registry(registry_hosts()))],
    };
    let state = AppState::new(config, backends);
    TestApp {
        router: create_router(state.clone()),
        state,
        runner,
        _dir: dir,
    }
}

fn default_app() -> TestApp {
    build_app(Box::new(FixedPrices), FakeLedger::default(), |_| {})
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    send(router, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    post_from(router, uri, body, "198.51.100.1").await
}

async fn post_from(router: &Router, uri: &str, body: Value, ip: &str) -> (StatusCode, Value) {
    let req = Request::post(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, req).await
}

#[tokio::test]
async fn test_health() {
    let app = default_app();
    let (status, body) = get(&app.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
    assert!(body["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_missing_and_unknown_action() {
    let app = default_app();

    let (status, body) = get(&app.router, "/api").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("missing action"));

    let (status, body) = get(&app.router, "/api?action=launch_rockets").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_post_only_action_rejects_get() {
    let app = default_app();
    let (status, body) = get(&app.router, "/api?action=create_sale").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("requires POST"));
}

#[tokio::test]
async fn test_info_reports_capacity() {
    let app = default_app();
    let (status, body) = get(&app.router, "/api?action=info").await;

    assert_eq!(status, StatusCode::OK);
    let info = &body["data"];
    assert_eq!(info["domain"], "self.example.com");
    assert_eq!(info["enhanced"], true);
    assert_eq!(info["status"], "online");
    assert_eq!(info["instances"]["total"], 5);
    assert_eq!(info["instances"]["available"], 3);
    assert!(info["api_version"].is_string());
}

#[tokio::test]
async fn test_hosts_listing_and_filters() {
    let app = default_app();

    let (status, body) = get(&app.router, "/api?action=hosts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 3);
    let hosts = body["data"]["hosts"].as_array().unwrap();
    // Best quality first; every host is scored
    let scores: Vec<u64> = hosts.iter().map(|h| h["quality"].as_u64().unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(hosts.last().unwrap()["address"], "rBeta");

    let (_, body) = get(&app.router, "/api?action=hosts&location=de").await;
    assert_eq!(body["data"]["count"], 1);
    assert_eq!(body["data"]["hosts"][0]["address"], "rAlpha");

    let (_, body) = get(&app.router, "/api?action=hosts&available_only=1").await;
    assert_eq!(body["data"]["count"], 2);

    let (_, body) = get(&app.router, "/api?action=hosts&enhanced_only=true").await;
    assert_eq!(body["data"]["count"], 1);
    assert_eq!(body["data"]["hosts"][0]["address"], "rSelf");

    let (_, body) = get(&app.router, "/api?action=hosts&limit=1").await;
    assert_eq!(body["data"]["hosts"].as_array().unwrap().len(), 1);

    let (status, _) = get(&app.router, "/api?action=hosts&limit=lots").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_host_lookup() {
    let app = default_app();

    let (status, body) = get(&app.router, "/api?action=host&domain=https://Beta.Example.com/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["address"], "rBeta");

    let (status, _) = get(&app.router, "/api?action=host&address=rNobody").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&app.router, "/api?action=host").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_announce_then_lookup_and_peers() {
    let app = default_app();

    let (status, body) = post(
        &app.router,
        "/api?action=announce",
        json!({"address": "rAlpha", "features": ["ssl", "monitoring"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enhanced"], true);
    assert_eq!(body["data"]["sources"], json!(["announcement"]));

    // Merged with the registry record of the same address
    let (_, body) = get(&app.router, "/api?action=host&address=rAlpha").await;
    let host = &body["data"];
    assert_eq!(host["enhanced"], true);
    assert_eq!(host["domain"], "alpha.example.com");
    assert_eq!(host["features"], json!(["monitoring", "ssl"]));

    let (status, body) = get(&app.router, "/api?action=peers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["node"]["address"], "rSelf");
    let peers: Vec<&str> = body["data"]["peers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["address"].as_str())
        .collect();
    assert!(peers.contains(&"rAlpha"));
    assert!(!peers.contains(&"rBeta"));
}

#[tokio::test]
async fn test_announce_rate_limited_per_client() {
    let app = default_app();
    let announce = json!({"domain": "peer.example.com"});

    for _ in 0..2 {
        let (status, _) = post_from(&app.router, "/api?action=announce", announce.clone(), "203.0.113.5").await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = post_from(&app.router, "/api?action=announce", announce.clone(), "203.0.113.5").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);

    // Another client still gets through
    let (status, _) = post_from(&app.router, "/api?action=announce", announce, "203.0.113.6").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_announce_requires_identity() {
    let app = default_app();
    let (status, _) = post(&app.router, "/api?action=announce", json!({"features": ["ssl"]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_refresh_reports_counts() {
    let app = default_app();
    let (status, body) = post(&app.router, "/api?action=refresh", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["hosts"], 3);
    assert_eq!(body["data"]["enhanced"], 1);
    assert_eq!(body["data"]["stale"], false);
}

#[tokio::test]
async fn test_rates_from_source() {
    let app = default_app();
    let (status, body) = get(&app.router, "/api?action=rates").await;

    assert_eq!(status, StatusCode::OK);
    let evr = &body["data"]["rates"]["EVR"];
    assert_eq!(evr["rate"], 0.25);
    assert_eq!(evr["amount_for_license"], 200.0);
    assert_eq!(evr["display"], "200.00 EVR");
    assert_eq!(evr["source"], "coingecko");
    assert_eq!(body["data"]["license_price_usd"], 50.0);
}

#[tokio::test]
async fn test_rates_fall_back_when_source_down() {
    let app = build_app(Box::new(DownPrices), FakeLedger::default(), |_| {});
    let (status, body) = get(&app.router, "/api?action=rates&refresh=1").await;

    assert_eq!(status, StatusCode::OK);
    let rates = body["data"]["rates"].as_object().unwrap();
    assert_eq!(rates.len(), 3);
    assert!(rates.values().all(|r| r["source"] == "fallback"));
    assert_eq!(rates["XRP"]["rate"], 0.55);
}

#[tokio::test]
async fn test_quote() {
    let app = default_app();

    let (status, body) = get(&app.router, "/api?action=quote&currency=xrp&usd=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["currency"], "XRP");
    assert_eq!(body["data"]["amount"], 20.0);

    // Defaults to the license price
    let (_, body) = get(&app.router, "/api?action=quote&currency=EVR").await;
    assert_eq!(body["data"]["amount"], 200.0);

    let (status, _) = get(&app.router, "/api?action=quote&currency=BTC").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app.router, "/api?action=quote&currency=EVR&usd=-5").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sale_payment_and_license_flow() {
    let ledger = FakeLedger {
        txs: [(TX_GOOD.to_string(), native_payment("100000000"))]
            .into_iter()
            .collect(),
    };
    let app = build_app(Box::new(FixedPrices), ledger, |_| {});

    let (status, body) = post(
        &app.router,
        "/api?action=create_sale",
        json!({"buyer": BUYER, "currency": "XRP", "referrer": "rAlpha"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sale = &body["data"];
    let sale_id = sale["id"].as_str().unwrap().to_string();
    assert!(sale_id.starts_with("sale_"));
    assert_eq!(sale["status"], "pending");
    assert_eq!(sale["amount"], 100.0);
    assert_eq!(sale["commission"], 20.0);

    // Minting before payment is refused
    let (status, _) = post(&app.router, "/api?action=issue_license", json!({"sale_id": sale_id})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": sale_id, "tx_hash": TX_GOOD}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "paid");
    assert_eq!(body["data"]["tx_hash"], TX_GOOD);

    let (status, body) = post(&app.router, "/api?action=issue_license", json!({"sale_id": sale_id})).await;
    assert_eq!(status, StatusCode::OK);
    let license = body["data"].clone();
    assert_eq!(license["owner"], BUYER);
    assert_eq!(license["nft_token_id"], TOKEN_ID);
    let license_id = license["license_id"].as_str().unwrap().to_string();

    // Second issue returns the same license without minting again
    let (_, body) = post(&app.router, "/api?action=issue_license", json!({"sale_id": sale_id})).await;
    assert_eq!(body["data"]["license_id"], license_id.as_str());
    let mints = app
        .runner
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c[0] == "mint")
        .count();
    assert_eq!(mints, 1);

    let (_, body) = get(&app.router, &format!("/api?action=sale&id={}", sale_id)).await;
    assert_eq!(body["data"]["status"], "licensed");
    assert_eq!(body["data"]["license_id"], license_id.as_str());

    let (status, body) = get(&app.router, &format!("/api?action=license&id={}", license_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sale_id"], sale_id.as_str());

    let (_, body) = get(&app.router, "/api?action=commissions").await;
    let report = &body["data"];
    assert_eq!(report["total_sales"], 1);
    assert_eq!(report["total_paid"], 1);
    assert_eq!(report["referrers"]["rAlpha"]["paid"], 1);
}

#[tokio::test]
async fn test_confirm_payment_errors() {
    let ledger = FakeLedger {
        txs: [(TX_SMALL.to_string(), native_payment("1000000"))]
            .into_iter()
            .collect(),
    };
    let app = build_app(Box::new(FixedPrices), ledger, |_| {});

    let (_, body) = post(
        &app.router,
        "/api?action=create_sale",
        json!({"buyer": BUYER, "currency": "XRP"}),
    )
    .await;
    let sale_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["commission"], 0.0);

    let (status, body) = post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": sale_id, "tx_hash": TX_SMALL}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("too small"));

    let (status, _) = post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": sale_id, "tx_hash": TX_MISSING}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&app.router, "/api?action=sale&id=sale_nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(&app.router, "/api?action=create_sale", json!({"buyer": "rX"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payment_cannot_be_replayed_in_lowercase() {
    let ledger = FakeLedger {
        txs: [(TX_GOOD.to_string(), native_payment("100000000"))]
            .into_iter()
            .collect(),
    };
    let app = build_app(Box::new(FixedPrices), ledger, |_| {});

    let mut ids = Vec::new();
    for _ in 0..2 {
        let (_, body) = post(
            &app.router,
            "/api?action=create_sale",
            json!({"buyer": BUYER, "currency": "XRP"}),
        )
        .await;
        ids.push(body["data"]["id"].as_str().unwrap().to_string());
    }

    let (status, _) = post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": ids[0], "tx_hash": TX_GOOD}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": ids[1], "tx_hash": TX_GOOD.to_lowercase()}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already used"));

    let (status, _) = post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": ids[1], "tx_hash": "not-a-hash"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = get(&app.router, &format!("/api?action=sale&id={}", ids[1])).await;
    assert_eq!(body["data"]["status"], "pending");
}

#[tokio::test]
async fn test_minting_disabled_is_unavailable() {
    let ledger = FakeLedger {
        txs: [(TX_GOOD.to_string(), native_payment("100000000"))]
            .into_iter()
            .collect(),
    };
    let app = build_app(Box::new(FixedPrices), ledger, |c| c.license.mint_command.clear());

    let (_, body) = post(
        &app.router,
        "/api?action=create_sale",
        json!({"buyer": BUYER, "currency": "XRP"}),
    )
    .await;
    let sale_id = body["data"]["id"].as_str().unwrap().to_string();
    post(
        &app.router,
        "/api?action=confirm_payment",
        json!({"sale_id": sale_id, "tx_hash": TX_GOOD}),
    )
    .await;

    let (status, _) = post(&app.router, "/api?action=issue_license", json!({"sale_id": sale_id})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_cluster_plan_and_extend() {
    let app = default_app();
    let request = json!({
        "instances": [
            {"name": "i1", "host": "rAlpha", "lease_amount": 0.5, "expires_at": 1_000_000},
            {"name": "broken", "host": "rAlpha", "lease_amount": 0.5, "expires_at": 1_001_800}
        ],
        "target": {"extend_hours": 2}
    });

    let (status, body) = post(&app.router, "/api?action=cluster_plan", request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let plan = &body["data"];
    assert_eq!(plan["total_moments"], 4);
    assert_eq!(plan["total_evr"], 2.0);
    assert_eq!(plan["total_usd"], 0.5);

    let (status, body) = post(&app.router, "/api?action=cluster_extend", request).await;
    assert_eq!(status, StatusCode::OK);
    let results = body["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[1]["success"], false);
    assert_eq!(body["data"]["failed"], 1);

    let extends: Vec<Vec<String>> = app
        .runner
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c[0] == "extend")
        .cloned()
        .collect();
    assert_eq!(extends[0], vec!["extend", "rAlpha", "i1", "2"]);

    let (status, _) = post(
        &app.router,
        "/api?action=cluster_plan",
        json!({"instances": [], "target": {"align_hours": 1}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cluster_plan_rejects_oversized_extension() {
    let app = default_app();
    let (status, body) = post(
        &app.router,
        "/api?action=cluster_plan",
        json!({
            "instances": [{"name": "i1", "host": "rAlpha", "lease_amount": 0.5, "expires_at": 1_000_000}],
            "target": {"extend_hours": u64::MAX / 1000}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("out of range"));
}

#[tokio::test]
async fn test_cluster_extend_unconfigured() {
    let app = build_app(Box::new(FixedPrices), FakeLedger::default(), |c| {
        c.cluster.extend_command.clear()
    });
    let (status, _) = post(
        &app.router,
        "/api?action=cluster_extend",
        json!({"instances": [], "target": {"extend_hours": 1}}),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_without_prometheus() {
    let app = default_app();
    let (status, body) = get(&app.router, "/api?action=metrics").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_hosts_cache_written_to_data_dir() {
    let app = default_app();
    get(&app.router, "/api?action=hosts").await;
    assert!(app._dir.path().join("discovered-hosts.json").exists());
}

#[tokio::test]
async fn test_server_adds_cors_and_resolves_address() {
    let app = default_app();
    let (router, addr) = api::create_server(app.state.clone()).unwrap();
    assert_eq!(addr.port(), 8080);
    assert!(addr.ip().is_unspecified());

    let req = Request::get("/health")
        .header("origin", "https://dashboard.example.com")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn test_request_metrics_reported_by_health() {
    let app = default_app();
    get(&app.router, "/api?action=info").await;
    get(&app.router, "/api?action=nope").await;

    let metrics = app.state.metrics.lock().await.clone();
    assert_eq!(metrics.requests_total, 2);
    assert_eq!(metrics.requests_failed, 1);
    assert_eq!(metrics.actions["info"], 1);
    assert_eq!(metrics.actions["unknown"], 1);

    let (_, body) = get(&app.router, "/health").await;
    assert_eq!(body["data"]["requests_total"], 2);
    assert_eq!(body["data"]["success_rate"], 50.0);
}
