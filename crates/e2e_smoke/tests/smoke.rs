use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
struct MockBackend {
    calls: Arc<AtomicUsize>,
    last_auth: Arc<Mutex<Option<String>>>,
    last_body: Arc<Mutex<Option<serde_json::Value>>>,
    delay: Option<Duration>,
}

impl MockBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_auth(&self) -> Option<String> {
        self.last_auth.lock().expect("auth lock").clone()
    }

    fn last_body(&self) -> Option<serde_json::Value> {
        self.last_body.lock().expect("body lock").clone()
    }
}

async fn backend_handler(
    State(mock): State<MockBackend>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    *mock.last_auth.lock().expect("auth lock") = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    *mock.last_body.lock().expect("body lock") = Some(body);

    if let Some(delay) = mock.delay {
        tokio::time::sleep(delay).await;
    }

    Json(serde_json::json!({
        "rows": [{"amount": 42, "region": "emea"}]
    }))
}

#[derive(Clone)]
struct MockBroker {
    calls: Arc<AtomicUsize>,
    fail_all: bool,
}

async fn broker_token(
    State(mock): State<MockBroker>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    if mock.fail_all {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "broker outage"})),
        );
    }

    let audience = body
        .get("audience")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "access_token": format!("tok-for-{}", audience),
            "expires_in_secs": 300,
        })),
    )
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn spawn_backend(delay: Option<Duration>) -> (MockBackend, SocketAddr, oneshot::Sender<()>) {
    let mock = MockBackend {
        delay,
        ..MockBackend::default()
    };
    let app = Router::new()
        .route("/query", post(backend_handler))
        .with_state(mock.clone());
    let (addr, shutdown, _handle) = spawn_server(app).await;
    (mock, addr, shutdown)
}

async fn spawn_broker(fail_all: bool) -> (Arc<AtomicUsize>, SocketAddr, oneshot::Sender<()>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mock = MockBroker {
        calls: calls.clone(),
        fail_all,
    };
    let app = Router::new()
        .route("/v1/token", post(broker_token))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(mock);
    let (addr, shutdown, _handle) = spawn_server(app).await;
    (calls, addr, shutdown)
}

async fn spawn_router(
    broker_addr: SocketAddr,
    overrides: &[(&str, String)],
) -> (SocketAddr, oneshot::Sender<()>) {
    let mut kv = HashMap::from([
        ("TRESTLE_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
        ("TRESTLE_REGISTRY_MODE".to_string(), "memory".to_string()),
        (
            "TRESTLE_BROKER_URL".to_string(),
            format!("http://{}", broker_addr),
        ),
        ("TRESTLE_BROKER_TIMEOUT_MS".to_string(), "500".to_string()),
        (
            "TRESTLE_BROKER_RETRY_BASE_BACKOFF_MS".to_string(),
            "1".to_string(),
        ),
    ]);
    for (key, value) in overrides {
        kv.insert(key.to_string(), value.clone());
    }

    let config =
        trestle_router::config::RouterConfig::from_kv(&kv).expect("router config should be valid");
    let app = trestle_router::http::router(config)
        .await
        .expect("router should init");
    let (addr, shutdown, _handle) = spawn_server(app).await;
    (addr, shutdown)
}

fn warehouse_entity(name: &str, endpoint: &str) -> serde_json::Value {
    serde_json::json!({
        "entity_name": name,
        "display_name": "Sales",
        "source_kind": "warehouse",
        "source_details": {
            "endpoint_url": endpoint,
            "catalog": "acme",
            "dataset": "core",
            "table": "sales",
            "columns": ["amount", "region", "sold_at"]
        }
    })
}

fn legacy_entity(name: &str, endpoint: &str) -> serde_json::Value {
    serde_json::json!({
        "entity_name": name,
        "display_name": "Tickets",
        "source_kind": "legacy",
        "source_details": {
            "endpoint_url": endpoint,
            "object_name": "tickets",
            "columns": ["ticket_id", "status"]
        }
    })
}

async fn register_entity(
    client: &reqwest::Client,
    router_addr: SocketAddr,
    entity: &serde_json::Value,
) {
    let resp = client
        .post(format!("http://{}/v1/entities", router_addr))
        .json(entity)
        .send()
        .await
        .expect("entity registration should reach the router");
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_warehouse_query_round_trip() {
    let (warehouse, wh_addr, _wh_shutdown) = spawn_backend(None).await;
    let (broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/query", wh_addr);
    register_entity(&client, router_addr, &warehouse_entity("sales", &endpoint)).await;

    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "sales",
            "columns": ["amount", "region"],
            "filters": [
                {"column": "region", "operator": "=", "value": "emea"},
                {"column": "amount", "operator": "IN", "value": [10, 42]}
            ],
            "limit": 50
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await.expect("response should be JSON");
    assert_eq!(body["entity_name"], "sales");
    assert_eq!(body["row_count"], 1);
    assert_eq!(body["rows"][0]["amount"], 42);

    assert_eq!(warehouse.calls(), 1);
    assert_eq!(broker_calls.load(Ordering::SeqCst), 1);

    // The token is audience-scoped to the entity's endpoint and attached as
    // a bearer credential.
    assert_eq!(
        warehouse.last_auth().as_deref(),
        Some(format!("Bearer tok-for-{}", endpoint).as_str())
    );

    // Filter values travel only as bound parameters; the statement text
    // carries placeholders and allow-listed identifiers.
    let sent = warehouse.last_body().expect("warehouse saw a request");
    let statement = sent["statement"].as_str().expect("statement is a string");
    assert!(statement.contains("SELECT `amount`, `region` FROM `acme`.`core`.`sales`"));
    assert!(statement.contains("`region` = @p0"));
    assert!(statement.contains("`amount` IN (@p1_0, @p1_1)"));
    assert!(statement.ends_with("LIMIT 50"));
    assert!(!statement.contains("emea"));
    assert_eq!(sent["params"][0]["value"], "emea");
    assert_eq!(sent["params"][1]["value"], 10);
    assert_eq!(sent["params"][2]["value"], 42);

    // A second query mints a fresh token; nothing is cached.
    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "sales",
            "columns": ["amount"]
        }))
        .send()
        .await
        .expect("second query should reach the router");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(broker_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_validation_failure_never_reaches_backends() {
    let (warehouse, wh_addr, _wh_shutdown) = spawn_backend(None).await;
    let (broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/query", wh_addr);
    register_entity(&client, router_addr, &warehouse_entity("sales", &endpoint)).await;

    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "sales",
            "columns": ["amount", "ssn"]
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = resp.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_INVALID_QUERY");
    assert_eq!(body["retryable"], false);

    assert_eq!(warehouse.calls(), 0, "rejected query must not reach the source");
    assert_eq!(
        broker_calls.load(Ordering::SeqCst),
        0,
        "rejected query must not mint a token"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_unknown_entity_skips_broker() {
    let (broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "payroll",
            "columns": ["amount"]
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body: serde_json::Value = resp.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_UNKNOWN_ENTITY");
    assert_eq!(broker_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_legacy_query_passes_structured_body_without_credentials() {
    let (legacy, legacy_addr, _legacy_shutdown) = spawn_backend(None).await;
    let (broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/query", legacy_addr);
    register_entity(&client, router_addr, &legacy_entity("tickets", &endpoint)).await;

    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "tickets",
            "columns": ["ticket_id", "status"],
            "filters": [{"column": "status", "operator": "=", "value": "open"}],
            "limit": 10
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(legacy.calls(), 1);
    assert_eq!(broker_calls.load(Ordering::SeqCst), 0, "legacy calls need no token");
    assert_eq!(legacy.last_auth(), None);

    let sent = legacy.last_body().expect("legacy saw a request");
    assert_eq!(sent["object"], "tickets");
    assert_eq!(sent["columns"], serde_json::json!(["status", "ticket_id"]));
    assert_eq!(sent["filters"][0]["value"], "open");
    assert_eq!(sent["limit"], 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_slow_warehouse_times_out_with_single_attempt() {
    let (warehouse, wh_addr, _wh_shutdown) = spawn_backend(Some(Duration::from_secs(2))).await;
    let (_broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(
        broker_addr,
        &[("TRESTLE_REQUEST_DEADLINE_MS", "150".to_string())],
    )
    .await;

    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/query", wh_addr);
    register_entity(&client, router_addr, &warehouse_entity("sales", &endpoint)).await;

    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "sales",
            "columns": ["amount"]
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

    let body: serde_json::Value = resp.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_SOURCE_TIMEOUT");
    assert_eq!(body["retryable"], true);

    assert_eq!(warehouse.calls(), 1, "the source call is attempted exactly once");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_unreachable_warehouse_maps_to_source_unavailable() {
    let (_broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    // Bind and immediately drop a listener so the port is closed.
    let closed_addr = {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        listener.local_addr().expect("local_addr should succeed")
    };

    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/query", closed_addr);
    register_entity(&client, router_addr, &warehouse_entity("sales", &endpoint)).await;

    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "sales",
            "columns": ["amount"]
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(
        resp.status(),
        StatusCode::SERVICE_UNAVAILABLE,
        "a refused connection is not a deadline expiry"
    );

    let body: serde_json::Value = resp.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_SOURCE_UNAVAILABLE");
    assert_eq!(body["retryable"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_broker_outage_maps_to_broker_unavailable() {
    let (warehouse, wh_addr, _wh_shutdown) = spawn_backend(None).await;
    let (broker_calls, broker_addr, _broker_shutdown) = spawn_broker(true).await;
    let (router_addr, _router_shutdown) = spawn_router(
        broker_addr,
        &[("TRESTLE_BROKER_RETRY_MAX_ATTEMPTS", "1".to_string())],
    )
    .await;

    let client = reqwest::Client::new();
    let endpoint = format!("http://{}/query", wh_addr);
    register_entity(&client, router_addr, &warehouse_entity("sales", &endpoint)).await;

    let resp = client
        .post(format!("http://{}/v1/query", router_addr))
        .json(&serde_json::json!({
            "entity_name": "sales",
            "columns": ["amount"]
        }))
        .send()
        .await
        .expect("query should reach the router");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: serde_json::Value = resp.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_BROKER_UNAVAILABLE");
    assert_eq!(body["retryable"], true);

    assert_eq!(broker_calls.load(Ordering::SeqCst), 2, "initial attempt plus one retry");
    assert_eq!(warehouse.calls(), 0, "no token means no source call");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_entity_crud_over_http() {
    let (_broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    let client = reqwest::Client::new();
    let entity = warehouse_entity("sales", "http://warehouse.internal/query");

    let resp = client
        .post(format!("http://{}/v1/entities", router_addr))
        .json(&entity)
        .send()
        .await
        .expect("create should reach the router");
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: serde_json::Value = resp.json().await.expect("created entity JSON");
    let id = created["id"].as_str().expect("minted id").to_string();

    let resp = client
        .post(format!("http://{}/v1/entities", router_addr))
        .json(&entity)
        .send()
        .await
        .expect("duplicate create should reach the router");
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = resp.json().await.expect("conflict body JSON");
    assert_eq!(body["code"], "ERR_ENTITY_EXISTS");

    let resp = client
        .get(format!("http://{}/v1/entities/sales", router_addr))
        .send()
        .await
        .expect("get should reach the router");
    assert_eq!(resp.status(), StatusCode::OK);

    // Replacing the definition keeps the minted id stable.
    let mut replacement = warehouse_entity("sales", "http://warehouse.internal/query");
    replacement["source_details"]["columns"] = serde_json::json!(["amount"]);
    let resp = client
        .put(format!("http://{}/v1/entities/sales", router_addr))
        .json(&replacement)
        .send()
        .await
        .expect("put should reach the router");
    assert_eq!(resp.status(), StatusCode::OK);
    let replaced: serde_json::Value = resp.json().await.expect("replaced entity JSON");
    assert_eq!(replaced["id"], id.as_str());

    let resp = client
        .put(format!("http://{}/v1/entities/renamed", router_addr))
        .json(&replacement)
        .send()
        .await
        .expect("mismatched put should reach the router");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.expect("mismatch body JSON");
    assert_eq!(body["code"], "ERR_INVALID_ENTITY");

    let resp = client
        .get(format!("http://{}/v1/entities", router_addr))
        .send()
        .await
        .expect("list should reach the router");
    assert_eq!(resp.status(), StatusCode::OK);
    let listed: serde_json::Value = resp.json().await.expect("entity list JSON");
    assert_eq!(listed["entities"].as_array().map(|v| v.len()), Some(1));

    let resp = client
        .delete(format!("http://{}/v1/entities/sales", router_addr))
        .send()
        .await
        .expect("delete should reach the router");
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client
        .get(format!("http://{}/v1/entities/sales", router_addr))
        .send()
        .await
        .expect("get after delete should reach the router");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json().await.expect("not-found body JSON");
    assert_eq!(body["code"], "ERR_UNKNOWN_ENTITY");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_hostile_entity_definition_is_rejected() {
    let (_broker_calls, broker_addr, _broker_shutdown) = spawn_broker(false).await;
    let (router_addr, _router_shutdown) = spawn_router(broker_addr, &[]).await;

    let client = reqwest::Client::new();
    let mut entity = warehouse_entity("sales", "http://warehouse.internal/query");
    entity["source_details"]["table"] =
        serde_json::json!("sales`; DROP TABLE users; --");

    let resp = client
        .post(format!("http://{}/v1/entities", router_addr))
        .json(&entity)
        .send()
        .await
        .expect("create should reach the router");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.expect("error body JSON");
    assert_eq!(body["code"], "ERR_INVALID_ENTITY");
}
