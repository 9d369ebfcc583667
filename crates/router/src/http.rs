use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use trestle_broker::{BrokerClient, BrokerClientConfig};
use trestle_registry::{EntityRegistry, MemoryRegistry, PgRegistry, RegistryError};
use ulid::Ulid;

use crate::adapters::{LegacyAdapter, WarehouseAdapter};
use crate::config::{RegistryMode, RouterConfig, StartupError};
use crate::dispatch::Dispatcher;
use crate::validate::QueryLimits;

mod entities;
mod query;

#[derive(Clone)]
pub struct AppState {
    pub config: RouterConfig,
    registry: Arc<dyn EntityRegistry>,
    dispatcher: Arc<Dispatcher>,
    broker: BrokerClient,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: RouterConfig) -> Result<Router, StartupError> {
    let registry: Arc<dyn EntityRegistry> = match config.registry_mode {
        RegistryMode::Postgres => {
            let db_url = config.db_url.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "postgres registry mode requires TRESTLE_DB_URL".to_string(),
            })?;
            let registry = PgRegistry::connect_and_migrate(
                &db_url,
                Duration::from_millis(config.registry_op_timeout_ms),
            )
            .await
            .map_err(|err| StartupError {
                code: "ERR_REGISTRY_UNAVAILABLE",
                message: format!("failed to initialize entity registry: {}", err),
            })?;
            Arc::new(registry)
        }
        RegistryMode::Memory => Arc::new(MemoryRegistry::new()),
    };

    let broker = BrokerClient::new(BrokerClientConfig {
        base_url: config.broker_url.clone(),
        timeout: Duration::from_millis(config.broker_timeout_ms),
        retry_max_attempts: config.broker_retry_max_attempts,
        retry_base_backoff: Duration::from_millis(config.broker_retry_base_backoff_ms),
    })
    .map_err(|_| StartupError {
        code: "ERR_BROKER_UNAVAILABLE",
        message: "failed to initialize credential broker client".to_string(),
    })?;

    let warehouse = WarehouseAdapter::new(
        Duration::from_millis(config.warehouse_call_timeout_ms),
        broker.clone(),
    )
    .map_err(|_| StartupError {
        code: "ERR_ADAPTER_INIT",
        message: "failed to initialize warehouse adapter".to_string(),
    })?;

    let legacy = LegacyAdapter::new(Duration::from_millis(config.legacy_call_timeout_ms))
        .map_err(|_| StartupError {
            code: "ERR_ADAPTER_INIT",
            message: "failed to initialize legacy adapter".to_string(),
        })?;

    let limits = QueryLimits {
        max_columns: config.max_columns,
        max_filters: config.max_filters,
        max_in_values: config.max_in_values,
        max_limit: config.max_limit,
        default_limit: config.default_limit,
    };

    let mut dispatcher = Dispatcher::new(
        registry.clone(),
        limits,
        Duration::from_millis(config.request_deadline_ms),
    );
    dispatcher.register_adapter(Arc::new(warehouse));
    dispatcher.register_adapter(Arc::new(legacy));

    let state = AppState {
        config,
        registry,
        dispatcher: Arc::new(dispatcher),
        broker,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            "/v1/entities",
            get(entities::list_entities).post(entities::create_entity),
        )
        .route(
            "/v1/entities/{entity_name}",
            get(entities::get_entity)
                .put(entities::put_entity)
                .delete(entities::delete_entity),
        )
        .route("/v1/query", axum::routing::post(query::run_query))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let registry_ready = state.registry.ping().await.is_ok();
    checks.insert("registry", registry_ready);

    let broker_ready = state.broker.ready().await.is_ok();
    checks.insert("broker", broker_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
            detail: None,
        }),
    )
}

fn registry_error_response(err: &RegistryError) -> ApiError {
    match err {
        RegistryError::NotFound => json_error(
            StatusCode::NOT_FOUND,
            "ERR_UNKNOWN_ENTITY",
            "no entity registered under that name",
            false,
        ),
        RegistryError::Conflict => json_error(
            StatusCode::CONFLICT,
            "ERR_ENTITY_EXISTS",
            "an entity with that name already exists",
            false,
        ),
        RegistryError::UnsupportedKind(kind) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_UNSUPPORTED_SOURCE",
            format!("entity is registered with unsupported source kind {}", kind),
            false,
        ),
        RegistryError::Timeout | RegistryError::Unavailable(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_REGISTRY_UNAVAILABLE",
            "entity registry is unavailable",
            true,
        ),
    }
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trestle-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}
