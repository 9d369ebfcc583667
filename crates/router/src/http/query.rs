use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::Instrument;
use trestle_contracts::canonical;
use trestle_contracts::QuerySpec;

use super::{extract_request_id, json_error, ApiError, AppState};
use crate::dispatch::{RouteError, UpstreamKind};

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    entity_name: String,
    row_count: usize,
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

pub async fn run_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<QuerySpec>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(spec) = req.map_err(|err| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_QUERY",
                format!("invalid JSON body: {}", err.body_text()),
                false,
            )
        })?;

        // Stable fingerprint of the query shape for log correlation; filter
        // values are part of the hash but never logged in the clear.
        let query_fingerprint = canonical::hash_canonical_json(&serde_json::to_value(&spec)
            .unwrap_or(serde_json::Value::Null));

        let span = tracing::info_span!(
            "query.dispatch",
            request_id = %request_id,
            entity_name = %spec.entity_name,
            query_fingerprint = %query_fingerprint,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let dispatched = state.dispatcher.dispatch(&spec).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);

            match dispatched {
                Ok(result) => {
                    tracing::Span::current().record("outcome", "ok");
                    Ok(Json(QueryResponse {
                        entity_name: spec.entity_name.clone(),
                        row_count: result.rows.len(),
                        rows: result.rows,
                    }))
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", "error");
                    Err(route_error_response(&err))
                }
            }
        }
        .instrument(span)
        .await
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request("/v1/query", "POST", status.as_u16(), started.elapsed());
    result
}

fn route_error_response(err: &RouteError) -> ApiError {
    match err {
        RouteError::UnknownEntity(name) => json_error(
            StatusCode::NOT_FOUND,
            "ERR_UNKNOWN_ENTITY",
            format!("no entity registered under name {}", name),
            false,
        ),
        RouteError::RegistryUnavailable(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_REGISTRY_UNAVAILABLE",
            "entity registry is unavailable",
            true,
        ),
        RouteError::Invalid(reason) => json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_QUERY",
            reason.to_string(),
            false,
        ),
        RouteError::UnsupportedSource(kind) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_UNSUPPORTED_SOURCE",
            format!("no adapter available for source kind {}", kind),
            false,
        ),
        RouteError::Broker(_) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_BROKER_UNAVAILABLE",
            "credential broker is unavailable",
            true,
        ),
        RouteError::Upstream {
            kind: UpstreamKind::Rejected,
            status,
        } => json_error(
            StatusCode::BAD_GATEWAY,
            "ERR_SOURCE_REJECTED",
            match status {
                Some(status) => format!("source rejected the query (status {})", status),
                None => "source rejected the query".to_string(),
            },
            false,
        ),
        RouteError::Upstream {
            kind: UpstreamKind::TimedOut,
            ..
        } => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_SOURCE_TIMEOUT",
            "source did not answer within the deadline",
            true,
        ),
        RouteError::Upstream {
            kind: UpstreamKind::Unavailable,
            status,
        } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_SOURCE_UNAVAILABLE",
            match status {
                Some(status) => format!("source is unavailable (status {})", status),
                None => "source is unavailable".to_string(),
            },
            true,
        ),
        RouteError::Internal(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "internal routing error",
            false,
        ),
    }
}
