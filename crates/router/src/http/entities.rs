use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::Instrument;
use trestle_contracts::{Entity, NewEntity};

use super::{extract_request_id, json_error, registry_error_response, ApiError, AppState};

#[derive(Debug, serde::Serialize)]
pub struct ListEntitiesResponse {
    entities: Vec<Entity>,
}

pub async fn list_entities(
    State(state): State<AppState>,
) -> Result<Json<ListEntitiesResponse>, ApiError> {
    let started = Instant::now();
    let result = state
        .registry
        .list()
        .await
        .map(|entities| Json(ListEntitiesResponse { entities }))
        .map_err(|err| registry_error_response(&err));

    observe("/v1/entities", "GET", &result, started);
    result
}

pub async fn get_entity(
    State(state): State<AppState>,
    Path(entity_name): Path<String>,
) -> Result<Json<Entity>, ApiError> {
    let started = Instant::now();
    let result = state
        .registry
        .resolve(&entity_name)
        .await
        .map(Json)
        .map_err(|err| registry_error_response(&err));

    observe("/v1/entities/{entity_name}", "GET", &result, started);
    result
}

pub async fn create_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<NewEntity>, JsonRejection>,
) -> Result<(StatusCode, Json<Entity>), ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let entity = parse_entity_body(req)?;

        let span = tracing::info_span!(
            "registry.insert",
            request_id = %request_id,
            entity_name = %entity.entity_name,
        );
        let created = async { state.registry.insert(&entity).await }
            .instrument(span)
            .await
            .map_err(|err| registry_error_response(&err))?;

        Ok((StatusCode::CREATED, Json(created)))
    }
    .await;

    observe("/v1/entities", "POST", &result, started);
    result
}

pub async fn put_entity(
    State(state): State<AppState>,
    Path(entity_name): Path<String>,
    headers: HeaderMap,
    req: Result<Json<NewEntity>, JsonRejection>,
) -> Result<Json<Entity>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let entity = parse_entity_body(req)?;

        if entity.entity_name != entity_name {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_ENTITY",
                "entity_name in body must match the path",
                false,
            ));
        }

        let span = tracing::info_span!(
            "registry.upsert",
            request_id = %request_id,
            entity_name = %entity.entity_name,
        );
        let stored = async { state.registry.upsert(&entity).await }
            .instrument(span)
            .await
            .map_err(|err| registry_error_response(&err))?;

        Ok(Json(stored))
    }
    .await;

    observe("/v1/entities/{entity_name}", "PUT", &result, started);
    result
}

pub async fn delete_entity(
    State(state): State<AppState>,
    Path(entity_name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "registry.delete",
        request_id = %request_id,
        entity_name = %entity_name,
    );
    let result = async { state.registry.delete(&entity_name).await }
        .instrument(span)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| registry_error_response(&err));

    observe("/v1/entities/{entity_name}", "DELETE", &result, started);
    result
}

fn parse_entity_body(req: Result<Json<NewEntity>, JsonRejection>) -> Result<NewEntity, ApiError> {
    let Json(entity) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_ENTITY",
            "invalid JSON body",
            false,
        )
    })?;

    entity.validate().map_err(|reason| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_ENTITY",
            format!("invalid entity: {}", reason),
            false,
        )
    })?;

    Ok(entity)
}

fn observe<T>(route: &str, method: &str, result: &Result<T, ApiError>, started: Instant) {
    let status = match result {
        Ok(_) => default_success_status(method),
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}

fn default_success_status(method: &str) -> StatusCode {
    match method {
        "POST" => StatusCode::CREATED,
        "DELETE" => StatusCode::NO_CONTENT,
        _ => StatusCode::OK,
    }
}
