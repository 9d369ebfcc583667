use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use trestle_broker::BrokerClient;
use trestle_contracts::{Entity, RoutedResult, SourceConfig, SourceKind};

use crate::compile::{compile, BoundParam};
use crate::dispatch::{AdapterError, SourceAdapter};
use crate::metrics;
use crate::validate::ValidatedQuery;

#[derive(Debug, Serialize)]
struct WarehouseRequest {
    statement: String,
    params: Vec<BoundParam>,
}

#[derive(Debug, Deserialize)]
struct WarehouseResponse {
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Executes compiled statements against a warehouse query endpoint. Each
/// call mints a fresh broker token scoped to the entity's endpoint and makes
/// exactly one execution attempt.
pub struct WarehouseAdapter {
    http: reqwest::Client,
    broker: BrokerClient,
}

impl WarehouseAdapter {
    pub fn new(call_timeout: Duration, broker: BrokerClient) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(call_timeout).build()?;
        Ok(Self { http, broker })
    }
}

#[async_trait]
impl SourceAdapter for WarehouseAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Warehouse
    }

    async fn execute(
        &self,
        entity: &Entity,
        query: &ValidatedQuery,
    ) -> Result<RoutedResult, AdapterError> {
        let SourceConfig::Warehouse(details) = &entity.source else {
            return Err(AdapterError::Internal(format!(
                "warehouse adapter dispatched for {} entity",
                entity.source.kind().as_str()
            )));
        };

        let compiled = {
            let _span = tracing::info_span!(
                "query.compile",
                entity_name = %entity.entity_name,
            )
            .entered();
            compile(query, details).map_err(|err| AdapterError::Internal(err.to_string()))?
        };

        let token_span = tracing::info_span!(
            "broker.token",
            audience = %details.endpoint_url,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let token = async {
            let started = Instant::now();
            let acquired = self.broker.token_for(&details.endpoint_url).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            match acquired {
                Ok(token) => {
                    tracing::Span::current().record("outcome", "ok");
                    metrics::observe_broker_token_request("ok");
                    Ok(token)
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", "error");
                    metrics::observe_broker_token_request("error");
                    Err(AdapterError::Broker(err))
                }
            }
        }
        .instrument(token_span)
        .await?;

        let request = WarehouseRequest {
            statement: compiled.statement,
            params: compiled.params,
        };

        let resp = self
            .http
            .post(&details.endpoint_url)
            .bearer_auth(&token.access_token)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AdapterError::Timeout
                } else {
                    AdapterError::Transport(err.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(
                entity_name = %entity.entity_name,
                status = status.as_u16(),
                "warehouse endpoint refused the statement"
            );
            return Err(AdapterError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = resp
            .json::<WarehouseResponse>()
            .await
            .map_err(|_| AdapterError::InvalidResponse)?;

        Ok(RoutedResult { rows: body.rows })
    }
}
