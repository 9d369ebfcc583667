use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trestle_contracts::{Entity, Filter, RoutedResult, SourceConfig, SourceKind};

use crate::dispatch::{AdapterError, SourceAdapter};
use crate::validate::ValidatedQuery;

#[derive(Debug, Serialize)]
struct LegacyRequest<'a> {
    object: &'a str,
    columns: &'a [String],
    filters: &'a [Filter],
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Forwards validated queries to a legacy service endpoint. The legacy
/// protocol carries the structured query as-is; no statement text is built
/// and no broker credential is involved.
pub struct LegacyAdapter {
    http: reqwest::Client,
}

impl LegacyAdapter {
    pub fn new(call_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(call_timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SourceAdapter for LegacyAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Legacy
    }

    async fn execute(
        &self,
        entity: &Entity,
        query: &ValidatedQuery,
    ) -> Result<RoutedResult, AdapterError> {
        let SourceConfig::Legacy(details) = &entity.source else {
            return Err(AdapterError::Internal(format!(
                "legacy adapter dispatched for {} entity",
                entity.source.kind().as_str()
            )));
        };

        let request = LegacyRequest {
            object: &details.object_name,
            columns: &query.columns,
            filters: &query.filters,
            limit: query.limit,
        };

        let resp = self
            .http
            .post(&details.endpoint_url)
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
                "legacy endpoint refused the query"
            );
            return Err(AdapterError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = resp
            .json::<LegacyResponse>()
            .await
            .map_err(|_| AdapterError::InvalidResponse)?;

        Ok(RoutedResult { rows: body.rows })
    }
}
