use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;
use trestle_broker::BrokerError;
use trestle_contracts::{Entity, QuerySpec, RoutedResult, SourceKind};
use trestle_registry::{EntityRegistry, RegistryError};

use crate::metrics;
use crate::validate::{self, QueryLimits, ValidatedQuery, ValidationError};

/// Terminal routing failure, mapped to the HTTP error taxonomy in one place.
#[derive(Debug)]
pub enum RouteError {
    UnknownEntity(String),
    RegistryUnavailable(RegistryError),
    Invalid(ValidationError),
    UnsupportedSource(String),
    Broker(BrokerError),
    Upstream {
        kind: UpstreamKind,
        status: Option<u16>,
    },
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// The deadline or the per-call timeout expired.
    TimedOut,
    /// Transport failure, 5xx, or an unparseable response body.
    Unavailable,
    /// The source understood the call and refused it (4xx).
    Rejected,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::UnknownEntity(name) => write!(f, "unknown entity {}", name),
            RouteError::RegistryUnavailable(err) => write!(f, "registry unavailable: {}", err),
            RouteError::Invalid(err) => write!(f, "invalid query: {}", err),
            RouteError::UnsupportedSource(kind) => {
                write!(f, "no adapter for source kind {}", kind)
            }
            RouteError::Broker(err) => write!(f, "credential broker failure: {}", err),
            RouteError::Upstream { kind, status } => match (kind, status) {
                (UpstreamKind::TimedOut, _) => write!(f, "source call timed out"),
                (UpstreamKind::Rejected, Some(status)) => {
                    write!(f, "source rejected the query with status {}", status)
                }
                (UpstreamKind::Rejected, None) => write!(f, "source rejected the query"),
                (UpstreamKind::Unavailable, Some(status)) => {
                    write!(f, "source unavailable (status {})", status)
                }
                (UpstreamKind::Unavailable, None) => write!(f, "source unavailable"),
            },
            RouteError::Internal(msg) => write!(f, "internal routing error: {}", msg),
        }
    }
}

impl std::error::Error for RouteError {}

/// Failure surfaced by one adapter attempt. Adapters never retry; retry
/// policy for token acquisition lives in the broker client and nothing
/// retries the backend call itself.
#[derive(Debug)]
pub enum AdapterError {
    Broker(BrokerError),
    Timeout,
    Transport(String),
    Rejected { status: u16 },
    InvalidResponse,
    Internal(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Broker(err) => write!(f, "token acquisition failed: {}", err),
            AdapterError::Timeout => write!(f, "source call timed out"),
            AdapterError::Transport(detail) => write!(f, "source transport error: {}", detail),
            AdapterError::Rejected { status } => {
                write!(f, "source rejected the call with status {}", status)
            }
            AdapterError::InvalidResponse => write!(f, "source returned an unparseable response"),
            AdapterError::Internal(msg) => write!(f, "adapter error: {}", msg),
        }
    }
}

impl std::error::Error for AdapterError {}

/// One backend family. Implementations own their wire protocol and
/// credential needs; the dispatcher only sees the normalized result.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn execute(
        &self,
        entity: &Entity,
        query: &ValidatedQuery,
    ) -> Result<RoutedResult, AdapterError>;
}

pub struct Dispatcher {
    registry: Arc<dyn EntityRegistry>,
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
    limits: QueryLimits,
    request_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn EntityRegistry>,
        limits: QueryLimits,
        request_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            adapters: HashMap::new(),
            limits,
            request_deadline,
        }
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Routes one query end to end: resolve, validate, dispatch. Validation
    /// failures and unknown entities return before any adapter or broker
    /// traffic happens. The adapter call runs under the request deadline and
    /// is attempted exactly once.
    pub async fn dispatch(&self, spec: &QuerySpec) -> Result<RoutedResult, RouteError> {
        let resolve_span = tracing::info_span!(
            "registry.resolve",
            entity_name = %spec.entity_name,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let entity = async {
            let started = Instant::now();
            let resolved = self.registry.resolve(&spec.entity_name).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            match resolved {
                Ok(entity) => {
                    tracing::Span::current().record("outcome", "ok");
                    Ok(entity)
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", "error");
                    Err(err)
                }
            }
        }
        .instrument(resolve_span)
        .await
        .map_err(|err| match err {
            RegistryError::NotFound => RouteError::UnknownEntity(spec.entity_name.clone()),
            RegistryError::UnsupportedKind(kind) => RouteError::UnsupportedSource(kind),
            other => RouteError::RegistryUnavailable(other),
        })?;

        let validated = {
            let _span = tracing::info_span!(
                "query.validate",
                entity_name = %entity.entity_name,
            )
            .entered();
            validate::validate(&entity, spec, &self.limits).map_err(|err| {
                metrics::inc_validation_failure();
                tracing::info!(reason = %err, "query rejected by validator");
                RouteError::Invalid(err)
            })?
        };

        let kind = entity.source.kind();
        let Some(adapter) = self.adapters.get(&kind) else {
            return Err(RouteError::UnsupportedSource(kind.as_str().to_string()));
        };

        let adapter_span = tracing::info_span!(
            "adapter.execute",
            entity_name = %entity.entity_name,
            source_kind = kind.as_str(),
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        async {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.request_deadline, adapter.execute(&entity, &validated))
                    .await;

            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);

            let result = match outcome {
                Ok(result) => result,
                Err(_elapsed) => Err(AdapterError::Timeout),
            };

            match result {
                Ok(rows) => {
                    tracing::Span::current().record("outcome", "ok");
                    metrics::observe_upstream_call(kind.as_str(), "ok");
                    Ok(rows)
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", "error");
                    metrics::observe_upstream_call(kind.as_str(), "error");
                    tracing::warn!(error = %err, "adapter call failed");
                    Err(route_adapter_error(err))
                }
            }
        }
        .instrument(adapter_span)
        .await
    }
}

fn route_adapter_error(err: AdapterError) -> RouteError {
    match err {
        AdapterError::Broker(err) => RouteError::Broker(err),
        AdapterError::Timeout => RouteError::Upstream {
            kind: UpstreamKind::TimedOut,
            status: None,
        },
        AdapterError::Transport(_) => RouteError::Upstream {
            kind: UpstreamKind::Unavailable,
            status: None,
        },
        AdapterError::Rejected { status } => RouteError::Upstream {
            kind: if (400..500).contains(&status) {
                UpstreamKind::Rejected
            } else {
                UpstreamKind::Unavailable
            },
            status: Some(status),
        },
        AdapterError::InvalidResponse => RouteError::Upstream {
            kind: UpstreamKind::Unavailable,
            status: None,
        },
        AdapterError::Internal(msg) => RouteError::Internal(msg),
    }
}
