use serde::{Deserialize, Serialize};

pub mod canonical;

/// Backend family an entity belongs to. Determines which adapter the router
/// dispatches to; adding a backend means adding a variant here, one
/// `SourceConfig` variant, and one adapter implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Warehouse,
    Legacy,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Warehouse => "warehouse",
            SourceKind::Legacy => "legacy",
        }
    }
}

/// Per-source connection details, closed over the known source kinds so each
/// adapter gets compile-time-checked access to only its own fields. Wire
/// shape is `{"source_kind": "...", "source_details": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_kind", content = "source_details", rename_all = "snake_case")]
pub enum SourceConfig {
    Warehouse(WarehouseDetails),
    Legacy(LegacyDetails),
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Warehouse(_) => SourceKind::Warehouse,
            SourceConfig::Legacy(_) => SourceKind::Legacy,
        }
    }

    /// The entity's declared column set. Membership in this list is the
    /// precondition for a column appearing anywhere in a query.
    pub fn columns(&self) -> &[String] {
        match self {
            SourceConfig::Warehouse(details) => &details.columns,
            SourceConfig::Legacy(details) => &details.columns,
        }
    }

    pub fn endpoint_url(&self) -> &str {
        match self {
            SourceConfig::Warehouse(details) => &details.endpoint_url,
            SourceConfig::Legacy(details) => &details.endpoint_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseDetails {
    /// Warehouse query-execution endpoint; also the broker token audience.
    pub endpoint_url: String,
    pub catalog: String,
    pub dataset: String,
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyDetails {
    pub endpoint_url: String,
    pub object_name: String,
    pub columns: Vec<String>,
}

/// Administrator-registered data source exposed for querying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_name: String,
    pub display_name: String,
    #[serde(flatten)]
    pub source: SourceConfig,
}

/// Caller-supplied entity definition; the registry mints the `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntity {
    pub entity_name: String,
    pub display_name: String,
    #[serde(flatten)]
    pub source: SourceConfig,
}

/// Comparison operators accepted in filters. Anything else fails
/// deserialization; the textual SQL form comes only from `as_sql`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
}

impl FilterOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT IN",
        }
    }

    pub fn is_membership(self) -> bool {
        matches!(self, FilterOp::In | FilterOp::NotIn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOp,
    pub value: serde_json::Value,
}

/// Ephemeral caller query. Column membership and value shapes are checked by
/// the router's validator before any backend is contacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySpec {
    pub entity_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Normalized response shape shared by every adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutedResult {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Identifier grammar shared by registry writes and the query compiler.
/// Table and column names cannot be bound as statement parameters, so
/// anything interpolated into statement text must satisfy this.
pub fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl NewEntity {
    /// Configuration-time identifier hygiene. Registry writes refuse
    /// entities whose table coordinates or columns could not be safely
    /// interpolated later.
    pub fn validate(&self) -> Result<(), String> {
        if self.entity_name.trim().is_empty() {
            return Err("entity_name must be non-empty".to_string());
        }
        if !is_safe_identifier(&self.entity_name) {
            return Err(format!("invalid entity_name: {}", self.entity_name));
        }
        if self.display_name.trim().is_empty() {
            return Err("display_name must be non-empty".to_string());
        }

        let identifiers: Vec<&str> = match &self.source {
            SourceConfig::Warehouse(details) => {
                let mut ids = vec![
                    details.catalog.as_str(),
                    details.dataset.as_str(),
                    details.table.as_str(),
                ];
                ids.extend(details.columns.iter().map(String::as_str));
                ids
            }
            SourceConfig::Legacy(details) => {
                let mut ids = vec![details.object_name.as_str()];
                ids.extend(details.columns.iter().map(String::as_str));
                ids
            }
        };

        for identifier in identifiers {
            if !is_safe_identifier(identifier) {
                return Err(format!("invalid identifier: {}", identifier));
            }
        }

        if self.source.columns().is_empty() {
            return Err("source must declare at least one column".to_string());
        }
        if self.source.endpoint_url().trim().is_empty() {
            return Err("endpoint_url must be non-empty".to_string());
        }

        Ok(())
    }
}
