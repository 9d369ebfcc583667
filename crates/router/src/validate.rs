use trestle_contracts::{Entity, Filter, QuerySpec};

/// Shape limits applied to every incoming query, sourced from router config.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_columns: usize,
    pub max_filters: usize,
    pub max_in_values: usize,
    pub max_limit: u32,
    pub default_limit: u32,
}

/// A query that passed validation against one entity's column allow-list.
/// The compiler and the adapters only accept this shape, never a raw
/// `QuerySpec`.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyColumns,
    TooManyColumns { requested: usize, max: usize },
    UnknownColumn(String),
    TooManyFilters { requested: usize, max: usize },
    UnknownFilterColumn(String),
    NonScalarFilterValue { column: String },
    EmptyValueList { column: String },
    TooManyListValues { column: String, max: usize },
    NonScalarListValue { column: String },
    LimitOutOfRange { requested: u32, max: u32 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyColumns => {
                write!(f, "query must select at least one column")
            }
            ValidationError::TooManyColumns { requested, max } => {
                write!(f, "query selects {} columns, limit is {}", requested, max)
            }
            ValidationError::UnknownColumn(column) => {
                write!(f, "column {} is not exposed by this entity", column)
            }
            ValidationError::TooManyFilters { requested, max } => {
                write!(f, "query has {} filters, limit is {}", requested, max)
            }
            ValidationError::UnknownFilterColumn(column) => {
                write!(f, "filter column {} is not exposed by this entity", column)
            }
            ValidationError::NonScalarFilterValue { column } => {
                write!(f, "filter on {} requires a scalar value", column)
            }
            ValidationError::EmptyValueList { column } => {
                write!(f, "membership filter on {} requires a non-empty list", column)
            }
            ValidationError::TooManyListValues { column, max } => {
                write!(f, "membership filter on {} exceeds {} values", column, max)
            }
            ValidationError::NonScalarListValue { column } => {
                write!(f, "membership filter on {} contains a non-scalar value", column)
            }
            ValidationError::LimitOutOfRange { requested, max } => {
                write!(f, "limit {} is out of range (1..={})", requested, max)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a query against the entity's allow-list before any SQL text or
/// upstream payload is assembled. Selected columns come back sorted and
/// deduplicated so identical queries compile to identical statements.
pub fn validate(
    entity: &Entity,
    spec: &QuerySpec,
    limits: &QueryLimits,
) -> Result<ValidatedQuery, ValidationError> {
    let allowed = entity.source.columns();

    let mut columns = spec
        .columns
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .collect::<Vec<_>>();
    columns.sort();
    columns.dedup();

    if columns.is_empty() {
        return Err(ValidationError::EmptyColumns);
    }
    if columns.len() > limits.max_columns {
        return Err(ValidationError::TooManyColumns {
            requested: columns.len(),
            max: limits.max_columns,
        });
    }
    for column in &columns {
        if !allowed.iter().any(|a| a == column) {
            return Err(ValidationError::UnknownColumn(column.clone()));
        }
    }

    if spec.filters.len() > limits.max_filters {
        return Err(ValidationError::TooManyFilters {
            requested: spec.filters.len(),
            max: limits.max_filters,
        });
    }
    let mut filters = Vec::with_capacity(spec.filters.len());
    for filter in &spec.filters {
        // Same normalization as the selected columns, so a padded name is
        // treated identically in both positions.
        let column = filter.column.trim().to_string();
        if !allowed.iter().any(|a| a == &column) {
            return Err(ValidationError::UnknownFilterColumn(column));
        }

        if filter.operator.is_membership() {
            let Some(values) = filter.value.as_array() else {
                return Err(ValidationError::NonScalarFilterValue { column });
            };
            if values.is_empty() {
                return Err(ValidationError::EmptyValueList { column });
            }
            if values.len() > limits.max_in_values {
                return Err(ValidationError::TooManyListValues {
                    column,
                    max: limits.max_in_values,
                });
            }
            if !values.iter().all(is_scalar) {
                return Err(ValidationError::NonScalarListValue { column });
            }
        } else if !is_scalar(&filter.value) {
            return Err(ValidationError::NonScalarFilterValue { column });
        }

        filters.push(Filter {
            column,
            operator: filter.operator,
            value: filter.value.clone(),
        });
    }

    let limit = spec.limit.unwrap_or(limits.default_limit);
    if limit == 0 || limit > limits.max_limit {
        return Err(ValidationError::LimitOutOfRange {
            requested: limit,
            max: limits.max_limit,
        });
    }

    Ok(ValidatedQuery {
        columns,
        filters,
        limit,
    })
}

fn is_scalar(value: &serde_json::Value) -> bool {
    value.is_string() || value.is_number() || value.is_boolean()
}
