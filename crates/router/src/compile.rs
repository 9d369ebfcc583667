use serde::Serialize;
use trestle_contracts::{is_safe_identifier, WarehouseDetails};

use crate::validate::ValidatedQuery;

/// One bound statement parameter. Caller-supplied filter values only ever
/// travel here; they never appear in statement text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundParam {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub statement: String,
    pub params: Vec<BoundParam>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    UnsafeIdentifier(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnsafeIdentifier(identifier) => {
                write!(f, "identifier {} failed the safety re-check", identifier)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Compiles a validated query into a parameterized warehouse statement.
///
/// Identifiers are re-checked against the safe grammar immediately before
/// interpolation even though registry writes already enforced it; a stored
/// record is not trusted to still be well-formed. Values bind as `@p{i}`
/// (scalars) or `@p{i}_{j}` (membership list elements).
pub fn compile(
    query: &ValidatedQuery,
    details: &WarehouseDetails,
) -> Result<CompiledQuery, CompileError> {
    let select_list = query
        .columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let table = format!(
        "{}.{}.{}",
        quote_identifier(&details.catalog)?,
        quote_identifier(&details.dataset)?,
        quote_identifier(&details.table)?
    );

    let mut statement = format!("SELECT {} FROM {}", select_list, table);
    let mut params = Vec::new();
    let mut predicates = Vec::new();

    for (i, filter) in query.filters.iter().enumerate() {
        let column = quote_identifier(&filter.column)?;
        if filter.operator.is_membership() {
            let values = filter.value.as_array().cloned().unwrap_or_default();
            let mut placeholders = Vec::with_capacity(values.len());
            for (j, value) in values.into_iter().enumerate() {
                let name = format!("p{}_{}", i, j);
                placeholders.push(format!("@{}", name));
                params.push(BoundParam { name, value });
            }
            predicates.push(format!(
                "{} {} ({})",
                column,
                filter.operator.as_sql(),
                placeholders.join(", ")
            ));
        } else {
            let name = format!("p{}", i);
            predicates.push(format!("{} {} @{}", column, filter.operator.as_sql(), name));
            params.push(BoundParam {
                name,
                value: filter.value.clone(),
            });
        }
    }

    if !predicates.is_empty() {
        statement.push_str(" WHERE ");
        statement.push_str(&predicates.join(" AND "));
    }

    // The limit was range-checked by the validator and is formatted from an
    // integer, never from caller text.
    statement.push_str(&format!(" LIMIT {}", query.limit));

    Ok(CompiledQuery { statement, params })
}

fn quote_identifier(identifier: &str) -> Result<String, CompileError> {
    if !is_safe_identifier(identifier) {
        return Err(CompileError::UnsafeIdentifier(identifier.to_string()));
    }
    Ok(format!("`{}`", identifier))
}
