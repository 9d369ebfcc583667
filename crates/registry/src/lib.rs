use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use tokio::sync::RwLock;
use trestle_contracts::{Entity, NewEntity, SourceConfig};
use ulid::Ulid;

#[derive(Debug)]
pub enum RegistryError {
    /// The requested entity_name has no record. Callers rely on this being
    /// distinct from storage failure to detect stale admin state.
    NotFound,
    /// An insert hit an existing entity_name.
    Conflict,
    Timeout,
    Unavailable(sqlx::Error),
    /// A stored record references a source kind this build has no adapter
    /// for. Configuration-time bug, not a runtime backend failure.
    UnsupportedKind(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound => write!(f, "entity not found"),
            RegistryError::Conflict => write!(f, "entity_name already registered"),
            RegistryError::Timeout => write!(f, "registry operation timed out"),
            RegistryError::Unavailable(err) => write!(f, "registry sql error: {}", err),
            RegistryError::UnsupportedKind(kind) => {
                write!(f, "stored entity has unsupported source kind: {}", kind)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<sqlx::Error> for RegistryError {
    fn from(value: sqlx::Error) -> Self {
        RegistryError::Unavailable(value)
    }
}

/// Durable entity_name -> routing-metadata mapping. The router resolves
/// through this on every call; administrative writes serialize per key in
/// the storage layer, never in the router.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn resolve(&self, entity_name: &str) -> Result<Entity, RegistryError>;
    async fn list(&self) -> Result<Vec<Entity>, RegistryError>;
    async fn insert(&self, entity: &NewEntity) -> Result<Entity, RegistryError>;
    async fn update(&self, entity_name: &str, entity: &NewEntity)
        -> Result<Entity, RegistryError>;
    async fn upsert(&self, entity: &NewEntity) -> Result<Entity, RegistryError>;
    async fn delete(&self, entity_name: &str) -> Result<(), RegistryError>;
    async fn ping(&self) -> Result<(), RegistryError>;
}

const ENTITY_COLUMNS: &str = "id, entity_name, display_name, source_kind, source_details";

#[derive(Clone)]
pub struct PgRegistry {
    pool: sqlx::PgPool,
    op_timeout: Duration,
}

impl PgRegistry {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, RegistryError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| RegistryError::Timeout)??;

        Ok(Self { pool, op_timeout })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        op_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let registry = Self::connect(db_url, op_timeout).await?;
        registry.migrate().await?;
        Ok(registry)
    }

    pub async fn migrate(&self) -> Result<(), RegistryError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| RegistryError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EntityRegistry for PgRegistry {
    async fn resolve(&self, entity_name: &str) -> Result<Entity, RegistryError> {
        let sql = format!(
            "SELECT {} FROM trestle_entities WHERE entity_name = $1",
            ENTITY_COLUMNS
        );
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(&sql).bind(entity_name).fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| RegistryError::Timeout)??;

        match row {
            Some(row) => entity_from_row(&row),
            None => Err(RegistryError::NotFound),
        }
    }

    async fn list(&self) -> Result<Vec<Entity>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM trestle_entities ORDER BY entity_name",
            ENTITY_COLUMNS
        );
        let rows = tokio::time::timeout(self.op_timeout, sqlx::query(&sql).fetch_all(&self.pool))
            .await
            .map_err(|_| RegistryError::Timeout)??;

        rows.iter().map(entity_from_row).collect()
    }

    async fn insert(&self, entity: &NewEntity) -> Result<Entity, RegistryError> {
        let (kind, details) = split_source(&entity.source);
        let id = Ulid::new().to_string();

        let sql = format!(
            "INSERT INTO trestle_entities (id, entity_name, display_name, source_kind, source_details) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            ENTITY_COLUMNS
        );

        let result = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(&sql)
                .bind(&id)
                .bind(&entity.entity_name)
                .bind(&entity.display_name)
                .bind(kind)
                .bind(&details)
                .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| RegistryError::Timeout)?;

        match result {
            Ok(row) => entity_from_row(&row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(RegistryError::Conflict)
            }
            Err(err) => Err(RegistryError::Unavailable(err)),
        }
    }

    async fn update(
        &self,
        entity_name: &str,
        entity: &NewEntity,
    ) -> Result<Entity, RegistryError> {
        let (kind, details) = split_source(&entity.source);

        let sql = format!(
            "UPDATE trestle_entities \
             SET display_name = $2, source_kind = $3, source_details = $4, updated_at = now() \
             WHERE entity_name = $1 RETURNING {}",
            ENTITY_COLUMNS
        );

        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(&sql)
                .bind(entity_name)
                .bind(&entity.display_name)
                .bind(kind)
                .bind(&details)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| RegistryError::Timeout)??;

        match row {
            Some(row) => entity_from_row(&row),
            None => Err(RegistryError::NotFound),
        }
    }

    async fn upsert(&self, entity: &NewEntity) -> Result<Entity, RegistryError> {
        let (kind, details) = split_source(&entity.source);
        let id = Ulid::new().to_string();

        // Single statement so a concurrent resolve never observes a partial
        // record; the existing id survives a replace.
        let sql = format!(
            "INSERT INTO trestle_entities (id, entity_name, display_name, source_kind, source_details) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (entity_name) DO UPDATE \
             SET display_name = EXCLUDED.display_name, \
                 source_kind = EXCLUDED.source_kind, \
                 source_details = EXCLUDED.source_details, \
                 updated_at = now() \
             RETURNING {}",
            ENTITY_COLUMNS
        );

        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(&sql)
                .bind(&id)
                .bind(&entity.entity_name)
                .bind(&entity.display_name)
                .bind(kind)
                .bind(&details)
                .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| RegistryError::Timeout)??;

        entity_from_row(&row)
    }

    async fn delete(&self, entity_name: &str) -> Result<(), RegistryError> {
        let result = tokio::time::timeout(
            self.op_timeout,
            sqlx::query("DELETE FROM trestle_entities WHERE entity_name = $1")
                .bind(entity_name)
                .execute(&self.pool),
        )
        .await
        .map_err(|_| RegistryError::Timeout)??;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        tokio::time::timeout(
            self.op_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| RegistryError::Timeout)??;
        Ok(())
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn split_source(source: &SourceConfig) -> (&'static str, serde_json::Value) {
    let details = match source {
        SourceConfig::Warehouse(details) => serde_json::to_value(details),
        SourceConfig::Legacy(details) => serde_json::to_value(details),
    }
    .unwrap_or_else(|_| serde_json::json!({}));

    (source.kind().as_str(), details)
}

fn entity_from_row(row: &sqlx::postgres::PgRow) -> Result<Entity, RegistryError> {
    let id: String = row.try_get("id")?;
    let entity_name: String = row.try_get("entity_name")?;
    let display_name: String = row.try_get("display_name")?;
    let source_kind: String = row.try_get("source_kind")?;
    let source_details: serde_json::Value = row.try_get("source_details")?;

    let source = serde_json::from_value::<SourceConfig>(serde_json::json!({
        "source_kind": source_kind,
        "source_details": source_details,
    }))
    .map_err(|_| RegistryError::UnsupportedKind(source_kind))?;

    Ok(Entity {
        id,
        entity_name,
        display_name,
        source,
    })
}

/// In-memory registry used by tests and by the router's `memory` registry
/// mode for local development. Holds the write lock across the whole
/// mutation, so read-after-write holds by construction.
#[derive(Default)]
pub struct MemoryRegistry {
    entities: RwLock<HashMap<String, Entity>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityRegistry for MemoryRegistry {
    async fn resolve(&self, entity_name: &str) -> Result<Entity, RegistryError> {
        self.entities
            .read()
            .await
            .get(entity_name)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Entity>, RegistryError> {
        let mut entities = self
            .entities
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        entities.sort_by(|a, b| a.entity_name.cmp(&b.entity_name));
        Ok(entities)
    }

    async fn insert(&self, entity: &NewEntity) -> Result<Entity, RegistryError> {
        let mut entities = self.entities.write().await;
        if entities.contains_key(&entity.entity_name) {
            return Err(RegistryError::Conflict);
        }

        let stored = Entity {
            id: Ulid::new().to_string(),
            entity_name: entity.entity_name.clone(),
            display_name: entity.display_name.clone(),
            source: entity.source.clone(),
        };
        entities.insert(stored.entity_name.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        entity_name: &str,
        entity: &NewEntity,
    ) -> Result<Entity, RegistryError> {
        let mut entities = self.entities.write().await;
        let existing = entities.get_mut(entity_name).ok_or(RegistryError::NotFound)?;

        existing.display_name = entity.display_name.clone();
        existing.source = entity.source.clone();
        Ok(existing.clone())
    }

    async fn upsert(&self, entity: &NewEntity) -> Result<Entity, RegistryError> {
        let mut entities = self.entities.write().await;
        let id = entities
            .get(&entity.entity_name)
            .map(|existing| existing.id.clone())
            .unwrap_or_else(|| Ulid::new().to_string());

        let stored = Entity {
            id,
            entity_name: entity.entity_name.clone(),
            display_name: entity.display_name.clone(),
            source: entity.source.clone(),
        };
        entities.insert(stored.entity_name.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, entity_name: &str) -> Result<(), RegistryError> {
        let mut entities = self.entities.write().await;
        entities
            .remove(entity_name)
            .map(|_| ())
            .ok_or(RegistryError::NotFound)
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
