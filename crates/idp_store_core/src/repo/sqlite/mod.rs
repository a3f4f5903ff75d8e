//! Relational repository implementation on SQLite.
//!
//! # Responsibility
//! - Implement the repository contract for every [`SqlEntity`].
//! - Map SQLite constraint failures onto the store error taxonomy.
//!
//! # Invariants
//! - Every write runs inside an immediate transaction.
//! - References are checked inside the write transaction; the schema's
//!   foreign keys stay as the last line of enforcement.
//! - Reads order by `created_at, id`.

use crate::db::{is_connectivity_failure, ConnectionPool};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    format_timestamp, now, parse_timestamp, ApiKey, Blueprint, CloudProvider, EntityId,
    EntityKind, EntityRecord, EntityRef, EntityWrite, PropertySchema, ResourceType, ResourceTypeCloudMapping, Stack, Team,
};
use crate::repo::{
    ApiKeyRepository, BlueprintRepository, CloudProviderRepository, FieldFilter, FieldValue,
    PropertySchemaRepository, Repository, ResourceTypeCloudMappingRepository,
    ResourceTypeRepository, StackRepository, TeamRepository,
};
use crate::tx::{merge_writes, unit_item_count, MAX_TRANSACTION_ITEMS};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::marker::PhantomData;
use std::time::Instant;
use uuid::Uuid;

mod rows;
mod tx;

pub(crate) use rows::SqlEntity;
use rows::{encoded_len, table_for, RowReader};
pub use tx::SqliteTransactionCoordinator;

/// Repository for one entity type over a shared connection pool.
pub struct SqliteRepository<E> {
    pool: ConnectionPool,
    max_record_bytes: usize,
    _entity: PhantomData<fn() -> E>,
}

impl<E: SqlEntity> SqliteRepository<E> {
    pub(crate) fn new(pool: ConnectionPool, max_record_bytes: usize) -> Self {
        Self {
            pool,
            max_record_bytes,
            _entity: PhantomData,
        }
    }
}

impl<E> Repository<E> for SqliteRepository<E>
where
    E: SqlEntity + Clone + Into<EntityRecord>,
{
    fn save(&self, mut entity: E) -> StoreResult<E> {
        let started_at = Instant::now();
        if entity.id().is_none() {
            entity.set_id(Uuid::new_v4());
        }
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error(E::KIND, err))?;
        let outcome = check_unit_size(&tx, &[EntityWrite::save(entity.clone())])
            .and_then(|_| save_entity(&tx, entity, self.max_record_bytes));
        let saved = match outcome {
            Ok(saved) => saved,
            Err(err) => {
                warn!(
                    "event=entity_save module=repo backend=sqlite kind={} status=error error_type={} duration_ms={}",
                    E::KIND,
                    err.error_type(),
                    started_at.elapsed().as_millis()
                );
                return Err(err);
            }
        };
        tx.commit().map_err(|err| map_sqlite_error(E::KIND, err))?;

        debug!(
            "event=entity_save module=repo backend=sqlite kind={} status=ok duration_ms={}",
            E::KIND,
            started_at.elapsed().as_millis()
        );
        Ok(saved)
    }

    fn find_by_id(&self, id: EntityId) -> StoreResult<Option<E>> {
        let conn = self.pool.get()?;
        load_by_id::<E>(&conn, id)
    }

    fn find_all(&self) -> StoreResult<Vec<E>> {
        let conn = self.pool.get()?;
        query::<E>(&conn, &[])
    }

    fn count(&self) -> StoreResult<u64> {
        let conn = self.pool.get()?;
        count_rows(&conn, E::KIND)
    }

    fn exists(&self, id: EntityId) -> StoreResult<bool> {
        let conn = self.pool.get()?;
        row_exists(&conn, E::KIND, id)
    }

    fn delete_by_id(&self, id: EntityId) -> StoreResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error(E::KIND, err))?;
        delete_row(&tx, E::KIND, id)?;
        tx.commit().map_err(|err| map_sqlite_error(E::KIND, err))?;
        debug!(
            "event=entity_delete module=repo backend=sqlite kind={} status=ok",
            E::KIND
        );
        Ok(())
    }

    fn find_by(&self, filters: &[FieldFilter]) -> StoreResult<Vec<E>> {
        let conn = self.pool.get()?;
        query::<E>(&conn, filters)
    }
}

impl CloudProviderRepository for SqliteRepository<CloudProvider> {}
impl ResourceTypeRepository for SqliteRepository<ResourceType> {}
impl ResourceTypeCloudMappingRepository for SqliteRepository<ResourceTypeCloudMapping> {}
impl PropertySchemaRepository for SqliteRepository<PropertySchema> {}
impl BlueprintRepository for SqliteRepository<Blueprint> {}
impl TeamRepository for SqliteRepository<Team> {}
impl StackRepository for SqliteRepository<Stack> {}
impl ApiKeyRepository for SqliteRepository<ApiKey> {}

fn select_sql<E: SqlEntity>() -> String {
    format!(
        "SELECT id, created_at, updated_at, {} FROM {}",
        E::COLUMNS.join(", "),
        E::TABLE
    )
}

pub(crate) fn load_by_id<E: SqlEntity>(conn: &Connection, id: EntityId) -> StoreResult<Option<E>> {
    let sql = format!("{} WHERE id = ?1;", select_sql::<E>());
    let mut stmt = conn
        .prepare_cached(&sql)
        .map_err(|err| map_sqlite_error(E::KIND, err))?;
    let mut rows = stmt
        .query([id.to_string()])
        .map_err(|err| map_sqlite_error(E::KIND, err))?;
    let mut entity = match rows.next().map_err(|err| map_sqlite_error(E::KIND, err))? {
        Some(row) => E::from_row(&RowReader::new(row, E::TABLE)?)?,
        None => return Ok(None),
    };
    drop(rows);
    entity.load_links(conn)?;
    Ok(Some(entity))
}

/// Backend items `writes` occupy, rejected above [`MAX_TRANSACTION_ITEMS`]
/// the same way the key-value backend rejects them.
pub(crate) fn check_unit_size(conn: &Connection, writes: &[EntityWrite]) -> StoreResult<usize> {
    let merged = merge_writes(writes)?;
    let items = unit_item_count(&merged.writes, |target| load_record(conn, target))?;
    if items > MAX_TRANSACTION_ITEMS {
        return Err(StoreError::TransactionTooLarge {
            items,
            limit: MAX_TRANSACTION_ITEMS,
        });
    }
    Ok(items)
}

/// Any stored record, dispatched on `target.kind`.
pub(crate) fn load_record(conn: &Connection, target: EntityRef) -> StoreResult<Option<EntityRecord>> {
    fn load<E: SqlEntity + Into<EntityRecord>>(
        conn: &Connection,
        id: EntityId,
    ) -> StoreResult<Option<EntityRecord>> {
        Ok(load_by_id::<E>(conn, id)?.map(Into::into))
    }
    match target.kind {
        EntityKind::CloudProvider => load::<CloudProvider>(conn, target.id),
        EntityKind::ResourceType => load::<ResourceType>(conn, target.id),
        EntityKind::ResourceTypeCloudMapping => load::<ResourceTypeCloudMapping>(conn, target.id),
        EntityKind::PropertySchema => load::<PropertySchema>(conn, target.id),
        EntityKind::Blueprint => load::<Blueprint>(conn, target.id),
        EntityKind::Team => load::<Team>(conn, target.id),
        EntityKind::Stack => load::<Stack>(conn, target.id),
        EntityKind::ApiKey => load::<ApiKey>(conn, target.id),
    }
}

fn query<E: SqlEntity>(conn: &Connection, filters: &[FieldFilter]) -> StoreResult<Vec<E>> {
    let mut sql = select_sql::<E>();
    let mut bind_values = Vec::with_capacity(filters.len());
    for (position, filter) in filters.iter().enumerate() {
        let clause = E::filter_clause(filter.field).ok_or_else(|| {
            StoreError::Validation(format!("{} cannot be queried by `{}`", E::KIND, filter.field))
        })?;
        sql.push_str(if position == 0 { " WHERE " } else { " AND " });
        sql.push_str(&clause);
        bind_values.push(match &filter.value {
            FieldValue::Text(text) => Value::Text(text.clone()),
            FieldValue::Id(id) => Value::Text(id.to_string()),
            FieldValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        });
    }
    sql.push_str(" ORDER BY created_at ASC, id ASC;");

    let mut stmt = conn
        .prepare_cached(&sql)
        .map_err(|err| map_sqlite_error(E::KIND, err))?;
    let mut rows = stmt
        .query(params_from_iter(bind_values))
        .map_err(|err| map_sqlite_error(E::KIND, err))?;
    let mut entities = Vec::new();
    while let Some(row) = rows.next().map_err(|err| map_sqlite_error(E::KIND, err))? {
        entities.push(E::from_row(&RowReader::new(row, E::TABLE)?)?);
    }
    drop(rows);

    for entity in &mut entities {
        entity.load_links(conn)?;
    }
    Ok(entities)
}

/// Inserts or overwrites `entity` on an open transaction.
pub(crate) fn save_entity<E: SqlEntity>(
    conn: &Connection,
    mut entity: E,
    max_record_bytes: usize,
) -> StoreResult<E> {
    let id = entity.id().unwrap_or_else(Uuid::new_v4);
    let stored_created_at = conn
        .query_row(
            &format!("SELECT created_at FROM {} WHERE id = ?1;", E::TABLE),
            [id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|err| map_sqlite_error(E::KIND, err))?;

    if let Some(missing) = first_missing_reference(conn, &entity.references())? {
        return Err(StoreError::not_found(missing.kind, missing.id));
    }

    let updated_at = now();
    let created_at = match &stored_created_at {
        Some(text) => parse_timestamp(text).ok_or_else(|| {
            StoreError::Validation(format!(
                "{}.created_at for id {id}: `{text}` is not an RFC 3339 timestamp",
                E::TABLE
            ))
        })?,
        None => updated_at,
    };
    entity.set_id(id);
    entity.set_timestamps(created_at, updated_at);

    let columns = entity.to_columns()?;
    let bytes = encoded_len(&columns);
    if bytes > max_record_bytes {
        return Err(StoreError::SizeLimit {
            kind: E::KIND,
            bytes,
            limit: max_record_bytes,
        });
    }

    let sql = if stored_created_at.is_some() {
        update_sql::<E>()
    } else {
        insert_sql::<E>()
    };
    let mut values = Vec::with_capacity(columns.len() + 3);
    if stored_created_at.is_some() {
        values.extend(columns);
        values.push(Value::Text(format_timestamp(&updated_at)));
        values.push(Value::Text(id.to_string()));
    } else {
        values.push(Value::Text(id.to_string()));
        values.extend(columns);
        values.push(Value::Text(format_timestamp(&created_at)));
        values.push(Value::Text(format_timestamp(&updated_at)));
    }

    conn.execute(&sql, params_from_iter(values))
        .map_err(|err| map_write_error(conn, E::KIND, &entity.references(), err))?;
    entity.store_links(conn)?;
    Ok(entity)
}

fn insert_sql<E: SqlEntity>() -> String {
    let placeholders = (1..=E::COLUMNS.len() + 3)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} (id, {}, created_at, updated_at) VALUES ({});",
        E::TABLE,
        E::COLUMNS.join(", "),
        placeholders
    )
}

fn update_sql<E: SqlEntity>() -> String {
    let assignments = E::COLUMNS
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{column} = ?{}", index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let updated_at = E::COLUMNS.len() + 1;
    format!(
        "UPDATE {} SET {assignments}, updated_at = ?{updated_at} WHERE id = ?{};",
        E::TABLE,
        updated_at + 1
    )
}

/// Deletes one row; absent rows are a no-op.
pub(crate) fn delete_row(conn: &Connection, kind: EntityKind, id: EntityId) -> StoreResult<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1;", table_for(kind)),
        [id.to_string()],
    )
    .map_err(|err| {
        if foreign_key_failure(&err) {
            StoreError::conflict(
                kind,
                format!("{kind} {id} is still referenced by other records"),
            )
        } else {
            map_sqlite_error(kind, err)
        }
    })?;
    Ok(())
}

pub(crate) fn count_rows(conn: &Connection, kind: EntityKind) -> StoreResult<u64> {
    let count = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {};", table_for(kind)),
            [],
            |row| row.get::<_, i64>(0),
        )
        .map_err(|err| map_sqlite_error(kind, err))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

pub(crate) fn row_exists(conn: &Connection, kind: EntityKind, id: EntityId) -> StoreResult<bool> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?1;", table_for(kind)),
        [id.to_string()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|err| map_sqlite_error(kind, err))
}

fn first_missing_reference(
    conn: &Connection,
    references: &[EntityRef],
) -> StoreResult<Option<EntityRef>> {
    for reference in references {
        if !row_exists(conn, reference.kind, reference.id)? {
            return Ok(Some(*reference));
        }
    }
    Ok(None)
}

fn map_write_error(
    conn: &Connection,
    kind: EntityKind,
    references: &[EntityRef],
    err: rusqlite::Error,
) -> StoreError {
    if foreign_key_failure(&err) {
        if let Ok(Some(missing)) = first_missing_reference(conn, references) {
            return StoreError::not_found(missing.kind, missing.id);
        }
    }
    map_sqlite_error(kind, err)
}

fn foreign_key_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// Maps a SQLite failure on `kind` onto the store error taxonomy.
pub(crate) fn map_sqlite_error(kind: EntityKind, err: rusqlite::Error) -> StoreError {
    if is_connectivity_failure(&err) {
        return StoreError::Connectivity(err.to_string());
    }

    if let rusqlite::Error::SqliteFailure(failure, message) = &err {
        match failure.code {
            ErrorCode::ConstraintViolation => {
                let detail = message.clone().unwrap_or_else(|| failure.to_string());
                match failure.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        return StoreError::conflict(kind, format!("duplicate value: {detail}"));
                    }
                    rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                        return StoreError::conflict(
                            kind,
                            format!("reference constraint failed: {detail}"),
                        );
                    }
                    _ => {}
                }
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return StoreError::Capacity(format!("database busy: {err}"));
            }
            _ => {}
        }
    }

    StoreError::backend(err)
}

#[cfg(test)]
mod tests {
    use super::{insert_sql, update_sql};
    use crate::model::Team;

    #[test]
    fn insert_binds_id_columns_and_timestamps() {
        assert_eq!(
            insert_sql::<Team>(),
            "INSERT INTO teams (id, name, description, is_active, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6);"
        );
    }

    #[test]
    fn update_never_touches_created_at() {
        let sql = update_sql::<Team>();
        assert!(!sql.contains("created_at"));
        assert!(sql.ends_with("WHERE id = ?5;"));
    }
}
