//! SQLite store implementation.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{
    IdPageQuery, PartitionPredicate, PendingWrite, ResourceStore, StoreSession, TokenHash,
    TokenHashPredicate, WriteBuffer,
};
use crate::error::{BackendError, StorageError, StorageResult, TransactionError};
use crate::types::{
    IndexCategory, IndexPopulation, IndexRow, IndexValue, LoadedResource, PartitionId,
    PersistentId, RequestPartitionId, ResourceIdentity, ResourceRow, TokenIndexMatch,
    TypedPersistentId, WriteCounts,
};

use super::schema;

const BACKEND_NAME: &str = "sqlite";

fn internal_error(message: String) -> BackendError {
    BackendError::Internal {
        backend_name: BACKEND_NAME.to_string(),
        message,
        source: None,
    }
}

fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

/// Configuration for the SQLite store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection.
    #[serde(with = "humantime_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,

    /// SQLite busy timeout.
    #[serde(with = "humantime_serde", default = "default_busy_timeout")]
    pub busy_timeout: Duration,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Enable foreign key constraints.
    #[serde(default = "default_true")]
    pub enable_foreign_keys: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            busy_timeout: default_busy_timeout(),
            enable_wal: true,
            enable_foreign_keys: true,
        }
    }
}

impl SqliteStoreConfig {
    /// Sets the pool size.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// A transactional store backed by SQLite.
///
/// An in-memory database lives in a single pooled connection, so only one
/// session (or id page query) can run at a time against it.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteStoreConfig,
    is_memory: bool,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("config", &self.config)
            .field("is_memory", &self.is_memory)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Creates an in-memory store with an initialized schema.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(":memory:", SqliteStoreConfig::default())
    }

    /// Opens or creates a file database with an initialized schema.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(path, SqliteStoreConfig::default())
    }

    /// Opens a store with custom configuration.
    pub fn with_config<P: AsRef<Path>>(path: P, config: SqliteStoreConfig) -> StorageResult<Self> {
        let is_memory = path.as_ref().to_string_lossy() == ":memory:";

        let busy_timeout = config.busy_timeout;
        let enable_wal = config.enable_wal && !is_memory;
        let enable_foreign_keys = config.enable_foreign_keys;
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        };
        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if enable_foreign_keys {
                conn.pragma_update(None, "foreign_keys", "ON")?;
            }
            if enable_wal {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
            }
            Ok(())
        });

        let builder = Pool::builder().connection_timeout(config.connection_timeout);
        let builder = if is_memory {
            // Every connection to :memory: is a separate database.
            builder.max_size(1).idle_timeout(None).max_lifetime(None)
        } else {
            builder
                .max_size(config.max_connections)
                .min_idle(Some(config.min_connections))
        };
        let pool = builder.build(manager).map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: BACKEND_NAME.to_string(),
                message: e.to_string(),
            })
        })?;

        let store = Self {
            pool,
            config,
            is_memory,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &SqliteStoreConfig {
        &self.config
    }

    fn get_connection(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            StorageError::Backend(BackendError::ConnectionFailed {
                backend_name: BACKEND_NAME.to_string(),
                message: e.to_string(),
            })
        })
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    type Session = SqliteSession;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn begin(&self) -> StorageResult<Self::Session> {
        let conn = self.get_connection()?;
        SqliteSession::new(conn)
    }

    async fn fetch_id_page(&self, query: IdPageQuery<'_>) -> StorageResult<Vec<TypedPersistentId>> {
        let conn = self.get_connection()?;
        let selection = query.selection;

        let mut sql = String::from(
            "SELECT pid, resource_type, partition_id FROM resources WHERE deleted = 0 AND pid > ?1",
        );
        let mut values = vec![SqlValue::Integer(
            query.after.map(|pid| pid.value()).unwrap_or(i64::MIN),
        )];

        if let Some(types) = &selection.resource_types {
            let start = values.len() + 1;
            sql.push_str(&format!(
                " AND resource_type IN ({})",
                placeholders(start, types.len())
            ));
            values.extend(types.iter().cloned().map(SqlValue::Text));
        }
        if let Some(start) = selection.start {
            values.push(SqlValue::Text(format_timestamp(start)));
            sql.push_str(&format!(" AND last_updated >= ?{}", values.len()));
        }
        if let Some(end) = selection.end {
            values.push(SqlValue::Text(format_timestamp(end)));
            sql.push_str(&format!(" AND last_updated < ?{}", values.len()));
        }
        match selection.partition {
            RequestPartitionId::Default => sql.push_str(" AND partition_id IS NULL"),
            RequestPartitionId::Partition(id) => {
                values.push(SqlValue::Integer(i64::from(id.value())));
                sql.push_str(&format!(" AND partition_id = ?{}", values.len()));
            }
            RequestPartitionId::AllPartitions | RequestPartitionId::Undetermined => {}
        }
        values.push(SqlValue::Integer(query.limit as i64));
        sql.push_str(&format!(" ORDER BY pid LIMIT ?{}", values.len()));

        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(TypedPersistentId {
                    pid: PersistentId::new(row.get(0)?),
                    resource_type: row.get(1)?,
                    partition: row.get::<_, Option<i32>>(2)?.map(PartitionId::new),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

/// An open `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Dropping a session without committing rolls it back.
pub struct SqliteSession {
    conn: PooledConnection<SqliteConnectionManager>,
    buffer: WriteBuffer,
    last_pid: i64,
    active: bool,
}

impl Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("active", &self.active)
            .field("pending", &self.buffer.counts())
            .finish_non_exhaustive()
    }
}

impl SqliteSession {
    fn new(conn: PooledConnection<SqliteConnectionManager>) -> StorageResult<Self> {
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            StorageError::Backend(internal_error(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let last_pid: i64 =
            conn.query_row("SELECT COALESCE(MAX(pid), 0) FROM resources", [], |row| {
                row.get(0)
            })?;

        Ok(Self {
            conn,
            buffer: WriteBuffer::new(),
            last_pid,
            active: true,
        })
    }

    fn ensure_active(&self) -> StorageResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(StorageError::Transaction(TransactionError::InvalidTransaction))
        }
    }

    fn write_batch(&self, writes: &[PendingWrite]) -> rusqlite::Result<()> {
        let conn: &Connection = &self.conn;
        for write in writes {
            let row = write.row();
            let data = serde_json::to_vec(&row.content)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let populated = serde_json::to_string(&row.populated)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let partition = row.partition.map(|p| p.value());
            let last_updated = format_timestamp(row.last_updated);

            match write {
                PendingWrite::Insert { .. } => {
                    conn.execute(
                        "INSERT INTO resources
                            (pid, resource_type, id, partition_id, version, deleted, data, last_updated, populated)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            row.pid.value(),
                            row.identity.resource_type(),
                            row.identity.id(),
                            partition,
                            row.version as i64,
                            row.deleted,
                            data,
                            last_updated,
                            populated,
                        ],
                    )?;
                }
                PendingWrite::Update { changes, .. } | PendingWrite::Delete { changes, .. } => {
                    conn.execute(
                        "UPDATE resources
                         SET partition_id = ?2, version = ?3, deleted = ?4, data = ?5,
                             last_updated = ?6, populated = ?7
                         WHERE pid = ?1",
                        params![
                            row.pid.value(),
                            partition,
                            row.version as i64,
                            row.deleted,
                            data,
                            last_updated,
                            populated,
                        ],
                    )?;
                    for category in &changes.cleared {
                        conn.execute(
                            "DELETE FROM resource_index WHERE pid = ?1 AND category = ?2",
                            params![row.pid.value(), category.as_str()],
                        )?;
                    }
                    for index in &changes.removed {
                        conn.execute(
                            "DELETE FROM resource_index
                             WHERE pid = ?1 AND category = ?2 AND param_name = ?3 AND value = ?4",
                            params![
                                row.pid.value(),
                                index.category().as_str(),
                                index.param_name,
                                index_value_text(index)?,
                            ],
                        )?;
                    }
                }
            }

            for index in write.added_indexes() {
                insert_index_row(conn, index)?;
            }
        }
        Ok(())
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back abandoned SQLite session");
            }
        }
    }
}

fn index_value_text(index: &IndexRow) -> rusqlite::Result<String> {
    serde_json::to_string(&index.value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn insert_index_row(conn: &Connection, index: &IndexRow) -> rusqlite::Result<()> {
    let value = index_value_text(index)?;
    let (hash_value, hash_system_and_value) = match &index.value {
        IndexValue::Token {
            hash_value,
            hash_system_and_value,
            ..
        } => (Some(*hash_value), Some(*hash_system_and_value)),
        _ => (None, None),
    };
    conn.execute(
        "INSERT INTO resource_index
            (pid, partition_id, resource_type, param_name, category, value, hash_value, hash_system_and_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            index.pid.value(),
            index.partition.map(|p| p.value()),
            index.resource_type,
            index.param_name,
            index.category().as_str(),
            value,
            hash_value,
            hash_system_and_value,
        ],
    )?;
    Ok(())
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_timestamp(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| serialization_error(format!("Invalid last_updated '{}': {}", text, e)))
}

/// Columns of a `resources` row before JSON decoding.
struct RawResource {
    pid: i64,
    resource_type: String,
    id: String,
    partition: Option<i32>,
    version: i64,
    deleted: bool,
    data: Vec<u8>,
    last_updated: String,
    populated: String,
}

impl RawResource {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pid: row.get(0)?,
            resource_type: row.get(1)?,
            id: row.get(2)?,
            partition: row.get(3)?,
            version: row.get(4)?,
            deleted: row.get(5)?,
            data: row.get(6)?,
            last_updated: row.get(7)?,
            populated: row.get(8)?,
        })
    }

    fn decode(self) -> StorageResult<ResourceRow> {
        let content = serde_json::from_slice(&self.data)
            .map_err(|e| serialization_error(format!("Failed to deserialize resource: {}", e)))?;
        let populated: IndexPopulation = serde_json::from_str(&self.populated)?;
        Ok(ResourceRow {
            pid: PersistentId::new(self.pid),
            identity: ResourceIdentity::new(self.resource_type, self.id),
            partition: self.partition.map(PartitionId::new),
            version: u64::try_from(self.version).unwrap_or_default(),
            deleted: self.deleted,
            content,
            last_updated: parse_timestamp(&self.last_updated)?,
            populated,
        })
    }
}

/// Columns of a joined `resource_index` row.
struct RawIndex {
    partition: Option<i32>,
    resource_type: String,
    param_name: String,
    value: String,
}

impl RawIndex {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Self>> {
        let Some(param_name) = row.get::<_, Option<String>>(11)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            partition: row.get(9)?,
            resource_type: row.get(10)?,
            param_name,
            value: row.get(12)?,
        }))
    }

    fn decode(self, pid: PersistentId) -> StorageResult<IndexRow> {
        Ok(IndexRow {
            pid,
            partition: self.partition.map(PartitionId::new),
            resource_type: self.resource_type,
            param_name: self.param_name,
            value: serde_json::from_str(&self.value)?,
        })
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn resolve_persistent_ids(
        &mut self,
        partition: &RequestPartitionId,
        identities: &[ResourceIdentity],
    ) -> StorageResult<Vec<(ResourceIdentity, PersistentId)>> {
        self.ensure_active()?;

        let mut found = Vec::new();
        let mut remaining = Vec::new();
        for identity in identities {
            match self.buffer.find_identity(partition, identity) {
                Some(pid) => found.push((identity.clone(), pid)),
                None => remaining.push(identity),
            }
        }
        if remaining.is_empty() {
            return Ok(found);
        }

        let clauses: Vec<String> = (0..remaining.len())
            .map(|i| format!("(resource_type = ?{} AND id = ?{})", 2 * i + 1, 2 * i + 2))
            .collect();
        let sql = format!(
            "SELECT pid, resource_type, id, partition_id FROM resources WHERE {}",
            clauses.join(" OR ")
        );
        let values: Vec<SqlValue> = remaining
            .iter()
            .flat_map(|identity| {
                [
                    SqlValue::Text(identity.resource_type().to_string()),
                    SqlValue::Text(identity.id().to_string()),
                ]
            })
            .collect();

        let shadowed: HashSet<PersistentId> = self.buffer.shadowed().collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    PersistentId::new(row.get(0)?),
                    ResourceIdentity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                    row.get::<_, Option<i32>>(3)?.map(PartitionId::new),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        found.extend(
            rows.into_iter()
                .filter(|(pid, _, stored)| !shadowed.contains(pid) && partition.admits(*stored))
                .map(|(pid, identity, _)| (identity, pid)),
        );
        Ok(found)
    }

    async fn find_token_matches(
        &mut self,
        predicates: &[TokenHashPredicate],
    ) -> StorageResult<Vec<TokenIndexMatch>> {
        self.ensure_active()?;
        if predicates.is_empty() {
            return Ok(Vec::new());
        }

        let mut clauses = Vec::with_capacity(predicates.len());
        let mut values = Vec::with_capacity(predicates.len());
        for predicate in predicates {
            let (column, hash) = match predicate.hash {
                TokenHash::Value(hash) => ("hash_value", hash),
                TokenHash::SystemAndValue(hash) => ("hash_system_and_value", hash),
            };
            values.push(SqlValue::Integer(hash));
            let hash_clause = format!("{} = ?{}", column, values.len());
            let clause = match &predicate.partition {
                PartitionPredicate::Any => hash_clause,
                PartitionPredicate::DefaultOnly => {
                    format!("({} AND partition_id IS NULL)", hash_clause)
                }
                PartitionPredicate::In(ids) if ids.is_empty() => format!("({} AND 0)", hash_clause),
                PartitionPredicate::In(ids) => {
                    let start = values.len() + 1;
                    values.extend(ids.iter().map(|id| SqlValue::Integer(i64::from(id.value()))));
                    format!(
                        "({} AND partition_id IN ({}))",
                        hash_clause,
                        placeholders(start, ids.len())
                    )
                }
            };
            clauses.push(clause);
        }
        let sql = format!(
            "SELECT pid, partition_id, hash_value, hash_system_and_value
             FROM resource_index WHERE category = 'token' AND ({})",
            clauses.join(" OR ")
        );

        let shadowed: HashSet<PersistentId> = self.buffer.shadowed().collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let stored = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(TokenIndexMatch {
                    pid: PersistentId::new(row.get(0)?),
                    partition: row.get::<_, Option<i32>>(1)?.map(PartitionId::new),
                    hash_value: row.get(2)?,
                    hash_system_and_value: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut hits = self.buffer.token_matches(predicates);
        hits.extend(stored.into_iter().filter(|hit| !shadowed.contains(&hit.pid)));
        Ok(hits)
    }

    async fn load_resources(
        &mut self,
        pids: &[PersistentId],
        join: Option<IndexCategory>,
    ) -> StorageResult<Vec<LoadedResource>> {
        self.ensure_active()?;

        let mut loaded: BTreeMap<PersistentId, LoadedResource> = BTreeMap::new();
        let mut remaining = Vec::new();
        for &pid in pids {
            match self.buffer.loaded(pid) {
                Some(mut resource) => {
                    match join {
                        Some(category) => resource.indexes.retain(|i| i.category() == category),
                        None => resource.indexes.clear(),
                    }
                    loaded.insert(pid, resource);
                }
                None => remaining.push(pid),
            }
        }

        if !remaining.is_empty() {
            // A NULL category joins nothing.
            let sql = format!(
                "SELECT r.pid, r.resource_type, r.id, r.partition_id, r.version, r.deleted,
                        r.data, r.last_updated, r.populated,
                        i.partition_id, i.resource_type, i.param_name, i.value
                 FROM resources r
                 LEFT JOIN resource_index i ON i.pid = r.pid AND i.category = ?1
                 WHERE r.pid IN ({})
                 ORDER BY r.pid",
                placeholders(2, remaining.len())
            );
            let mut values = vec![match join {
                Some(category) => SqlValue::Text(category.as_str().to_string()),
                None => SqlValue::Null,
            }];
            values.extend(remaining.iter().map(|pid| SqlValue::Integer(pid.value())));

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((RawResource::read(row)?, RawIndex::read(row)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (raw, index) in rows {
                let pid = PersistentId::new(raw.pid);
                if !loaded.contains_key(&pid) {
                    let row = raw.decode()?;
                    loaded.insert(
                        pid,
                        LoadedResource {
                            row,
                            indexes: Vec::new(),
                        },
                    );
                }
                if let (Some(index), Some(resource)) = (index, loaded.get_mut(&pid)) {
                    resource.indexes.push(index.decode(pid)?);
                }
            }
        }

        Ok(loaded.into_values().collect())
    }

    async fn allocate_pid(&mut self) -> StorageResult<PersistentId> {
        self.ensure_active()?;
        self.last_pid += 1;
        Ok(PersistentId::new(self.last_pid))
    }

    fn stage(&mut self, write: PendingWrite) -> StorageResult<()> {
        self.ensure_active()?;
        self.buffer.stage(write);
        Ok(())
    }

    fn pending_counts(&self) -> WriteCounts {
        self.buffer.counts()
    }

    async fn flush(&mut self) -> Result<WriteCounts, BackendError> {
        if !self.active {
            return Err(internal_error("session is no longer active".to_string()));
        }
        if self.buffer.is_empty() {
            return Ok(WriteCounts::default());
        }

        let counts = self.buffer.counts();
        let resource_types = self.buffer.resource_types();
        let writes = self.buffer.drain();

        self.write_batch(&writes).map_err(|e| {
            if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                BackendError::ConstraintViolation {
                    backend_name: BACKEND_NAME.to_string(),
                    resource_types,
                    message: e.to_string(),
                }
            } else {
                BackendError::Internal {
                    backend_name: BACKEND_NAME.to_string(),
                    message: format!("Failed to flush session writes: {}", e),
                    source: Some(Box::new(e)),
                }
            }
        })?;

        debug!(
            backend = BACKEND_NAME,
            inserts = counts.inserts,
            updates = counts.updates,
            deletes = counts.deletes,
            "Flushed session writes"
        );
        Ok(counts)
    }

    async fn commit(mut self) -> StorageResult<()> {
        self.ensure_active()?;
        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        self.conn.execute_batch("COMMIT").map_err(|e| {
            StorageError::Backend(internal_error(format!("Failed to commit: {}", e)))
        })?;
        self.active = false;
        Ok(())
    }

    async fn rollback(mut self) -> StorageResult<()> {
        self.ensure_active()?;
        self.active = false;
        self.conn.execute_batch("ROLLBACK").map_err(|e| {
            StorageError::Transaction(TransactionError::RollbackFailed {
                message: e.to_string(),
            })
        })?;
        Ok(())
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IndexChanges;
    use crate::types::ChunkSelection;
    use serde_json::json;

    fn row(pid: PersistentId, id: &str, version: u64) -> ResourceRow {
        ResourceRow {
            pid,
            identity: ResourceIdentity::new("Patient", id),
            partition: None,
            version,
            deleted: false,
            content: json!({"resourceType": "Patient", "id": id}),
            last_updated: Utc::now(),
            populated: IndexPopulation {
                token: true,
                ..IndexPopulation::default()
            },
        }
    }

    fn token(pid: PersistentId, hash: i64) -> IndexRow {
        IndexRow {
            pid,
            partition: None,
            resource_type: "Patient".to_string(),
            param_name: "identifier".to_string(),
            value: IndexValue::Token {
                system: Some("sys".to_string()),
                value: "1".to_string(),
                hash_value: hash,
                hash_system_and_value: hash + 100,
            },
        }
    }

    #[test]
    fn test_config_defaults_and_durations() {
        let config: SqliteStoreConfig =
            serde_json::from_value(json!({"busy_timeout": "250ms"})).unwrap();
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 10);
        assert!(config.enable_wal);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert_eq!(
            parse_timestamp(&format_timestamp(earlier)).unwrap().timestamp_micros(),
            earlier.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_flush_and_reload_with_join() {
        let store = SqliteStore::in_memory().unwrap();
        let mut session = store.begin().await.unwrap();
        let pid = session.allocate_pid().await.unwrap();
        session
            .stage(PendingWrite::Insert {
                row: row(pid, "a", 1),
                indexes: vec![token(pid, 7)],
            })
            .unwrap();
        let counts = session.flush().await.unwrap();
        assert_eq!(counts.inserts, 1);

        let loaded = session
            .load_resources(&[pid], Some(IndexCategory::Token))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].indexes.len(), 1);
        assert_eq!(loaded[0].row.identity, ResourceIdentity::new("Patient", "a"));

        let plain = session.load_resources(&[pid], None).await.unwrap();
        assert!(plain[0].indexes.is_empty());

        let hits = session
            .find_token_matches(&[TokenHashPredicate {
                hash: TokenHash::SystemAndValue(107),
                partition: PartitionPredicate::DefaultOnly,
            }])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_identity_is_a_constraint_violation() {
        let store = SqliteStore::in_memory().unwrap();
        let mut session = store.begin().await.unwrap();
        for _ in 0..2 {
            let pid = session.allocate_pid().await.unwrap();
            session
                .stage(PendingWrite::Insert {
                    row: row(pid, "dup", 1),
                    indexes: Vec::new(),
                })
                .unwrap();
        }
        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, BackendError::ConstraintViolation { .. }));
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_flushed_writes() {
        let store = SqliteStore::in_memory().unwrap();
        let mut session = store.begin().await.unwrap();
        let pid = session.allocate_pid().await.unwrap();
        session
            .stage(PendingWrite::Insert {
                row: row(pid, "a", 1),
                indexes: Vec::new(),
            })
            .unwrap();
        session.flush().await.unwrap();
        session.rollback().await.unwrap();

        let selection = ChunkSelection::all();
        let ids = store
            .fetch_id_page(IdPageQuery {
                selection: &selection,
                after: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_token_matches_are_partition_qualified_in_sql() {
        let store = SqliteStore::in_memory().unwrap();
        let mut session = store.begin().await.unwrap();
        let a = PartitionId::new(1);
        let mut pids = Vec::new();
        for (id, partition) in [("a", Some(a)), ("b", Some(PartitionId::new(2))), ("c", None)] {
            let pid = session.allocate_pid().await.unwrap();
            let mut stored = row(pid, id, 1);
            stored.partition = partition;
            let mut index = token(pid, 7);
            index.partition = partition;
            session
                .stage(PendingWrite::Insert {
                    row: stored,
                    indexes: vec![index],
                })
                .unwrap();
            pids.push(pid);
        }
        session.commit().await.unwrap();

        // A fresh session has nothing buffered, so every hit comes from the query.
        let mut session = store.begin().await.unwrap();
        let find = |partition: PartitionPredicate| TokenHashPredicate {
            hash: TokenHash::Value(7),
            partition,
        };
        let in_a = session
            .find_token_matches(&[find(PartitionPredicate::In(vec![a]))])
            .await
            .unwrap();
        assert_eq!(in_a.iter().map(|hit| hit.pid).collect::<Vec<_>>(), vec![pids[0]]);

        let default_only = session
            .find_token_matches(&[find(PartitionPredicate::DefaultOnly)])
            .await
            .unwrap();
        assert_eq!(default_only.iter().map(|hit| hit.pid).collect::<Vec<_>>(), vec![pids[2]]);

        let none = session
            .find_token_matches(&[find(PartitionPredicate::In(Vec::new()))])
            .await
            .unwrap();
        assert!(none.is_empty());

        let any = session
            .find_token_matches(&[find(PartitionPredicate::Any)])
            .await
            .unwrap();
        assert_eq!(any.len(), 3);
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_writes_only_changed_index_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let mut session = store.begin().await.unwrap();
        let pid = session.allocate_pid().await.unwrap();
        session
            .stage(PendingWrite::Insert {
                row: row(pid, "a", 1),
                indexes: vec![token(pid, 7), token(pid, 8)],
            })
            .unwrap();
        session.commit().await.unwrap();

        let rows = vec![token(pid, 7), token(pid, 9)];
        let changes = IndexChanges::between(&rows, |category| match category {
            IndexCategory::Token => Some(vec![token(pid, 7), token(pid, 8)]),
            _ => Some(Vec::new()),
        });
        assert_eq!(changes.removed, vec![token(pid, 8)]);
        assert_eq!(changes.added, vec![token(pid, 9)]);

        let mut session = store.begin().await.unwrap();
        session
            .stage(PendingWrite::Update {
                row: row(pid, "a", 2),
                indexes: rows,
                changes,
            })
            .unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        let loaded = session
            .load_resources(&[pid], Some(IndexCategory::Token))
            .await
            .unwrap();
        let mut hashes: Vec<i64> = loaded[0]
            .indexes
            .iter()
            .filter_map(|index| match index.value {
                IndexValue::Token { hash_value, .. } => Some(hash_value),
                _ => None,
            })
            .collect();
        hashes.sort();
        assert_eq!(hashes, vec![7, 9]);
        assert_eq!(loaded[0].row.version, 2);
        session.rollback().await.unwrap();
    }
}
