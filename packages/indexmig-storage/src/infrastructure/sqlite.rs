//! SQLite catalog
//!
//! File-based durable storage for indexes, versions and actions.
//! Multi-row changes run inside one transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{
    ActionKind, ActionStatus, CatalogStore, Index, IndexAction, IndexVersion, NewVersion,
    VersionKey, VersionState,
};
use crate::{Result, StorageError};

const VERSION_COLUMNS: &str = "index_name, sequence, prefix, fingerprint, schema_json, tag,
     created_at, state, last_successful_update, last_attempted_update, doc_count,
     cleared_at, deleted_at";

const ACTION_COLUMNS: &str = "id, kind, index_name, version_index, version_sequence, parent,
     status, context, started_at, heartbeat_at, finished_at, docs_affected, log, payload,
     environment";

const INDEX_COLUMNS: &str = "name, last_sequence, created_at";

/// SQLite-based `CatalogStore`
#[derive(Clone)]
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    /// Open (or create) a catalog database at the given path
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite catalog (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS indexes (
                name TEXT PRIMARY KEY,
                last_sequence INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        // One row per (index, environment) with an active version
        conn.execute(
            "CREATE TABLE IF NOT EXISTS active_versions (
                index_name TEXT NOT NULL,
                prefix TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                PRIMARY KEY (index_name, prefix),
                FOREIGN KEY (index_name) REFERENCES indexes(name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS index_versions (
                index_name TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                prefix TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                tag TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                state TEXT NOT NULL,
                last_successful_update INTEGER,
                last_attempted_update INTEGER,
                doc_count INTEGER NOT NULL DEFAULT 0,
                cleared_at INTEGER,
                deleted_at INTEGER,
                PRIMARY KEY (index_name, sequence),
                FOREIGN KEY (index_name) REFERENCES indexes(name)
            )",
            [],
        )?;

        // No foreign keys here: actions outlive the versions they reference
        conn.execute(
            "CREATE TABLE IF NOT EXISTS index_actions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                index_name TEXT,
                version_index TEXT,
                version_sequence INTEGER,
                parent TEXT,
                status TEXT NOT NULL,
                context TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                heartbeat_at INTEGER NOT NULL,
                finished_at INTEGER,
                docs_affected INTEGER NOT NULL DEFAULT 0,
                log TEXT NOT NULL,
                payload TEXT NOT NULL,
                environment TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_actions_target
             ON index_actions(index_name, version_sequence, started_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_actions_status
             ON index_actions(status)",
            [],
        )?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = StorageError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_micros))
}

fn index_from_row(row: &Row<'_>) -> rusqlite::Result<Index> {
    Ok(Index {
        name: row.get(0)?,
        active: BTreeMap::new(),
        last_sequence: row.get(1)?,
        created_at: from_micros(row.get(2)?),
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<IndexVersion> {
    Ok(IndexVersion {
        key: VersionKey::new(row.get::<_, String>(0)?, row.get(1)?),
        prefix: row.get(2)?,
        fingerprint: row.get(3)?,
        schema_json: json_column(row, 4)?,
        tag: row.get(5)?,
        created_at: from_micros(row.get(6)?),
        state: parse_column::<VersionState>(row, 7)?,
        last_successful_update: opt_time(row, 8)?,
        last_attempted_update: opt_time(row, 9)?,
        doc_count: row.get::<_, i64>(10)?.max(0) as u64,
        cleared_at: opt_time(row, 11)?,
        deleted_at: opt_time(row, 12)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<IndexAction> {
    let id: String = row.get(0)?;
    let version_index: Option<String> = row.get(3)?;
    let version_sequence: Option<u32> = row.get(4)?;
    let parent: Option<String> = row.get(5)?;

    Ok(IndexAction {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        kind: parse_column::<ActionKind>(row, 1)?,
        index: row.get(2)?,
        version: version_index
            .zip(version_sequence)
            .map(|(index, sequence)| VersionKey::new(index, sequence)),
        parent: parent
            .map(|p| Uuid::parse_str(&p))
            .transpose()
            .map_err(|e| conversion_error(5, e))?,
        status: parse_column::<ActionStatus>(row, 6)?,
        context: row.get(7)?,
        started_at: from_micros(row.get(8)?),
        heartbeat_at: from_micros(row.get(9)?),
        finished_at: opt_time(row, 10)?,
        docs_affected: row.get::<_, i64>(11)?.max(0) as u64,
        log: json_column(row, 12)?,
        payload: json_column(row, 13)?,
        environment: row.get(14)?,
    })
}

fn attach_pointers(conn: &Connection, index: &mut Index) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT prefix, sequence FROM active_versions WHERE index_name = ?1")?;
    let pointers = stmt
        .query_map(params![&index.name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    index.active = pointers;
    Ok(())
}

fn load_index(conn: &Connection, name: &str) -> Result<Option<Index>> {
    let sql = format!("SELECT {} FROM indexes WHERE name = ?1", INDEX_COLUMNS);
    let index = conn
        .query_row(&sql, params![name], index_from_row)
        .optional()?;
    match index {
        Some(mut index) => {
            attach_pointers(conn, &mut index)?;
            Ok(Some(index))
        }
        None => Ok(None),
    }
}

/// Refuse state changes the lifecycle does not allow
fn check_transition(stored: &IndexVersion, to: VersionState) -> Result<()> {
    if stored.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::invalid_transition(&stored.key, stored.state, to))
    }
}

fn write_version(conn: &Connection, version: &IndexVersion) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE index_versions
         SET state = ?3, last_successful_update = ?4, last_attempted_update = ?5,
             doc_count = ?6, cleared_at = ?7, deleted_at = ?8
         WHERE index_name = ?1 AND sequence = ?2",
        params![
            &version.key.index,
            version.key.sequence,
            version.state.as_str(),
            version.last_successful_update.map(to_micros),
            version.last_attempted_update.map(to_micros),
            version.doc_count as i64,
            version.cleared_at.map(to_micros),
            version.deleted_at.map(to_micros),
        ],
    )?;
    Ok(changed)
}

fn load_version(conn: &Connection, key: &VersionKey) -> Result<Option<IndexVersion>> {
    let sql = format!(
        "SELECT {} FROM index_versions WHERE index_name = ?1 AND sequence = ?2",
        VERSION_COLUMNS
    );
    let version = conn
        .query_row(&sql, params![&key.index, key.sequence], version_from_row)
        .optional()?;
    Ok(version)
}

fn load_actions(conn: &Connection, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<IndexAction>> {
    let sql = format!(
        "SELECT {} FROM index_actions {} ORDER BY started_at ASC",
        ACTION_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let actions = stmt
        .query_map(args, action_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(actions)
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn get_or_create_index(&self, name: &str) -> Result<Index> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO indexes (name, last_sequence, created_at) VALUES (?1, 0, ?2)",
            params![name, to_micros(Utc::now())],
        )?;
        load_index(&conn, name)?.ok_or_else(|| StorageError::index_not_found(name))
    }

    async fn get_index(&self, name: &str) -> Result<Option<Index>> {
        let conn = self.conn.lock();
        load_index(&conn, name)
    }

    async fn list_indexes(&self) -> Result<Vec<Index>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM indexes ORDER BY name", INDEX_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut indexes = stmt
            .query_map([], index_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for index in &mut indexes {
            attach_pointers(&conn, index)?;
        }
        Ok(indexes)
    }

    async fn allocate_version(&self, new: NewVersion) -> Result<IndexVersion> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO indexes (name, last_sequence, created_at) VALUES (?1, 0, ?2)",
            params![&new.index, to_micros(Utc::now())],
        )?;
        tx.execute(
            "UPDATE indexes SET last_sequence = last_sequence + 1 WHERE name = ?1",
            params![&new.index],
        )?;
        let sequence: u32 = tx.query_row(
            "SELECT last_sequence FROM indexes WHERE name = ?1",
            params![&new.index],
            |row| row.get(0),
        )?;

        let version = new.into_version(sequence);
        tx.execute(
            "INSERT INTO index_versions (index_name, sequence, prefix, fingerprint, schema_json,
                 tag, created_at, state, doc_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                &version.key.index,
                version.key.sequence,
                &version.prefix,
                &version.fingerprint,
                serde_json::to_string(&version.schema_json)?,
                &version.tag,
                to_micros(version.created_at),
                version.state.as_str(),
            ],
        )?;

        tx.commit()?;
        Ok(version)
    }

    async fn get_version(&self, key: &VersionKey) -> Result<Option<IndexVersion>> {
        let conn = self.conn.lock();
        load_version(&conn, key)
    }

    async fn list_versions(&self, index: &str) -> Result<Vec<IndexVersion>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM index_versions WHERE index_name = ?1 ORDER BY sequence ASC",
            VERSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![index], version_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    async fn update_version(&self, version: &IndexVersion) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let stored = load_version(&tx, &version.key)?
            .ok_or_else(|| StorageError::version_not_found(&version.key))?;
        check_transition(&stored, version.state)?;
        write_version(&tx, version)?;

        tx.commit()?;
        Ok(())
    }

    async fn set_active_version(
        &self,
        index: &str,
        prefix: &str,
        sequence: Option<u32>,
    ) -> Result<Option<u32>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let known: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM indexes WHERE name = ?1)",
            params![index],
            |row| row.get(0),
        )?;
        if !known {
            return Err(StorageError::index_not_found(index));
        }

        let previous: Option<u32> = tx
            .query_row(
                "SELECT sequence FROM active_versions WHERE index_name = ?1 AND prefix = ?2",
                params![index, prefix],
                |row| row.get(0),
            )
            .optional()?;

        match sequence {
            Some(seq) => {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM index_versions
                     WHERE index_name = ?1 AND sequence = ?2 AND prefix = ?3)",
                    params![index, seq, prefix],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(StorageError::version_not_found(format!(
                        "{}{}",
                        prefix,
                        VersionKey::new(index, seq)
                    )));
                }
                tx.execute(
                    "INSERT INTO active_versions (index_name, prefix, sequence) VALUES (?1, ?2, ?3)
                     ON CONFLICT (index_name, prefix) DO UPDATE SET sequence = excluded.sequence",
                    params![index, prefix, seq],
                )?;
            }
            None => {
                tx.execute(
                    "DELETE FROM active_versions WHERE index_name = ?1 AND prefix = ?2",
                    params![index, prefix],
                )?;
            }
        }

        tx.commit()?;
        Ok(previous)
    }

    async fn mark_dropped(&self, key: &VersionKey, at: DateTime<Utc>) -> Result<IndexVersion> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut version =
            load_version(&tx, key)?.ok_or_else(|| StorageError::version_not_found(key))?;
        if version.is_dropped() {
            return Err(StorageError::invalid_transition(
                key,
                version.state,
                VersionState::Dropped,
            ));
        }
        version.state = VersionState::Dropped;
        version.deleted_at = Some(at);
        write_version(&tx, &version)?;

        tx.execute(
            "DELETE FROM active_versions WHERE index_name = ?1 AND sequence = ?2",
            params![&key.index, key.sequence],
        )?;
        tx.commit()?;
        Ok(version)
    }

    async fn delete_version(&self, key: &VersionKey) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM index_versions WHERE index_name = ?1 AND sequence = ?2",
            params![&key.index, key.sequence],
        )?;
        if removed == 0 {
            return Err(StorageError::version_not_found(key));
        }
        tx.execute(
            "DELETE FROM active_versions WHERE index_name = ?1 AND sequence = ?2",
            params![&key.index, key.sequence],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn insert_action(&self, action: &IndexAction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO index_actions (id, kind, index_name, version_index, version_sequence,
                 parent, status, context, started_at, heartbeat_at, finished_at, docs_affected,
                 log, payload, environment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                action.id.to_string(),
                action.kind.as_str(),
                &action.index,
                action.version.as_ref().map(|v| v.index.clone()),
                action.version.as_ref().map(|v| v.sequence),
                action.parent.map(|p| p.to_string()),
                action.status.as_str(),
                &action.context,
                to_micros(action.started_at),
                to_micros(action.heartbeat_at),
                action.finished_at.map(to_micros),
                action.docs_affected as i64,
                serde_json::to_string(&action.log)?,
                serde_json::to_string(&action.payload)?,
                &action.environment,
            ],
        )?;
        Ok(())
    }

    async fn update_action(&self, action: &IndexAction) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT status FROM index_actions WHERE id = ?1",
                params![action.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let status: ActionStatus = stored
            .ok_or_else(|| StorageError::action_not_found(action.id))?
            .parse()?;
        if status.is_terminal() {
            return Err(StorageError::action_finalized(action.id, status));
        }

        tx.execute(
            "UPDATE index_actions
             SET status = ?2, heartbeat_at = ?3, finished_at = ?4, docs_affected = ?5,
                 log = ?6, payload = ?7
             WHERE id = ?1",
            params![
                action.id.to_string(),
                action.status.as_str(),
                to_micros(action.heartbeat_at),
                action.finished_at.map(to_micros),
                action.docs_affected as i64,
                serde_json::to_string(&action.log)?,
                serde_json::to_string(&action.payload)?,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_action(&self, id: Uuid) -> Result<IndexAction> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM index_actions WHERE id = ?1", ACTION_COLUMNS);
        conn.query_row(&sql, params![id.to_string()], action_from_row)
            .optional()?
            .ok_or_else(|| StorageError::action_not_found(id))
    }

    async fn latest_action_for(
        &self,
        index: &str,
        version: Option<&VersionKey>,
    ) -> Result<Option<IndexAction>> {
        let conn = self.conn.lock();
        let action = match version {
            Some(key) => {
                let sql = format!(
                    "SELECT {} FROM index_actions
                     WHERE index_name = ?1 AND version_index = ?2 AND version_sequence = ?3
                     ORDER BY started_at DESC LIMIT 1",
                    ACTION_COLUMNS
                );
                conn.query_row(&sql, params![index, &key.index, key.sequence], action_from_row)
                    .optional()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM index_actions WHERE index_name = ?1
                     ORDER BY started_at DESC LIMIT 1",
                    ACTION_COLUMNS
                );
                conn.query_row(&sql, params![index], action_from_row)
                    .optional()?
            }
        };
        Ok(action)
    }

    async fn actions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IndexAction>> {
        let conn = self.conn.lock();
        load_actions(
            &conn,
            "WHERE started_at >= ?1 AND started_at <= ?2",
            &[&to_micros(from), &to_micros(to)],
        )
    }

    async fn in_progress_actions(&self) -> Result<Vec<IndexAction>> {
        let conn = self.conn.lock();
        load_actions(
            &conn,
            "WHERE status = ?1",
            &[&ActionStatus::InProgress.as_str()],
        )
    }

    async fn purge_environment(&self, prefix: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM index_actions WHERE environment = ?1",
            params![prefix],
        )?;
        tx.execute("DELETE FROM active_versions WHERE prefix = ?1", params![prefix])?;
        tx.execute("DELETE FROM index_versions WHERE prefix = ?1", params![prefix])?;
        tx.execute(
            "DELETE FROM active_versions
             WHERE index_name NOT IN (SELECT DISTINCT index_name FROM index_versions)",
            [],
        )?;
        tx.execute(
            "DELETE FROM indexes
             WHERE name NOT IN (SELECT DISTINCT index_name FROM index_versions)",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }
}
