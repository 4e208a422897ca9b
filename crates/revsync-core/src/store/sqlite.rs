//! SQLite-backed row store for state that must survive restarts.
//!
//! Runtime defaults follow the projection database conventions:
//! - `journal_mode = WAL` so readers are not blocked by the sync worker
//! - `busy_timeout = 5s` to ride out short lock contention
//!
//! All rows live in one `rows(tbl, id, body)` table; `body` is the row's
//! JSON object. Batches passed to [`RowStore::apply`] run in a single
//! transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params, types::Type};
use tracing::debug;

use super::{RowStore, RowWrite, StoreError};
use crate::model::Row;

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rows (
    tbl TEXT NOT NULL CHECK (length(tbl) > 0),
    id TEXT NOT NULL CHECK (length(id) > 0),
    body TEXT NOT NULL,
    PRIMARY KEY (tbl, id)
) WITHOUT ROWID;
";

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL)];

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a store file, apply pragmas and migrate.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, connection or migration fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot create the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        configure_connection(&conn)?;
        let version = migrate(&mut conn)?;
        debug!(version, "opened sqlite row store");
        Ok(Self { conn })
    }

    /// Current `PRAGMA user_version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be read.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(current_schema_version(&self.conn)?)
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        current = *version;
    }
    Ok(current)
}

fn decode(table: &str, id: &str, body: &str) -> Result<Row, StoreError> {
    serde_json::from_str(body).map_err(|source| StoreError::Codec {
        table: table.to_string(),
        id: id.to_string(),
        source,
    })
}

fn encode(table: &str, id: &str, row: &Row) -> Result<String, StoreError> {
    serde_json::to_string(row).map_err(|source| StoreError::Codec {
        table: table.to_string(),
        id: id.to_string(),
        source,
    })
}

fn write_in(conn: &Connection, write: &RowWrite) -> Result<(), StoreError> {
    match write {
        RowWrite::Set { table, id, row } => {
            let body = encode(table, id, row)?;
            conn.execute(
                "INSERT INTO rows (tbl, id, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT (tbl, id) DO UPDATE SET body = excluded.body",
                params![table, id, body],
            )?;
        }
        RowWrite::Delete { table, id } => {
            conn.execute("DELETE FROM rows WHERE tbl = ?1 AND id = ?2", params![table, id])?;
        }
    }
    Ok(())
}

impl RowStore for SqliteStore {
    fn get_row(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM rows WHERE tbl = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| decode(table, id, &body)).transpose()
    }

    fn set_row(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError> {
        write_in(&self.conn, &RowWrite::set(table, id, row))
    }

    fn del_row(&mut self, table: &str, id: &str) -> Result<(), StoreError> {
        write_in(&self.conn, &RowWrite::delete(table, id))
    }

    fn get_table(&self, table: &str) -> Result<BTreeMap<String, Row>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM rows WHERE tbl = ?1 ORDER BY id")?;
        let raw = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(id, body)| {
                let row = decode(table, &id, &body)?;
                Ok((id, row))
            })
            .collect()
    }

    fn apply(&mut self, writes: Vec<RowWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for write in &writes {
            write_in(&tx, write)?;
        }
        tx.commit()?;
        Ok(())
    }
}
