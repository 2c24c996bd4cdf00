use std::sync::{Arc, RwLock};

use anyhow::Result;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Handle to the audit database. Cheap to clone; all clones share one
/// connection. Write requests take the write half of the lock for the
/// duration of their transaction, read requests share the read half.
#[derive(Clone)]
pub struct AuditDb {
    pub(crate) conn: Arc<RwLock<Connection>>,
}

impl AuditDb {
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::migrations().to_latest(&mut conn)?;

        Ok(Self {
            conn: Arc::new(RwLock::new(conn)),
        })
    }

    fn migrations() -> Migrations<'static> {
        Migrations::new(vec![M::up(
            "
            CREATE TABLE changeset (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                author       TEXT,
                requested_on INTEGER NOT NULL,
                committed_on INTEGER NOT NULL,
                comment      TEXT
            );

            CREATE TABLE change (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                changeset_id INTEGER NOT NULL REFERENCES changeset(id),
                target_type  TEXT NOT NULL,
                target_id    INTEGER NOT NULL,
                old_value    TEXT NOT NULL,
                new_value    TEXT NOT NULL
            );

            CREATE INDEX idx_change_target ON change(target_type, target_id);
            CREATE INDEX idx_changeset_author ON changeset(author);
            ",
        )])
    }

    pub fn get_changeset(&self, id: i64) -> Result<Option<ChangesetRecord>> {
        Ok(self
            .query("SELECT * FROM changeset WHERE id = ? LIMIT 1", &[&id])?
            .into_iter()
            .next())
    }

    pub fn changes_for_changeset(&self, changeset_id: i64) -> Result<Vec<ChangeRecord>> {
        self.query(
            "SELECT * FROM change WHERE changeset_id = ? ORDER BY id ASC",
            &[&changeset_id],
        )
    }

    /// All recorded changes for one entity, oldest first.
    pub fn changes_for_target(&self, target_type: &str, target_id: i64) -> Result<Vec<ChangeRecord>> {
        self.query(
            "SELECT * FROM change WHERE target_type = ? AND target_id = ? ORDER BY id ASC",
            &[&target_type, &target_id],
        )
    }

    pub fn changesets_by_author(&self, author: &str) -> Result<Vec<ChangesetRecord>> {
        self.query(
            "SELECT * FROM changeset WHERE author = ? ORDER BY id ASC",
            &[&author],
        )
    }

    /// Changesets committed in the inclusive `[from, to]` range of
    /// millisecond timestamps.
    pub fn changesets_between(&self, from: i64, to: i64) -> Result<Vec<ChangesetRecord>> {
        self.query(
            "SELECT * FROM changeset WHERE committed_on >= ? AND committed_on <= ? ORDER BY id ASC",
            &[&from, &to],
        )
    }

    pub fn changesets_with_comment(&self, needle: &str) -> Result<Vec<ChangesetRecord>> {
        let pattern = format!("%{}%", needle);
        self.query(
            "SELECT * FROM changeset WHERE comment LIKE ? ORDER BY id ASC",
            &[&pattern],
        )
    }

    fn query<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>> {
        let conn = self
            .conn
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;
        let mut stmt = conn.prepare(sql)?;
        let records = serde_rusqlite::from_rows::<T>(stmt.query(params)?)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

/// A persisted changeset row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangesetRecord {
    pub id: i64,
    pub author: Option<String>,
    pub requested_on: i64,
    pub committed_on: i64,
    pub comment: Option<String>,
}

impl ChangesetRecord {
    /// Time spent between request start and commit, in milliseconds.
    pub fn duration(&self) -> i64 {
        self.committed_on - self.requested_on
    }
}

/// A persisted change row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub changeset_id: i64,
    pub target_type: String,
    pub target_id: i64,
    pub old_value: String,
    pub new_value: String,
}
