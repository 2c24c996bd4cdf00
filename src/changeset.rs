use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rusqlite::Transaction;

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A single old-value/new-value record for one field of one target entity.
///
/// Values are stored as serialized strings, with the JSON literal `"null"`
/// standing in for "no value" so inserts and deletes can be told apart from
/// updates. Changes are only ever created through [`Changeset::add`], which
/// guarantees `old_value != new_value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub target_type: String,
    pub target_id: i64,
    pub old_value: String,
    pub new_value: String,
}

impl Change {
    /// Check if a change is an insertion.
    pub fn is_insert(&self) -> bool {
        self.old_value == "null" && self.new_value != "null"
    }

    /// Check if a change is a deletion.
    pub fn is_delete(&self) -> bool {
        self.old_value != "null" && self.new_value == "null"
    }

    /// Check if a change is an update.
    pub fn is_update(&self) -> bool {
        self.old_value != "null" && self.new_value != "null"
    }
}

/// Groups the changes made during a single write request.
///
/// Changes added via [`add`](Changeset::add) are not stored immediately. The
/// actual saving is postponed until [`commit`](Changeset::commit) is called,
/// which happens in the interceptor once the request has succeeded, so there
/// is no need to commit from anywhere else. `commit` consumes the changeset,
/// making a double commit impossible.
#[derive(Debug)]
pub struct Changeset {
    author: Option<String>,
    comment: Option<String>,
    requested_on: i64,
    changes: Vec<Change>,
}

impl Changeset {
    /// Open a new changeset, stamping the request start time.
    pub fn open(author: Option<String>, comment: Option<String>) -> Self {
        Self {
            author,
            comment,
            requested_on: now_millis(),
            changes: Vec::new(),
        }
    }

    /// Record a change. The `target_type` and `target_id` specify the object
    /// that was changed, the rest of the arguments give the original and new
    /// value.
    ///
    /// If the old and new values are the same this is a no-op. Logging that
    /// nothing in fact changed is useless.
    pub fn add(&mut self, target_type: &str, target_id: i64, old_value: &str, new_value: &str) {
        if old_value != new_value {
            self.changes.push(Change {
                target_type: target_type.to_lowercase(),
                target_id,
                old_value: old_value.to_string(),
                new_value: new_value.to_string(),
            });
        }
    }

    /// Set the author if it is not known yet. Token-based authentication can
    /// resolve the user after the changeset has already been opened, in which
    /// case the identity is bound late through this method. Calls after the
    /// author is set are ignored.
    pub fn set_author_once(&mut self, author: &str) {
        if self.author.is_none() {
            self.author = Some(author.to_string());
        }
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn requested_on(&self) -> i64 {
        self.requested_on
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Remove all changes from this changeset.
    pub fn reset(&mut self) {
        self.changes.clear();
    }

    /// Commit the changeset into the database within the caller's
    /// transaction. If there are no changes associated with this changeset,
    /// nothing is saved and `None` is returned, so pure-read and no-op
    /// requests leave no audit rows behind.
    ///
    /// The changeset row is written first, then each change in insertion
    /// order. A failure at any point propagates to the caller and aborts the
    /// surrounding transaction, so a partial commit is not possible.
    pub fn commit(self, txn: &Transaction) -> Result<Option<CommittedChangeset>> {
        if self.changes.is_empty() {
            return Ok(None);
        }

        let committed_on = now_millis();
        txn.execute(
            "INSERT INTO changeset (author, requested_on, committed_on, comment)
             VALUES (?, ?, ?, ?)",
            rusqlite::params![self.author, self.requested_on, committed_on, self.comment],
        )?;
        let changeset_id = txn.last_insert_rowid();

        for change in &self.changes {
            txn.execute(
                "INSERT INTO change (changeset_id, target_type, target_id, old_value, new_value)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    changeset_id,
                    change.target_type,
                    change.target_id,
                    change.old_value,
                    change.new_value,
                ],
            )?;
        }

        log::debug!(
            "Committed changeset {} with {} change(s)",
            changeset_id,
            self.changes.len()
        );

        Ok(Some(CommittedChangeset {
            id: changeset_id,
            requested_on: self.requested_on,
            committed_on,
        }))
    }
}

/// Proof that a changeset was persisted, carrying its commit metadata.
#[derive(Clone, Copy, Debug)]
pub struct CommittedChangeset {
    pub id: i64,
    pub requested_on: i64,
    pub committed_on: i64,
}

impl CommittedChangeset {
    /// Time spent between request start and commit, in milliseconds.
    pub fn duration(&self) -> i64 {
        self.committed_on - self.requested_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AuditDb;

    #[test]
    fn add_skips_equal_values() {
        let mut changeset = Changeset::open(None, None);
        changeset.add("Widget", 1, "same", "same");
        changeset.add("Widget", 1, "null", "null");
        assert!(changeset.is_empty());

        changeset.add("Widget", 1, "old", "new");
        assert_eq!(changeset.len(), 1);
    }

    #[test]
    fn add_lowercases_target_type() {
        let mut changeset = Changeset::open(None, None);
        changeset.add("Widget", 7, "a", "b");
        assert_eq!(changeset.changes()[0].target_type, "widget");
    }

    #[test]
    fn reset_clears_pending_changes() {
        let mut changeset = Changeset::open(None, None);
        changeset.add("widget", 1, "a", "b");
        changeset.add("widget", 2, "c", "d");
        changeset.reset();
        assert!(changeset.is_empty());
        // Idempotent.
        changeset.reset();
        assert!(changeset.is_empty());
    }

    #[test]
    fn set_author_once_only_binds_while_unset() {
        let mut changeset = Changeset::open(None, None);
        changeset.set_author_once("alice");
        changeset.set_author_once("bob");
        assert_eq!(changeset.author(), Some("alice"));

        let mut changeset = Changeset::open(Some("carol".to_string()), None);
        changeset.set_author_once("mallory");
        assert_eq!(changeset.author(), Some("carol"));
    }

    #[test]
    fn change_classification() {
        let mut changeset = Changeset::open(None, None);
        changeset.add("widget", 1, "null", "\"a\"");
        changeset.add("widget", 2, "\"a\"", "null");
        changeset.add("widget", 3, "\"a\"", "\"b\"");

        let changes = changeset.changes();
        assert!(changes[0].is_insert());
        assert!(changes[1].is_delete());
        assert!(changes[2].is_update());
        assert!(!changes[2].is_insert());
        assert!(!changes[2].is_delete());
    }

    #[test]
    fn empty_commit_writes_nothing() -> Result<()> {
        let db = AuditDb::open_memory()?;
        let changeset = Changeset::open(Some("alice".to_string()), None);

        {
            let mut conn = db.conn.write().unwrap();
            let txn = conn.transaction()?;
            assert!(changeset.commit(&txn)?.is_none());
            txn.commit()?;
        }

        let conn = db.conn.read().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM changeset", [], |row| row.get(0))?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn commit_persists_changeset_and_changes_in_order() -> Result<()> {
        let db = AuditDb::open_memory()?;
        let mut changeset = Changeset::open(Some("alice".to_string()), Some("bulk edit".to_string()));
        changeset.add("widget", 1, "\"a\"", "\"b\"");
        changeset.add("release", 2, "null", "\"r1\"");

        let committed = {
            let mut conn = db.conn.write().unwrap();
            let txn = conn.transaction()?;
            let committed = changeset.commit(&txn)?.expect("non-empty commit");
            txn.commit()?;
            committed
        };

        assert!(committed.duration() >= 0);

        let record = db.get_changeset(committed.id)?.expect("changeset row");
        assert_eq!(record.author.as_deref(), Some("alice"));
        assert_eq!(record.comment.as_deref(), Some("bulk edit"));
        assert_eq!(record.committed_on, committed.committed_on);

        let changes = db.changes_for_changeset(committed.id)?;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].target_type, "widget");
        assert_eq!(changes[0].old_value, "\"a\"");
        assert_eq!(changes[1].target_type, "release");
        assert!(changes[0].id < changes[1].id);
        Ok(())
    }
}
