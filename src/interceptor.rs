use std::cell::RefCell;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::Connection;
use serde_json::Value;

use crate::changeset::{Changeset, CommittedChangeset};
use crate::db::AuditDb;
use crate::messenger::Messenger;
use crate::outbox::Outbox;
use crate::request::{Request, Response};

/// Per-request coordinator binding the transaction lifecycle to changeset
/// commit/rollback and post-commit notification delivery.
///
/// Constructed once at process bootstrap with the database and the configured
/// messenger, then shared by every request handler. For each write request it
/// guarantees that exactly one of commit or rollback happens, and that the
/// outbox is flushed only after the transaction has durably committed.
pub struct Interceptor {
    db: AuditDb,
    messenger: Arc<dyn Messenger>,
}

impl Interceptor {
    pub fn new(db: AuditDb, messenger: Arc<dyn Messenger>) -> Self {
        Self { db, messenger }
    }

    pub fn db(&self) -> &AuditDb {
        &self.db
    }

    /// Run `handler` for `request` with the lifecycle the method calls for.
    ///
    /// Read-only methods get shared database access and no changeset. All
    /// other methods run inside a transaction with an open changeset; the
    /// outcome decides between commit and rollback:
    ///
    /// - handler returns `Err`: the error is logged with the request context,
    ///   the transaction is rolled back, and the error is returned unchanged.
    /// - handler returns an error response (status >= 400): the changeset is
    ///   reset and the transaction rolled back, undoing every write the
    ///   handler made; the response still goes back to the caller.
    /// - otherwise: the changeset commits inside the same transaction, the
    ///   transaction commits, and the outbox is flushed to the messenger with
    ///   the commit metadata stamped onto each message.
    pub fn handle<F>(&self, request: &Request, handler: F) -> Result<Response>
    where
        F: FnOnce(&RequestScope) -> Result<Response>,
    {
        if request.method.is_read_only() {
            self.handle_read(request, handler)
        } else {
            self.handle_write(request, handler)
        }
    }

    fn handle_read<F>(&self, request: &Request, handler: F) -> Result<Response>
    where
        F: FnOnce(&RequestScope) -> Result<Response>,
    {
        log::debug!(
            "Start query request {} on {} {}",
            request.id,
            request.method.as_str(),
            request.path
        );

        let conn = self
            .db
            .conn
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock"))?;

        let outbox_cell = RefCell::new(Outbox::new());
        let scope = RequestScope {
            conn: &*conn,
            changeset: None,
            outbox: &outbox_cell,
        };
        let result = handler(&scope);
        drop(scope);
        let outbox = outbox_cell.into_inner();

        match result {
            Err(err) => {
                log::error!(
                    "Handler failed on {} {} ({}): {:#}",
                    request.method.as_str(),
                    request.path,
                    request.id,
                    err
                );
                Err(err)
            }
            Ok(response) if response.is_error() => Ok(response),
            Ok(response) => {
                // Release the lock before handing off to the messenger.
                drop(conn);
                self.flush_outbox(request, request.user.clone(), outbox, None);
                Ok(response)
            }
        }
    }

    fn handle_write<F>(&self, request: &Request, handler: F) -> Result<Response>
    where
        F: FnOnce(&RequestScope) -> Result<Response>,
    {
        log::debug!(
            "Start write request {} on {} {}",
            request.id,
            request.method.as_str(),
            request.path
        );

        let mut conn = self
            .db
            .conn
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock"))?;
        let txn = conn.transaction()?;

        let changeset_cell = RefCell::new(Changeset::open(
            request.user.clone(),
            request.comment.clone(),
        ));
        let outbox_cell = RefCell::new(Outbox::new());
        let scope = RequestScope {
            conn: &*txn,
            changeset: Some(&changeset_cell),
            outbox: &outbox_cell,
        };
        let result = handler(&scope);
        drop(scope);
        let mut changeset = changeset_cell.into_inner();
        let outbox = outbox_cell.into_inner();

        match result {
            Err(err) => {
                log::error!(
                    "Handler failed on {} {} ({}): {:#}",
                    request.method.as_str(),
                    request.path,
                    request.id,
                    err
                );
                // Dropping the transaction rolls back every write made during
                // the request; the outbox is discarded unsent.
                Err(err)
            }
            Ok(response) if response.is_error() => {
                changeset.reset();
                txn.rollback()?;
                Ok(response)
            }
            Ok(response) => {
                let author = changeset
                    .author()
                    .map(str::to_string)
                    .or_else(|| request.user.clone());
                let committed = changeset.commit(&txn)?;
                txn.commit()?;
                // Release the write lock before handing off to the messenger.
                drop(conn);
                self.flush_outbox(request, author, outbox, committed.as_ref());
                Ok(response)
            }
        }
    }

    fn flush_outbox(
        &self,
        request: &Request,
        author: Option<String>,
        outbox: Outbox,
        committed: Option<&CommittedChangeset>,
    ) {
        if outbox.is_empty() {
            return;
        }
        let messages =
            outbox.into_annotated(author.as_deref(), request.comment.as_deref(), committed);
        log::debug!(
            "Flushing {} notification(s) for request {}",
            messages.len(),
            request.id
        );
        self.messenger.send_messages(messages);
    }
}

/// What a handler sees while its request is being processed: the database
/// connection (the open transaction for write requests), the changeset, and
/// the notification outbox.
pub struct RequestScope<'a> {
    conn: &'a Connection,
    changeset: Option<&'a RefCell<Changeset>>,
    outbox: &'a RefCell<Outbox>,
}

impl<'a> RequestScope<'a> {
    /// The connection to run business reads and writes on. For write
    /// requests this is the open transaction, so everything done here is
    /// undone by a rollback.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Record a field-level change for the audit trail. Equal old and new
    /// values are not recorded. On a read-only request there is no changeset
    /// and the record is dropped with a warning.
    pub fn record_change(&self, target_type: &str, target_id: i64, old_value: &str, new_value: &str) {
        match self.changeset {
            Some(changeset) => changeset
                .borrow_mut()
                .add(target_type, target_id, old_value, new_value),
            None => log::warn!(
                "Ignoring change record for {} {} outside a write request",
                target_type,
                target_id
            ),
        }
    }

    /// Bind the authenticated user after the fact. Token authentication can
    /// resolve the user mid-request, after the changeset was opened; the
    /// first call wins and later calls are ignored.
    pub fn set_author(&self, author: &str) {
        if let Some(changeset) = self.changeset {
            changeset.borrow_mut().set_author_once(author);
        }
    }

    /// Queue a notification for delivery after the request succeeds.
    pub fn notify(&self, topic: &str, message: Value) {
        self.outbox.borrow_mut().add(topic, message);
    }

    pub fn pending_changes(&self) -> usize {
        self.changeset.map(|c| c.borrow().len()).unwrap_or(0)
    }

    /// Whether this request runs on the changeset/write path.
    pub fn has_changeset(&self) -> bool {
        self.changeset.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use serde_json::json;

    #[test]
    fn read_request_has_no_changeset() -> Result<()> {
        let db = AuditDb::open_memory()?;
        let messenger = Arc::new(crate::messenger::CaptureMessenger::new());
        let interceptor = Interceptor::new(db, messenger);

        let request = Request::new(Method::Get, "/widgets/7");
        let response = interceptor.handle(&request, |scope| {
            assert!(!scope.has_changeset());
            assert_eq!(scope.pending_changes(), 0);
            // Dropped with a warning, not recorded anywhere.
            scope.record_change("widget", 7, "\"a\"", "\"b\"");
            Ok(Response::ok(json!({"id": 7})))
        })?;

        assert_eq!(response.status, 200);
        let count: i64 = {
            let conn = interceptor.db().conn.read().unwrap();
            conn.query_row("SELECT COUNT(*) FROM changeset", [], |row| row.get(0))?
        };
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn write_request_commits_changeset() -> Result<()> {
        let db = AuditDb::open_memory()?;
        let messenger = Arc::new(crate::messenger::CaptureMessenger::new());
        let interceptor = Interceptor::new(db.clone(), messenger);

        let request = Request::new(Method::Post, "/widgets").with_user("alice");
        interceptor.handle(&request, |scope| {
            assert!(scope.has_changeset());
            scope.record_change("Widget", 7, "null", "\"a\"");
            Ok(Response::new(201, json!({"id": 7})))
        })?;

        let changesets = db.changesets_by_author("alice")?;
        assert_eq!(changesets.len(), 1);
        let changes = db.changes_for_changeset(changesets[0].id)?;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].target_type, "widget");
        Ok(())
    }

    #[test]
    fn late_bound_author_lands_on_the_changeset() -> Result<()> {
        let db = AuditDb::open_memory()?;
        let messenger = Arc::new(crate::messenger::CaptureMessenger::new());
        let interceptor = Interceptor::new(db.clone(), messenger);

        // No user known at request start, as with token authentication.
        let request = Request::new(Method::Post, "/widgets");
        interceptor.handle(&request, |scope| {
            scope.set_author("token-user");
            scope.record_change("widget", 1, "null", "\"a\"");
            Ok(Response::new(201, json!({})))
        })?;

        assert_eq!(db.changesets_by_author("token-user")?.len(), 1);
        Ok(())
    }
}
