use serde_json::Value;

use crate::changeset::CommittedChangeset;

/// Per-request buffer of pending outbound notifications.
///
/// Business logic appends (topic, message) pairs at any point while handling
/// a request; nothing is delivered until the interceptor has seen the
/// transaction commit. A request that fails drops its outbox unsent, so
/// observers never hear about work that was rolled back.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<(String, Value)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: impl Into<String>, message: Value) {
        self.messages.push((topic.into(), message));
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Stamp every queued message with the commit metadata and hand the batch
    /// back in queue order. `author` and `comment` are always written (null
    /// when unknown); the changeset id and commit time only when a changeset
    /// was actually persisted. Non-object message bodies are passed through
    /// untouched.
    pub(crate) fn into_annotated(
        self,
        author: Option<&str>,
        comment: Option<&str>,
        committed: Option<&CommittedChangeset>,
    ) -> Vec<(String, Value)> {
        let mut messages = self.messages;
        for (_, message) in messages.iter_mut() {
            let Value::Object(fields) = message else {
                continue;
            };
            fields.insert("author".to_string(), json_string(author));
            fields.insert("comment".to_string(), json_string(comment));
            if let Some(committed) = committed {
                fields.insert("changeset_id".to_string(), committed.id.into());
                fields.insert("committed_on".to_string(), committed.committed_on.into());
            }
        }
        messages
    }
}

fn json_string(value: Option<&str>) -> Value {
    match value {
        Some(value) => Value::String(value.to_string()),
        None => Value::Null,
    }
}
