use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::Messenger;

type MessageLog = Arc<Mutex<Vec<(String, Value)>>>;

/// In-memory messenger for tests. Messages are appended to every listener
/// attached at the time of sending.
///
/// ```
/// use changeset_db::{CaptureMessenger, Messenger};
///
/// let messenger = CaptureMessenger::new();
/// let listener = messenger.listen();
/// messenger.send_message("widget.added", serde_json::json!({"id": 1}));
/// assert_eq!(listener.messages().len(), 1);
/// // Dropping the listener detaches it.
/// ```
#[derive(Default)]
pub struct CaptureMessenger {
    listeners: Arc<Mutex<Vec<MessageLog>>>,
}

impl CaptureMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener. It records every message sent until it is dropped.
    pub fn listen(&self) -> CaptureListener {
        let messages: MessageLog = Arc::new(Mutex::new(Vec::new()));
        self.listeners.lock().unwrap().push(messages.clone());
        CaptureListener {
            registry: self.listeners.clone(),
            messages,
        }
    }
}

impl Messenger for CaptureMessenger {
    fn send_message(&self, topic: &str, message: Value) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener
                .lock()
                .unwrap()
                .push((topic.to_string(), message.clone()));
        }
    }
}

/// Scoped listener registration; detaches itself from the messenger on drop.
pub struct CaptureListener {
    registry: Arc<Mutex<Vec<MessageLog>>>,
    messages: MessageLog,
}

impl CaptureListener {
    /// Snapshot of the messages captured so far, in send order.
    pub fn messages(&self) -> Vec<(String, Value)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Drop for CaptureListener {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap()
            .retain(|log| !Arc::ptr_eq(log, &self.messages));
    }
}
