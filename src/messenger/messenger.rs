use serde_json::Value;

/// A delivery backend for outbound notifications.
///
/// Implementations must provide `send_message`; `send_messages` falls back to
/// sending one at a time and should be overridden when the backend can do
/// better. Delivery happens after the HTTP response is already on its way, so
/// neither method returns an error: a backend that can fail is expected to
/// log and swallow the failure rather than surface it to a caller that can no
/// longer do anything about it.
pub trait Messenger: Send + Sync {
    fn send_message(&self, topic: &str, message: Value);

    /// Send multiple messages in queue order.
    fn send_messages(&self, messages: Vec<(String, Value)>) {
        for (topic, message) in messages {
            self.send_message(&topic, message);
        }
    }
}
