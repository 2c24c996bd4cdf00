use serde_json::Value;

use super::Messenger;

/// Synchronous messenger that writes every message to the log and performs no
/// external I/O. This is the default backend when no message bus is
/// configured; it never fails the request.
#[derive(Debug, Default)]
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn send_message(&self, topic: &str, message: Value) {
        log::info!("Sending to {}:\n{:#}", topic, message);
    }
}
