mod capture_messenger;
mod log_messenger;
mod messenger;
mod queued_messenger;

pub use capture_messenger::{CaptureListener, CaptureMessenger};
pub use log_messenger::LogMessenger;
pub use messenger::Messenger;
pub use queued_messenger::{LogTransport, MemoryTransport, OutboundMessage, QueuedMessenger, Transport};
