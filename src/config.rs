use std::path::PathBuf;
use std::sync::Arc;

use crate::messenger::{CaptureMessenger, LogMessenger, LogTransport, Messenger, QueuedMessenger};

/// Closed set of messenger backends, chosen once when the process
/// configuration is loaded. The built messenger is handed to the
/// [`Interceptor`](crate::Interceptor) at bootstrap; nothing selects a
/// backend by name at runtime.
///
/// The default is [`Log`](MessengerConfig::Log): a deployment with no
/// message bus configured still starts, it just writes notifications to the
/// log instead of a bus.
#[derive(Clone, Debug, Default)]
pub enum MessengerConfig {
    #[default]
    Log,
    Capture,
    Queued(QueuedConfig),
}

/// Connection material for the queued backend: bus endpoints, the client
/// certificate pair, and the prefix prepended to every topic at delivery.
#[derive(Clone, Debug, Default)]
pub struct QueuedConfig {
    pub urls: Vec<String>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub topic_prefix: String,
}

impl MessengerConfig {
    pub fn build(self) -> Arc<dyn Messenger> {
        match self {
            MessengerConfig::Log => Arc::new(LogMessenger),
            MessengerConfig::Capture => Arc::new(CaptureMessenger::new()),
            MessengerConfig::Queued(config) => {
                let prefix = config.topic_prefix.clone();
                Arc::new(QueuedMessenger::new(prefix, Box::new(LogTransport::new(config))))
            }
        }
    }
}
