use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Receiver, Sender},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use serde_json::{Map, Value};

use super::Messenger;
use crate::config::QueuedConfig;

/// A message as handed to the wire transport: scalar headers extracted from
/// the body, plus the JSON-encoded body itself.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub headers: Map<String, Value>,
    pub body: String,
}

/// Blocking delivery of one topic's batch to the external bus.
///
/// Runs only on the messenger's worker thread. Errors are reported back so
/// the worker can log them per batch; they never reach a request thread.
pub trait Transport: Send {
    fn send_batch(&self, topic: &str, batch: &[OutboundMessage]) -> Result<()>;
}

/// Asynchronous messenger with a single background delivery worker.
///
/// `send_messages` groups consecutive messages that share a topic into one
/// batch and pushes the batches onto an unbounded queue, so a bulk change
/// costs one connection per topic group instead of one per message. The
/// worker drains the queue for the life of the process and hands each batch
/// to the [`Transport`]; delivery is at-most-once with no retry, and a failed
/// batch is logged and dropped.
///
/// [`shutdown`](QueuedMessenger::shutdown) (also run on drop) closes the
/// queue and joins the worker, which finishes delivering everything already
/// queued before exiting.
pub struct QueuedMessenger {
    sender: Mutex<Option<Sender<(String, Vec<Value>)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedMessenger {
    pub fn new(topic_prefix: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let (sender, receiver) = channel();
        let prefix = topic_prefix.into();
        let worker = thread::spawn(move || Self::worker_loop(receiver, prefix, transport));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn worker_loop(
        receiver: Receiver<(String, Vec<Value>)>,
        prefix: String,
        transport: Box<dyn Transport>,
    ) {
        // Iteration ends once every sender is dropped and the queue is empty,
        // which is what makes shutdown a flush.
        for (topic, messages) in receiver {
            let topic = format!("{}{}", prefix, topic);
            let batch: Vec<OutboundMessage> = messages
                .iter()
                .map(|message| OutboundMessage {
                    headers: make_headers(message),
                    body: message.to_string(),
                })
                .collect();
            log::info!("Sending {} message(s) to {}", batch.len(), topic);
            if let Err(err) = transport.send_batch(&topic, &batch) {
                log::error!(
                    "Failed to send {} message(s) to {}: {:#}",
                    batch.len(),
                    topic,
                    err
                );
            }
        }
    }

    /// Flush queued batches and stop the delivery worker. Messages sent after
    /// shutdown are dropped with a warning.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("Delivery worker panicked during shutdown");
            }
        }
    }
}

impl Drop for QueuedMessenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Messenger for QueuedMessenger {
    fn send_message(&self, topic: &str, message: Value) {
        self.send_messages(vec![(topic.to_string(), message)]);
    }

    /// Group messages by topic and enqueue each group as one batch.
    ///
    /// Only consecutive messages are grouped, so ordering within the call is
    /// preserved exactly as queued.
    fn send_messages(&self, messages: Vec<(String, Value)>) {
        let sender = self.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            log::warn!(
                "Dropping {} message(s): messenger is shut down",
                messages.len()
            );
            return;
        };
        for group in group_by_topic(messages) {
            if sender.send(group).is_err() {
                log::error!("Delivery worker is gone; dropping batch");
            }
        }
    }
}

/// Collapse consecutive messages that share a topic into (topic, batch)
/// groups, preserving order.
fn group_by_topic(messages: Vec<(String, Value)>) -> Vec<(String, Vec<Value>)> {
    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
    for (topic, message) in messages {
        match groups.last_mut() {
            Some((last_topic, batch)) if *last_topic == topic => batch.push(message),
            _ => groups.push((topic, vec![message])),
        }
    }
    groups
}

/// Extract all scalar values from the message root and its `new_value` object
/// into transport headers. Values under `new_value` get a `DATA:` prefix.
fn make_headers(message: &Value) -> Map<String, Value> {
    let mut headers = Map::new();
    let nested = message.get("new_value").unwrap_or(&Value::Null);
    for (prefix, source) in [("", message), ("DATA:", nested)] {
        if let Value::Object(fields) = source {
            for (key, value) in fields {
                if is_scalar(value) {
                    headers.insert(format!("{}{}", prefix, key), value.clone());
                }
            }
        }
    }
    headers
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Stand-in wire transport that logs each batch instead of delivering it.
/// This is where a real bus client (AMQP, STOMP, ...) plugs in; the config
/// carries the connection material such a client needs.
pub struct LogTransport {
    config: QueuedConfig,
}

impl LogTransport {
    pub fn new(config: QueuedConfig) -> Self {
        Self { config }
    }
}

impl Transport for LogTransport {
    fn send_batch(&self, topic: &str, batch: &[OutboundMessage]) -> Result<()> {
        log::info!(
            "Delivering {} message(s) to {} via {:?}",
            batch.len(),
            topic,
            self.config.urls
        );
        for message in batch {
            log::debug!("{}: {}", topic, message.body);
        }
        Ok(())
    }
}

/// In-memory transport for tests. Records every delivered batch and can be
/// switched into a failing mode to exercise the error-isolation path.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    batches: Arc<Mutex<Vec<(String, Vec<OutboundMessage>)>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(String, Vec<OutboundMessage>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send_batch(&self, topic: &str, batch: &[OutboundMessage]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("transport offline");
        }
        self.batches
            .lock()
            .unwrap()
            .push((topic.to_string(), batch.to_vec()));
        Ok(())
    }
}
