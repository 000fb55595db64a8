// SPDX-License-Identifier: MIT OR Apache-2.0
//! An in-process reference dialect.
//!
//! No external AMQP broker client crate appears anywhere in this stack, and
//! the specification treats wire-level dialect bindings as pluggable — only
//! one reference implementation of the adapter contract is required. This
//! dialect keeps that contract real and testable without depending on an
//! external process: connecting to the same `url` from multiple places
//! returns handles to the same shared bus, exactly as connecting twice to
//! the same real broker would.

use crate::{AckHandle, Broker, BrokerError, Connector, Delivery, Destination, ExchangeKind, QueueSpec};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState {
    messages: VecDeque<(u64, Vec<u8>)>,
    in_flight: HashMap<u64, Vec<u8>>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self { messages: VecDeque::new(), in_flight: HashMap::new(), notify: Arc::new(Notify::new()) }
    }
}

struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

/// An in-process broker: exchanges, bindings, and queues all live in
/// memory for the lifetime of the process (or, in tests, for the lifetime
/// of the shared registry entry for a given URL).
pub struct MemoryBroker {
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    bindings: Mutex<Vec<Binding>>,
    queues: Mutex<HashMap<String, QueueState>>,
    next_seq: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            exchanges: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Vec::new()),
            queues: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }
}

impl MemoryBroker {
    fn matches(pattern: &str, routing_key: &str, kind: ExchangeKind) -> bool {
        match kind {
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
        }
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.first() {
            None => key.is_empty(),
            Some(&"#") => {
                if pattern.len() == 1 {
                    return true;
                }
                (0..=key.len()).any(|i| go(&pattern[1..], &key[i..]))
            }
            Some(&"*") => !key.is_empty() && go(&pattern[1..], &key[1..]),
            Some(seg) => key.first() == Some(seg) && go(&pattern[1..], &key[1..]),
        }
    }
    go(&pattern_parts, &key_parts)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
        _auto_delete: bool,
    ) -> Result<(), BrokerError> {
        self.exchanges.lock().unwrap().entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError> {
        self.queues.lock().unwrap().entry(spec.name.clone()).or_insert_with(QueueState::new);
        self.bindings.lock().unwrap().push(Binding {
            exchange: spec.exchange,
            routing_key: spec.routing_key,
            queue: spec.name,
        });
        Ok(())
    }

    async fn send(&self, destination: &Destination, body: Vec<u8>, _ttl: Option<Duration>) -> Result<(), BrokerError> {
        let kind = *self
            .exchanges
            .lock()
            .unwrap()
            .get(&destination.exchange)
            .ok_or_else(|| BrokerError::SendFailed(format!("no such exchange: {}", destination.exchange)))?;

        let targets: Vec<String> = self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.exchange == destination.exchange && Self::matches(&b.routing_key, &destination.routing_key, kind))
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            return Err(BrokerError::SendFailed(format!(
                "no queue bound to {}/{}",
                destination.exchange, destination.routing_key
            )));
        }

        let mut queues = self.queues.lock().unwrap();
        for queue_name in targets {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let queue = queues.entry(queue_name).or_insert_with(QueueState::new);
            queue.messages.push_back((seq, body.clone()));
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn get(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let notify = {
            let mut queues = self.queues.lock().unwrap();
            let state = queues.entry(queue.to_string()).or_insert_with(QueueState::new);
            if let Some((seq, body)) = state.messages.pop_front() {
                state.in_flight.insert(seq, body.clone());
                return Ok(Some(Delivery { body, ack: AckHandle { queue: queue.to_string(), seq } }));
            }
            state.notify.clone()
        };

        let waited = tokio::time::timeout(timeout, notify.notified()).await;
        if waited.is_err() {
            return Ok(None);
        }

        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_insert_with(QueueState::new);
        match state.messages.pop_front() {
            Some((seq, body)) => {
                state.in_flight.insert(seq, body.clone());
                Ok(Some(Delivery { body, ack: AckHandle { queue: queue.to_string(), seq } }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(&handle.queue) {
            state.in_flight.remove(&handle.seq);
        }
        Ok(())
    }

    async fn reject(&self, handle: &AckHandle, requeue: bool) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(&handle.queue) {
            if let Some(body) = state.in_flight.remove(&handle.seq) {
                if requeue {
                    state.messages.push_front((handle.seq, body));
                    state.notify.notify_one();
                }
            }
        }
        Ok(())
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemoryBroker>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<MemoryBroker>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up (or create) the shared [`MemoryBroker`] for `url`. Every
/// connector that connects to the same `url` observes the same bus.
#[must_use]
pub fn shared_broker(url: &str) -> Arc<MemoryBroker> {
    registry().lock().unwrap().entry(url.to_string()).or_insert_with(|| Arc::new(MemoryBroker::default())).clone()
}

/// Drop every registered bus. Intended for test isolation only.
pub fn reset_all() {
    registry().lock().unwrap().clear();
}

/// [`Connector`] for the in-process reference dialect.
#[derive(Default)]
pub struct MemoryConnector;

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(shared_broker(url) as Arc<dyn Broker>)
    }
}
