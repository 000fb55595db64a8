// SPDX-License-Identifier: MIT OR Apache-2.0
//! The broker adapter: a minimal, dialect-agnostic contract for talking to
//! an AMQP-family message bus, plus one reference dialect.
//!
//! A real deployment plugs in a dialect for its actual broker (RabbitMQ,
//! Qpid, ActiveMQ, ...); this crate fixes the contract every dialect must
//! satisfy ([`Broker`]) and ships an in-process [`memory`] dialect that
//! implements it faithfully, suitable for single-host deployments and for
//! the test suite. [`SessionPool`] wraps whichever dialect is configured
//! with a reliability policy: a lost connection is retried forever, any
//! other failure is returned to the caller immediately.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues bound with an exact routing key match.
    Direct,
    /// Routes to queues bound with a `*`/`#` wildcard pattern match.
    Topic,
}

/// Where an outbound message is addressed.
#[derive(Debug, Clone)]
pub struct Destination {
    /// Exchange name.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
}

/// A queue to declare and bind.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Exchange to bind to.
    pub exchange: String,
    /// Binding routing key (or pattern, for a topic exchange).
    pub routing_key: String,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Whether the queue is deleted once its last consumer disconnects.
    pub auto_delete: bool,
    /// Whether the queue may only be consumed by one connection.
    pub exclusive: bool,
}

/// A message delivered from a queue, along with the handle needed to
/// acknowledge or reject it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Raw message body.
    pub body: Vec<u8>,
    /// Handle for [`Broker::ack`] / [`Broker::reject`].
    pub ack: AckHandle,
}

/// An opaque handle identifying one delivered, not-yet-acked message.
#[derive(Debug, Clone)]
pub struct AckHandle {
    /// The queue the message was delivered from.
    pub queue: String,
    /// Dialect-assigned sequence number, unique within the queue.
    pub seq: u64,
}

/// Failure modes a [`Broker`] implementation can report.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The connection to the broker was lost. The reliability wrapper
    /// treats this as transient and retries forever.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    /// A send could not be delivered for a reason other than connection
    /// loss (e.g. no queue bound to the destination).
    #[error("broker send failed: {0}")]
    SendFailed(String),
    /// Any other adapter-level failure.
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// `true` for [`BrokerError::ConnectionLost`] — the only variant the
    /// reliability wrapper retries indefinitely.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// A connected broker session. One dialect implementation of this trait is
/// the reference contract every real transport binding must satisfy.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange, creating it if absent.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue and bind it per `spec`.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError>;

    /// Publish `body` to `destination`. `ttl`, if set, bounds how long an
    /// unconsumed message may sit in a bound queue.
    async fn send(
        &self,
        destination: &Destination,
        body: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next message on `queue`. `None` means
    /// the wait elapsed with nothing delivered.
    async fn get(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge successful processing of a delivered message.
    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError>;

    /// Reject a delivered message. `requeue` controls whether the broker
    /// makes it available for redelivery or drops it.
    async fn reject(&self, handle: &AckHandle, requeue: bool) -> Result<(), BrokerError>;
}

/// Establishes a [`Broker`] session for a given connection URL. Each
/// dialect module provides one implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`, returning a session ready for use.
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Wraps a [`Connector`] with connection reuse and the reliability policy:
/// every operation that fails with [`BrokerError::ConnectionLost`] causes
/// the session to be dropped and reconnected, then retried, without limit.
/// Any other error is returned to the caller on the first attempt.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<String, Arc<dyn Broker>>>,
    backoff: rmi_retry::BackoffPolicy,
}

impl SessionPool {
    /// Build a pool around `connector`, retrying lost connections per
    /// `backoff`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, backoff: rmi_retry::BackoffPolicy) -> Self {
        Self { connector, sessions: Mutex::new(HashMap::new()), backoff }
    }

    async fn session(&self, url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(url) {
            return Ok(session.clone());
        }
        let session = self.connector.connect(url).await?;
        sessions.insert(url.to_string(), session.clone());
        Ok(session)
    }

    /// Drop the cached session for `url`, forcing the next operation to
    /// reconnect.
    pub async fn invalidate(&self, url: &str) {
        self.sessions.lock().await.remove(url);
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut(Arc<dyn Broker>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        rmi_retry::retry_forever(
            &self.backoff,
            |e: &BrokerError| e.is_connection_loss(),
            || async {
                let session = match self.session(url).await {
                    Ok(s) => s,
                    Err(e) => return Err(e),
                };
                let result = op(session).await;
                if let Err(e) = &result {
                    if e.is_connection_loss() {
                        self.invalidate(url).await;
                    }
                }
                result
            },
        )
        .await
    }

    /// Declare an exchange on `url`'s session, reconnecting on connection
    /// loss until it succeeds.
    pub async fn declare_exchange(
        &self,
        url: &str,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), BrokerError> {
        self.with_retry(url, |session| async move {
            session.declare_exchange(name, kind, durable, auto_delete).await
        })
        .await
    }

    /// Declare and bind a queue on `url`'s session.
    pub async fn declare_queue(&self, url: &str, spec: QueueSpec) -> Result<(), BrokerError> {
        self.with_retry(url, |session| {
            let spec = spec.clone();
            async move { session.declare_queue(spec).await }
        })
        .await
    }

    /// Publish on `url`'s session.
    pub async fn send(
        &self,
        url: &str,
        destination: &Destination,
        body: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.with_retry(url, |session| {
            let destination = destination.clone();
            let body = body.clone();
            async move { session.send(&destination, body, ttl).await }
        })
        .await
    }

    /// Poll `queue` on `url`'s session.
    pub async fn get(
        &self,
        url: &str,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.with_retry(url, |session| async move { session.get(queue, timeout).await }).await
    }

    /// Acknowledge a delivery on `url`'s session.
    pub async fn ack(&self, url: &str, handle: &AckHandle) -> Result<(), BrokerError> {
        self.with_retry(url, |session| {
            let handle = handle.clone();
            async move { session.ack(&handle).await }
        })
        .await
    }

    /// Reject a delivery on `url`'s session.
    pub async fn reject(&self, url: &str, handle: &AckHandle, requeue: bool) -> Result<(), BrokerError> {
        self.with_retry(url, |session| {
            let handle = handle.clone();
            async move { session.reject(&handle, requeue).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyConnector {
        fail_connects: AtomicU32,
    }

    struct FailingSession;

    #[async_trait]
    impl Broker for FailingSession {
        async fn declare_exchange(
            &self,
            _name: &str,
            _kind: ExchangeKind,
            _durable: bool,
            _auto_delete: bool,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn declare_queue(&self, _spec: QueueSpec) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn send(&self, _d: &Destination, _b: Vec<u8>, _t: Option<Duration>) -> Result<(), BrokerError> {
            Err(BrokerError::ConnectionLost("severed".into()))
        }
        async fn get(&self, _q: &str, _t: Duration) -> Result<Option<Delivery>, BrokerError> {
            Ok(None)
        }
        async fn ack(&self, _h: &AckHandle) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn reject(&self, _h: &AckHandle, _r: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
            Ok(Arc::new(FailingSession))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_is_retried_forever_until_it_succeeds_elsewhere() {
        // FailingSession always reports connection loss on send; verify the
        // pool keeps retrying (we just bound the attempts and stop the test).
        let pool = SessionPool::new(
            Arc::new(FlakyConnector { fail_connects: AtomicU32::new(0) }),
            rmi_retry::BackoffPolicy { initial: Duration::from_millis(1), max: Duration::from_millis(5), multiplier: 2.0 },
        );
        let destination = Destination { exchange: "ex".into(), routing_key: "rk".into() };
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            pool.send("local://test", &destination, b"hi".to_vec(), None),
        )
        .await;
        // Times out because it retries forever rather than giving up — this
        // is the contract, not a bug.
        assert!(result.is_err());
    }

    struct OtherErrorSession;

    #[async_trait]
    impl Broker for OtherErrorSession {
        async fn declare_exchange(&self, _n: &str, _k: ExchangeKind, _d: bool, _a: bool) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn declare_queue(&self, _spec: QueueSpec) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn send(&self, _d: &Destination, _b: Vec<u8>, _t: Option<Duration>) -> Result<(), BrokerError> {
            Err(BrokerError::SendFailed("no queue bound".into()))
        }
        async fn get(&self, _q: &str, _t: Duration) -> Result<Option<Delivery>, BrokerError> {
            Ok(None)
        }
        async fn ack(&self, _h: &AckHandle) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn reject(&self, _h: &AckHandle, _r: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    struct SingleConnector;

    #[async_trait]
    impl Connector for SingleConnector {
        async fn connect(&self, _url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
            Ok(Arc::new(OtherErrorSession))
        }
    }

    #[tokio::test]
    async fn non_connection_errors_propagate_immediately() {
        let pool = SessionPool::new(Arc::new(SingleConnector), rmi_retry::BackoffPolicy::broker_default());
        let destination = Destination { exchange: "ex".into(), routing_key: "rk".into() };
        let result = pool.send("local://test", &destination, b"hi".to_vec(), None).await;
        assert!(matches!(result, Err(BrokerError::SendFailed(_))));
    }
}
