// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ingress consumer (C5): one per plugin queue, turning broker deliveries
//! into either a `rejected` status or an accepted, persisted request.

use crate::{RuntimeShared, inject_inbound, parse_address, send_best_effort};
use rmi_broker::Delivery;
use rmi_cancel::CancellationToken;
use rmi_envelope::{CONTRACT_VERSION, Envelope, Status};
use rmi_error::{ErrorCode, RmiError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How long a single `get` on the plugin's queue waits before looping
/// around to re-check the stop token.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads one plugin's queue, validating and handing accepted requests off
/// to the pending store.
pub struct IngressConsumer {
    runtime: Arc<RuntimeShared>,
    queue: String,
}

impl IngressConsumer {
    /// Build a consumer bound to `queue`.
    #[must_use]
    pub fn new(runtime: Arc<RuntimeShared>, queue: impl Into<String>) -> Self {
        Self { runtime, queue: queue.into() }
    }

    /// Run until `stop` is cancelled. Intended to be spawned as its own
    /// task; one per registered plugin queue.
    pub async fn run(self, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                return;
            }
            let delivery = tokio::select! {
                biased;
                () = stop.cancelled() => return,
                result = self.runtime.broker.get(&self.runtime.messaging_url, &self.queue, POLL_TIMEOUT) => result,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(queue = %self.queue, error = %err, "ingress: broker read failed");
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let persisted = match Envelope::decode(&delivery.body) {
            Ok(envelope) => {
                if rmi_auth::is_valid(self.runtime.authenticator.as_deref(), &envelope) {
                    self.accept(envelope).await
                } else {
                    self.reject(&envelope, ErrorCode::DocumentAuthRejected, "signature verification failed").await;
                    true
                }
            }
            Err(err) => {
                self.reject_raw(&delivery.body, &err).await;
                true
            }
        };

        // A validated, accepted request must make it into the pending
        // store before the broker delivery is acked — acking first would
        // let a store I/O failure silently drop the request with no
        // redelivery. Rejections and already-rejected malformed messages
        // have nothing pending to lose, so they always ack.
        if persisted {
            if let Err(err) = self.runtime.broker.ack(&self.runtime.messaging_url, &delivery.ack).await {
                tracing::error!(queue = %self.queue, error = %err, "ingress: failed to ack broker delivery");
            }
        } else if let Err(err) = self.runtime.broker.reject(&self.runtime.messaging_url, &delivery.ack, true).await {
            tracing::error!(queue = %self.queue, error = %err, "ingress: failed to reject broker delivery for redelivery");
        }
    }

    /// Returns `true` once the request is durably persisted (or correctly
    /// rejected with nothing to persist), `false` if persistence failed
    /// and the broker delivery should be redelivered instead of acked.
    async fn accept(&self, mut envelope: Envelope) -> bool {
        if envelope.request.is_none() {
            self.reject(&envelope, ErrorCode::DocumentInvalid, "envelope carries no request body").await;
            return true;
        }

        inject_inbound(&mut envelope, &self.runtime.messaging_url, &self.queue);
        self.send_status(&envelope, Status::Accepted).await;

        if let Err(err) = self.runtime.store.put(&envelope).await {
            tracing::error!(sn = %envelope.sn, queue = %self.queue, error = %err, "ingress: failed to persist accepted request");
            return false;
        }
        true
    }

    async fn reject(&self, envelope: &Envelope, code: ErrorCode, description: &str) {
        tracing::info!(sn = %envelope.sn, queue = %self.queue, code = %code, "ingress: rejecting request");
        let Some(replyto) = envelope.replyto.clone() else { return };
        let rejected = rejection_envelope(Some(envelope.sn.clone()), Some(replyto.clone()), envelope.data.clone(), code, description);
        send_best_effort(&self.runtime, &parse_address(&replyto), &rejected).await;
    }

    /// Decode failed entirely; loosely recover `sn`/`replyto`/`data` from
    /// the raw JSON (if it parses at all) so the caller can still be told
    /// why its request was refused.
    async fn reject_raw(&self, body: &[u8], err: &RmiError) {
        tracing::info!(queue = %self.queue, error = %err, "ingress: rejecting undecodable message");
        let Ok(loose) = serde_json::from_slice::<Value>(body) else {
            tracing::warn!(queue = %self.queue, "ingress: dropping message that is not even valid JSON");
            return;
        };
        let sn = loose.get("sn").and_then(Value::as_str).map(str::to_string);
        let Some(replyto) = loose.get("replyto").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let data = loose.get("data").cloned();
        let rejected = rejection_envelope(sn, Some(replyto.clone()), data, err.code, &err.message);
        send_best_effort(&self.runtime, &parse_address(&replyto), &rejected).await;
    }

    async fn send_status(&self, envelope: &Envelope, status: Status) {
        let Some(replyto) = envelope.replyto.clone() else { return };
        let mut status_envelope = Envelope::new_request("", "");
        status_envelope.sn = envelope.sn.clone();
        status_envelope.version = CONTRACT_VERSION.to_string();
        status_envelope.request = None;
        status_envelope.replyto = None;
        status_envelope.data = envelope.data.clone();
        status_envelope.status = Some(status);
        status_envelope.ts = Some(chrono::Utc::now());
        send_best_effort(&self.runtime, &parse_address(&replyto), &status_envelope).await;
    }
}

fn rejection_envelope(
    sn: Option<String>,
    replyto: Option<String>,
    data: Option<Value>,
    code: ErrorCode,
    description: impl Into<String>,
) -> Envelope {
    let mut envelope = Envelope::new_request("", "");
    envelope.sn = sn.unwrap_or_default();
    envelope.request = None;
    envelope.replyto = replyto;
    envelope.data = data;
    envelope.status = Some(Status::Rejected);
    envelope.ts = Some(chrono::Utc::now());
    envelope.extra.insert("code".to_string(), Value::String(code.as_str().to_string()));
    envelope.extra.insert("description".to_string(), Value::String(description.into()));
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmi_auth::HmacAuthenticator;
    use rmi_broker::memory::{self, MemoryConnector};
    use rmi_broker::{Destination, ExchangeKind, QueueSpec};
    use rmi_cancel::CancellationTracker;
    use rmi_retry::BackoffPolicy;
    use rmi_store::PendingStore;
    use std::time::Duration as StdDuration;

    async fn setup(url: &str, queue: &str) -> (Arc<RuntimeShared>, rmi_broker::SessionPool) {
        memory::reset_all();
        let pool = rmi_broker::SessionPool::new(Arc::new(MemoryConnector), BackoffPolicy::broker_default());
        pool.declare_exchange(url, "agent.direct", ExchangeKind::Direct, true, false).await.unwrap();
        pool.declare_queue(
            url,
            QueueSpec {
                name: queue.to_string(),
                exchange: "agent.direct".to_string(),
                routing_key: queue.to_string(),
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
        )
        .await
        .unwrap();
        pool.declare_exchange(url, "agent.reply", ExchangeKind::Direct, true, false).await.unwrap();
        pool.declare_queue(
            url,
            QueueSpec {
                name: "caller-1".to_string(),
                exchange: "agent.reply".to_string(),
                routing_key: "caller-1".to_string(),
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
        )
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PendingStore::open(dir.path()).await.unwrap());
        let broker = Arc::new(rmi_broker::SessionPool::new(Arc::new(MemoryConnector), BackoffPolicy::broker_default()));
        let shared = Arc::new(RuntimeShared {
            messaging_url: url.to_string(),
            broker: broker.clone(),
            store,
            cancel: Arc::new(CancellationTracker::new()),
            authenticator: None,
        });
        (shared, pool)
    }

    fn request_for(queue: &str) -> Envelope {
        let mut e = Envelope::new_request("Dog", "bark");
        e.replyto = Some("agent.reply/caller-1".to_string());
        e.routing = vec!["caller-1".into(), queue.into()];
        e
    }

    #[tokio::test]
    async fn accepted_request_is_persisted_and_status_sent() {
        let url = "local://ingress-accept";
        let (shared, pool) = setup(url, "Q-dog").await;
        let consumer = IngressConsumer::new(shared.clone(), "Q-dog");

        let envelope = request_for("Q-dog");
        let dest = Destination { exchange: "agent.direct".into(), routing_key: "Q-dog".into() };
        pool.send(url, &dest, envelope.encode().unwrap(), None).await.unwrap();

        let delivery = pool.get(url, "Q-dog", StdDuration::from_millis(200)).await.unwrap().unwrap();
        consumer.process(delivery).await;

        assert_eq!(shared.store.pending_count().await, 1);
        let status = pool.get(url, "caller-1", StdDuration::from_millis(200)).await.unwrap().unwrap();
        let status_env = Envelope::decode(&status.body).unwrap();
        assert_eq!(status_env.status, Some(Status::Accepted));
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_and_never_persisted() {
        let url = "local://ingress-reject-auth";
        let (mut shared, pool) = setup(url, "Q-dog").await;
        let auth = Arc::new(HmacAuthenticator::new(b"right-key".to_vec()));
        Arc::get_mut(&mut shared).unwrap().authenticator = Some(auth.clone() as Arc<dyn rmi_auth::Authenticator>);
        let consumer = IngressConsumer::new(shared.clone(), "Q-dog");

        let mut envelope = request_for("Q-dog");
        let wrong = HmacAuthenticator::new(b"wrong-key".to_vec());
        envelope = rmi_auth::sign(Some(&wrong), &envelope);

        let dest = Destination { exchange: "agent.direct".into(), routing_key: "Q-dog".into() };
        pool.send(url, &dest, envelope.encode().unwrap(), None).await.unwrap();
        let delivery = pool.get(url, "Q-dog", StdDuration::from_millis(200)).await.unwrap().unwrap();
        consumer.process(delivery).await;

        assert_eq!(shared.store.pending_count().await, 0);
        let status = pool.get(url, "caller-1", StdDuration::from_millis(200)).await.unwrap().unwrap();
        let status_env = Envelope::decode(&status.body).unwrap();
        assert_eq!(status_env.status, Some(Status::Rejected));
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_without_a_reply_address() {
        let url = "local://ingress-malformed";
        let (shared, pool) = setup(url, "Q-dog").await;
        let consumer = IngressConsumer::new(shared.clone(), "Q-dog");

        let dest = Destination { exchange: "agent.direct".into(), routing_key: "Q-dog".into() };
        pool.send(url, &dest, b"not json at all".to_vec(), None).await.unwrap();
        let delivery = pool.get(url, "Q-dog", StdDuration::from_millis(200)).await.unwrap().unwrap();
        consumer.process(delivery).await;

        assert_eq!(shared.store.pending_count().await, 0);
        let nothing = pool.get(url, "caller-1", StdDuration::from_millis(50)).await.unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn store_persistence_failure_rejects_with_requeue_instead_of_acking() {
        let url = "local://ingress-store-failure";
        let (shared, pool) = setup(url, "Q-dog").await;
        let consumer = IngressConsumer::new(shared.clone(), "Q-dog");

        // Pull the pending directory out from under the store so `put`
        // fails with an I/O error, simulating a disk failure between
        // accept and persistence.
        std::fs::remove_dir_all(shared.store.dir()).unwrap();

        let envelope = request_for("Q-dog");
        let dest = Destination { exchange: "agent.direct".into(), routing_key: "Q-dog".into() };
        pool.send(url, &dest, envelope.encode().unwrap(), None).await.unwrap();

        let delivery = pool.get(url, "Q-dog", StdDuration::from_millis(200)).await.unwrap().unwrap();
        consumer.process(delivery).await;

        // The broker message must come back for redelivery rather than
        // being acked away and silently lost.
        let redelivered = pool.get(url, "Q-dog", StdDuration::from_millis(200)).await.unwrap();
        assert!(redelivered.is_some(), "message should be requeued for redelivery after a store failure");
    }
}
