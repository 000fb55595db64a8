// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reply consumer (C10): the caller side of the pipeline — listens on a
//! private reply queue, classifies incoming envelopes, and correlates
//! them back to outstanding calls by serial number.

use crate::{RuntimeShared, send_best_effort};
use rmi_broker::Destination;
use rmi_cancel::CancellationToken;
use rmi_envelope::{CONTRACT_VERSION, Envelope, ResultBody, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What kind of envelope arrived on the reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A final reply carrying a return value.
    Succeeded,
    /// A final reply carrying a stringified exception.
    Failed,
    /// A non-final lifecycle update (`accepted`, `rejected`, `started`,
    /// `progress`).
    Status(Status),
}

/// Classify an envelope arriving on a reply queue.
#[must_use]
pub fn classify(envelope: &Envelope) -> Classification {
    match (&envelope.result, envelope.status) {
        (Some(ResultBody::Retval(_)), _) => Classification::Succeeded,
        (Some(ResultBody::Exval(_)), _) => Classification::Failed,
        (None, Some(status)) => Classification::Status(status),
        (None, None) => Classification::Status(Status::Progress),
    }
}

/// Observes every envelope the reply consumer classifies, keyed by its
/// own `sn`. Default methods are no-ops — implement only the ones a
/// caller cares about.
pub trait ReplyListener: Send + Sync {
    /// A final success arrived.
    fn succeeded(&self, _envelope: &Envelope) {}
    /// A final failure arrived.
    fn failed(&self, _envelope: &Envelope) {}
    /// A non-final status update arrived.
    fn status(&self, _envelope: &Envelope, _status: Status) {}
}

/// A [`ReplyListener`] that does nothing with any envelope.
pub struct NullReplyListener;

impl ReplyListener for NullReplyListener {}

/// Error raised by [`MatchStore::search`] — local to this crate since
/// the unified error taxonomy has no request-timeout variant; a timed
/// out wait is a caller-side condition, not a protocol-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    /// No matching reply arrived before the deadline.
    #[error("no reply for sn {sn} within the wait window")]
    Timeout {
        /// The serial number that was waited on.
        sn: String,
    },
}

struct MatchState {
    by_sn: HashMap<String, Vec<Envelope>>,
}

/// Buffers every envelope delivered for a given `sn` until a waiter
/// collects it. Supports multiple waiters per `sn` arriving at
/// different times (e.g. one waiting on `started`, another on the final
/// reply) by keeping every undelivered envelope around until drained.
pub struct MatchStore {
    state: Mutex<MatchState>,
    notify: Notify,
}

impl Default for MatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchStore {
    /// Build an empty match store.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new(MatchState { by_sn: HashMap::new() }), notify: Notify::new() }
    }

    /// Record an envelope as arrived, waking any waiter for its `sn`.
    pub fn deliver(&self, envelope: Envelope) {
        let mut state = self.state.lock().unwrap();
        state.by_sn.entry(envelope.sn.clone()).or_default().push(envelope);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait up to `timeout` for any buffered envelope matching `sn`,
    /// removing and returning the oldest one found. Envelopes delivered
    /// for other serial numbers do not consume the timeout budget of a
    /// waiter on this one.
    pub async fn search(&self, sn: &str, timeout: Duration) -> Result<Envelope, ReplyError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(queue) = state.by_sn.get_mut(sn) {
                    if !queue.is_empty() {
                        let envelope = queue.remove(0);
                        if queue.is_empty() {
                            state.by_sn.remove(sn);
                        }
                        return Ok(envelope);
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReplyError::Timeout { sn: sn.to_string() });
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(ReplyError::Timeout { sn: sn.to_string() });
            }
        }
    }
}

/// Consumes a private reply queue, classifying every envelope and
/// delivering it to a [`MatchStore`] and an optional [`ReplyListener`].
pub struct ReplyConsumer {
    runtime: Arc<RuntimeShared>,
    queue: String,
    match_store: Arc<MatchStore>,
    listener: Arc<dyn ReplyListener>,
}

const POLL_TIMEOUT: Duration = Duration::from_secs(5);

impl ReplyConsumer {
    /// Build a consumer bound to `queue`, delivering into `match_store`
    /// and notifying `listener` of every classified envelope.
    #[must_use]
    pub fn new(
        runtime: Arc<RuntimeShared>,
        queue: impl Into<String>,
        match_store: Arc<MatchStore>,
        listener: Arc<dyn ReplyListener>,
    ) -> Self {
        Self { runtime, queue: queue.into(), match_store, listener }
    }

    /// Run until `stop` is cancelled.
    pub async fn run(self, stop: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                biased;
                () = stop.cancelled() => return,
                result = self.runtime.broker.get(&self.runtime.messaging_url, &self.queue, POLL_TIMEOUT) => result,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    if let Ok(envelope) = Envelope::decode(&delivery.body) {
                        match classify(&envelope) {
                            Classification::Succeeded => self.listener.succeeded(&envelope),
                            Classification::Failed => self.listener.failed(&envelope),
                            Classification::Status(status) => self.listener.status(&envelope, status),
                        }
                        self.match_store.deliver(envelope);
                    } else {
                        tracing::warn!(queue = %self.queue, "reply consumer: dropping undecodable message");
                    }
                    if let Err(err) = self.runtime.broker.ack(&self.runtime.messaging_url, &delivery.ack).await {
                        tracing::error!(queue = %self.queue, error = %err, "reply consumer: failed to ack");
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(queue = %self.queue, error = %err, "reply consumer: broker read failed");
                }
            }
        }
    }
}

/// Submit `request` and wait for its outcome, the synchronous-caller
/// pattern built on top of a [`MatchStore`] fed by a [`ReplyConsumer`].
///
/// Waits up to `t_started` for a `started` status (best-effort: a
/// missing `started` is not itself a failure, since a fast plugin may
/// reply before this function even starts waiting for it), then up to
/// `t_reply` for the final outcome, skipping over any intervening
/// `progress` updates for the same `sn`.
pub async fn submit_and_wait(
    runtime: &RuntimeShared,
    destination: &Destination,
    match_store: &MatchStore,
    mut request: Envelope,
    t_started: Duration,
    t_reply: Duration,
) -> Result<ResultBody, ReplyError> {
    request.version = CONTRACT_VERSION.to_string();
    let sn = request.sn.clone();
    send_best_effort(runtime, destination, &request).await;

    let _ = match_store.search(&sn, t_started).await;

    loop {
        let envelope = match_store.search(&sn, t_reply).await?;
        if let Some(result) = envelope.result {
            return Ok(result);
        }
        // Non-final (accepted/rejected/started/progress): keep waiting
        // for the actual reply, within the same overall t_reply budget
        // each iteration re-applies.
    }
}
