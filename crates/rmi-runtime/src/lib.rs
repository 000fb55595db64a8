// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ingress consumer, scheduler, task runtime, and reply consumer for the
//! RMI execution core.
//!
//! This crate wires the lower-level building blocks — [`rmi_broker`],
//! [`rmi_store`], [`rmi_catalog`], [`rmi_cancel`], [`rmi_auth`] — into the
//! pipeline that carries a request from "message arrived on a plugin's
//! queue" through execution to "reply delivered", plus the caller-side
//! counterpart that correlates replies back to outstanding calls.
//!
//! Submodules map directly onto the pipeline stages: [`ingress`] (C5),
//! [`scheduler`] (C7), [`task`] (C8), [`reply`] (C10).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ingress;
pub mod reply;
pub mod scheduler;
pub mod task;

use rmi_auth::Authenticator;
use rmi_broker::{Destination, SessionPool};
use rmi_cancel::CancellationTracker;
use rmi_catalog::Plugin;
use rmi_envelope::Envelope;
use rmi_store::PendingStore;
use std::sync::Arc;

/// Top-level key under which the ingress consumer records where a request
/// came in, so the scheduler can later recover its target plugin.
pub const INBOUND_KEY: &str = "inbound";

/// Shared handles every stage of the pipeline needs: the broker session
/// pool, the pending store, the cancellation tracker, and the optional
/// authenticator.
pub struct RuntimeShared {
    /// Connection URL this runtime's broker sessions are opened against.
    pub messaging_url: String,
    /// Reliability-wrapped broker session pool.
    pub broker: Arc<SessionPool>,
    /// Durable pending-request FIFO.
    pub store: Arc<PendingStore>,
    /// Process-wide cooperative cancellation registry.
    pub cancel: Arc<CancellationTracker>,
    /// Envelope signer/verifier, or `None` to accept/send unsigned.
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

/// One unit of work submitted to a plugin's worker pool: the accepted
/// request, the plugin it was resolved against, and whether that
/// resolution actually fell back to the sink.
///
/// Holds an `Arc<Plugin<DispatchJob>>` of itself — the cycle is broken by
/// `Arc`'s indirection, the same way any other owner-of-its-own-pool-item
/// type would be.
pub struct DispatchJob {
    /// The accepted request envelope, as read back from the pending store.
    pub envelope: Envelope,
    /// The plugin this request was dispatched to (may be the sink).
    pub plugin: Arc<Plugin<DispatchJob>>,
    /// `true` if `plugin` is the sink, i.e. the inbound queue had no
    /// registered plugin.
    pub is_sink: bool,
    /// The inbound queue the request arrived on, recorded for the sink's
    /// `PluginNotFound` message and for diagnostics.
    pub inbound_queue: String,
    /// Shared runtime handles.
    pub runtime: Arc<RuntimeShared>,
}

/// Parse a reply address of the form `exchange/routing_key` into a
/// [`Destination`]. An address with no `/` is treated as a bare routing
/// key on the default (empty-named) exchange.
#[must_use]
pub fn parse_address(addr: &str) -> Destination {
    match addr.split_once('/') {
        Some((exchange, routing_key)) => {
            Destination { exchange: exchange.to_string(), routing_key: routing_key.to_string() }
        }
        None => Destination { exchange: String::new(), routing_key: addr.to_string() },
    }
}

/// Sign (if an authenticator is configured) and publish `envelope` to
/// `destination`. Send failures are logged at warn level and otherwise
/// swallowed — outbound status and reply delivery is always best-effort,
/// per the task runtime's contract.
pub async fn send_best_effort(runtime: &RuntimeShared, destination: &Destination, envelope: &Envelope) {
    let signed = rmi_auth::sign(runtime.authenticator.as_deref(), envelope);
    let bytes = match signed.encode() {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(sn = %envelope.sn, error = %err, "failed to encode outbound envelope");
            return;
        }
    };
    if let Err(err) = runtime.broker.send(&runtime.messaging_url, destination, bytes, None).await {
        tracing::warn!(sn = %envelope.sn, error = %err, "failed to publish outbound envelope");
    }
}

/// Inject `{inbound: {url, queue}}` into a request envelope's `request`
/// sub-document, so a later stage (the scheduler) can recover which
/// plugin queue it arrived on without re-consulting the broker.
pub fn inject_inbound(envelope: &mut Envelope, url: &str, queue: &str) {
    if let Some(request) = envelope.request.as_mut() {
        let mut inbound = serde_json::Map::new();
        inbound.insert("url".to_string(), serde_json::Value::String(url.to_string()));
        inbound.insert("queue".to_string(), serde_json::Value::String(queue.to_string()));
        request.extra.insert(INBOUND_KEY.to_string(), serde_json::Value::Object(inbound));
    }
}

/// Recover the inbound queue name previously injected by
/// [`inject_inbound`], if present.
#[must_use]
pub fn read_inbound_queue(envelope: &Envelope) -> Option<String> {
    envelope
        .request
        .as_ref()?
        .extra
        .get(INBOUND_KEY)?
        .get("queue")?
        .as_str()
        .map(str::to_string)
}
