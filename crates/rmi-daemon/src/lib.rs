// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent process (C12): wires the execution core together from
//! configuration, owns the single-instance lock, and exposes the HTTP
//! control surface.
//!
//! Plugin class/method registration is left to the embedding application
//! — loading plugin descriptors off disk is explicitly out of scope — so
//! [`bootstrap`] takes an already-built [`PluginCatalog`] rather than
//! constructing one from config alone.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
mod lock;
pub mod middleware;

pub use lock::InstanceLock;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rmi_auth::{Authenticator, HmacAuthenticator};
use rmi_broker::{SessionPool, memory::MemoryConnector};
use rmi_cancel::CancellationTracker;
use rmi_catalog::{Plugin, PluginCatalog};
use rmi_config::Config;
use rmi_runtime::{DispatchJob, RuntimeShared, ingress::IngressConsumer, scheduler::Scheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use api::{CancelResponse, HealthResponse, PluginSnapshot, ReadyResponse};

/// Shared state handed to every Axum handler.
#[derive(Clone)]
pub struct DaemonState {
    runtime: Arc<RuntimeShared>,
    plugins: Arc<Vec<Arc<Plugin<DispatchJob>>>>,
    ready: Arc<AtomicBool>,
}

/// Build the control-surface router described in the external interfaces
/// section: `/healthz`, `/readyz`, `/plugins`, `POST /cancel/{sn}`.
///
/// Every request passes through [`middleware::request_id_middleware`] (stamps
/// an `X-Request-Id` response header) and [`middleware::RequestLogger`]
/// (structured `tracing` line per request) — the ambient logging stack this
/// control surface gets for free regardless of which routes are mounted.
#[must_use]
pub fn build_app(state: DaemonState) -> Router {
    Router::new()
        .route("/healthz", get(cmd_healthz))
        .route("/readyz", get(cmd_readyz))
        .route("/plugins", get(cmd_plugins))
        .route("/cancel/{sn}", post(cmd_cancel))
        .layer(axum::middleware::from_fn(middleware::RequestLogger::layer))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .with_state(state)
}

async fn cmd_healthz() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", contract_version: rmi_envelope::CONTRACT_VERSION })
}

async fn cmd_readyz(State(state): State<DaemonState>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        Json(ReadyResponse { ready: true }).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ReadyResponse { ready: false })).into_response()
    }
}

async fn cmd_plugins(State(state): State<DaemonState>) -> impl IntoResponse {
    let snapshots: Vec<PluginSnapshot> = state
        .plugins
        .iter()
        .map(|p| PluginSnapshot { queue: p.queue.clone(), backlog: p.pool.backlog_snapshot() })
        .collect();
    Json(snapshots)
}

async fn cmd_cancel(State(state): State<DaemonState>, AxPath(sn): AxPath<String>) -> impl IntoResponse {
    let cancelled = state.runtime.cancel.cancel(&sn);
    info!(sn = %sn, cancelled, "control surface: cancel request");
    Json(CancelResponse { sn, cancelled })
}

/// Everything started by [`bootstrap`], returned so the caller can drive
/// the control surface and later call [`RunningAgent::shutdown`].
pub struct RunningAgent {
    /// State to hand to [`build_app`].
    pub state: DaemonState,
    runtime: Arc<RuntimeShared>,
    plugins: Arc<Vec<Arc<Plugin<DispatchJob>>>>,
    tasks: Vec<JoinHandle<()>>,
    stop: rmi_cancel::CancellationToken,
    lock: InstanceLock,
}

/// Acquire the instance lock, construct the broker/store/cancel-tracker,
/// and start one ingress consumer per plugin queue plus the scheduler,
/// per C12's startup sequence. `catalog` must already have every plugin
/// queue in `plugins` registered.
pub async fn bootstrap(
    config: &Config,
    catalog: Arc<PluginCatalog<DispatchJob>>,
    plugins: Vec<Arc<Plugin<DispatchJob>>>,
) -> anyhow::Result<RunningAgent> {
    let lock = InstanceLock::acquire(&config.instance_lock.path)?;

    let store = Arc::new(rmi_store::PendingStore::open(config.pending.dir.clone()).await?);
    let broker = Arc::new(SessionPool::new(Arc::new(MemoryConnector), rmi_retry::BackoffPolicy::broker_default()));
    let authenticator = build_authenticator(config.messaging.authenticator.as_deref());

    let runtime = Arc::new(RuntimeShared {
        messaging_url: config.messaging.url.clone(),
        broker,
        store,
        cancel: Arc::new(CancellationTracker::new()),
        authenticator,
    });

    let stop = rmi_cancel::CancellationToken::new();
    let mut tasks = Vec::new();

    for plugin in &plugins {
        let consumer = IngressConsumer::new(runtime.clone(), plugin.queue.clone());
        let stop = stop.clone();
        tasks.push(tokio::spawn(consumer.run(stop)));
    }

    let scheduler = Scheduler::new(runtime.clone(), catalog);
    tasks.push(tokio::spawn(scheduler.run(stop.clone())));

    let plugins = Arc::new(plugins);
    let state = DaemonState { runtime: runtime.clone(), plugins: plugins.clone(), ready: Arc::new(AtomicBool::new(true)) };

    info!(plugins = plugins.len(), "agent process bootstrapped");
    Ok(RunningAgent { state, runtime, plugins, tasks, stop, lock })
}

impl RunningAgent {
    /// Stop accepting new ingress, stop every pipeline task, drain each
    /// plugin's worker pool back into the pending store (requeueing any
    /// orphaned, not-yet-committed request so it is reconsidered without
    /// requiring a process restart), and release the instance lock.
    pub async fn shutdown(self) {
        self.state.ready.store(false, Ordering::SeqCst);
        self.stop.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        for plugin in self.plugins.iter() {
            let orphans = plugin.pool.shutdown().await;
            if !orphans.is_empty() {
                warn!(queue = %plugin.queue, count = orphans.len(), "draining orphaned requests back to pending store");
            }
            for job in orphans {
                self.runtime.store.requeue(&job.envelope.sn).await;
            }
        }
        drop(self.lock);
        info!("agent process shut down cleanly");
    }
}

fn build_authenticator(name: Option<&str>) -> Option<Arc<dyn Authenticator>> {
    match name {
        None | Some("none") => None,
        Some("hmac") => match std::env::var("RMI_HMAC_KEY") {
            Ok(key) => Some(Arc::new(HmacAuthenticator::new(key.into_bytes())) as Arc<dyn Authenticator>),
            Err(_) => {
                warn!("messaging.authenticator is \"hmac\" but RMI_HMAC_KEY is unset; running unauthenticated");
                None
            }
        },
        Some(other) => {
            warn!(authenticator = %other, "unknown authenticator name, running unauthenticated");
            None
        }
    }
}
