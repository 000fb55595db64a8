// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scheduler (C7): the single loop that pulls accepted requests out of the
//! pending store and hands them to the right plugin's worker pool.

use crate::{DispatchJob, RuntimeShared, read_inbound_queue, task};
use rmi_cancel::CancellationToken;
use rmi_catalog::PluginCatalog;
use std::sync::Arc;

/// Pulls from the pending store and submits to plugin worker pools.
///
/// Never executes a method itself — dispatch happens inside the worker
/// pool the request is submitted to, on whichever task drains it.
pub struct Scheduler {
    runtime: Arc<RuntimeShared>,
    catalog: Arc<PluginCatalog<DispatchJob>>,
}

impl Scheduler {
    /// Build a scheduler over `catalog`.
    #[must_use]
    pub fn new(runtime: Arc<RuntimeShared>, catalog: Arc<PluginCatalog<DispatchJob>>) -> Self {
        Self { runtime, catalog }
    }

    /// Run until `stop` is cancelled.
    pub async fn run(self, stop: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                biased;
                () = stop.cancelled() => return,
                result = self.runtime.store.get() => result,
            };
            let envelope = match envelope {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::error!(error = %err, "scheduler: failed to read from pending store");
                    continue;
                }
            };

            let sn = envelope.sn.clone();
            let inbound_queue = read_inbound_queue(&envelope).unwrap_or_default();
            let is_sink = !self.catalog.contains(&inbound_queue);
            let plugin = self.catalog.resolve(&inbound_queue);

            let job = DispatchJob { envelope, plugin: plugin.clone(), is_sink, inbound_queue, runtime: self.runtime.clone() };
            plugin.pool.schedule(job).await;
            tracing::debug!(sn = %sn, is_sink, "scheduler: submitted request to worker pool");
        }
    }
}

/// Build the `Handler` every plugin pool (including the sink) runs: just
/// the task runtime's entry point.
#[must_use]
pub fn dispatch_handler() -> rmi_pool::Handler<DispatchJob> {
    std::sync::Arc::new(|job: DispatchJob| Box::pin(task::run(job)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeShared;
    use rmi_broker::memory::{self, MemoryConnector};
    use rmi_broker::SessionPool;
    use rmi_cancel::CancellationTracker;
    use rmi_catalog::{Plugin, RemoteClass, RemoteMethod};
    use rmi_envelope::Envelope;
    use rmi_pool::WorkerPool;
    use rmi_retry::BackoffPolicy;
    use rmi_store::PendingStore;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Echo(Arc<Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl RemoteMethod for Echo {
        async fn call(
            &self,
            ctx: &rmi_catalog::CallContext,
            _args: Vec<serde_json::Value>,
            _kws: serde_json::Map<String, serde_json::Value>,
        ) -> Result<serde_json::Value, rmi_catalog::MethodError> {
            self.0.lock().unwrap().push(ctx.sn.clone());
            Ok(serde_json::Value::Null)
        }
    }

    async fn shared_runtime(url: &str) -> Arc<RuntimeShared> {
        memory::reset_all();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PendingStore::open(dir.path()).await.unwrap());
        let broker = Arc::new(SessionPool::new(Arc::new(MemoryConnector), BackoffPolicy::broker_default()));
        Arc::new(RuntimeShared {
            messaging_url: url.to_string(),
            broker,
            store,
            cancel: Arc::new(CancellationTracker::new()),
            authenticator: None,
        })
    }

    #[tokio::test]
    async fn known_queue_is_submitted_to_its_plugin_pool() {
        let url = "local://scheduler-known";
        let runtime = shared_runtime(url).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut class = RemoteClass::new();
        class.register_method("bark", Arc::new(Echo(seen.clone())));
        let mut classes = HashMap::new();
        classes.insert("Dog".to_string(), Arc::new(class));
        let dog_pool = WorkerPool::new(2, 8, dispatch_handler());
        let dog = Arc::new(Plugin::new("Q-dog", classes, dog_pool));

        let sink = Arc::new(Plugin::sink(WorkerPool::direct(dispatch_handler())));
        let mut catalog = PluginCatalog::new(sink);
        catalog.register(dog.clone());
        let catalog = Arc::new(catalog);

        let mut envelope = Envelope::new_request("Dog", "bark");
        crate::inject_inbound(&mut envelope, url, "Q-dog");
        runtime.store.put(&envelope).await.unwrap();

        let scheduler = Scheduler::new(runtime.clone(), catalog);
        let stop = CancellationToken::new();
        let stop2 = stop.clone();
        let handle = tokio::spawn(scheduler.run(stop2));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_queue_falls_back_to_sink_and_is_marked_as_such() {
        let url = "local://scheduler-sink";
        let runtime = shared_runtime(url).await;
        let sink = Arc::new(Plugin::sink(WorkerPool::direct(dispatch_handler())));
        let catalog = Arc::new(PluginCatalog::<DispatchJob>::new(sink));

        let mut envelope = Envelope::new_request("Dog", "bark");
        envelope.replyto = Some("agent.reply/caller-1".to_string());
        crate::inject_inbound(&mut envelope, url, "Q-nonexistent");
        runtime.store.put(&envelope).await.unwrap();

        // Set up the reply queue so the sink's best-effort send has
        // somewhere to land.
        let broker = SessionPool::new(Arc::new(MemoryConnector), BackoffPolicy::broker_default());
        broker.declare_exchange(url, "agent.reply", rmi_broker::ExchangeKind::Direct, true, false).await.unwrap();
        broker
            .declare_queue(
                url,
                rmi_broker::QueueSpec {
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

        let scheduler = Scheduler::new(runtime.clone(), catalog);
        let stop = CancellationToken::new();
        let stop2 = stop.clone();
        let handle = tokio::spawn(scheduler.run(stop2));

        let reply = broker.get(url, "caller-1", Duration::from_millis(500)).await.unwrap();
        stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        let reply_env = Envelope::decode(&reply.unwrap().body).unwrap();
        let rmi_envelope::ResultBody::Exval(message) = reply_env.result.unwrap() else {
            panic!("expected an exval result for an unknown plugin");
        };
        assert!(message.contains("Q-nonexistent"));
    }
}
