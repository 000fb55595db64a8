// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plugin catalog and class/method registry.
//!
//! A [`Plugin`] is a queue name, a table of [`RemoteClass`]es, and the
//! worker pool that executes its dispatched calls. [`PluginCatalog`] maps
//! an inbound queue name to its plugin, falling back to a sink plugin for
//! any queue nothing is registered against — this is how the scheduler
//! avoids a special case for an unknown destination.
//!
//! Unlike the dynamic, attribute-driven method discovery of a reflective
//! runtime, methods are registered explicitly with [`RemoteClass::register_method`]
//! — Rust has no decorator-style introspection to hang a "remote-permitted"
//! marker off of, so the marker becomes the registration call itself.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use rmi_cancel::CancellationToken;
use rmi_error::{ErrorCode, RmiError};
use rmi_pool::WorkerPool;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reports progress from inside a dispatched method back to the caller.
///
/// Implemented by the task runtime, which knows how to turn a progress
/// update into a `progress` status envelope and where to send it; this
/// crate only needs the contract so it stays free of any broker or
/// envelope dependency.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress update. Implementations should treat failures to
    /// deliver it as non-fatal to the call in progress.
    async fn report(&self, total: Option<u64>, completed: u64, details: Option<String>);
}

/// A [`ProgressReporter`] that discards every update — used where no
/// `replyto` was given, so there is nowhere to send progress to.
pub struct NullProgressReporter;

#[async_trait]
impl ProgressReporter for NullProgressReporter {
    async fn report(&self, _total: Option<u64>, _completed: u64, _details: Option<String>) {}
}

/// Ambient state available to a dispatched method: its serial number, a
/// progress-reporting handle, and cooperative cancellation.
pub struct CallContext {
    /// The request's serial number.
    pub sn: String,
    progress: Arc<dyn ProgressReporter>,
    cancelled: CancellationToken,
}

impl CallContext {
    /// Build a context for a dispatched call.
    #[must_use]
    pub fn new(sn: impl Into<String>, progress: Arc<dyn ProgressReporter>, cancelled: CancellationToken) -> Self {
        Self { sn: sn.into(), progress, cancelled }
    }

    /// Build a context with no progress sink and no way to be cancelled —
    /// useful for direct invocation in tests.
    #[must_use]
    pub fn detached(sn: impl Into<String>) -> Self {
        Self::new(sn, Arc::new(NullProgressReporter), CancellationToken::new())
    }

    /// `true` once cancellation has been requested for this call. Plugin
    /// code is expected to poll this cooperatively; nothing here forces
    /// the call to stop.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Report a progress update.
    pub async fn report_progress(&self, total: Option<u64>, completed: u64, details: Option<String>) {
        self.progress.report(total, completed, details).await;
    }
}

/// A plugin method failed. Carries a string description intended to be
/// sent back verbatim as the reply's `exval` — plugin exceptions are
/// never allowed to propagate as Rust errors past this boundary.
#[derive(Debug, Clone)]
pub struct MethodError(pub String);

impl MethodError {
    /// Build a method error from any displayable value.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

/// A dispatchable remote method.
#[async_trait]
pub trait RemoteMethod: Send + Sync {
    /// Invoke the method with positional `args` and keyword `kws`,
    /// returning either a JSON return value or a [`MethodError`] to be
    /// rendered into the reply's `exval`.
    async fn call(&self, ctx: &CallContext, args: Vec<Value>, kws: Map<String, Value>) -> Result<Value, MethodError>;
}

struct RegisteredMethod {
    handler: Arc<dyn RemoteMethod>,
    remote_permitted: bool,
}

/// A table of methods resolvable under one `classname`.
#[derive(Default)]
pub struct RemoteClass {
    methods: HashMap<String, RegisteredMethod>,
}

impl RemoteClass {
    /// An empty class with no methods registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method that is callable remotely.
    pub fn register_method(&mut self, name: impl Into<String>, handler: Arc<dyn RemoteMethod>) -> &mut Self {
        self.methods.insert(name.into(), RegisteredMethod { handler, remote_permitted: true });
        self
    }

    /// Register a method that exists but is **not** remote-permitted —
    /// resolving it yields [`ErrorCode::NotPermitted`] rather than
    /// invoking it. Used for methods a class exposes internally but never
    /// over the wire.
    pub fn register_internal_method(&mut self, name: impl Into<String>, handler: Arc<dyn RemoteMethod>) -> &mut Self {
        self.methods.insert(name.into(), RegisteredMethod { handler, remote_permitted: false });
        self
    }

    /// Resolve `method`, distinguishing "not found" from "found but not
    /// permitted".
    pub fn resolve(&self, method: &str) -> Result<Arc<dyn RemoteMethod>, RmiError> {
        match self.methods.get(method) {
            None => Err(RmiError::new(ErrorCode::MethodNotFound, format!("no such method: {method}"))),
            Some(m) if !m.remote_permitted => {
                Err(RmiError::new(ErrorCode::NotPermitted, format!("method not remote-permitted: {method}")))
            }
            Some(m) => Ok(m.handler.clone()),
        }
    }
}

/// One registered plugin: a queue, its class table, and the worker pool
/// that executes calls dispatched to it.
///
/// Generic over `T`, the work item type the owning runtime schedules onto
/// the pool — `rmi-catalog` has no opinion on what that item looks like.
pub struct Plugin<T: Send + 'static> {
    /// The inbound queue this plugin is bound to (empty for the sink).
    pub queue: String,
    classes: HashMap<String, Arc<RemoteClass>>,
    /// The worker pool executing this plugin's dispatched calls.
    pub pool: Arc<WorkerPool<T>>,
}

impl<T: Send + 'static> Plugin<T> {
    /// Build a plugin bound to `queue`, exposing `classes`, executing on
    /// `pool`.
    #[must_use]
    pub fn new(queue: impl Into<String>, classes: HashMap<String, Arc<RemoteClass>>, pool: Arc<WorkerPool<T>>) -> Self {
        Self { queue: queue.into(), classes, pool }
    }

    /// Build the sink plugin: no classes, a direct (no-threading) pool
    /// whose handler is responsible for producing a `PluginNotFound` reply
    /// regardless of what was requested.
    #[must_use]
    pub fn sink(pool: Arc<WorkerPool<T>>) -> Self {
        Self { queue: String::new(), classes: HashMap::new(), pool }
    }

    /// Resolve `classname`, distinguishing "unknown class" from a
    /// subsequent method-resolution failure.
    pub fn resolve_class(&self, classname: &str) -> Result<Arc<RemoteClass>, RmiError> {
        self.classes
            .get(classname)
            .cloned()
            .ok_or_else(|| RmiError::new(ErrorCode::ClassNotFound, format!("no such class: {classname}")))
    }
}

/// Maps an inbound queue name to its registered [`Plugin`], falling back
/// to a sink plugin for anything unregistered.
pub struct PluginCatalog<T: Send + 'static> {
    plugins: HashMap<String, Arc<Plugin<T>>>,
    sink: Arc<Plugin<T>>,
}

impl<T: Send + 'static> PluginCatalog<T> {
    /// Build a catalog with no registered plugins, backed by `sink` for
    /// unknown queues.
    #[must_use]
    pub fn new(sink: Arc<Plugin<T>>) -> Self {
        Self { plugins: HashMap::new(), sink }
    }

    /// Register `plugin` under its own queue name.
    pub fn register(&mut self, plugin: Arc<Plugin<T>>) {
        self.plugins.insert(plugin.queue.clone(), plugin);
    }

    /// Resolve `queue` to its plugin, or the sink if nothing is
    /// registered for it.
    #[must_use]
    pub fn resolve(&self, queue: &str) -> Arc<Plugin<T>> {
        self.plugins.get(queue).cloned().unwrap_or_else(|| self.sink.clone())
    }

    /// `true` if `queue` has a plugin registered (not counting the sink).
    #[must_use]
    pub fn contains(&self, queue: &str) -> bool {
        self.plugins.contains_key(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RemoteMethod for Echo {
        async fn call(&self, _ctx: &CallContext, args: Vec<Value>, _kws: Map<String, Value>) -> Result<Value, MethodError> {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl RemoteMethod for AlwaysFails {
        async fn call(&self, _ctx: &CallContext, _args: Vec<Value>, _kws: Map<String, Value>) -> Result<Value, MethodError> {
            Err(MethodError::new("KeyError: 'missing'"))
        }
    }

    fn sample_class() -> RemoteClass {
        let mut class = RemoteClass::new();
        class.register_method("bark", Arc::new(Echo));
        class.register_internal_method("secret", Arc::new(Echo));
        class
    }

    #[test]
    fn resolve_known_method_succeeds() {
        let class = sample_class();
        assert!(class.resolve("bark").is_ok());
    }

    #[test]
    fn resolve_unknown_method_is_not_found() {
        let class = sample_class();
        let err = class.resolve("missing").unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound);
    }

    #[test]
    fn resolve_internal_method_is_not_permitted() {
        let class = sample_class();
        let err = class.resolve("secret").unwrap_err();
        assert_eq!(err.code, ErrorCode::NotPermitted);
    }

    #[tokio::test]
    async fn method_call_returns_value_or_method_error() {
        let class = sample_class();
        let method = class.resolve("bark").unwrap();
        let ctx = CallContext::detached("sn-1");
        let ok = method.call(&ctx, vec![Value::String("ruf".into())], Map::new()).await;
        assert_eq!(ok.unwrap(), Value::String("ruf".into()));

        let failing = AlwaysFails;
        let err = failing.call(&ctx, vec![], Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'missing'");
    }

    fn noop_pool() -> Arc<WorkerPool<u32>> {
        WorkerPool::direct(Arc::new(|_: u32| Box::pin(async {})))
    }

    #[test]
    fn plugin_resolves_registered_class() {
        let mut classes = HashMap::new();
        classes.insert("Dog".to_string(), Arc::new(sample_class()));
        let plugin = Plugin::new("q.dog", classes, noop_pool());
        assert!(plugin.resolve_class("Dog").is_ok());
        let err = plugin.resolve_class("Cat").unwrap_err();
        assert_eq!(err.code, ErrorCode::ClassNotFound);
    }

    #[test]
    fn catalog_falls_back_to_sink_for_unknown_queue() {
        let mut classes = HashMap::new();
        classes.insert("Dog".to_string(), Arc::new(sample_class()));
        let dog_plugin = Arc::new(Plugin::new("q.dog", classes, noop_pool()));
        let sink = Arc::new(Plugin::sink(noop_pool()));
        let mut catalog = PluginCatalog::new(sink.clone());
        catalog.register(dog_plugin.clone());

        assert!(catalog.contains("q.dog"));
        assert!(Arc::ptr_eq(&catalog.resolve("q.dog"), &dog_plugin));
        assert!(Arc::ptr_eq(&catalog.resolve("q.nonexistent"), &sink));
    }

    #[tokio::test]
    async fn cancellation_flag_is_observed_cooperatively() {
        let token = CancellationToken::new();
        let ctx = CallContext::new("sn-1", Arc::new(NullProgressReporter), token.clone());
        assert!(!ctx.cancelled());
        token.cancel();
        assert!(ctx.cancelled());
    }
}
