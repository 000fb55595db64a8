// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task runtime (C8): executes one dispatched request to completion.
//!
//! Runs as the handler every plugin's worker pool (including the sink)
//! invokes per scheduled [`crate::DispatchJob`]. Owns the full lifecycle
//! from window check through final reply: installing cancellation,
//! sending `started`/`progress` status, dispatching into the plugin's
//! class/method table, committing the request out of the pending store,
//! and delivering the final reply — all best-effort on the reply side,
//! never on the commit.

use crate::{DispatchJob, RuntimeShared, parse_address, send_best_effort};
use chrono::Utc;
use rmi_catalog::{CallContext, NullProgressReporter, ProgressReporter};
use rmi_envelope::{CONTRACT_VERSION, Envelope, ResultBody, Status};
use serde_json::Value;
use std::sync::Arc;

/// Run `job` to completion. This is the pool `Handler` body; it never
/// returns early on failure — every path ends in a commit and, if a
/// `replyto` was given, a best-effort reply.
pub async fn run(job: DispatchJob) {
    let DispatchJob { envelope, plugin, is_sink, inbound_queue, runtime } = job;
    let sn = envelope.sn.clone();

    if let Some(window) = &envelope.window {
        let now = Utc::now();
        if let Some(end) = window.end {
            if now > end {
                finish(&runtime, &envelope, ResultBody::Exval(format!("WindowMissed({sn})"))).await;
                return;
            }
        }
        if let Some(begin) = window.begin {
            if now < begin {
                // Not yet time to run; hand it back to the pending store,
                // delayed until the window opens, rather than occupy this
                // worker waiting or spin the scheduler re-reading it
                // immediately.
                let delay = (begin - now).to_std().unwrap_or(std::time::Duration::ZERO);
                runtime.store.requeue_after(sn.clone(), delay);
                tracing::debug!(sn = %sn, delay_ms = delay.as_millis() as u64, "task: window not yet open, requeued with delay");
                return;
            }
        }
    }

    let token = runtime.cancel.add(&sn);
    let replyto = envelope.replyto.clone();
    let progress: Arc<dyn ProgressReporter> = match &replyto {
        Some(addr) => Arc::new(ReplyProgressReporter {
            runtime: runtime.clone(),
            destination: parse_address(addr),
            sn: sn.clone(),
            data: envelope.data.clone(),
        }),
        None => Arc::new(NullProgressReporter),
    };
    let ctx = CallContext::new(sn.clone(), progress, token);

    send_status(&runtime, &envelope, Status::Started).await;

    let result = dispatch(&plugin, is_sink, &inbound_queue, &envelope, &ctx).await;

    runtime.cancel.remove(&sn);
    finish(&runtime, &envelope, result).await;
}

async fn dispatch(
    plugin: &Arc<rmi_catalog::Plugin<DispatchJob>>,
    is_sink: bool,
    inbound_queue: &str,
    envelope: &Envelope,
    ctx: &CallContext,
) -> ResultBody {
    if is_sink {
        return ResultBody::Exval(format!("PluginNotFound({inbound_queue})"));
    }
    let Some(request) = &envelope.request else {
        return ResultBody::Exval("DocumentInvalid(request body missing at dispatch)".to_string());
    };
    let class = match plugin.resolve_class(&request.classname) {
        Ok(class) => class,
        Err(err) => return ResultBody::Exval(format!("{}({})", err.code.as_str(), err.message)),
    };
    let method = match class.resolve(&request.method) {
        Ok(method) => method,
        Err(err) => return ResultBody::Exval(format!("{}({})", err.code.as_str(), err.message)),
    };
    match method.call(ctx, request.args.clone(), request.kws.clone()).await {
        Ok(value) => ResultBody::Retval(value),
        Err(err) => ResultBody::Exval(err.to_string()),
    }
}

/// Commit the request out of the pending store, then best-effort deliver
/// the final reply. Commit always happens first and unconditionally —
/// the reply is advisory, the store is the durability boundary.
async fn finish(runtime: &RuntimeShared, envelope: &Envelope, result: ResultBody) {
    if let Err(err) = runtime.store.commit(&envelope.sn).await {
        tracing::error!(sn = %envelope.sn, error = %err, "task: failed to commit completed request");
    }

    let Some(replyto) = envelope.replyto.clone() else { return };
    let mut reply = Envelope::new_request("", "");
    reply.sn = envelope.sn.clone();
    reply.version = CONTRACT_VERSION.to_string();
    reply.request = None;
    reply.replyto = None;
    reply.data = envelope.data.clone();
    reply.result = Some(result);
    reply.ts = Some(Utc::now());
    send_best_effort(runtime, &parse_address(&replyto), &reply).await;
}

async fn send_status(runtime: &RuntimeShared, envelope: &Envelope, status: Status) {
    let Some(replyto) = envelope.replyto.clone() else { return };
    let mut status_envelope = Envelope::new_request("", "");
    status_envelope.sn = envelope.sn.clone();
    status_envelope.version = CONTRACT_VERSION.to_string();
    status_envelope.request = None;
    status_envelope.replyto = None;
    status_envelope.data = envelope.data.clone();
    status_envelope.status = Some(status);
    status_envelope.ts = Some(Utc::now());
    send_best_effort(runtime, &parse_address(&replyto), &status_envelope).await;
}

/// Turns in-flight `CallContext::report_progress` calls into `progress`
/// status envelopes sent to the original caller.
struct ReplyProgressReporter {
    runtime: Arc<RuntimeShared>,
    destination: rmi_broker::Destination,
    sn: String,
    data: Option<Value>,
}

#[async_trait::async_trait]
impl ProgressReporter for ReplyProgressReporter {
    async fn report(&self, total: Option<u64>, completed: u64, details: Option<String>) {
        let mut envelope = Envelope::new_request("", "");
        envelope.sn = self.sn.clone();
        envelope.version = CONTRACT_VERSION.to_string();
        envelope.request = None;
        envelope.data = self.data.clone();
        envelope.status = Some(Status::Progress);
        envelope.ts = Some(Utc::now());
        if let Some(total) = total {
            envelope.extra.insert("total".to_string(), Value::from(total));
        }
        envelope.extra.insert("completed".to_string(), Value::from(completed));
        if let Some(details) = details {
            envelope.extra.insert("details".to_string(), Value::String(details));
        }
        send_best_effort(&self.runtime, &self.destination, &envelope).await;
    }
}
