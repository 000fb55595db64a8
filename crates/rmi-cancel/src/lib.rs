// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide cooperative cancellation.
//!
//! The task runtime registers every in-flight request's serial number with
//! a [`CancellationTracker`] before dispatch and removes it on exit. A
//! control-plane caller who wants to cancel a run looks it up by serial
//! number and flips its token — the plugin method itself decides when (or
//! whether) to notice, by polling [`CancellationToken::is_cancelled`].
//! Nothing here force-kills a running task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one
/// immediately makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent — calling more than once is harmless.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a future that completes when the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Process-wide `sn -> token` map.
///
/// Add a token when a request starts executing, cancel by `sn` from
/// anywhere (e.g. an HTTP control-plane handler), and remove it once the
/// task runtime is done with the request — entries are never cleaned up
/// automatically, so callers must remove what they add.
#[derive(Default)]
pub struct CancellationTracker {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sn` and return its token. Replaces any prior token for the
    /// same `sn` (a `put()` with a reused `sn` starts a fresh lifecycle).
    pub fn add(&self, sn: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("cancellation tracker poisoned")
            .insert(sn.to_string(), token.clone());
        token
    }

    /// Cancel the token registered for `sn`, if any. Returns `true` if `sn`
    /// was tracked.
    pub fn cancel(&self, sn: &str) -> bool {
        let tokens = self.tokens.lock().expect("cancellation tracker poisoned");
        match tokens.get(sn) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `sn` is tracked and has been cancelled. An
    /// untracked `sn` is reported as not cancelled.
    #[must_use]
    pub fn is_cancelled(&self, sn: &str) -> bool {
        self.tokens
            .lock()
            .expect("cancellation tracker poisoned")
            .get(sn)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Stop tracking `sn`. Idempotent.
    pub fn remove(&self, sn: &str) {
        self.tokens
            .lock()
            .expect("cancellation tracker poisoned")
            .remove(sn);
    }

    /// Number of currently tracked serial numbers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.lock().expect("cancellation tracker poisoned").len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
