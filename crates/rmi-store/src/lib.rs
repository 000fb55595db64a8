// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pending store: a durable, crash-survivable FIFO of accepted
//! requests waiting to be scheduled.
//!
//! Every accepted request is written to `<dir>/<sn>.json` before the
//! ingress consumer acknowledges the inbound broker message — so a crash
//! between accept and schedule never loses a request. [`PendingStore::get`]
//! hands requests out in enqueue order but does **not** delete anything;
//! only [`PendingStore::commit`] does, and only once a reply has been
//! computed. A request that was `get()`-ed but never committed is
//! redelivered on the next [`PendingStore::open`], because the file is
//! still on disk and gets re-enqueued during the startup scan.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rmi_envelope::Envelope;
use rmi_error::{ErrorCode, RmiError};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
}

/// A directory-backed FIFO of pending (accepted, not yet committed)
/// requests, keyed by serial number.
pub struct PendingStore {
    dir: PathBuf,
    state: Mutex<State>,
    notify: Notify,
}

impl PendingStore {
    /// Open (creating if needed) the pending directory at `dir`, replaying
    /// any `*.json` files already there into the FIFO ordered by last
    /// modified time — this is what makes an uncommitted request survive
    /// a restart.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RmiError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_error("create pending dir", e))?;

        let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(|e| io_error("read pending dir", e))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| io_error("read pending dir entry", e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(sn) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(|e| io_error("stat pending file", e))?;
            let modified = metadata.modified().map_err(|e| io_error("read mtime", e))?;
            entries.push((modified, sn.to_string()));
        }
        entries.sort_by_key(|(modified, _)| *modified);

        let queue: VecDeque<String> = entries.into_iter().map(|(_, sn)| sn).collect();
        let queued: HashSet<String> = queue.iter().cloned().collect();
        if !queue.is_empty() {
            tracing::info!(count = queue.len(), "replaying uncommitted requests from pending store");
        }

        Ok(Self { dir, state: Mutex::new(State { queue, queued }), notify: Notify::new() })
    }

    fn path_for(&self, sn: &str) -> PathBuf {
        self.dir.join(format!("{sn}.json"))
    }

    fn tmp_path_for(&self, sn: &str) -> PathBuf {
        self.dir.join(format!("{sn}.json.tmp"))
    }

    /// Persist `envelope` and enqueue it. Writing is atomic (write to a
    /// temp file, then rename) so a concurrent [`open`](Self::open) never
    /// observes a half-written file. Calling `put` again with the same
    /// `sn` overwrites the file but does not enqueue a second entry —
    /// this makes accept-then-redeliver (a broker redelivery after an
    /// ack that didn't make it back) idempotent.
    pub async fn put(&self, envelope: &Envelope) -> Result<(), RmiError> {
        let sn = envelope.sn.clone();
        let bytes = serde_json::to_vec_pretty(envelope)
            .map_err(|e| RmiError::new(ErrorCode::Internal, "failed to encode pending request").with_source(e))?;

        let tmp = self.tmp_path_for(&sn);
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_error("write pending request", e))?;
        tokio::fs::rename(&tmp, self.path_for(&sn)).await.map_err(|e| io_error("persist pending request", e))?;

        let mut state = self.state.lock().await;
        if state.queued.insert(sn.clone()) {
            state.queue.push_back(sn);
        }
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Block until the oldest pending request is available and return it.
    /// The request stays on disk until [`commit`](Self::commit) is called.
    pub async fn get(&self) -> Result<Envelope, RmiError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(sn) = state.queue.pop_front() {
                    state.queued.remove(&sn);
                    drop(state);
                    return self.read(&sn).await;
                }
            }
            notified.await;
        }
    }

    async fn read(&self, sn: &str) -> Result<Envelope, RmiError> {
        let bytes = tokio::fs::read(self.path_for(sn)).await.map_err(|e| io_error("read pending request", e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RmiError::new(ErrorCode::DocumentInvalid, "pending request file is corrupt").with_source(e))
    }

    /// Delete the on-disk record for `sn`. Idempotent — committing an `sn`
    /// that is already gone (or was never known) is not an error.
    pub async fn commit(&self, sn: &str) -> Result<(), RmiError> {
        match tokio::fs::remove_file(self.path_for(sn)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("commit pending request", e)),
        }
    }

    /// Re-enqueue `sn` without touching its file — used when a request's
    /// execution window hasn't opened yet and it needs to be reconsidered
    /// later rather than dispatched now.
    pub async fn requeue(&self, sn: &str) {
        let mut state = self.state.lock().await;
        if state.queued.insert(sn.to_string()) {
            state.queue.push_back(sn.to_string());
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Re-enqueue `sn` after `delay` instead of immediately, so a request
    /// whose window hasn't opened yet doesn't come straight back off
    /// `get()` and spin the scheduler until `window.begin`. Spawns a
    /// detached task that sleeps for `delay` and then calls
    /// [`requeue`](Self::requeue); `self` must be held in an `Arc` since
    /// the delayed task outlives this call.
    pub fn requeue_after(self: &Arc<Self>, sn: impl Into<String>, delay: std::time::Duration) {
        let store = self.clone();
        let sn = sn.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.requeue(&sn).await;
        });
    }

    /// Number of requests currently waiting to be `get()`-ed (does not
    /// include requests already handed out but not yet committed).
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// The directory this store is backed by.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn io_error(action: &str, err: std::io::Error) -> RmiError {
    RmiError::new(ErrorCode::StoreIoFailed, format!("pending store: {action}")).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmi_envelope::Envelope;
    use std::time::Duration;

    fn envelope(sn: &str) -> Envelope {
        let mut e = Envelope::new_request("Echo", "bark");
        e.sn = sn.to_string();
        e
    }

    #[tokio::test]
    async fn put_then_get_returns_same_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();
        store.put(&envelope("sn-1")).await.unwrap();
        let got = store.get().await.unwrap();
        assert_eq!(got.sn, "sn-1");
    }

    #[tokio::test]
    async fn get_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();
        store.put(&envelope("sn-1")).await.unwrap();
        store.put(&envelope("sn-2")).await.unwrap();
        store.put(&envelope("sn-3")).await.unwrap();
        assert_eq!(store.get().await.unwrap().sn, "sn-1");
        assert_eq!(store.get().await.unwrap().sn, "sn-2");
        assert_eq!(store.get().await.unwrap().sn, "sn-3");
    }

    #[tokio::test]
    async fn commit_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();
        store.put(&envelope("sn-1")).await.unwrap();
        let _ = store.get().await.unwrap();
        store.commit("sn-1").await.unwrap();
        assert!(!dir.path().join("sn-1.json").exists());
        // committing again is a no-op, not an error
        store.commit("sn-1").await.unwrap();
    }

    #[tokio::test]
    async fn reopening_replays_uncommitted_requests() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PendingStore::open(dir.path()).await.unwrap();
            store.put(&envelope("sn-1")).await.unwrap();
            // get() without commit simulates a crash before execution finished
            let _ = store.get().await.unwrap();
        }
        let reopened = PendingStore::open(dir.path()).await.unwrap();
        let got = reopened.get().await.unwrap();
        assert_eq!(got.sn, "sn-1");
    }

    #[tokio::test]
    async fn committed_requests_do_not_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PendingStore::open(dir.path()).await.unwrap();
            store.put(&envelope("sn-1")).await.unwrap();
            let _ = store.get().await.unwrap();
            store.commit("sn-1").await.unwrap();
        }
        let reopened = PendingStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.pending_count().await, 0);
    }

    #[tokio::test]
    async fn put_with_same_sn_does_not_duplicate_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();
        store.put(&envelope("sn-1")).await.unwrap();
        store.put(&envelope("sn-1")).await.unwrap();
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn get_blocks_until_a_request_is_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(PendingStore::open(dir.path()).await.unwrap());
        let reader = store.clone();
        let handle = tokio::spawn(async move { reader.get().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.put(&envelope("sn-1")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(got.sn, "sn-1");
    }

    #[tokio::test]
    async fn requeue_makes_a_request_gettable_again_without_rewriting_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::open(dir.path()).await.unwrap();
        store.put(&envelope("sn-1")).await.unwrap();
        let first = store.get().await.unwrap();
        store.requeue(&first.sn).await;
        let second = store.get().await.unwrap();
        assert_eq!(second.sn, "sn-1");
    }

    #[tokio::test]
    async fn requeue_after_does_not_make_the_request_gettable_before_the_delay() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(PendingStore::open(dir.path()).await.unwrap());
        store.put(&envelope("sn-1")).await.unwrap();
        let first = store.get().await.unwrap();
        store.requeue_after(first.sn.clone(), Duration::from_millis(80));

        let too_soon = tokio::time::timeout(Duration::from_millis(30), store.get()).await;
        assert!(too_soon.is_err(), "request should not be gettable before the delay elapses");

        let got = tokio::time::timeout(Duration::from_millis(300), store.get()).await.unwrap().unwrap();
        assert_eq!(got.sn, "sn-1");
    }
}
