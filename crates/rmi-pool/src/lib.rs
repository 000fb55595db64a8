// SPDX-License-Identifier: MIT OR Apache-2.0
//! A bounded-backlog worker pool that load-balances by smallest backlog.
//!
//! Each worker owns a small FIFO channel ("backlog") and an atomic counter
//! of its queue depth. [`WorkerPool::schedule`] always picks the worker
//! with the smallest counter and increments it *before* the send
//! completes — so a burst of scheduling calls spreads across workers
//! instead of piling onto whichever one happened to be idle a moment ago.
//! A pool can also run in [`WorkerPool::direct`] mode, executing the
//! handler inline with no background worker at all, for call sites that
//! need to bypass any real concurrency (an unregistered destination,
//! for instance).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

/// A boxed, owned, `'static` future — the shape the pool's handler returns.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The function a pool invokes for each scheduled item.
pub type Handler<T> = Arc<dyn Fn(T) -> BoxFuture + Send + Sync>;

enum Command<T> {
    Item(T),
    Stop(oneshot::Sender<Vec<T>>),
}

struct Worker<T> {
    backlog: Arc<AtomicUsize>,
    tx: mpsc::Sender<Command<T>>,
}

/// A pool of workers, or a direct (no-threading) passthrough.
pub struct WorkerPool<T: Send + 'static> {
    workers: Vec<Worker<T>>,
    direct: Option<Handler<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Build a pool of `capacity` workers, each with a backlog bounded at
    /// `backlog` items, all running `handler`.
    #[must_use]
    pub fn new(capacity: usize, backlog: usize, handler: Handler<T>) -> Arc<Self> {
        assert!(capacity > 0, "worker pool capacity must be at least 1");
        let backlog = backlog.max(1);
        let mut workers = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let (tx, rx) = mpsc::channel::<Command<T>>(backlog);
            let counter = Arc::new(AtomicUsize::new(0));
            spawn_worker(rx, counter.clone(), handler.clone());
            workers.push(Worker { backlog: counter, tx });
        }
        Arc::new(Self { workers, direct: None })
    }

    /// Build a pool that runs `handler` inline on the caller's task, with
    /// no worker threads and no backlog of its own.
    #[must_use]
    pub fn direct(handler: Handler<T>) -> Arc<Self> {
        Arc::new(Self { workers: Vec::new(), direct: Some(handler) })
    }

    /// `true` for a pool built with [`WorkerPool::direct`].
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct.is_some()
    }

    /// Hand `item` to the pool. In threaded mode this blocks only if every
    /// worker's backlog is full; in direct mode it runs the handler to
    /// completion before returning.
    pub async fn schedule(&self, item: T) {
        if let Some(handler) = &self.direct {
            handler(item).await;
            return;
        }
        let idx = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.backlog.load(Ordering::SeqCst))
            .map(|(idx, _)| idx)
            .expect("threaded pool has at least one worker");
        self.workers[idx].backlog.fetch_add(1, Ordering::SeqCst);
        if self.workers[idx].tx.send(Command::Item(item)).await.is_err() {
            tracing::error!("worker pool: channel closed while scheduling");
        }
    }

    /// Current backlog depth per worker, in worker order. Empty for a
    /// direct pool.
    #[must_use]
    pub fn backlog_snapshot(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.backlog.load(Ordering::SeqCst)).collect()
    }

    /// Stop accepting new work and return every item still sitting in a
    /// worker's backlog, unprocessed. Items already being handled when
    /// `shutdown` is called are allowed to finish. A direct pool has
    /// nothing to drain and returns an empty list.
    pub async fn shutdown(&self) -> Vec<T> {
        let mut orphans = Vec::new();
        for worker in &self.workers {
            let (tx, rx) = oneshot::channel();
            if worker.tx.send(Command::Stop(tx)).await.is_ok() {
                if let Ok(mut drained) = rx.await {
                    orphans.append(&mut drained);
                }
            }
        }
        orphans
    }
}

fn spawn_worker<T: Send + 'static>(
    mut rx: mpsc::Receiver<Command<T>>,
    backlog: Arc<AtomicUsize>,
    handler: Handler<T>,
) {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Item(item) => {
                    backlog.fetch_sub(1, Ordering::SeqCst);
                    handler(item).await;
                }
                Command::Stop(reply) => {
                    let mut orphans = Vec::new();
                    while let Ok(cmd) = rx.try_recv() {
                        if let Command::Item(item) = cmd {
                            orphans.push(item);
                        }
                    }
                    let _ = reply.send(orphans);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn noop_handler() -> Handler<u32> {
        Arc::new(|_: u32| Box::pin(async {}))
    }

    #[tokio::test]
    async fn direct_pool_runs_inline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let pool = WorkerPool::direct(Arc::new(move |item: u32| {
            let seen = seen2.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(item);
            })
        }));
        assert!(pool.is_direct());
        pool.schedule(7).await;
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(pool.backlog_snapshot().is_empty());
    }

    #[tokio::test]
    async fn threaded_pool_processes_all_items() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let pool = WorkerPool::new(
            3,
            8,
            Arc::new(move |item: u32| {
                let seen = seen2.clone();
                Box::pin(async move {
                    seen.lock().unwrap().push(item);
                })
            }),
        );
        for i in 0..12u32 {
            pool.schedule(i).await;
        }
        // give workers a moment to drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn schedule_balances_across_workers() {
        let pool = WorkerPool::new(4, 16, noop_handler());
        for _ in 0..8 {
            // backlog counters only decrement once a worker actually pulls
            // the item off its channel, so scheduling in a tight loop
            // before any worker wakes exercises the smallest-backlog pick.
            pool.schedule(0).await;
        }
        let snapshot = pool.backlog_snapshot();
        let total: usize = snapshot.iter().sum();
        assert!(total <= 8);
        let max = *snapshot.iter().max().unwrap_or(&0);
        let min = *snapshot.iter().min().unwrap_or(&0);
        assert!(max - min <= 1, "backlog should be balanced within 1: {snapshot:?}");
    }

    #[tokio::test]
    async fn shutdown_drains_unprocessed_orphans() {
        let pool = WorkerPool::new(1, 16, Arc::new(|item: u32| {
            Box::pin(async move {
                if item == 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
        }));
        for i in 0..5u32 {
            pool.schedule(i).await;
        }
        let orphans = pool.shutdown().await;
        assert!(orphans.len() <= 4, "at most the items behind the in-flight one should be orphaned");
    }

    #[tokio::test]
    async fn direct_pool_shutdown_drains_nothing() {
        let pool = WorkerPool::direct(noop_handler());
        pool.schedule(1).await;
        let orphans = pool.shutdown().await;
        assert!(orphans.is_empty());
    }
}
