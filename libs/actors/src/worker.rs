//! Worker
//!
//! One FIFO queue and one sequential consumption loop. Each loop iteration
//! pops a message, hands it to the [`HandlerRegistry`], releases its dedup
//! key and marks it done.
//!
//! The shared cancellation flag is checked after every pop: an in-flight
//! delivery always runs to completion, but once the flag is observed the
//! loop exits and whatever is still queued is abandoned (its keys released,
//! its completion never signalled).

use crate::dedup::DedupCache;
use crate::message::Message;
use crate::metrics::BusMetrics;
use crate::registry::HandlerRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Item carried by a worker's queue
#[derive(Debug)]
pub(crate) enum WorkItem {
    Deliver(Arc<dyn Message>),
    /// Terminal sentinel, unblocks a worker waiting on an empty queue
    Shutdown,
}

/// Collaborators every worker loop needs
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    pub registry: Arc<HandlerRegistry>,
    pub dedup: Arc<DedupCache>,
    pub metrics: Arc<BusMetrics>,
    pub cancelled: Arc<AtomicBool>,
}

/// Per-worker diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub index: usize,
    pub group: usize,
    /// Enqueued deliveries not yet finished (including the in-flight one)
    pub queue_len: usize,
    pub processed: u64,
    pub abandoned: u64,
    pub finished: bool,
}

/// Handle to one worker; the consumption loop runs in its own task
#[derive(Debug)]
pub struct Worker {
    index: usize,
    group: usize,
    tx: mpsc::UnboundedSender<WorkItem>,
    pending: AtomicUsize,
    processed: AtomicU64,
    abandoned: AtomicU64,
    finished: AtomicBool,
    idle: Notify,
}

impl Worker {
    pub(crate) fn new(index: usize, group: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            index,
            group,
            tx,
            pending: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            idle: Notify::new(),
        });
        (worker, rx)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Deliveries enqueued and not yet finished
    pub fn queue_len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.queue_len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Append to the queue; false once the worker loop has exited
    pub(crate) fn enqueue(&self, message: Arc<dyn Message>) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(WorkItem::Deliver(message)).is_err() {
            self.finish_one();
            return false;
        }
        true
    }

    pub(crate) fn send_shutdown(&self) {
        // Fails only if the loop already exited
        let _ = self.tx.send(WorkItem::Shutdown);
    }

    /// Suspend until every enqueued delivery has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            index: self.index,
            group: self.group,
            queue_len: self.queue_len(),
            processed: self.processed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            finished: self.is_finished(),
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn abandon(&self, message: Arc<dyn Message>, ctx: &WorkerContext) {
        trace!(
            worker = self.index,
            message_type = message.name(),
            key = message.key(),
            "Abandoning queued message"
        );
        ctx.dedup.release(message.key()).await;
        ctx.metrics.record_abandoned(1);
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        self.finish_one();
    }

    /// Consumption loop; returns when cancelled or sent the sentinel
    pub(crate) async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WorkItem>, ctx: WorkerContext) {
        debug!(worker = self.index, group = self.group, "Worker started");

        while let Some(item) = rx.recv().await {
            let message = match item {
                WorkItem::Deliver(message) => message,
                WorkItem::Shutdown => break,
            };

            if ctx.cancelled.load(Ordering::Acquire) {
                self.abandon(message, &ctx).await;
                break;
            }

            let started = Instant::now();
            let report = ctx.registry.handle(Arc::clone(&message)).await;
            ctx.metrics
                .record_delivery(started.elapsed(), report.failed, report.unhandled);
            ctx.dedup.release(message.key()).await;

            self.processed.fetch_add(1, Ordering::Relaxed);
            self.finish_one();
        }

        // Refuse new work, then discard what is left
        rx.close();
        let before = self.abandoned.load(Ordering::Relaxed);
        while let Ok(item) = rx.try_recv() {
            if let WorkItem::Deliver(message) = item {
                self.abandon(message, &ctx).await;
            }
        }
        let dropped = self.abandoned.load(Ordering::Relaxed) - before;
        if dropped > 0 {
            warn!(
                worker = self.index,
                group = self.group,
                abandoned = dropped,
                "Worker exited with queued messages, discarded"
            );
        }

        self.finished.store(true, Ordering::Release);
        self.idle.notify_waiters();
        info!(
            worker = self.index,
            group = self.group,
            processed = self.processed.load(Ordering::Relaxed),
            "Worker stopped"
        );
    }
}
