//! Worker Pool
//!
//! `W x G` workers created eagerly and sliced into `G` contiguous priority
//! groups of `W`. Routing a message takes three steps:
//!
//! 1. The [`LoadBalancer`] picks a priority group.
//! 2. The [`DedupCache`] admits or rejects the message key. Rejections still
//!    count towards the balancer, which tracks attempted traffic.
//! 3. A worker inside the group's slice is chosen: any idle worker first
//!    (uniformly among the idle ones), otherwise a draw weighted by
//!    `1 / (queue_len + 1)`.

use crate::balancer::LoadBalancer;
use crate::dedup::DedupCache;
use crate::error::BusError;
use crate::message::Message;
use crate::metrics::BusMetrics;
use crate::registry::HandlerRegistry;
use crate::worker::{Worker, WorkerContext, WorkerStats};
use bus_config::BusConfig;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Result of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Enqueued on `worker` in priority group `group`
    Enqueued { group: usize, worker: usize },
    /// Same key already in flight; the message was completed as a duplicate
    Deduplicated { group: usize },
    /// The chosen worker has exited; the message was failed with `Stopped`
    Closed { group: usize },
}

/// Fixed set of workers partitioned by priority group
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    workers_per_group: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    balancer: LoadBalancer,
    dedup: Arc<DedupCache>,
    metrics: Arc<BusMetrics>,
    cancelled: Arc<AtomicBool>,
    rng: Mutex<StdRng>,
}

impl WorkerPool {
    /// Create and spawn every worker. Must be called inside a tokio runtime.
    pub fn new(config: &BusConfig, registry: Arc<HandlerRegistry>, metrics: Arc<BusMetrics>) -> Self {
        let groups = config.pool.priority_groups.max(1);
        let per_group = config.pool.workers_per_group.max(1);
        let dedup = Arc::new(DedupCache::new(&config.dedup));
        let cancelled = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext {
            registry,
            dedup: Arc::clone(&dedup),
            metrics: Arc::clone(&metrics),
            cancelled: Arc::clone(&cancelled),
        };

        let mut workers = Vec::with_capacity(groups * per_group);
        let mut handles = Vec::with_capacity(groups * per_group);
        for index in 0..groups * per_group {
            let (worker, rx) = Worker::new(index, index / per_group);
            handles.push(tokio::spawn(Arc::clone(&worker).run(rx, ctx.clone())));
            workers.push(worker);
        }

        // Worker selection gets its own stream so a balancer seed stays reproducible
        let rng = match config.balancer.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };

        info!(
            priority_groups = groups,
            workers_per_group = per_group,
            shards = dedup.shard_count(),
            "Worker pool started"
        );

        Self {
            workers,
            workers_per_group: per_group,
            handles: Mutex::new(handles),
            balancer: LoadBalancer::new(groups, &config.balancer),
            dedup,
            metrics,
            cancelled,
            rng: Mutex::new(rng),
        }
    }

    pub fn priority_groups(&self) -> usize {
        self.balancer.groups()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Workers serving priority group `group`
    pub fn group_workers(&self, group: usize) -> &[Arc<Worker>] {
        let start = group * self.workers_per_group;
        &self.workers[start..start + self.workers_per_group]
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Route `message` to a worker
    pub async fn dispatch_to_worker(&self, message: Arc<dyn Message>) -> DispatchOutcome {
        let group = self.balancer.determine_priority_group(message.priority());

        if !self.dedup.acquire(message.key()).await {
            self.balancer.register_event(group);
            self.metrics.record_deduplicated();
            debug!(
                message_type = message.name(),
                key = message.key(),
                group,
                "Duplicate message dropped"
            );
            message.reject_duplicate();
            return DispatchOutcome::Deduplicated { group };
        }

        let worker = self.select_worker(group);
        let key = message.key().to_string();
        trace!(
            message_type = message.name(),
            key = %key,
            group,
            worker = worker.index(),
            "Routing message"
        );

        if !worker.enqueue(Arc::clone(&message)) {
            self.dedup.release(&key).await;
            error!(worker = worker.index(), key = %key, "Worker queue closed, message not enqueued");
            message.fail(BusError::stopped(message.kind().as_str()));
            return DispatchOutcome::Closed { group };
        }
        self.balancer.register_event(group);

        DispatchOutcome::Enqueued {
            group,
            worker: worker.index(),
        }
    }

    fn select_worker(&self, group: usize) -> &Arc<Worker> {
        let candidates = self.group_workers(group);
        let mut rng = self.rng.lock();

        let idle: Vec<&Arc<Worker>> = candidates.iter().filter(|w| w.is_idle()).collect();
        if let Some(worker) = idle.choose(&mut *rng) {
            return *worker;
        }

        let weights = candidates
            .iter()
            .map(|w| 1.0 / (w.queue_len() as f64 + 1.0));
        match WeightedIndex::new(weights) {
            Ok(distribution) => &candidates[distribution.sample(&mut *rng)],
            Err(_) => &candidates[0],
        }
    }

    /// Suspend until every worker has drained its queue.
    ///
    /// Handlers may enqueue follow-up messages on workers that already went
    /// idle, so the check repeats until all of them are idle at once.
    pub async fn wait_idle(&self) {
        loop {
            join_all(self.workers.iter().map(|w| w.wait_idle())).await;
            if self.workers.iter().all(|w| w.is_idle()) {
                return;
            }
        }
    }

    pub fn all_idle_or_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_idle() || w.is_finished())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Send the terminal sentinel to every worker and await their loops
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.send_shutdown();
        }
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task did not exit cleanly");
            }
        }
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterQueue;
    use crate::error::BusError;
    use crate::message::{Command, Event, Query, Status};
    use crate::registry::handler_fn;
    use std::sync::atomic::AtomicUsize;

    fn pool(groups: usize, per_group: usize) -> (WorkerPool, Arc<HandlerRegistry>) {
        let mut config = BusConfig::default();
        config.pool.priority_groups = groups;
        config.pool.workers_per_group = per_group;
        config.balancer.seed = Some(11);
        let registry = Arc::new(HandlerRegistry::new(Arc::new(DeadLetterQueue::new(16))));
        let pool = WorkerPool::new(&config, Arc::clone(&registry), Arc::new(BusMetrics::default()));
        (pool, registry)
    }

    #[tokio::test]
    async fn test_workers_are_sliced_into_contiguous_groups() {
        let (pool, _registry) = pool(3, 2);
        assert_eq!(pool.workers().len(), 6);
        for group in 0..3 {
            for worker in pool.group_workers(group) {
                assert_eq!(worker.group(), group);
            }
        }
        assert_eq!(pool.group_workers(1)[0].index(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cold_start_routes_by_declared_priority() {
        let (pool, _registry) = pool(3, 1);
        let message: Arc<dyn Message> = Arc::new(Event::new(1u8).with_priority(2));
        let outcome = pool.dispatch_to_worker(message).await;
        assert_eq!(outcome, DispatchOutcome::Enqueued { group: 2, worker: 2 });
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_rejected_and_counted() {
        let (pool, registry) = pool(1, 1);
        let gate = Arc::new(tokio::sync::Notify::new());
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let gate = Arc::clone(&gate);
            let hits = Arc::clone(&hits);
            registry.register(handler_fn(move |_cmd: Arc<Command<&'static str>>| {
                let gate = Arc::clone(&gate);
                let hits = Arc::clone(&hits);
                async move {
                    gate.notified().await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        let first = Arc::new(Command::new("flatten"));
        let second = Arc::new(Command::new("flatten"));
        if first.key() != second.key() {
            // Expiry window rolled over between constructions
            pool.shutdown().await;
            return;
        }

        assert!(matches!(
            pool.dispatch_to_worker(first.clone()).await,
            DispatchOutcome::Enqueued { .. }
        ));
        assert_eq!(
            pool.dispatch_to_worker(second.clone()).await,
            DispatchOutcome::Deduplicated { group: 0 }
        );
        assert_eq!(second.wait_for_execution().await.unwrap(), Status::Deduplicated);

        gate.notify_one();
        pool.wait_idle().await;
        assert_eq!(first.wait_for_execution().await.unwrap(), Status::Success);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Both attempts reached the balancer
        assert_eq!(pool.balancer().snapshot().counts, vec![2.0]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_worker_preferred() {
        let (pool, registry) = pool(1, 2);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        {
            let gate = Arc::clone(&gate);
            registry.register(handler_fn(move |_e: Arc<Event<u8>>| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await?.forget();
                    anyhow::Ok(())
                }
            }));
        }

        let a = pool.dispatch_to_worker(Arc::new(Event::new(1u8))).await;
        let b = pool.dispatch_to_worker(Arc::new(Event::new(2u8))).await;
        let (DispatchOutcome::Enqueued { worker: wa, .. }, DispatchOutcome::Enqueued { worker: wb, .. }) = (a, b) else {
            panic!("both events should be enqueued");
        };
        assert_ne!(wa, wb);

        gate.add_permits(2);
        pool.wait_idle().await;
        assert!(pool.stats().iter().all(|w| w.processed == 1));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_worker_fails_message_and_frees_key() {
        let (pool, _registry) = pool(1, 1);
        pool.shutdown().await;

        let query = Arc::new(Query::<&'static str, f64>::new("BTC"));
        let outcome = pool.dispatch_to_worker(query.clone()).await;
        assert_eq!(outcome, DispatchOutcome::Closed { group: 0 });

        let answer = tokio::time::timeout(std::time::Duration::from_millis(100), query.wait_for_response())
            .await
            .expect("closed dispatch must complete the query");
        assert!(matches!(answer, Err(BusError::Stopped { .. })));
        assert!(!pool.dedup().contains(query.key()).await);
    }
}
