//! Dispatcher
//!
//! Facade over the handler registry and the worker pool. A `Dispatcher` is a
//! cheap cloneable handle; every clone talks to the same bus.
//!
//! ## Instances
//!
//! - [`Dispatcher::new`] builds an independent bus. Pass it to actors
//!   explicitly.
//! - [`Dispatcher::init`] / [`Dispatcher::global`] give an opt-in
//!   process-wide bus. The first `init` wins; later calls return the same
//!   instance and ignore their configuration.
//!
//! ## Submission
//!
//! `dispatch`, `execute`, `query` and `run` only guarantee the message was
//! routed. Completion is awaited on the message itself
//! (`wait_for_execution`, `wait_for_response`, `wait_for_finishing`).
//!
//! ## Shutdown
//!
//! [`Dispatcher::stop`] is cooperative: in-flight handlers finish, queued
//! messages are abandoned. Call [`Dispatcher::wait`] first to drain.

use crate::dead_letter::DeadLetterQueue;
use crate::error::{BusError, Result};
use crate::message::{Command, Deliverable, Event, Message, Query, Task};
use crate::metrics::{BusMetrics, BusStats};
use crate::pool::{DispatchOutcome, WorkerPool};
use crate::registry::{Handler, HandlerId, HandlerRegistry};
use bus_config::BusConfig;
use once_cell::sync::OnceCell;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

static GLOBAL: OnceCell<Dispatcher> = OnceCell::new();

struct DispatcherInner {
    /// Short id for log correlation
    id: String,
    config: BusConfig,
    registry: Arc<HandlerRegistry>,
    pool: WorkerPool,
    metrics: Arc<BusMetrics>,
    stopped: AtomicBool,
}

/// Handle to a running message bus
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Build an independent bus and spawn its workers.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(config: BusConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BusError::configuration(format!("{:#}", e), None))?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| BusError::system(format!("dispatcher requires a tokio runtime: {}", e)))?;

        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter.capacity));
        let registry = Arc::new(HandlerRegistry::new(dead_letters));
        let metrics = Arc::new(BusMetrics::default());
        let pool = WorkerPool::new(&config, Arc::clone(&registry), Arc::clone(&metrics));

        info!(
            dispatcher = %id,
            priority_groups = config.pool.priority_groups,
            workers = config.pool.total_workers(),
            "Dispatcher started"
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                id,
                config,
                registry,
                pool,
                metrics,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Initialise the process-wide bus, or return it if already initialised
    pub fn init(config: BusConfig) -> Result<Self> {
        GLOBAL.get_or_try_init(|| Self::new(config)).cloned()
    }

    /// The process-wide bus, if [`Dispatcher::init`] has run
    pub fn global() -> Option<Self> {
        GLOBAL.get().cloned()
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        self.inner.registry.dead_letters()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same bus
    pub fn same_bus(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn register<M: Deliverable>(&self, handler: Arc<dyn Handler<M>>) -> HandlerId {
        self.inner.registry.register(handler)
    }

    pub fn register_with_filter<M, F>(&self, handler: Arc<dyn Handler<M>>, filter: F) -> HandlerId
    where
        M: Deliverable,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.inner.registry.register_with_filter(handler, filter)
    }

    /// Remove every registration of `handler`; returns how many were removed
    pub fn unregister<M: Deliverable>(&self, handler: &Arc<dyn Handler<M>>) -> usize {
        self.inner.registry.unregister(handler)
    }

    /// Build a command keyed with the configured expiry window
    pub fn new_command<P: Hash>(&self, payload: P) -> Command<P> {
        Command::with_expiry(payload, self.inner.config.commands.expiry_window())
    }

    /// Route any message; the typed entry points all end here
    pub async fn submit(&self, message: Arc<dyn Message>) -> Result<DispatchOutcome> {
        if self.is_stopped() {
            debug!(
                dispatcher = %self.inner.id,
                message_type = message.name(),
                "Submission rejected, dispatcher stopped"
            );
            return Err(BusError::stopped(message.kind().as_str()));
        }
        self.inner.metrics.record_submitted();
        let kind = message.kind();
        match self.inner.pool.dispatch_to_worker(message).await {
            // Lost a race with stop(); the message was already failed
            DispatchOutcome::Closed { .. } => Err(BusError::stopped(kind.as_str())),
            outcome => Ok(outcome),
        }
    }

    /// Fire-and-forget broadcast
    pub async fn dispatch<P>(&self, event: Arc<Event<P>>) -> Result<()>
    where
        P: fmt::Debug + Send + Sync + 'static,
    {
        self.submit(event).await.map(|_| ())
    }

    /// Enqueue a command; await `wait_for_execution` for the outcome
    pub async fn execute<P>(&self, command: Arc<Command<P>>) -> Result<()>
    where
        P: fmt::Debug + Send + Sync + 'static,
    {
        self.submit(command).await.map(|_| ())
    }

    /// Enqueue a query; await `wait_for_response` for the answer
    pub async fn query<P, T>(&self, query: Arc<Query<P, T>>) -> Result<()>
    where
        P: fmt::Debug + Send + Sync + 'static,
        T: fmt::Debug + Clone + Send + Sync + 'static,
    {
        self.submit(query).await.map(|_| ())
    }

    /// Enqueue a task; await `wait_for_finishing` for its result
    pub async fn run<P, T>(&self, task: Arc<Task<P, T>>) -> Result<()>
    where
        P: fmt::Debug + Send + Sync + 'static,
        T: fmt::Debug + Clone + Send + Sync + 'static,
    {
        self.submit(task).await.map(|_| ())
    }

    /// Suspend until every worker queue has drained
    pub async fn wait(&self) {
        self.inner.pool.wait_idle().await;
    }

    /// Stop the bus.
    ///
    /// Sets the cancellation flag, polls until every worker is idle or has
    /// exited (bounded by the configured drain timeout), then sends the
    /// sentinel to every worker and awaits their loops. Later calls are
    /// no-ops.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!(dispatcher = %self.inner.id, "Dispatcher already stopped");
            return;
        }

        let shutdown = &self.inner.config.shutdown;
        info!(dispatcher = %self.inner.id, "Stopping dispatcher");
        self.inner.pool.cancel();

        let deadline = Instant::now() + shutdown.drain_timeout();
        while !self.inner.pool.all_idle_or_finished() {
            if Instant::now() >= deadline {
                warn!(
                    dispatcher = %self.inner.id,
                    timeout_ms = shutdown.drain_timeout_ms,
                    "Drain bound reached, stopping workers with pending work"
                );
                break;
            }
            tokio::time::sleep(shutdown.poll_interval()).await;
        }

        self.inner.pool.shutdown().await;

        let metrics = self.inner.metrics.snapshot();
        info!(
            dispatcher = %self.inner.id,
            delivered = metrics.delivered,
            abandoned = metrics.abandoned,
            handler_failures = metrics.handler_failures,
            "Dispatcher stopped"
        );
    }

    pub fn stats(&self) -> BusStats {
        let dead_letters = self.dead_letters();
        BusStats {
            metrics: self.inner.metrics.snapshot(),
            balancer: self.inner.pool.balancer().snapshot(),
            workers: self.inner.pool.stats(),
            dead_letters: dead_letters.len(),
            dead_letters_recorded: dead_letters.total_recorded(),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .field("handler_types", &self.inner.registry.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;
    use crate::registry::handler_fn;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn small_config() -> BusConfig {
        let mut config = BusConfig::default();
        config.pool.priority_groups = 2;
        config.pool.workers_per_group = 1;
        config.balancer.seed = Some(3);
        config
    }

    #[tokio::test]
    async fn test_rejects_invalid_configuration() {
        let mut config = small_config();
        config.pool.workers_per_group = 0;
        let err = Dispatcher::new(config).unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(err.to_string().contains("pool.workers_per_group"));
    }

    #[tokio::test]
    async fn test_event_reaches_every_handler_and_wait_drains() {
        let bus = Dispatcher::new(small_config()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.register(handler_fn(move |_e: Arc<Event<u64>>| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        for n in 0..10u64 {
            bus.dispatch(Arc::new(Event::new(n))).await.unwrap();
        }
        bus.wait().await;

        assert_eq!(hits.load(Ordering::SeqCst), 30);
        let stats = bus.stats();
        assert_eq!(stats.metrics.submitted, 10);
        assert_eq!(stats.metrics.delivered, 10);
        assert_eq!(stats.queued(), 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_command_uses_configured_expiry() {
        let mut config = small_config();
        config.commands.expiry_window_secs = 3600;
        let bus = Dispatcher::new(config).unwrap();
        bus.register(handler_fn(|_c: Arc<Command<&'static str>>| async { Ok(()) }));

        let cmd = Arc::new(bus.new_command("rebalance"));
        let window: u64 = cmd.key().rsplit(':').next().unwrap().parse().unwrap();
        let hour = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            / 3600;
        assert!(window == hour || window + 1 == hour);

        bus.execute(cmd.clone()).await.unwrap();
        assert_eq!(cmd.wait_for_execution().await.unwrap(), Status::Success);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_submission_after_stop_is_rejected() {
        let bus = Dispatcher::new(small_config()).unwrap();
        bus.stop().await;
        bus.stop().await;

        let err = bus.dispatch(Arc::new(Event::new(1u8))).await.unwrap_err();
        assert!(matches!(err, BusError::Stopped { .. }));
        assert!(bus.is_stopped());
        assert!(bus.stats().workers.iter().all(|w| w.finished));
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_finish() {
        let bus = Dispatcher::new(small_config()).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = Arc::clone(&done);
            bus.register(handler_fn(move |_e: Arc<Event<u8>>| {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        bus.dispatch(Arc::new(Event::new(1u8))).await.unwrap();
        // Let the worker pick it up
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.stop().await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
