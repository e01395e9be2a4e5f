//! Message Taxonomy
//!
//! The four message kinds carried by the bus and the metadata every one of
//! them owns:
//!
//! - [`Event`] - fire-and-forget broadcast, no completion
//! - [`Command`] - intended side effect, completes with a [`Status`]
//! - [`Query`] - request with a typed response
//! - [`Task`] - long-running unit of work, cancellable while it runs
//!
//! Messages are immutable once submitted. The only mutable state is the
//! one-shot [`Completion`] cell, which accepts exactly one value: the first
//! writer wins and every later write is ignored.
//!
//! # Keys
//!
//! Event, Query and Task keys are fresh UUIDs, so every submission is
//! distinct. Command keys are derived from the payload's `Hash` and a short
//! expiry window, so structurally identical commands issued inside the
//! window collapse onto one key and are deduplicated on admission.

use crate::error::{BusError, Result};
use crate::registry::panic_message;
use async_trait::async_trait;
use bus_config::defaults;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Default declared priority (0 is the most urgent)
pub const DEFAULT_PRIORITY: i32 = 1;

/// Default message schema version
pub const DEFAULT_VERSION: u32 = 1;

/// Business partition a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageGroup {
    #[default]
    System,
    Market,
    Signal,
    Position,
    Risk,
    Execution,
    Portfolio,
    Backtest,
}

/// The four permitted message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Event,
    Command,
    Query,
    Task,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Event => "event",
            MessageKind::Command => "command",
            MessageKind::Query => "query",
            MessageKind::Task => "task",
        }
    }

    /// Whether a producer can await an outcome for this kind
    pub fn has_completion(self) -> bool {
        !matches!(self, MessageKind::Event)
    }
}

/// Outcome of an executed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// At least one handler ran to completion
    Success,
    /// An identical command was already in flight; this one was dropped
    Deduplicated,
}

/// Metadata assigned at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Identity used for admission control
    pub key: String,
    /// Construction time (nanoseconds since Unix epoch)
    pub timestamp_ns: u64,
    /// Declared priority, lower is more urgent
    pub priority: i32,
    /// Payload schema version
    pub version: u32,
    /// Business partition
    pub group: MessageGroup,
}

impl MessageMeta {
    /// Create metadata with default priority, version and group
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            timestamp_ns: now_ns(),
            priority: DEFAULT_PRIORITY,
            version: DEFAULT_VERSION,
            group: MessageGroup::default(),
        }
    }

    /// Metadata with a fresh random key
    pub fn unique() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Derive the deterministic key of a command payload.
///
/// Identical payloads (by `Hash`) inside the same `window` produce identical
/// keys. A zero window is treated as one second.
///
/// The hash comes from `DefaultHasher`, which is only deterministic within
/// one process. Keys must not be persisted or compared across builds.
pub fn command_key<P: Hash>(payload: &P, window: Duration) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);

    let window_secs = window.as_secs().max(1);
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    format!(
        "{}:{:016x}:{}",
        type_name::<P>(),
        hasher.finish(),
        unix_secs / window_secs
    )
}

/// One-shot completion cell.
///
/// Holds at most one value. `set` returns `false` and leaves the stored value
/// untouched when the cell is already written. Any number of tasks may
/// `wait` and all of them observe the same value.
pub struct Completion<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Write the value if the cell is empty; wakes every waiter
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current value without waiting
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Suspend until the cell is written
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if rx.changed().await.is_err() {
                return futures::future::pending().await;
            }
        }
    }
}

impl<T: Clone + Send + Sync> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("is_set", &self.tx.borrow().is_some())
            .finish()
    }
}

/// Object-safe view of any message on the bus
pub trait Message: Any + Send + Sync + fmt::Debug {
    fn meta(&self) -> &MessageMeta;

    fn kind(&self) -> MessageKind;

    /// Fully qualified type name, used in logs and dead letters
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Complete the message with an error (no-op for events)
    fn fail(&self, error: BusError);

    /// Complete the message as a dropped duplicate (no-op for events)
    fn reject_duplicate(&self);

    fn key(&self) -> &str {
        &self.meta().key
    }

    fn priority(&self) -> i32 {
        self.meta().priority
    }
}

/// Typed side of a message: what its handlers produce and how that output
/// completes it.
pub trait Deliverable: Message + Sized {
    type Output: Send + 'static;

    /// Store a handler's successful output
    fn resolve(&self, output: Self::Output);

    /// Drive one handler invocation to completion.
    ///
    /// The default awaits the handler and resolves the message with its
    /// output. Tasks override this to run the work independently.
    fn deliver(
        self: Arc<Self>,
        work: BoxFuture<'static, anyhow::Result<Self::Output>>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            let output = work.await?;
            self.resolve(output);
            Ok(())
        }
        .boxed()
    }
}

/// Kind-specific awaiting of a submitted message
#[async_trait]
pub trait Ask: Deliverable {
    type Answer: Send;

    async fn answer(&self) -> Result<Self::Answer>;
}

macro_rules! builder_methods {
    () => {
        /// Set the declared priority (lower is more urgent)
        pub fn with_priority(mut self, priority: i32) -> Self {
            self.meta.priority = priority;
            self
        }

        /// Set the business partition
        pub fn with_group(mut self, group: MessageGroup) -> Self {
            self.meta.group = group;
            self
        }

        /// Set the payload schema version
        pub fn with_version(mut self, version: u32) -> Self {
            self.meta.version = version;
            self
        }

        pub fn payload(&self) -> &P {
            &self.payload
        }
    };
}

macro_rules! message_common {
    ($kind:expr) => {
        fn meta(&self) -> &MessageMeta {
            &self.meta
        }

        fn kind(&self) -> MessageKind {
            $kind
        }

        fn name(&self) -> &'static str {
            type_name::<Self>()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    };
}

/// Fire-and-forget broadcast
#[derive(Debug, Clone)]
pub struct Event<P> {
    meta: MessageMeta,
    payload: P,
}

impl<P> Event<P> {
    pub fn new(payload: P) -> Self {
        Self {
            meta: MessageMeta::unique(),
            payload,
        }
    }

    builder_methods!();
}

impl<P: fmt::Debug + Send + Sync + 'static> Message for Event<P> {
    message_common!(MessageKind::Event);

    fn fail(&self, _error: BusError) {}

    fn reject_duplicate(&self) {}
}

impl<P: fmt::Debug + Send + Sync + 'static> Deliverable for Event<P> {
    type Output = ();

    fn resolve(&self, _output: ()) {}
}

/// Intended side effect with a single completion signal
#[derive(Debug)]
pub struct Command<P> {
    meta: MessageMeta,
    payload: P,
    execution: Completion<Result<Status>>,
}

impl<P: Hash> Command<P> {
    /// Create a command keyed on its payload within the default expiry window
    pub fn new(payload: P) -> Self {
        Self::with_expiry(
            payload,
            Duration::from_secs(defaults::commands::EXPIRY_WINDOW_SECS),
        )
    }

    /// Create a command keyed on its payload within `window`
    pub fn with_expiry(payload: P, window: Duration) -> Self {
        Self {
            meta: MessageMeta::new(command_key(&payload, window)),
            payload,
            execution: Completion::new(),
        }
    }
}

impl<P> Command<P> {
    builder_methods!();

    /// Record the outcome; returns false if an outcome was already recorded
    pub fn mark_executed(&self, result: Result<Status>) -> bool {
        self.execution.set(result)
    }

    pub fn is_executed(&self) -> bool {
        self.execution.is_set()
    }

    /// Suspend until a handler (or admission control) completes the command
    pub async fn wait_for_execution(&self) -> Result<Status> {
        self.execution.wait().await
    }
}

impl<P: fmt::Debug + Send + Sync + 'static> Message for Command<P> {
    message_common!(MessageKind::Command);

    fn fail(&self, error: BusError) {
        self.mark_executed(Err(error));
    }

    fn reject_duplicate(&self) {
        self.mark_executed(Ok(Status::Deduplicated));
    }
}

impl<P: fmt::Debug + Send + Sync + 'static> Deliverable for Command<P> {
    type Output = ();

    fn resolve(&self, _output: ()) {
        self.mark_executed(Ok(Status::Success));
    }
}

#[async_trait]
impl<P: fmt::Debug + Send + Sync + 'static> Ask for Command<P> {
    type Answer = Status;

    async fn answer(&self) -> Result<Status> {
        self.wait_for_execution().await
    }
}

/// Request with a typed response
#[derive(Debug)]
pub struct Query<P, T> {
    meta: MessageMeta,
    payload: P,
    response: Completion<Result<T>>,
}

impl<P, T: Clone + Send + Sync> Query<P, T> {
    pub fn new(payload: P) -> Self {
        Self {
            meta: MessageMeta::unique(),
            payload,
            response: Completion::new(),
        }
    }

    builder_methods!();

    /// Record the response; returns false if a response was already recorded
    pub fn set_response(&self, result: Result<T>) -> bool {
        self.response.set(result)
    }

    pub fn has_response(&self) -> bool {
        self.response.is_set()
    }

    /// Suspend until the response is recorded
    pub async fn wait_for_response(&self) -> Result<T> {
        self.response.wait().await
    }
}

impl<P, T> Message for Query<P, T>
where
    P: fmt::Debug + Send + Sync + 'static,
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    message_common!(MessageKind::Query);

    fn fail(&self, error: BusError) {
        self.set_response(Err(error));
    }

    fn reject_duplicate(&self) {
        self.set_response(Err(BusError::deduplicated(self.meta.key.clone())));
    }
}

impl<P, T> Deliverable for Query<P, T>
where
    P: fmt::Debug + Send + Sync + 'static,
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    type Output = T;

    fn resolve(&self, output: T) {
        self.set_response(Ok(output));
    }
}

#[async_trait]
impl<P, T> Ask for Query<P, T>
where
    P: fmt::Debug + Send + Sync + 'static,
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    type Answer = T;

    async fn answer(&self) -> Result<T> {
        self.wait_for_response().await
    }
}

#[derive(Debug)]
enum TaskState {
    /// Not yet delivered to a handler
    Pending,
    /// Work spawned
    Running(AbortHandle),
    /// Cancelled before or while running
    Cancelled,
}

/// Long-running unit of work.
///
/// The handler registered for a task type is the work itself. On delivery
/// it is spawned onto the runtime, so the delivering worker moves on
/// immediately. The first handler to be delivered owns the task; further
/// handlers for the same task are skipped.
pub struct Task<P, T> {
    meta: MessageMeta,
    payload: P,
    state: Mutex<TaskState>,
    result: Completion<Result<T>>,
    /// Live `wait_for_finishing` futures
    awaiters: AtomicUsize,
}

impl<P, T: Clone + Send + Sync + 'static> Task<P, T> {
    pub fn new(payload: P) -> Self {
        Self {
            meta: MessageMeta::unique(),
            payload,
            state: Mutex::new(TaskState::Pending),
            result: Completion::new(),
            awaiters: AtomicUsize::new(0),
        }
    }

    builder_methods!();

    /// Whether a result (including cancellation) has been recorded
    pub fn is_finished(&self) -> bool {
        self.result.is_set()
    }

    /// Whether the work has been spawned and is not yet finished
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Running(_)) && !self.is_finished()
    }

    /// Abort the work (or prevent it from ever starting)
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock();
            if let TaskState::Running(handle) = &*state {
                handle.abort();
            }
            *state = TaskState::Cancelled;
        }
        self.result.set(Err(BusError::cancelled(type_name::<Self>())))
    }

    /// Suspend until the work finishes.
    ///
    /// Dropping the returned future before it resolves cancels the work once
    /// no other `wait_for_finishing` future is still waiting on it.
    pub async fn wait_for_finishing(&self) -> Result<T> {
        struct CancelOnDrop<'a, P, T: Clone + Send + Sync + 'static> {
            task: &'a Task<P, T>,
            armed: bool,
        }

        impl<P, T: Clone + Send + Sync + 'static> Drop for CancelOnDrop<'_, P, T> {
            fn drop(&mut self) {
                let last = self.task.awaiters.fetch_sub(1, Ordering::AcqRel) == 1;
                if self.armed && last && !self.task.is_finished() {
                    debug!(task = type_name::<Task<P, T>>(), "Last awaiter dropped, cancelling task");
                    self.task.cancel();
                }
            }
        }

        self.awaiters.fetch_add(1, Ordering::AcqRel);
        let mut guard = CancelOnDrop {
            task: self,
            armed: true,
        };
        let result = self.result.wait().await;
        guard.armed = false;
        result
    }
}

impl<P: fmt::Debug, T> fmt::Debug for Task<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("meta", &self.meta)
            .field("payload", &self.payload)
            .field("state", &*self.state.lock())
            .field("result", &self.result)
            .finish()
    }
}

impl<P, T> Message for Task<P, T>
where
    P: fmt::Debug + Send + Sync + 'static,
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    message_common!(MessageKind::Task);

    fn fail(&self, error: BusError) {
        self.result.set(Err(error));
    }

    fn reject_duplicate(&self) {
        self.result
            .set(Err(BusError::deduplicated(self.meta.key.clone())));
    }
}

impl<P, T> Deliverable for Task<P, T>
where
    P: fmt::Debug + Send + Sync + 'static,
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    type Output = T;

    fn resolve(&self, output: T) {
        self.result.set(Ok(output));
    }

    fn deliver(
        self: Arc<Self>,
        work: BoxFuture<'static, anyhow::Result<T>>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let mut state = self.state.lock();
        if matches!(*state, TaskState::Cancelled) {
            debug!(task = self.name(), key = %self.meta.key, "Task cancelled before delivery");
        } else if matches!(*state, TaskState::Running(_)) {
            debug!(task = self.name(), key = %self.meta.key, "Task already running, skipping handler");
        } else {
            let task = Arc::clone(&self);
            let join = tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(anyhow::anyhow!(
                        "task work panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                };
                match outcome {
                    Ok(output) => task.resolve(output),
                    Err(e) => {
                        error!(
                            task = task.name(),
                            key = %task.meta.key,
                            error = %e,
                            "Task work failed"
                        );
                        task.fail(BusError::handler(task.name(), e));
                    }
                }
            });
            *state = TaskState::Running(join.abort_handle());
        }
        drop(state);
        futures::future::ready(Ok(())).boxed()
    }
}

#[async_trait]
impl<P, T> Ask for Task<P, T>
where
    P: fmt::Debug + Send + Sync + 'static,
    T: fmt::Debug + Clone + Send + Sync + 'static,
{
    type Answer = T;

    async fn answer(&self) -> Result<T> {
        self.wait_for_finishing().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Hash)]
    struct OpenPosition {
        symbol: String,
        size: u64,
    }

    #[tokio::test]
    async fn test_completion_first_writer_wins() {
        let cell: Completion<u32> = Completion::new();
        assert!(!cell.is_set());
        assert!(cell.set(1));
        assert!(!cell.set(2));
        assert_eq!(cell.get(), Some(1));
        assert_eq!(cell.wait().await, 1);
    }

    #[tokio::test]
    async fn test_completion_wakes_all_waiters() {
        let cell: Arc<Completion<&'static str>> = Arc::new(Completion::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        cell.set("done");

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), "done");
        }
    }

    #[test]
    fn test_command_keys_collapse_identical_payloads() {
        let a = Command::new(OpenPosition { symbol: "BTC".into(), size: 1 });
        let b = Command::new(OpenPosition { symbol: "BTC".into(), size: 1 });
        let c = Command::new(OpenPosition { symbol: "ETH".into(), size: 1 });

        // Keys only differ if the window rolled over between constructions
        let window = |k: &str| k.rsplit(':').next().map(str::to_owned);
        if window(a.key()) == window(b.key()) {
            assert_eq!(a.key(), b.key());
        }
        assert_ne!(a.key(), c.key());
        assert!(a.key().contains("OpenPosition"));
    }

    #[test]
    fn test_unique_keys_for_events_and_queries() {
        let a = Event::new(1u8);
        let b = Event::new(1u8);
        assert_ne!(a.key(), b.key());

        let q1: Query<&str, f64> = Query::new("BTC");
        let q2: Query<&str, f64> = Query::new("BTC");
        assert_ne!(q1.key(), q2.key());
    }

    #[test]
    fn test_builders_do_not_touch_key() {
        let event = Event::new("tick");
        let key = event.key().to_string();
        let event = event
            .with_priority(0)
            .with_group(MessageGroup::Market)
            .with_version(3);

        assert_eq!(event.key(), key);
        assert_eq!(event.meta().priority, 0);
        assert_eq!(event.meta().group, MessageGroup::Market);
        assert_eq!(event.meta().version, 3);
        assert_eq!(event.kind(), MessageKind::Event);
        assert!(!event.kind().has_completion());
    }

    #[tokio::test]
    async fn test_command_completion_is_set_once() {
        let cmd = Command::new(OpenPosition { symbol: "BTC".into(), size: 2 });
        assert!(cmd.mark_executed(Ok(Status::Success)));
        cmd.fail(BusError::system("late failure"));
        assert_eq!(cmd.wait_for_execution().await.unwrap(), Status::Success);
    }

    #[tokio::test]
    async fn test_duplicate_rejection_outcomes() {
        let cmd = Command::new(OpenPosition { symbol: "BTC".into(), size: 3 });
        cmd.reject_duplicate();
        assert_eq!(cmd.wait_for_execution().await.unwrap(), Status::Deduplicated);

        let query: Query<&str, f64> = Query::new("BTC");
        query.reject_duplicate();
        assert!(matches!(
            query.wait_for_response().await,
            Err(BusError::Deduplicated { .. })
        ));
    }

    #[tokio::test]
    async fn test_task_runs_independently() {
        let task: Arc<Task<&str, u64>> = Arc::new(Task::new("backtest"));
        let work = async { anyhow::Ok(7u64) }.boxed();
        Arc::clone(&task).deliver(work).await.unwrap();

        assert_eq!(task.wait_for_finishing().await.unwrap(), 7);
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_task_cancelled_when_awaiter_dropped() {
        let task: Arc<Task<&str, u64>> = Arc::new(Task::new("slow"));
        let work = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(1u64)
        }
        .boxed();
        Arc::clone(&task).deliver(work).await.unwrap();
        assert!(task.is_running());

        let waited =
            tokio::time::timeout(Duration::from_millis(20), task.wait_for_finishing()).await;
        assert!(waited.is_err());

        assert!(task.is_finished());
        assert!(matches!(
            task.wait_for_finishing().await,
            Err(BusError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_task_survives_while_another_awaiter_waits() {
        let task: Arc<Task<&str, u64>> = Arc::new(Task::new("shared"));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let work = async move {
            gate.await?;
            anyhow::Ok(9u64)
        }
        .boxed();
        Arc::clone(&task).deliver(work).await.unwrap();

        let patient = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.wait_for_finishing().await })
        };
        while task.awaiters.load(Ordering::Acquire) == 0 {
            tokio::task::yield_now().await;
        }

        let impatient =
            tokio::time::timeout(Duration::from_millis(20), task.wait_for_finishing()).await;
        assert!(impatient.is_err());
        assert!(task.is_running());

        release.send(()).unwrap();
        assert_eq!(patient.await.unwrap().unwrap(), 9);
        assert_eq!(task.awaiters.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_task_cancelled_before_delivery_never_runs() {
        let task: Arc<Task<&str, u64>> = Arc::new(Task::new("never"));
        assert!(task.cancel());

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let work = async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            anyhow::Ok(1u64)
        }
        .boxed();
        Arc::clone(&task).deliver(work).await.unwrap();
        tokio::task::yield_now().await;

        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(task.wait_for_finishing().await.is_err());
    }
}
