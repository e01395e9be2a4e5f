//! Handler Registry
//!
//! Maps a message's exact runtime type to the handlers registered for it.
//! Delivery looks up the concrete type only; there is no matching on
//! wrapper or payload supertypes.
//!
//! ## Delivery rules
//!
//! - No handler registered: the message is dropped silently. A command or
//!   query in that situation never completes; callers needing a bound must
//!   apply their own timeout.
//! - Each registration whose filter accepts the message is invoked once, in
//!   registration order.
//! - A handler error (or panic) is logged, recorded to the dead-letter queue
//!   and completes the message with `Err`, so an awaiting producer is always
//!   released once any handler has actually run.
//!
//! ## Identity
//!
//! Handlers are `Arc<dyn Handler<M>>`; the `Arc` allocation is the handler's
//! identity. Registering the same `Arc` twice with different filters and
//! unregistering it once removes both registrations.

use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::error::BusError;
use crate::message::{Deliverable, Message};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// Processes one message type
#[async_trait]
pub trait Handler<M: Deliverable>: Send + Sync + 'static {
    async fn handle(&self, message: Arc<M>) -> anyhow::Result<M::Output>;
}

/// Adapter for async closures
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<M, F, Fut> Handler<M> for FnHandler<F>
where
    M: Deliverable,
    F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<M::Output>> + Send + 'static,
{
    async fn handle(&self, message: Arc<M>) -> anyhow::Result<M::Output> {
        (self.f)(message).await
    }
}

/// Adapter for synchronous closures, run on the blocking pool so the
/// delivering worker is never stalled.
pub struct BlockingFnHandler<F> {
    f: Arc<F>,
}

#[async_trait]
impl<M, F> Handler<M> for BlockingFnHandler<F>
where
    M: Deliverable,
    F: Fn(Arc<M>) -> anyhow::Result<M::Output> + Send + Sync + 'static,
{
    async fn handle(&self, message: Arc<M>) -> anyhow::Result<M::Output> {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f(message))
            .await
            .map_err(|e| anyhow::anyhow!("blocking handler did not complete: {}", e))?
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<M, F, Fut>(f: F) -> Arc<dyn Handler<M>>
where
    M: Deliverable,
    F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<M::Output>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Wrap a synchronous closure as a shareable handler
pub fn blocking_handler_fn<M, F>(f: F) -> Arc<dyn Handler<M>>
where
    M: Deliverable,
    F: Fn(Arc<M>) -> anyhow::Result<M::Output> + Send + Sync + 'static,
{
    Arc::new(BlockingFnHandler { f: Arc::new(f) })
}

/// Identity of a registered handler (its `Arc` allocation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

impl HandlerId {
    pub fn of<M: Deliverable>(handler: &Arc<dyn Handler<M>>) -> Self {
        Self(Arc::as_ptr(handler) as *const () as usize)
    }
}

/// Type-erased admission predicate
pub type MessageFilter = Arc<dyn Fn(&dyn Message) -> bool + Send + Sync>;

type Invoke = Arc<dyn Fn(Arc<dyn Message>) -> Option<BoxFuture<'static, anyhow::Result<()>>> + Send + Sync>;

/// One (message type, handler, optional filter) entry
#[derive(Clone)]
pub struct HandlerRegistration {
    type_id: TypeId,
    type_name: &'static str,
    handler_id: HandlerId,
    filter: Option<MessageFilter>,
    invoke: Invoke,
}

impl HandlerRegistration {
    pub fn new<M: Deliverable>(handler: Arc<dyn Handler<M>>, filter: Option<MessageFilter>) -> Self {
        let handler_id = HandlerId::of(&handler);
        let invoke: Invoke = Arc::new(move |message: Arc<dyn Message>| {
            let typed = message.into_any().downcast::<M>().ok()?;
            let handler = Arc::clone(&handler);
            let target = Arc::clone(&typed);
            let work = async move { handler.handle(target).await }.boxed();
            Some(typed.deliver(work))
        });

        Self {
            type_id: TypeId::of::<M>(),
            type_name: type_name::<M>(),
            handler_id,
            filter,
            invoke,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler_id
    }

    fn accepts(&self, message: &dyn Message) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(message))
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("type_name", &self.type_name)
            .field("handler_id", &self.handler_id)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Outcome of delivering one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handlers that ran (filters accepted)
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
    /// No handler was registered for the message type
    pub unhandled: bool,
}

#[derive(Debug)]
struct TypeHandlers {
    type_name: &'static str,
    registrations: Vec<HandlerRegistration>,
}

/// Registry of handlers keyed by concrete message type
#[derive(Debug)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TypeId, TypeHandlers>>,
    dead_letters: Arc<DeadLetterQueue>,
}

impl HandlerRegistry {
    pub fn new(dead_letters: Arc<DeadLetterQueue>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            dead_letters,
        }
    }

    /// Append a prepared registration
    pub fn add(&self, registration: HandlerRegistration) {
        debug!(
            message_type = registration.type_name,
            handler_id = ?registration.handler_id,
            filtered = registration.filter.is_some(),
            "Registering handler"
        );
        self.handlers
            .write()
            .entry(registration.type_id)
            .or_insert_with(|| TypeHandlers {
                type_name: registration.type_name,
                registrations: Vec::new(),
            })
            .registrations
            .push(registration);
    }

    /// Remove every registration of `handler_id` for `type_id`, whatever its filter
    pub fn remove(&self, type_id: TypeId, handler_id: HandlerId) -> usize {
        let mut handlers = self.handlers.write();
        let Some(entry) = handlers.get_mut(&type_id) else {
            return 0;
        };

        let before = entry.registrations.len();
        entry.registrations.retain(|r| r.handler_id != handler_id);
        let removed = before - entry.registrations.len();

        debug!(
            message_type = entry.type_name,
            handler_id = ?handler_id,
            removed,
            "Unregistered handler"
        );

        if entry.registrations.is_empty() {
            handlers.remove(&type_id);
        }
        removed
    }

    /// Register an unfiltered handler for `M`
    pub fn register<M: Deliverable>(&self, handler: Arc<dyn Handler<M>>) -> HandlerId {
        let registration = HandlerRegistration::new(handler, None);
        let id = registration.handler_id;
        self.add(registration);
        id
    }

    /// Register a handler for `M` that only sees messages accepted by `filter`
    pub fn register_with_filter<M, F>(&self, handler: Arc<dyn Handler<M>>, filter: F) -> HandlerId
    where
        M: Deliverable,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let erased: MessageFilter = Arc::new(move |message: &dyn Message| {
            message
                .as_any()
                .downcast_ref::<M>()
                .map_or(false, |typed| filter(typed))
        });
        let registration = HandlerRegistration::new(handler, Some(erased));
        let id = registration.handler_id;
        self.add(registration);
        id
    }

    /// Remove every registration of `handler` for `M`
    pub fn unregister<M: Deliverable>(&self, handler: &Arc<dyn Handler<M>>) -> usize {
        self.remove(TypeId::of::<M>(), HandlerId::of(handler))
    }

    pub fn handler_count<M: Deliverable>(&self) -> usize {
        self.handlers
            .read()
            .get(&TypeId::of::<M>())
            .map_or(0, |entry| entry.registrations.len())
    }

    /// Names of every message type with at least one handler
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.read().values().map(|e| e.type_name).collect();
        names.sort_unstable();
        names
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Deliver `message` to every registered handler whose filter accepts it
    pub async fn handle(&self, message: Arc<dyn Message>) -> DeliveryReport {
        let type_id = message.as_any().type_id();

        // Clone out of the lock: handlers may register or unregister while we await them.
        let registrations = match self.handlers.read().get(&type_id) {
            Some(entry) => entry.registrations.clone(),
            None => Vec::new(),
        };

        if registrations.is_empty() {
            debug!(
                message_type = message.name(),
                key = message.key(),
                "No handler registered, dropping message"
            );
            return DeliveryReport {
                unhandled: true,
                ..DeliveryReport::default()
            };
        }

        let mut report = DeliveryReport::default();
        for registration in &registrations {
            if !registration.accepts(message.as_ref()) {
                continue;
            }
            let Some(delivery) = (registration.invoke)(Arc::clone(&message)) else {
                continue;
            };
            report.invoked += 1;

            let outcome = match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if let Err(e) = outcome {
                report.failed += 1;
                let error = BusError::handler(message.name(), e);
                error!(
                    message_type = message.name(),
                    key = message.key(),
                    handler_id = ?registration.handler_id,
                    error = %error,
                    "Handler failed"
                );
                self.dead_letters
                    .push(DeadLetterEntry::new(Arc::clone(&message), error.clone()));
                message.fail(error);
            }
        }

        report
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, Event, Query, Status};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Tick {
        symbol: &'static str,
    }

    #[derive(Debug, Clone, Hash)]
    struct Flatten {
        symbol: &'static str,
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(Arc::new(DeadLetterQueue::new(8)))
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn Handler<Event<Tick>>> {
        handler_fn(move |_msg: Arc<Event<Tick>>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_every_accepting_handler_runs_once() {
        let registry = registry();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register(counting_handler(Arc::clone(&first)));
        registry.register(counting_handler(Arc::clone(&second)));

        let report = registry
            .handle(Arc::new(Event::new(Tick { symbol: "BTC" })))
            .await;

        assert_eq!(report.invoked, 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filter_skips_rejected_messages() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register_with_filter(counting_handler(Arc::clone(&hits)), |m: &Event<Tick>| {
            m.payload().symbol == "ETH"
        });

        let report = registry
            .handle(Arc::new(Event::new(Tick { symbol: "BTC" })))
            .await;
        assert_eq!(report.invoked, 0);
        assert!(!report.unhandled);

        registry
            .handle(Arc::new(Event::new(Tick { symbol: "ETH" })))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_all_filters_of_handler() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(Arc::clone(&hits));
        let other = counting_handler(Arc::clone(&hits));

        registry.register_with_filter(Arc::clone(&handler), |m: &Event<Tick>| m.payload().symbol == "BTC");
        registry.register_with_filter(Arc::clone(&handler), |m: &Event<Tick>| m.payload().symbol == "ETH");
        registry.register(Arc::clone(&other));
        assert_eq!(registry.handler_count::<Event<Tick>>(), 3);

        assert_eq!(registry.unregister(&handler), 2);
        assert_eq!(registry.handler_count::<Event<Tick>>(), 1);

        assert_eq!(registry.unregister(&other), 1);
        assert!(registry.registered_types().is_empty());
    }

    #[tokio::test]
    async fn test_exact_type_matching_only() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(counting_handler(Arc::clone(&hits)));

        // Same payload, different kind: not a match
        let report = registry
            .handle(Arc::new(Command::new(Flatten { symbol: "BTC" })))
            .await;
        assert!(report.unhandled);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_command_success_and_query_response() {
        let registry = registry();
        registry.register(handler_fn(|_cmd: Arc<Command<Flatten>>| async { Ok(()) }));
        registry.register(handler_fn(|_q: Arc<Query<&'static str, f64>>| async { Ok(42_000.0) }));

        let cmd = Arc::new(Command::new(Flatten { symbol: "BTC" }));
        registry.handle(cmd.clone()).await;
        assert_eq!(cmd.wait_for_execution().await.unwrap(), Status::Success);

        let query: Arc<Query<&'static str, f64>> = Arc::new(Query::new("BTC"));
        registry.handle(query.clone()).await;
        assert_eq!(query.wait_for_response().await.unwrap(), 42_000.0);
    }

    #[tokio::test]
    async fn test_failure_goes_to_dead_letters_and_completes_caller() {
        let registry = registry();
        registry.register(handler_fn(|_q: Arc<Query<&'static str, f64>>| async {
            Err(anyhow::anyhow!("bad"))
        }));

        let query: Arc<Query<&'static str, f64>> = Arc::new(Query::new("BTC"));
        let report = registry.handle(query.clone()).await;

        assert_eq!(report.failed, 1);
        assert!(matches!(query.wait_for_response().await, Err(BusError::Handler { .. })));
        assert_eq!(registry.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let registry = registry();
        registry.register(handler_fn(|_cmd: Arc<Command<Flatten>>| async {
            if true {
                panic!("exploded");
            }
            Ok(())
        }));

        let cmd = Arc::new(Command::new(Flatten { symbol: "SOL" }));
        let report = registry.handle(cmd.clone()).await;

        assert_eq!(report.failed, 1);
        let err = cmd.wait_for_execution().await.unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[tokio::test]
    async fn test_blocking_handler_runs_off_worker() {
        let registry = registry();
        registry.register(blocking_handler_fn(|q: Arc<Query<u32, u32>>| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(*q.payload() * 2)
        }));

        let query: Arc<Query<u32, u32>> = Arc::new(Query::new(21));
        registry.handle(query.clone()).await;
        assert_eq!(query.wait_for_response().await.unwrap(), 42);
    }
}
