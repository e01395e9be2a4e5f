//! Actor Contract
//!
//! An actor declares the message types it accepts through a static route
//! table ([`Actor::routes`]) and is driven through an [`ActorCell`], which
//! owns its lifecycle against a [`Dispatcher`].
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! - `start()` runs `on_start`, registers every route with the actor's
//!   `pre_receive` as filter, then enters `Running`.
//! - `stop()` unregisters every route, runs `on_stop`, then enters `Stopped`.
//!   Nothing dispatched afterwards reaches the actor.
//! - `start()` outside `Stopped` or `stop()` outside `Running` fails
//!   immediately with [`BusError::Lifecycle`].
//!
//! ## Declaration
//!
//! The route builder only offers the four message kinds, so an actor cannot
//! declare anything else. [`ActorCell::new`] additionally rejects an empty
//! table and a message type declared twice.

use crate::dispatcher::Dispatcher;
use crate::error::{BusError, Result};
use crate::message::{Ask, Command, Deliverable, Event, Message, MessageKind, Query, Task};
use crate::registry::{handler_fn, Handler, HandlerId, HandlerRegistration, MessageFilter};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Actor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActorState::Stopped => "stopped",
            ActorState::Starting => "starting",
            ActorState::Running => "running",
            ActorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Behaviour of an actor on the bus
#[async_trait]
pub trait Actor: Send + Sync + Sized + 'static {
    /// Name used in logs and lifecycle errors
    fn name(&self) -> &str;

    /// Declare one route per accepted message type
    fn routes(routes: &mut Routes<Self>);

    /// Synchronous admission filter consulted before every delivery
    fn pre_receive(&self, _message: &dyn Message) -> bool {
        true
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type Bind<A> = Box<dyn Fn(&Arc<A>) -> HandlerRegistration + Send + Sync>;

struct Route<A> {
    type_id: TypeId,
    type_name: &'static str,
    kind: MessageKind,
    bind: Bind<A>,
}

/// Static handler table of an actor
pub struct Routes<A> {
    routes: Vec<Route<A>>,
}

impl<A: Actor> Routes<A> {
    fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Handle `Event<P>`
    pub fn event<P, F, Fut>(&mut self, f: F) -> &mut Self
    where
        P: fmt::Debug + Send + Sync + 'static,
        F: Fn(Arc<A>, Arc<Event<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.route::<Event<P>, F, Fut>(MessageKind::Event, f)
    }

    /// Handle `Command<P>`; returning `Ok` completes it with `Status::Success`
    pub fn command<P, F, Fut>(&mut self, f: F) -> &mut Self
    where
        P: fmt::Debug + Send + Sync + 'static,
        F: Fn(Arc<A>, Arc<Command<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.route::<Command<P>, F, Fut>(MessageKind::Command, f)
    }

    /// Answer `Query<P, T>`
    pub fn query<P, T, F, Fut>(&mut self, f: F) -> &mut Self
    where
        P: fmt::Debug + Send + Sync + 'static,
        T: fmt::Debug + Clone + Send + Sync + 'static,
        F: Fn(Arc<A>, Arc<Query<P, T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.route::<Query<P, T>, F, Fut>(MessageKind::Query, f)
    }

    /// Run the work behind `Task<P, T>`
    pub fn task<P, T, F, Fut>(&mut self, f: F) -> &mut Self
    where
        P: fmt::Debug + Send + Sync + 'static,
        T: fmt::Debug + Clone + Send + Sync + 'static,
        F: Fn(Arc<A>, Arc<Task<P, T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.route::<Task<P, T>, F, Fut>(MessageKind::Task, f)
    }

    fn route<M, F, Fut>(&mut self, kind: MessageKind, f: F) -> &mut Self
    where
        M: Deliverable,
        F: Fn(Arc<A>, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Output>> + Send + 'static,
    {
        let f = Arc::new(f);
        let bind: Bind<A> = Box::new(move |actor: &Arc<A>| {
            let f = Arc::clone(&f);
            let target = Arc::clone(actor);
            let handler: Arc<dyn Handler<M>> =
                handler_fn(move |message: Arc<M>| f(Arc::clone(&target), message));

            let gatekeeper = Arc::clone(actor);
            let filter: MessageFilter =
                Arc::new(move |message: &dyn Message| gatekeeper.pre_receive(message));

            HandlerRegistration::new(handler, Some(filter))
        });

        self.routes.push(Route {
            type_id: TypeId::of::<M>(),
            type_name: type_name::<M>(),
            kind,
            bind,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Lifecycle owner binding an actor to a dispatcher
pub struct ActorCell<A: Actor> {
    actor: Arc<A>,
    dispatcher: Dispatcher,
    routes: Vec<Route<A>>,
    state: Mutex<ActorState>,
    registered: Mutex<Vec<(TypeId, HandlerId)>>,
}

impl<A: Actor> ActorCell<A> {
    /// Build the route table and validate it
    pub fn new(actor: A, dispatcher: Dispatcher) -> Result<Self> {
        let mut routes = Routes::new();
        A::routes(&mut routes);

        if routes.is_empty() {
            return Err(BusError::invalid_declaration(
                actor.name(),
                "no message types declared",
            ));
        }

        let mut seen = HashSet::new();
        for route in &routes.routes {
            if !seen.insert(route.type_id) {
                return Err(BusError::invalid_declaration(
                    actor.name(),
                    format!("{} declared more than once", route.type_name),
                ));
            }
        }

        debug!(
            actor = actor.name(),
            routes = routes.len(),
            "Actor declaration validated"
        );

        Ok(Self {
            actor: Arc::new(actor),
            dispatcher,
            routes: routes.routes,
            state: Mutex::new(ActorState::Stopped),
            registered: Mutex::new(Vec::new()),
        })
    }

    pub fn actor(&self) -> &Arc<A> {
        &self.actor
    }

    pub fn name(&self) -> &str {
        self.actor.name()
    }

    pub fn state(&self) -> ActorState {
        *self.state.lock()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Declared message types and their kinds
    pub fn accepted_types(&self) -> Vec<(&'static str, MessageKind)> {
        self.routes.iter().map(|r| (r.type_name, r.kind)).collect()
    }

    fn transition(&self, from: ActorState, to: ActorState, operation: &str) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(BusError::lifecycle(
                self.name(),
                format!("{} while {}", operation, *state),
            ));
        }
        *state = to;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.transition(ActorState::Stopped, ActorState::Starting, "start")?;

        if let Err(e) = self.actor.on_start().await {
            *self.state.lock() = ActorState::Stopped;
            return Err(BusError::lifecycle(
                self.name(),
                format!("on_start failed: {:#}", e),
            ));
        }

        let registry = self.dispatcher.registry();
        let mut registered = self.registered.lock();
        for route in &self.routes {
            let registration = (route.bind)(&self.actor);
            registered.push((registration.type_id(), registration.handler_id()));
            registry.add(registration);
        }
        drop(registered);

        *self.state.lock() = ActorState::Running;
        info!(actor = self.name(), routes = self.routes.len(), "Actor started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.transition(ActorState::Running, ActorState::Stopping, "stop")?;

        let registry = self.dispatcher.registry();
        let registered: Vec<_> = self.registered.lock().drain(..).collect();
        for (type_id, handler_id) in registered {
            registry.remove(type_id, handler_id);
        }

        if let Err(e) = self.actor.on_stop().await {
            warn!(actor = self.name(), error = %e, "on_stop hook failed");
        }

        *self.state.lock() = ActorState::Stopped;
        info!(actor = self.name(), "Actor stopped");
        Ok(())
    }

    /// Submit without waiting for any outcome
    pub async fn tell<M: Message>(&self, message: Arc<M>) -> Result<()> {
        self.dispatcher.submit(message).await.map(|_| ())
    }

    /// Submit and wait for the kind-specific outcome
    pub async fn ask<M: Ask>(&self, message: Arc<M>) -> Result<M::Answer> {
        self.dispatcher.submit(Arc::clone(&message) as Arc<dyn Message>).await?;
        message.answer().await
    }
}

impl<A: Actor> fmt::Debug for ActorCell<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorCell")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("routes", &self.accepted_types())
            .finish()
    }
}
