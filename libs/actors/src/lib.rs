//! Actor Message Bus
//!
//! In-process message bus for the trading engine's actors (signals,
//! positions, risk, execution, portfolio). Actors never call each other;
//! they exchange Events, Commands, Queries and Tasks through a
//! [`Dispatcher`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit   ┌──────────────────────────── WorkerPool ───────────────┐
//! │  Dispatcher  │──────────▶│ LoadBalancer ─▶ DedupCache ─▶ group g ─▶ Worker queue │
//! └──────────────┘           │   (PID +          (sharded     (W workers    (FIFO)   │
//!        ▲                   │    softmax)        TTL keys)    per group)            │
//!        │ register          └──────────────────────────────────────────┬───────────┘
//!        │                                                              │ pop
//! ┌──────┴───────┐                                           ┌──────────▼───────────┐
//! │  ActorCell   │──────────── routes + pre_receive ────────▶│   HandlerRegistry    │
//! └──────────────┘                                           │  (exact type match)  │
//!                                                            └──────────┬───────────┘
//!                                                                       │ failure
//!                                                            ┌──────────▼───────────┐
//!                                                            │   DeadLetterQueue    │
//!                                                            └──────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **FIFO per worker** only; nothing is ordered across workers or groups
//! - **At most one in-flight delivery per key**; identical commands inside
//!   the expiry window collapse to one execution
//! - **Handler failures always complete the caller** with `Err`, and are
//!   kept in the dead-letter ring
//! - **No handler, no completion**: callers awaiting a command or query with
//!   no registered handler must bound the wait themselves
//!
//! # Example
//!
//! ```no_run
//! use actor_bus::{handler_fn, BusConfig, Dispatcher, Query};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct GetPrice(&'static str);
//!
//! async fn demo() -> actor_bus::Result<()> {
//!     let bus = Dispatcher::new(BusConfig::default())?;
//!     bus.register(handler_fn(|_q: Arc<Query<GetPrice, f64>>| async { Ok(42_000.0) }));
//!
//!     let query = Arc::new(Query::<GetPrice, f64>::new(GetPrice("BTC")));
//!     bus.query(Arc::clone(&query)).await?;
//!     assert_eq!(query.wait_for_response().await?, 42_000.0);
//!
//!     bus.wait().await;
//!     bus.stop().await;
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod balancer;
pub mod dead_letter;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pid;
pub mod pool;
pub mod registry;
pub mod worker;

pub use actor::{Actor, ActorCell, ActorState, Routes};
pub use balancer::{BalancerSnapshot, LoadBalancer};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use dedup::DedupCache;
pub use dispatcher::Dispatcher;
pub use error::{BusError, Result};
pub use message::{
    command_key, Ask, Command, Completion, Deliverable, Event, Message, MessageGroup, MessageKind,
    MessageMeta, Query, Status, Task,
};
pub use metrics::{BusMetrics, BusStats, MetricsSnapshot};
pub use pid::{Gains, PidController};
pub use pool::{DispatchOutcome, WorkerPool};
pub use registry::{
    blocking_handler_fn, handler_fn, DeliveryReport, Handler, HandlerId, HandlerRegistry,
};
pub use worker::{Worker, WorkerStats};

pub use bus_config::BusConfig;
