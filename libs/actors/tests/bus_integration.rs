//! End-to-end behaviour of the bus through the public API

use actor_bus::balancer::target_shares;
use actor_bus::{
    handler_fn, Actor, ActorCell, BusConfig, BusError, Command, Dispatcher, Event, Message, Query,
    Routes, Status, Task,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config(groups: usize, per_group: usize) -> BusConfig {
    let mut config = BusConfig::default();
    config.pool.priority_groups = groups;
    config.pool.workers_per_group = per_group;
    config.balancer.seed = Some(2024);
    config
}

#[derive(Debug, Clone)]
struct Tick {
    symbol: &'static str,
    seq: usize,
}

#[derive(Debug, Clone, Hash)]
struct OpenPosition {
    symbol: &'static str,
    size: u64,
}

#[derive(Debug, Clone)]
struct GetPrice(&'static str);

#[derive(Debug, thiserror::Error)]
#[error("value error: {0}")]
struct ValueError(&'static str);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_accepting_handler_runs_exactly_once() {
    let bus = Dispatcher::new(config(3, 2)).unwrap();
    let all = Arc::new(AtomicUsize::new(0));
    let btc_only = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let all = Arc::clone(&all);
        bus.register(handler_fn(move |_t: Arc<Event<Tick>>| {
            let all = Arc::clone(&all);
            async move {
                all.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
    }
    {
        let btc_only = Arc::clone(&btc_only);
        bus.register_with_filter(
            handler_fn(move |_t: Arc<Event<Tick>>| {
                let btc_only = Arc::clone(&btc_only);
                async move {
                    btc_only.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            |t: &Event<Tick>| t.payload().symbol == "BTC",
        );
    }

    for seq in 0..200 {
        let symbol = if seq % 2 == 0 { "BTC" } else { "ETH" };
        let tick = Event::new(Tick { symbol, seq }).with_priority((seq % 3) as i32);
        bus.dispatch(Arc::new(tick)).await.unwrap();
    }
    bus.wait().await;

    assert_eq!(all.load(Ordering::SeqCst), 400);
    assert_eq!(btc_only.load(Ordering::SeqCst), 100);
    assert_eq!(bus.stats().metrics.delivered, 200);
    bus.stop().await;
}

#[tokio::test]
async fn identical_commands_collapse_to_one_execution() {
    let mut config = config(1, 1);
    config.commands.expiry_window_secs = 3600;
    let bus = Dispatcher::new(config).unwrap();

    let executions = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    {
        let executions = Arc::clone(&executions);
        let gate = Arc::clone(&gate);
        bus.register(handler_fn(move |_c: Arc<Command<OpenPosition>>| {
            let executions = Arc::clone(&executions);
            let gate = Arc::clone(&gate);
            async move {
                gate.acquire().await?.forget();
                executions.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        }));
    }

    let first = Arc::new(bus.new_command(OpenPosition { symbol: "BTC", size: 1 }));
    let second = Arc::new(bus.new_command(OpenPosition { symbol: "BTC", size: 1 }));
    if first.key() != second.key() {
        // Hour boundary crossed between the two constructions
        bus.stop().await;
        return;
    }

    bus.execute(Arc::clone(&first)).await.unwrap();
    bus.execute(Arc::clone(&second)).await.unwrap();
    assert_eq!(second.wait_for_execution().await.unwrap(), Status::Deduplicated);

    gate.add_permits(1);
    assert_eq!(first.wait_for_execution().await.unwrap(), Status::Success);
    bus.wait().await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().metrics.deduplicated, 1);

    // Released once handled, so the same key is admitted again
    let third = Arc::new(bus.new_command(OpenPosition { symbol: "BTC", size: 1 }));
    gate.add_permits(1);
    bus.execute(Arc::clone(&third)).await.unwrap();
    assert_eq!(third.wait_for_execution().await.unwrap(), Status::Success);
    bus.stop().await;
}

#[tokio::test]
async fn single_worker_preserves_fifo() {
    let bus = Dispatcher::new(config(1, 1)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        bus.register(handler_fn(move |t: Arc<Event<Tick>>| {
            let seen = Arc::clone(&seen);
            async move {
                if t.payload().seq % 7 == 0 {
                    tokio::task::yield_now().await;
                }
                seen.lock().push(t.payload().seq);
                Ok(())
            }
        }));
    }

    for seq in 0..100 {
        bus.dispatch(Arc::new(Event::new(Tick { symbol: "BTC", seq })))
            .await
            .unwrap();
    }
    bus.wait().await;

    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    bus.stop().await;
}

#[tokio::test]
async fn routing_share_converges_to_targets() {
    let bus = Dispatcher::new(config(3, 1)).unwrap();
    bus.register(handler_fn(|_t: Arc<Event<usize>>| async { Ok(()) }));

    for n in 0..10_000usize {
        // Skewed input: everything declares the least urgent priority
        let event = Event::new(n).with_priority(2);
        bus.dispatch(Arc::new(event)).await.unwrap();
    }
    bus.wait().await;

    let stats = bus.stats();
    let total: u64 = stats.workers.iter().map(|w| w.processed).sum();
    assert_eq!(total, 10_000);
    for (group, target) in target_shares(3).iter().enumerate() {
        let routed: u64 = stats
            .workers
            .iter()
            .filter(|w| w.group == group)
            .map(|w| w.processed)
            .sum();
        let share = routed as f64 / total as f64;
        assert!(
            (share - target).abs() < 0.05,
            "group {} share {:.3} target {:.3}",
            group,
            share,
            target
        );
    }
    bus.stop().await;
}

#[tokio::test]
async fn dead_letters_keep_most_recent_failures() {
    let mut config = config(1, 1);
    config.dead_letter.capacity = 5;
    let bus = Dispatcher::new(config).unwrap();
    bus.register(handler_fn(|q: Arc<Query<u32, u32>>| async move {
        Err(anyhow::anyhow!("failure {}", q.payload()))
    }));

    let mut queries = Vec::new();
    for n in 0..15u32 {
        let query = Arc::new(Query::<u32, u32>::new(n));
        bus.query(Arc::clone(&query)).await.unwrap();
        queries.push(query);
    }
    bus.wait().await;

    // Every failing caller was released with an error
    for query in &queries {
        assert!(matches!(query.wait_for_response().await, Err(BusError::Handler { .. })));
    }

    let retained: Vec<u32> = bus
        .dead_letters()
        .snapshot()
        .iter()
        .map(|entry| {
            *entry
                .message
                .as_any()
                .downcast_ref::<Query<u32, u32>>()
                .unwrap()
                .payload()
        })
        .collect();
    assert_eq!(retained, vec![10, 11, 12, 13, 14]);
    assert_eq!(bus.dead_letters().total_recorded(), 15);
    bus.stop().await;
}

#[tokio::test]
async fn query_resolves_value_or_handler_error() {
    let bus = Dispatcher::new(config(2, 1)).unwrap();
    bus.register(handler_fn(|q: Arc<Query<GetPrice, f64>>| async move {
        match q.payload().0 {
            "BTC" => Ok(42_000.0),
            _ => Err(ValueError("bad").into()),
        }
    }));

    let ok = Arc::new(Query::<GetPrice, f64>::new(GetPrice("BTC")));
    bus.query(Arc::clone(&ok)).await.unwrap();
    assert_eq!(ok.wait_for_response().await.unwrap(), 42_000.0);

    let bad = Arc::new(Query::<GetPrice, f64>::new(GetPrice("???")));
    bus.query(Arc::clone(&bad)).await.unwrap();
    let err = bad.wait_for_response().await.unwrap_err();
    let cause = err.handler_cause().expect("handler error");
    assert_eq!(cause.downcast_ref::<ValueError>().unwrap().0, "bad");
    bus.stop().await;
}

#[tokio::test]
async fn command_without_handler_never_completes() {
    let bus = Dispatcher::new(config(1, 1)).unwrap();
    let cmd = Arc::new(Command::new(OpenPosition { symbol: "SOL", size: 3 }));
    bus.execute(Arc::clone(&cmd)).await.unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(100), cmd.wait_for_execution()).await;
    assert!(waited.is_err());
    assert!(!cmd.is_executed());
    assert_eq!(bus.stats().metrics.unhandled, 1);
    bus.stop().await;
}

#[tokio::test]
async fn task_runs_and_is_cancelled_when_awaiter_times_out() {
    let bus = Dispatcher::new(config(1, 1)).unwrap();
    bus.register(handler_fn(|t: Arc<Task<u64, u64>>| async move {
        let n = *t.payload();
        if n > 100 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(n + 1)
    }));

    let quick = Arc::new(Task::<u64, u64>::new(1));
    bus.run(Arc::clone(&quick)).await.unwrap();
    assert_eq!(quick.wait_for_finishing().await.unwrap(), 2);

    let slow = Arc::new(Task::<u64, u64>::new(1_000));
    bus.run(Arc::clone(&slow)).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_millis(50), slow.wait_for_finishing()).await;
    assert!(waited.is_err());
    assert!(matches!(
        slow.wait_for_finishing().await,
        Err(BusError::Cancelled { .. })
    ));

    // The worker was never blocked by the slow task
    bus.wait().await;
    bus.stop().await;
}

#[tokio::test]
async fn stop_abandons_queued_messages() {
    let bus = Dispatcher::new(config(1, 1)).unwrap();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let started = Arc::new(tokio::sync::Notify::new());
    {
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        bus.register(handler_fn(move |_t: Arc<Event<Tick>>| {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                gate.acquire().await?.forget();
                anyhow::Ok(())
            }
        }));
    }

    for seq in 0..5 {
        bus.dispatch(Arc::new(Event::new(Tick { symbol: "BTC", seq })))
            .await
            .unwrap();
    }
    started.notified().await;

    let stopper = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);
    stopper.await.unwrap();

    let stats = bus.stats();
    assert_eq!(stats.metrics.delivered, 1);
    assert_eq!(stats.metrics.abandoned, 4);
    assert!(matches!(
        bus.dispatch(Arc::new(Event::new(Tick { symbol: "BTC", seq: 9 }))).await,
        Err(BusError::Stopped { .. })
    ));
}

struct PositionActor {
    opened: AtomicUsize,
}

impl Actor for PositionActor {
    fn name(&self) -> &str {
        "position"
    }

    fn routes(routes: &mut Routes<Self>) {
        routes.command(|actor: Arc<Self>, _cmd: Arc<Command<OpenPosition>>| async move {
            actor.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    fn pre_receive(&self, message: &dyn Message) -> bool {
        message
            .as_any()
            .downcast_ref::<Command<OpenPosition>>()
            .map_or(false, |cmd| cmd.payload().size > 0)
    }
}

#[tokio::test]
async fn actor_lifecycle_contract() {
    let bus = Dispatcher::new(config(2, 1)).unwrap();
    let cell = ActorCell::new(
        PositionActor {
            opened: AtomicUsize::new(0),
        },
        bus.clone(),
    )
    .unwrap();

    assert!(matches!(cell.stop().await, Err(BusError::Lifecycle { .. })));
    cell.start().await.unwrap();
    assert!(matches!(cell.start().await, Err(BusError::Lifecycle { .. })));

    let status = cell
        .ask(Arc::new(Command::new(OpenPosition { symbol: "BTC", size: 2 })))
        .await
        .unwrap();
    assert_eq!(status, Status::Success);

    // Filtered out by pre_receive: handled by nobody, never completes
    let rejected = Arc::new(Command::new(OpenPosition { symbol: "BTC", size: 0 }));
    cell.tell(Arc::clone(&rejected)).await.unwrap();
    bus.wait().await;
    assert!(!rejected.is_executed());

    cell.stop().await.unwrap();
    let after = Arc::new(Command::new(OpenPosition { symbol: "ETH", size: 5 }));
    bus.execute(Arc::clone(&after)).await.unwrap();
    bus.wait().await;

    assert_eq!(cell.actor().opened.load(Ordering::SeqCst), 1);
    assert!(!after.is_executed());
    bus.stop().await;
}
