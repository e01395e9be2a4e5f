//! Process-wide dispatcher: first initialisation wins

use actor_bus::{handler_fn, BusConfig, Dispatcher, Query};
use std::sync::Arc;

#[tokio::test]
async fn first_init_wins() {
    assert!(Dispatcher::global().is_none());

    let mut first = BusConfig::default();
    first.pool.workers_per_group = 1;
    let bus = Dispatcher::init(first).unwrap();

    let mut second = BusConfig::default();
    second.pool.workers_per_group = 4;
    let again = Dispatcher::init(second).unwrap();

    assert!(bus.same_bus(&again));
    assert_eq!(again.config().pool.workers_per_group, 1);

    let global = Dispatcher::global().expect("initialised");
    global.register(handler_fn(|q: Arc<Query<u8, u8>>| async move { Ok(*q.payload() + 1) }));

    let query = Arc::new(Query::<u8, u8>::new(41));
    bus.query(Arc::clone(&query)).await.unwrap();
    assert_eq!(query.wait_for_response().await.unwrap(), 42);

    global.stop().await;
    assert!(bus.is_stopped());
}
