//! Bus soak binary - pushes synthetic events through a dispatcher and
//! reports how they were routed across priority groups
//!
//! Built with the `bin` feature:
//!   cargo run -p actor-bus --features bin -- --messages 100000
//!
//! Usage:
//!   bus-soak --messages 100000
//!   bus-soak --config config/bus.toml --log-level debug

use actor_bus::balancer::target_shares;
use actor_bus::{handler_fn, Dispatcher, Event, MessageGroup};
use anyhow::{Context, Result};
use bus_config::BusConfig;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bus-soak")]
#[command(about = "Soak test for the actor message bus")]
#[command(version)]
struct Args {
    /// Path to a TOML bus configuration (BUS__* environment overrides still apply)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of events to submit
    #[arg(short, long, default_value_t = 10_000)]
    messages: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug)]
struct SoakTick {
    seq: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = BusConfig::load(args.config.as_deref()).context("Failed to load bus configuration")?;
    let groups = config.pool.priority_groups;
    info!(
        messages = args.messages,
        priority_groups = groups,
        workers_per_group = config.pool.workers_per_group,
        "Starting bus soak"
    );

    let bus = Dispatcher::new(config).context("Failed to start dispatcher")?;

    let handled = Arc::new(AtomicU64::new(0));
    {
        let handled = Arc::clone(&handled);
        bus.register(handler_fn(move |tick: Arc<Event<SoakTick>>| {
            let handled = Arc::clone(&handled);
            async move {
                if tick.payload().seq % 1_000 == 0 {
                    tokio::task::yield_now().await;
                }
                handled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }));
    }

    let started = Instant::now();
    let mut rng = rand::thread_rng();
    for seq in 0..args.messages {
        let priority = rng.gen_range(0..groups as i32);
        let event = Event::new(SoakTick { seq })
            .with_priority(priority)
            .with_group(MessageGroup::Market);
        bus.dispatch(Arc::new(event)).await?;
    }
    bus.wait().await;
    let elapsed = started.elapsed();

    let stats = bus.stats();
    let routed: Vec<f64> = (0..groups)
        .map(|g| {
            stats
                .workers
                .iter()
                .filter(|w| w.group == g)
                .map(|w| w.processed)
                .sum::<u64>() as f64
        })
        .collect();
    let total: f64 = routed.iter().sum::<f64>().max(1.0);

    println!("group  routed    share   target");
    for (group, target) in target_shares(groups).iter().enumerate() {
        println!(
            "{:>5}  {:>8}  {:>6.3}  {:>6.3}",
            group,
            routed[group],
            routed[group] / total,
            target
        );
    }
    println!(
        "handled {} events in {:.2?} ({:.0} msg/s)",
        handled.load(Ordering::Relaxed),
        elapsed,
        args.messages as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("{}", serde_json::to_string_pretty(&stats.metrics)?);

    bus.stop().await;
    info!("Bus soak complete");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
