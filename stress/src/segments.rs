/*
    Records one entry span with a random number of nested exit spans per
    iteration and pushes the sealed segments through the whole pipeline:
    buffer, dispatcher workers and a reporter that only counts.

    Buffer and dispatcher settings come from the SW_BUFFER_* and
    SW_DISPATCHER_* environment variables, so the overflow policies can be
    compared without rebuilding, e.g.

        SW_BUFFER_OVERFLOW_POLICY=discard_oldest cargo run --release --bin segments
*/

use futures_util::future::BoxFuture;
use num_format::{Locale, ToFormattedString};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sniffer_sdk::config::AgentConfig;
use sniffer_sdk::export::{ReportResult, SegmentReporter};
use sniffer_sdk::trace::{ContextEngine, ContextKey, Segment};
use sniffer_sdk::Agent;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

mod throughput;

static REPORTED: AtomicU64 = AtomicU64::new(0);
static ENGINE: OnceLock<Arc<ContextEngine>> = OnceLock::new();

thread_local! {
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

#[derive(Debug)]
struct CountingReporter;

impl SegmentReporter for CountingReporter {
    fn send(&self, batch: &[Segment]) -> BoxFuture<'static, ReportResult> {
        REPORTED.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Box::pin(async { Ok(()) })
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let agent = match Agent::builder(CountingReporter)
        .with_agent_config(
            AgentConfig::builder()
                .with_service_name("stress")
                .with_sample_n_per_3_secs(-1)
                .build(),
        )
        .build()
    {
        Ok(agent) => agent,
        Err(err) => {
            eprintln!("Failed to start the agent: {err}");
            return;
        }
    };
    let _ = ENGINE.set(agent.engine().clone());

    throughput::test_throughput(test_segment);

    if let Err(err) = agent.shutdown() {
        eprintln!("Shutdown failed: {err}");
    }
    let stats = agent.dispatcher_stats();
    println!(
        "Reported: {}, dropped by buffer: {}, failed: {}, discarded on shutdown: {}",
        REPORTED.load(Ordering::Relaxed).to_formatted_string(&Locale::en),
        agent.buffer().dropped_count().to_formatted_string(&Locale::en),
        stats.failed_segments.to_formatted_string(&Locale::en),
        stats.discarded_on_shutdown.to_formatted_string(&Locale::en),
    );
}

fn test_segment(worker: usize) {
    let Some(engine) = ENGINE.get() else {
        return;
    };
    let key = ContextKey::new(worker as u64 + 1);
    let exits = RNG.with(|rng| rng.borrow_mut().random_range(0..4));

    engine.create_entry_span(key, "GET /stress", None);
    for _ in 0..exits {
        engine.create_exit_span(key, "SELECT stress", "db:5432", None);
        engine.with_active_span(key, |span| {
            span.tag("db.type", "sql");
        });
        engine.stop_span(key);
    }
    engine.stop_span(key);
}
