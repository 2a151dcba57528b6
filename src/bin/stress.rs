//! Stress test for the decision core.
//!
//! Pushes progressively larger synthetic event streams through the threaded
//! pipeline to study:
//! - Throughput with all three stages attached
//! - Backpressure under the configured saturation policy
//! - Memory growth with many watched symbols
//!
//! Usage: cargo run --release --bin stress
//! Env: STRESS_EVENTS (largest run, default 100000), STRESS_SYMBOLS (default 50)

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sos_engine::events::{AlertAction, Event, Fields, MarketUpdate, ScreenerAlert, SentimentUpdate};
use sos_engine::gate::{DecisionSink, GateDecision};
use sos_engine::journal::WriteBehind;
use sos_engine::metrics::{CoreCounters, CountersSnapshot};
use sos_engine::recovery::NoBackfill;
use sos_engine::{Config, CoreSetup, DecisionCore};

struct CountingSink(Arc<AtomicU64>);

impl DecisionSink for CountingSink {
    fn deliver(&mut self, _decision: &GateDecision) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn generate_events(n_events: usize, n_symbols: usize, seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut events = Vec::with_capacity(n_events + n_symbols);
    let mut ts = 1_700_000_000_000u64;
    let mut prices: Vec<f64> = (0..n_symbols).map(|_| rng.gen_range(100.0..2_000.0)).collect();

    for i in 0..n_symbols {
        events.push(Event::Screener(ScreenerAlert {
            symbol: format!("SYM{}", i),
            timestamp: ts,
            action: AlertAction::Add,
            metrics: Fields::new(),
            timeframe: "5m".to_string(),
        }));
    }

    for i in 0..n_events {
        ts += 10;
        if i % 500 == 0 {
            events.push(Event::Sentiment(SentimentUpdate {
                timestamp: ts,
                pcr: rng.gen_range(0.6..1.4),
                advances: rng.gen_range(200..2_000),
                declines: rng.gen_range(200..2_000),
            }));
            continue;
        }
        let idx = rng.gen_range(0..n_symbols);
        let price = (prices[idx] * (1.0 + rng.gen_range(-0.004..0.005))).max(1.0);
        prices[idx] = price;
        // Occasional volume surges give the pattern something to match.
        let volume = if rng.gen_bool(0.05) { rng.gen_range(5_000.0..9_000.0) } else { rng.gen_range(500.0..1_500.0) };
        let fields: Fields = [("close", price), ("high", price * 1.001), ("low", price * 0.999), ("volume", volume)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        events.push(Event::Market(MarketUpdate { symbol: format!("SYM{}", idx), timestamp: ts, fields }));
    }
    events
}

fn run(events: Vec<Event>, cfg: &Config, rt: &tokio::runtime::Runtime) -> Result<(CountersSnapshot, u64)> {
    let counters = Arc::new(CoreCounters::new());
    let delivered = Arc::new(AtomicU64::new(0));
    let core = DecisionCore::start(
        CoreSetup::from_config(cfg.clone())?,
        Arc::clone(&counters),
        vec![Box::new(CountingSink(Arc::clone(&delivered)))],
        WriteBehind::disabled(Arc::clone(&counters)),
    )?;
    rt.block_on(core.recover(&NoBackfill))?;
    for event in events {
        // Rejections are counted as saturation; keep pushing.
        let _ = core.publish(event);
    }
    let snapshot = core.shutdown()?;
    Ok((snapshot, delivered.load(Ordering::Relaxed)))
}

fn get_memory_usage() -> usize {
    if let Ok(content) = std::fs::read_to_string("/proc/self/statm") {
        if let Some(rss) = content.split_whitespace().nth(1) {
            if let Ok(pages) = rss.parse::<usize>() {
                return pages * 4096;
            }
        }
    }
    0
}

fn format_bytes(bytes: usize) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.2} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.2} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.2} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} B", bytes)
    }
}

fn main() -> Result<()> {
    println!("=== STRESS TEST: Decision Core ===\n");

    let cfg = Config::from_env();
    let max_events: usize = std::env::var("STRESS_EVENTS").ok().and_then(|v| v.parse().ok()).unwrap_or(100_000);
    let n_symbols: usize = std::env::var("STRESS_SYMBOLS").ok().and_then(|v| v.parse().ok()).unwrap_or(50).max(1);
    let rt = tokio::runtime::Builder::new_current_thread().enable_time().build()?;

    let mut sizes: Vec<usize> = [1_000, 10_000, 100_000, 1_000_000].into_iter().filter(|&n| n < max_events).collect();
    sizes.push(max_events);

    println!(
        "{:>10} {:>12} {:>12} {:>8} {:>8} {:>10} {:>12} {:>12}",
        "Events", "Gen Time", "Run Time", "Intents", "Vetoes", "Saturated", "Memory", "Events/sec"
    );
    println!("{}", "-".repeat(94));

    let mut prev_mem = get_memory_usage();
    let mut last = None;

    for (i, &n_events) in sizes.iter().enumerate() {
        let gen_start = Instant::now();
        let events = generate_events(n_events, n_symbols, 42 + i as u64);
        let gen_time = gen_start.elapsed();

        let run_start = Instant::now();
        let (snapshot, delivered) = run(events, &cfg, &rt)?;
        let run_time = run_start.elapsed();

        let curr_mem = get_memory_usage();
        let mem_delta = curr_mem.saturating_sub(prev_mem);
        let events_per_sec =
            if run_time.as_secs_f64() > 0.0 { snapshot.published as f64 / run_time.as_secs_f64() } else { 0.0 };

        println!(
            "{:>10} {:>12} {:>12} {:>8} {:>8} {:>10} {:>12} {:>12.0}",
            n_events,
            format!("{:.2?}", gen_time),
            format!("{:.2?}", run_time),
            snapshot.intents,
            snapshot.vetoes,
            snapshot.saturated,
            format_bytes(mem_delta),
            events_per_sec
        );
        if delivered != snapshot.intents + snapshot.vetoes {
            anyhow::bail!("sink saw {} decisions, gate made {}", delivered, snapshot.intents + snapshot.vetoes);
        }

        prev_mem = curr_mem;
        last = Some(snapshot);
    }

    println!("\n=== Final counters ===");
    if let Some(snapshot) = last {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    println!("Final memory: {}", format_bytes(get_memory_usage()));
    Ok(())
}
