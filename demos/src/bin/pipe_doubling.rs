//! # pipe_doubling
//!
//! Pipes a range of numbers through an object-mode `Throughv` that doubles
//! each one after a short, uneven delay. Output order still matches input
//! order, and the small high-water mark keeps every batch at four entries or
//! fewer.
//!
//! Options can be supplied as JSON:
//! ```sh
//! export THROUGHV_OPTIONS='{"objectMode": true, "highWaterMark": 4}'
//! RUST_LOG=throughv_stream=debug cargo run --bin pipe_doubling
//! ```

use std::time::Duration;

use anyhow::Result;
use futures::{stream, StreamExt};
use throughv_stream::{pipeline, BoxError, StreamEvent, ThroughvBuilder, ThroughvOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // ── 1. Options ────────────────────────────────────────────────────────────
    let options = match std::env::var("THROUGHV_OPTIONS") {
        Ok(json) => ThroughvOptions::from_json(&json)?,
        Err(_) => ThroughvOptions::object().high_water_mark(4),
    };
    let hwm = options.effective_high_water_mark();
    println!("✓ Options: {}", serde_json::to_string(&options)?);

    // ── 2. Build the stream ───────────────────────────────────────────────────
    let through = ThroughvBuilder::object(|n: u64, _meta| async move {
        // Later numbers finish first.
        tokio::time::sleep(Duration::from_millis(20 - n % 20)).await;
        Ok::<_, BoxError>(Some(n * 2))
    })
    .high_water_mark(hwm)
    .flush(|| async {
        tracing::info!("all batches settled");
        Ok::<_, BoxError>(())
    })
    .build();

    let mut events = through.events();
    let stats = through.writer().clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(event = %event, "stream event");
            if matches!(event, StreamEvent::Close) {
                break;
            }
        }
    });

    // ── 3. Pipe ───────────────────────────────────────────────────────────────
    let (tx, rx) = futures::channel::mpsc::unbounded();
    pipeline(stream::iter(0..64u64), through, tx).await?;
    let doubled: Vec<u64> = rx.collect().await;

    println!("✓ {} results, first 8: {:?}", doubled.len(), &doubled[..8]);
    let metrics = stats.metrics();
    println!(
        "✓ {} batches, largest {} entries, {} transformed",
        metrics.batches_completed, metrics.largest_batch, metrics.entries_transformed
    );
    Ok(())
}
