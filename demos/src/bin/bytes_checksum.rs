//! # bytes_checksum
//!
//! Byte-mode `Throughv`: every 1 KiB block is checksummed in parallel with
//! the rest of its batch, and the checksums come out in block order. The
//! flush step reports how many blocks were seen before end-of-output.
//!
//! Run with:
//! ```sh
//! cargo run --bin bytes_checksum
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::TryStreamExt;
use throughv_stream::{BoxError, Metadata, ThroughvBuilder, ThroughvOptions};
use tracing_subscriber::EnvFilter;

const BLOCK_SIZE: usize = 1024;
const BLOCKS: usize = 256;

fn checksum(block: &[u8]) -> u32 {
    block
        .iter()
        .fold(0u32, |acc, &b| acc.rotate_left(5) ^ u32::from(b))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let reported = seen.clone();

    let through = ThroughvBuilder::with_options(ThroughvOptions::default(), move |block: Bytes, meta: Metadata| {
        counter.fetch_add(1, Ordering::Relaxed);
        async move {
            let sum = tokio::task::spawn_blocking(move || checksum(&block)).await?;
            tracing::trace!(encoding = ?meta.encoding, sum, "block checksummed");
            Ok::<_, BoxError>(Some(Bytes::from(format!("{sum:08x}\n"))))
        }
    })
    .flush(move || {
        let blocks = reported.load(Ordering::Relaxed);
        async move {
            tracing::info!(blocks, "flushing checksum stream");
            Ok::<_, BoxError>(())
        }
    })
    .build();

    let (writer, reader) = through.split();
    let producer = tokio::spawn(async move {
        for i in 0..BLOCKS {
            let block = Bytes::from(vec![(i % 251) as u8; BLOCK_SIZE]);
            if !writer.write(block) {
                writer.drained().await;
            }
        }
        writer.end().await
    });

    let lines: Vec<Bytes> = reader.try_collect().await?;
    producer.await??;

    let text: String = lines
        .iter()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect();
    println!("✓ {} checksums, {} blocks seen", lines.len(), seen.load(Ordering::Relaxed));
    print!("{}", text.lines().take(4).map(|l| format!("  {l}\n")).collect::<String>());
    Ok(())
}
