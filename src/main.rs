//! Fills a single segment with random values, acting as the owning cache:
//! when a write fails for lack of room it evicts a candidate and retries.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use offheap_segment::{
    BytesSerializer, LoggingConfig, Metadata, Segment, SegmentConfig, SegmentError, U64Serializer,
    config, logging,
};

#[derive(Parser)]
#[command(name = "segment-fill")]
#[command(about = "Fill an off-heap segment and report what survives eviction")]
struct Args {
    /// Path to configuration file
    config: PathBuf,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FillConfig {
    segment: SegmentConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    workload: WorkloadConfig,
}

#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WorkloadConfig {
    /// Number of distinct keys written, in order.
    keys: u64,
    /// Value length in bytes.
    value_size: usize,
    /// Pin every n-th key. 0 disables pinning.
    pin_every: u64,
    /// Veto every n-th key. 0 disables the veto.
    veto_every: u64,
    /// RNG seed for value contents.
    seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            keys: 10_000,
            value_size: 256,
            pin_every: 0,
            veto_every: 0,
            seed: None,
        }
    }
}

#[derive(Default)]
struct Totals {
    inserts: u64,
    rejected: u64,
    evictions: u64,
    resident: u64,
    pinned: u64,
    vetoed: u64,
}

fn main() {
    let args = Args::parse();

    let config: FillConfig = match config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "fill failed");
        std::process::exit(1);
    }
}

fn every(n: u64, key: u64) -> bool {
    n != 0 && key % n == 0
}

fn run(config: FillConfig) -> Result<(), Box<dyn std::error::Error>> {
    let source = config.segment.page_source()?;
    tracing::info!(
        max_size = config.segment.max_size,
        page_size = source.page_size(),
        pages = source.page_count(),
        table_size = config.segment.table_size(),
        hugepages = source.uses_hugepages(),
        "mapped page source"
    );

    let workload = &config.workload;
    let veto_every = workload.veto_every;
    let evictions = Arc::new(AtomicU64::new(0));
    let counter = evictions.clone();

    let segment: Segment<u64, Bytes> = Segment::builder(
        config.segment.engine(&source),
        U64Serializer,
        BytesSerializer,
    )
    .veto(move |key: &u64, _: &Bytes| every(veto_every, *key))
    .listener(move |_: u64, _: Bytes| {
        counter.fetch_add(1, Ordering::Relaxed);
    })
    .build();

    let mut rng = match workload.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut totals = Totals::default();
    let mut value = vec![0u8; workload.value_size];
    let start = Instant::now();

    for key in 0..workload.keys {
        rng.fill(&mut value[..]);
        let value = Bytes::copy_from_slice(&value);
        let pinned = every(workload.pin_every, key);

        loop {
            let result = if pinned {
                segment.put_pinned(&key, &value)
            } else {
                segment.put(&key, &value)
            };

            match result {
                Ok(()) => {
                    totals.inserts += 1;
                    break;
                }
                Err(e @ SegmentError::EntryTooLarge { .. }) => return Err(e.into()),
                Err(e) if e.is_allocation_failure() => {
                    let Some(index) = segment.get_eviction_index() else {
                        tracing::warn!(key, "no evictable entry left, dropping write");
                        totals.rejected += 1;
                        break;
                    };
                    segment.evict(index, true)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let elapsed = start.elapsed();

    for key in 0..workload.keys {
        if !segment.contains_key(&key) {
            continue;
        }
        totals.resident += 1;
        let metadata = segment.get_metadata(&key, Metadata::SEGMENT_MASK);
        if metadata.is_pinned() {
            totals.pinned += 1;
        }
        if metadata.is_vetoed() {
            totals.vetoed += 1;
        }
    }
    totals.evictions = evictions.load(Ordering::Relaxed);

    tracing::info!(
        inserts = totals.inserts,
        rejected = totals.rejected,
        evictions = totals.evictions,
        resident = totals.resident,
        pinned = totals.pinned,
        vetoed = totals.vetoed,
        used_pages = source.used_pages(),
        elapsed_ms = elapsed.as_millis() as u64,
        "fill complete"
    );

    segment.destroy();
    Ok(())
}
