//! Full pipeline against a file: synthetic decisions and fragments in, blocks out.
//!
//! Usage: `cargo run --example pipeline -- [config.toml]`

use std::str::FromStr;
use std::time::Duration;

use trigstore::config::Config;
use trigstore::core::{ComponentRequest, Fragment, SourceId, TriggerDecision, TriggerRecordHeader};
use trigstore::pipeline::{self, QueueSink};
use tracing_subscriber::EnvFilter;

const TRIGGERS: u64 = 1_000;
const SOURCES: u32 = 4;
const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::from_str(
            r#"
            [storage]
            path = "pipeline-demo.bin"
            block_size = 65536
            direct_io = false
            driver = "sync"

            [pipeline]
            progress_interval_secs = 1
            "#,
        )?,
    };

    let (decision_tx, decision_rx) = pipeline::queue::bounded(256);
    let (fragment_tx, fragment_rx) = pipeline::queue::bounded(1024);
    let handle = pipeline::launch(&config, decision_rx, fragment_rx)?;

    for trig in 0..TRIGGERS {
        let ts = trig * 64;
        let components = (0..SOURCES)
            .map(|e| ComponentRequest::new(SourceId::new(1, e), ts, ts + 64))
            .collect();
        decision_tx.push(TriggerDecision::new(1, trig, ts, components), PUSH_TIMEOUT)?;

        for e in 0..SOURCES {
            let payload = vec![(trig as u8).wrapping_add(e as u8); 4096];
            fragment_tx.push(Fragment::new(1, trig, SourceId::new(1, e), ts, payload), PUSH_TIMEOUT)?;
        }
    }
    drop(decision_tx);
    drop(fragment_tx);

    let correlator_metrics = std::sync::Arc::clone(handle.correlator_metrics());
    let storage_metrics = std::sync::Arc::clone(handle.storage_metrics());
    let summary = handle.join()?;

    println!("Wrote {} records in {} blocks", summary.records, summary.blocks);
    println!("{:?}", correlator_metrics.snapshot());
    println!("{:?}", storage_metrics.snapshot());
    println!(
        "Header block is {} bytes, zero padded to {}",
        std::mem::size_of::<TriggerRecordHeader>(),
        config.storage.block_size
    );
    Ok(())
}
