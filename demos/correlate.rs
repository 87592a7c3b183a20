//! Correlator alone: register decisions, feed fragments, drain and evict.

use trigstore::core::{ComponentRequest, Correlator, Fragment, IngestError, SourceId, TriggerDecision};
use tracing_subscriber::EnvFilter;

fn decision(trig: u64, ts: u64, sources: u32) -> TriggerDecision {
    let components = (0..sources)
        .map(|e| ComponentRequest::new(SourceId::new(1, e), ts, ts + 32))
        .collect();
    TriggerDecision::new(1, trig, ts, components)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut correlator = Correlator::new();

    // 1. Two decisions: trigger 1 expects two sources, trigger 2 expects one.
    correlator.ingest_decision(decision(1, 100, 2));
    correlator.ingest_decision(decision(2, 110, 1));

    // 2. A fragment that arrives before its decision is handed back.
    let early = Fragment::new(1, 3, SourceId::new(1, 0), 120, vec![3; 16]);
    match correlator.ingest_fragment(early) {
        Err(IngestError::NoDecision(f)) => println!("No decision yet for {}", f.trigger_id()),
        other => panic!("unexpected: {other:?}"),
    }

    // 3. Complete trigger 1.
    for e in 0..2 {
        correlator
            .ingest_fragment(Fragment::new(1, 1, SourceId::new(1, e), 100, vec![1; 16]))
            .expect("decision registered");
    }
    for record in correlator.drain_complete() {
        println!(
            "Record {} with {} fragments, {} payload bytes",
            record.trigger_id(),
            record.fragments().len(),
            record.payload_bytes()
        );
    }

    // 4. Trigger 2 never completes and ages out.
    correlator.advance_time(1_000);
    let evicted = correlator.evict_stale(correlator.present(), 500);
    println!("Evicted: {evicted:?}");

    println!("{:?}", correlator.metrics().snapshot());
}
