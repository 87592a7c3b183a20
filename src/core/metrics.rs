//! Lightweight metrics. No allocations, no locks, just atomics.
//!
//! Counters are written by the owning worker thread and may be read from
//! anywhere through an `Arc`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Correlator metrics. All counters are monotonic.
#[derive(Debug)]
pub struct CorrelatorMetrics {
    pub decisions: AtomicU64,
    pub overwritten_decisions: AtomicU64,
    pub fragments: AtomicU64,
    pub fragment_misses: AtomicU64,
    pub fragments_rejected: AtomicU64,
    pub records: AtomicU64,
    pub stale_decisions: AtomicU64,
    pub discarded_fragments: AtomicU64,
}

impl CorrelatorMetrics {
    pub const fn new() -> Self {
        Self {
            decisions: AtomicU64::new(0),
            overwritten_decisions: AtomicU64::new(0),
            fragments: AtomicU64::new(0),
            fragment_misses: AtomicU64::new(0),
            fragments_rejected: AtomicU64::new(0),
            records: AtomicU64::new(0),
            stale_decisions: AtomicU64::new(0),
            discarded_fragments: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn record_decision(&self, overwrote: bool) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        if overwrote {
            self.overwritten_decisions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn record_fragment(&self) {
        self.fragments.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_miss(&self) {
        self.fragment_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_rejected(&self) {
        self.fragments_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_emitted(&self, count: u64) {
        self.records.fetch_add(count, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_stale(&self, discarded_fragments: u64) {
        self.stale_decisions.fetch_add(1, Ordering::Relaxed);
        self.discarded_fragments
            .fetch_add(discarded_fragments, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_discarded(&self, count: u64) {
        self.discarded_fragments.fetch_add(count, Ordering::Relaxed);
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn stale_decisions(&self) -> u64 {
        self.stale_decisions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CorrelatorSnapshot {
        CorrelatorSnapshot {
            decisions: self.decisions.load(Ordering::Relaxed),
            overwritten_decisions: self.overwritten_decisions.load(Ordering::Relaxed),
            fragments: self.fragments.load(Ordering::Relaxed),
            fragment_misses: self.fragment_misses.load(Ordering::Relaxed),
            fragments_rejected: self.fragments_rejected.load(Ordering::Relaxed),
            records: self.records(),
            stale_decisions: self.stale_decisions(),
            discarded_fragments: self.discarded_fragments.load(Ordering::Relaxed),
        }
    }
}

impl Default for CorrelatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Block storage metrics.
#[derive(Debug)]
pub struct StorageMetrics {
    pub writes: AtomicU64,
    pub bytes_written: AtomicU64,
    pub payload_bytes: AtomicU64,
    pub total_write_latency_ns: AtomicU64,
    pub max_write_latency_ns: AtomicU64,
}

impl StorageMetrics {
    pub const fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
            total_write_latency_ns: AtomicU64::new(0),
            max_write_latency_ns: AtomicU64::new(0),
        }
    }

    /// `block_bytes` hit the disk, `payload` of them were caller data.
    #[inline(always)]
    pub fn record_store(&self, block_bytes: u64, payload: u64, latency_ns: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(block_bytes, Ordering::Relaxed);
        self.payload_bytes.fetch_add(payload, Ordering::Relaxed);
        self.total_write_latency_ns
            .fetch_add(latency_ns, Ordering::Relaxed);
        self.update_max_latency(latency_ns);
    }

    #[inline(always)]
    fn update_max_latency(&self, latency_ns: u64) {
        let mut current = self.max_write_latency_ns.load(Ordering::Relaxed);
        while latency_ns > current {
            match self.max_write_latency_ns.compare_exchange_weak(
                current,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes.load(Ordering::Relaxed)
    }

    pub fn avg_write_latency_ns(&self) -> u64 {
        let writes = self.writes();
        if writes == 0 {
            0
        } else {
            self.total_write_latency_ns.load(Ordering::Relaxed) / writes
        }
    }

    pub fn max_write_latency_ns(&self) -> u64 {
        self.max_write_latency_ns.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            writes: self.writes(),
            bytes_written: self.bytes_written(),
            payload_bytes: self.payload_bytes(),
            avg_write_latency_ns: self.avg_write_latency_ns(),
            max_write_latency_ns: self.max_write_latency_ns(),
        }
    }
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CorrelatorSnapshot {
    pub decisions: u64,
    pub overwritten_decisions: u64,
    pub fragments: u64,
    pub fragment_misses: u64,
    pub fragments_rejected: u64,
    pub records: u64,
    pub stale_decisions: u64,
    pub discarded_fragments: u64,
}

/// Immutable snapshot for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageSnapshot {
    pub writes: u64,
    pub bytes_written: u64,
    pub payload_bytes: u64,
    pub avg_write_latency_ns: u64,
    pub max_write_latency_ns: u64,
}
