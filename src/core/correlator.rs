//! Decision–fragment join. Bounded by staleness, single-threaded by construction.
//!
//! Lifecycle per [`TriggerId`]:
//! `Unseen → Pending → {Complete | Expired}`. Both terminal states remove the
//! entry. A later decision with the same id starts a fresh `Pending`.
//!
//! Completion is a cardinality match: collected == expected. Which sources
//! delivered is not checked.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use super::metrics::CorrelatorMetrics;
use super::record::{RecordAssembler, TriggerRecord};
use super::trigger::{Fragment, Timestamp, TriggerDecision, TriggerId};

/// Fragment could not be attached. Ownership goes back to the caller.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No decision registered for this id yet. Retry later.
    #[error("no pending decision for trigger {}", .0.trigger_id())]
    NoDecision(Fragment),
    /// Entry already holds its full complement.
    #[error("trigger {} already holds all expected fragments", .0.trigger_id())]
    EntryFull(Fragment),
}

impl IngestError {
    pub fn into_fragment(self) -> Fragment {
        match self {
            IngestError::NoDecision(f) | IngestError::EntryFull(f) => f,
        }
    }

    /// True when a later retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::NoDecision(_))
    }
}

/// One outstanding decision and what has arrived for it so far.
///
/// Invariant: `fragments.len() <= decision.expected_component_count()`.
#[derive(Debug)]
pub struct PendingEntry {
    decision: TriggerDecision,
    fragments: Vec<Fragment>,
}

impl PendingEntry {
    pub fn new(decision: TriggerDecision) -> Self {
        let capacity = decision.expected_component_count();
        Self {
            decision,
            fragments: Vec::with_capacity(capacity),
        }
    }

    pub fn decision(&self) -> &TriggerDecision {
        &self.decision
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    #[inline(always)]
    pub fn collected(&self) -> usize {
        self.fragments.len()
    }

    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.fragments.len() == self.decision.expected_component_count()
    }

    /// Append in arrival order. Hands the fragment back once the entry is full.
    pub fn push(&mut self, fragment: Fragment) -> Result<(), Fragment> {
        if self.is_complete() {
            return Err(fragment);
        }
        self.fragments.push(fragment);
        Ok(())
    }

    /// Age relative to `now`. Decisions stamped in the future count as age 0.
    #[inline(always)]
    pub fn age(&self, now: Timestamp) -> Timestamp {
        now.saturating_sub(self.decision.trigger_timestamp())
    }

    pub fn into_parts(self) -> (TriggerDecision, Vec<Fragment>) {
        (self.decision, self.fragments)
    }
}

/// The join engine. Owns every pending entry and every fragment attached to one.
#[derive(Debug)]
pub struct Correlator {
    pending: BTreeMap<TriggerId, PendingEntry>,
    present: Timestamp,
    metrics: Arc<CorrelatorMetrics>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(CorrelatorMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<CorrelatorMetrics>) -> Self {
        Self {
            pending: BTreeMap::new(),
            present: 0,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<CorrelatorMetrics> {
        &self.metrics
    }

    /// Register (or replace) the entry for this decision's id with an empty fragment list.
    ///
    /// Returns the replaced entry, if any. Its fragments are reported as discarded.
    pub fn ingest_decision(&mut self, decision: TriggerDecision) -> Option<PendingEntry> {
        let id = decision.trigger_id();
        trace!(%id, expected = decision.expected_component_count(), "decision ingested");

        let replaced = self.pending.insert(id, PendingEntry::new(decision));
        self.metrics.record_decision(replaced.is_some());

        if let Some(old) = &replaced {
            warn!(
                %id,
                dropped_fragments = old.collected(),
                "decision replaced an already pending decision"
            );
            for fragment in old.fragments() {
                error!(
                    trigger_number = fragment.trigger_number(),
                    source = %fragment.source(),
                    timestamp = fragment.timestamp(),
                    "removing fragment of replaced decision"
                );
            }
            self.metrics.record_discarded(old.collected() as u64);
        }
        replaced
    }

    /// Attach a fragment to its pending entry.
    ///
    /// No entry is created on a miss: without a decision there is nothing to attach to.
    pub fn ingest_fragment(&mut self, fragment: Fragment) -> Result<(), IngestError> {
        let id = fragment.trigger_id();
        let Some(entry) = self.pending.get_mut(&id) else {
            self.metrics.record_miss();
            return Err(IngestError::NoDecision(fragment));
        };

        match entry.push(fragment) {
            Ok(()) => {
                self.metrics.record_fragment();
                trace!(%id, collected = entry.collected(), "fragment attached");
                Ok(())
            }
            Err(fragment) => {
                warn!(%id, source = %fragment.source(), "fragment beyond expected count rejected");
                self.metrics.record_rejected();
                Err(IngestError::EntryFull(fragment))
            }
        }
    }

    /// Record the most recently observed trigger timestamp. Pending entries are untouched.
    #[inline]
    pub fn advance_time(&mut self, now: Timestamp) {
        self.present = now;
    }

    #[inline(always)]
    pub fn present(&self) -> Timestamp {
        self.present
    }

    /// Emit a record for every complete entry and remove those entries.
    pub fn drain_complete(&mut self) -> Vec<TriggerRecord> {
        let complete: Vec<TriggerId> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.is_complete())
            .map(|(id, _)| *id)
            .collect();

        let records: Vec<TriggerRecord> = complete
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(RecordAssembler::assemble)
            .collect();

        if !records.is_empty() {
            debug!(count = records.len(), pending = self.pending.len(), "records completed");
            self.metrics.record_emitted(records.len() as u64);
        }
        records
    }

    /// Drop every entry older than `threshold` at `now`, with its fragments.
    ///
    /// Collect-then-erase: keys are gathered first, removal happens afterwards.
    pub fn evict_stale(&mut self, now: Timestamp, threshold: Timestamp) -> Vec<TriggerId> {
        let stale: Vec<TriggerId> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.age(now) > threshold)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            let Some(entry) = self.pending.remove(id) else {
                continue;
            };
            let decision = entry.decision();
            warn!(
                trigger_number = decision.trigger_number(),
                run_number = decision.run_number(),
                trigger_timestamp = decision.trigger_timestamp(),
                present_time = now,
                "timed out trigger decision"
            );
            for fragment in entry.fragments() {
                error!(
                    trigger_number = fragment.trigger_number(),
                    source = %fragment.source(),
                    timestamp = fragment.timestamp(),
                    present_time = now,
                    "removing fragment of timed out decision"
                );
            }
            self.metrics.record_stale(entry.collected() as u64);
        }
        stale
    }

    pub fn get(&self, id: &TriggerId) -> Option<&PendingEntry> {
        self.pending.get(id)
    }

    pub fn contains(&self, id: &TriggerId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trigger::{ComponentRequest, SourceId};

    fn decision(trigger: u64, expected: u32, timestamp: Timestamp) -> TriggerDecision {
        let components = (0..expected)
            .map(|i| ComponentRequest::new(SourceId::new(0, i), 0, 0))
            .collect();
        TriggerDecision::new(1, trigger, timestamp, components)
    }

    fn fragment(trigger: u64, element: u32) -> Fragment {
        Fragment::new(1, trigger, SourceId::new(0, element), 0, vec![element as u8; 4])
    }

    #[test]
    fn test_complete_after_expected_count() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(1, 2, 0));

        c.ingest_fragment(fragment(1, 0)).unwrap();
        assert!(c.drain_complete().is_empty());

        c.ingest_fragment(fragment(1, 1)).unwrap();
        let records = c.drain_complete();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fragments().len(), 2);
        assert!(!c.contains(&TriggerId::new(1, 1)));
    }

    #[test]
    fn test_miss_returns_fragment() {
        let mut c = Correlator::new();
        let err = c.ingest_fragment(fragment(5, 0)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.into_fragment().trigger_number(), 5);
        assert!(c.is_empty());
        assert_eq!(c.metrics().snapshot().fragment_misses, 1);
    }

    #[test]
    fn test_full_entry_rejects_extra_fragment() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(1, 1, 0));
        c.ingest_fragment(fragment(1, 0)).unwrap();

        let err = c.ingest_fragment(fragment(1, 1)).unwrap_err();
        assert!(matches!(err, IngestError::EntryFull(_)));
        assert!(!err.is_retryable());
        assert_eq!(c.get(&TriggerId::new(1, 1)).unwrap().collected(), 1);
    }

    #[test]
    fn test_zero_component_decision_completes_immediately() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(3, 0, 0));
        let records = c.drain_complete();
        assert_eq!(records.len(), 1);
        assert!(records[0].fragments().is_empty());
    }

    #[test]
    fn test_redecision_resets_entry() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(1, 2, 0));
        c.ingest_fragment(fragment(1, 0)).unwrap();

        let replaced = c.ingest_decision(decision(1, 2, 5)).unwrap();
        assert_eq!(replaced.collected(), 1);
        assert_eq!(c.get(&TriggerId::new(1, 1)).unwrap().collected(), 0);
        assert_eq!(c.metrics().snapshot().overwritten_decisions, 1);
    }

    #[test]
    fn test_evict_stale_strictly_older_than_threshold() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(2, 1, 0));

        assert!(c.evict_stale(10, 10).is_empty());
        assert_eq!(c.evict_stale(11, 10), vec![TriggerId::new(1, 2)]);
        assert!(c.is_empty());
        assert!(c.drain_complete().is_empty());
    }

    #[test]
    fn test_evict_reports_discarded_fragments() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(2, 3, 0));
        c.ingest_fragment(fragment(2, 0)).unwrap();
        c.ingest_fragment(fragment(2, 1)).unwrap();

        c.evict_stale(100, 10);
        let s = c.metrics().snapshot();
        assert_eq!(s.stale_decisions, 1);
        assert_eq!(s.discarded_fragments, 2);
    }

    #[test]
    fn test_advance_time_does_not_evict() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(1, 1, 0));
        c.advance_time(1_000_000);
        assert_eq!(c.present(), 1_000_000);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_future_decision_is_not_stale() {
        let mut c = Correlator::new();
        c.ingest_decision(decision(1, 1, 500));
        assert!(c.evict_stale(100, 10).is_empty());
    }
}
