//! Correlator thread body: pop decisions and fragments, join, emit, evict.
//!
//! One cycle:
//! 1. pop up to `decision_batch` decisions, each advancing the present time
//! 2. retry fragments held back on an earlier miss
//! 3. pop up to `fragment_batch` fragments
//! 4. queue complete records, evict stale decisions, flush records downstream
//!
//! A record whose push times out stays queued for the next cycle. Held
//! fragments are capped at `max_held_fragments`; past that the oldest is
//! discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::queue::{QueueError, QueueSink, QueueSource};
use super::{PipelineError, Step};
use crate::config::CorrelatorConfig;
use crate::core::{Correlator, Fragment, IngestError, TriggerDecision, TriggerRecord};

/// Per-cycle counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub decisions: usize,
    pub fragments: usize,
    pub emitted: usize,
    pub evicted: usize,
}

impl CycleStats {
    fn is_idle(&self) -> bool {
        self.decisions == 0 && self.fragments == 0 && self.emitted == 0 && self.evicted == 0
    }
}

pub struct CorrelatorWorker<DQ, FQ, RQ> {
    correlator: Correlator,
    decisions: DQ,
    fragments: FQ,
    records: RQ,
    config: CorrelatorConfig,
    timeout: Duration,
    held: VecDeque<Fragment>,
    outbox: VecDeque<TriggerRecord>,
    decisions_open: bool,
    fragments_open: bool,
}

impl<DQ, FQ, RQ> CorrelatorWorker<DQ, FQ, RQ>
where
    DQ: QueueSource<TriggerDecision>,
    FQ: QueueSource<Fragment>,
    RQ: QueueSink<TriggerRecord>,
{
    pub fn new(
        correlator: Correlator,
        decisions: DQ,
        fragments: FQ,
        records: RQ,
        config: CorrelatorConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            correlator,
            decisions,
            fragments,
            records,
            config,
            timeout,
            held: VecDeque::new(),
            outbox: VecDeque::new(),
            decisions_open: true,
            fragments_open: true,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Fragments waiting for their decision.
    pub fn held(&self) -> &VecDeque<Fragment> {
        &self.held
    }

    /// Records waiting for room downstream.
    pub fn backlog(&self) -> usize {
        self.outbox.len()
    }

    pub fn into_correlator(self) -> Correlator {
        self.correlator
    }

    /// One full cycle. `Step::Closed` once both inputs are gone and nothing is left to retry.
    pub fn run_once(&mut self) -> Result<(Step, CycleStats), PipelineError> {
        let decisions = self.pop_decisions();
        self.retry_held();
        let fragments = self.pop_fragments();

        let complete = self.correlator.drain_complete();
        let emitted = complete.len();
        self.outbox.extend(complete);

        let now = self.correlator.present();
        let evicted = self
            .correlator
            .evict_stale(now, self.config.staleness_threshold)
            .len();

        let stats = CycleStats {
            decisions,
            fragments,
            emitted,
            evicted,
        };

        self.flush()?;

        let inputs_closed = !self.decisions_open && !self.fragments_open;
        let step = if inputs_closed && self.held.is_empty() && self.outbox.is_empty() {
            Step::Closed
        } else if stats.is_idle() {
            Step::Idle
        } else {
            Step::Progress
        };
        Ok((step, stats))
    }

    /// Cycle until `running` clears or the inputs close. Remaining records are flushed on exit.
    pub fn run(mut self, running: &AtomicBool) -> Result<Correlator, PipelineError> {
        info!(
            staleness_threshold = self.config.staleness_threshold,
            "correlator worker started"
        );

        while running.load(Ordering::Acquire) {
            let (step, _) = self.run_once()?;
            if step == Step::Closed {
                break;
            }
        }

        self.drain_outbox()?;

        if !self.held.is_empty() || !self.correlator.is_empty() {
            warn!(
                pending = self.correlator.len(),
                held_fragments = self.held.len(),
                "correlator stopping with incomplete triggers"
            );
        }
        info!(
            records = self.correlator.metrics().records(),
            "correlator worker stopped"
        );
        Ok(self.correlator)
    }

    fn pop_decisions(&mut self) -> usize {
        let mut popped = 0;
        while self.decisions_open && popped < self.config.decision_batch {
            match self.decisions.pop(self.timeout) {
                Ok(decision) => {
                    self.correlator.advance_time(decision.trigger_timestamp());
                    self.correlator.ingest_decision(decision);
                    popped += 1;
                }
                Err(QueueError::Timeout(())) => break,
                Err(QueueError::Disconnected(())) => {
                    debug!("decision queue closed");
                    self.decisions_open = false;
                }
            }
        }
        popped
    }

    fn pop_fragments(&mut self) -> usize {
        let mut popped = 0;
        while self.fragments_open && popped < self.config.fragment_batch {
            match self.fragments.pop(self.timeout) {
                Ok(fragment) => {
                    self.attach(fragment);
                    popped += 1;
                }
                Err(QueueError::Timeout(())) => break,
                Err(QueueError::Disconnected(())) => {
                    debug!("fragment queue closed");
                    self.fragments_open = false;
                }
            }
        }
        popped
    }

    fn retry_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let now = self.correlator.present();
        let threshold = self.config.staleness_threshold;
        let no_more_decisions = !self.decisions_open;

        for fragment in std::mem::take(&mut self.held) {
            let stale = now.saturating_sub(fragment.timestamp()) > threshold;
            match self.correlator.ingest_fragment(fragment) {
                Ok(()) => {}
                Err(IngestError::NoDecision(fragment)) if stale || no_more_decisions => {
                    self.discard(&fragment);
                }
                Err(IngestError::NoDecision(fragment)) => self.held.push_back(fragment),
                Err(IngestError::EntryFull(_)) => {}
            }
        }
    }

    fn attach(&mut self, fragment: Fragment) {
        match self.correlator.ingest_fragment(fragment) {
            Ok(()) | Err(IngestError::EntryFull(_)) => {}
            Err(IngestError::NoDecision(fragment)) => {
                if self.held.len() >= self.config.max_held_fragments {
                    if let Some(oldest) = self.held.pop_front() {
                        self.discard(&oldest);
                    }
                }
                self.held.push_back(fragment);
            }
        }
    }

    fn discard(&self, fragment: &Fragment) {
        error!(
            trigger_number = fragment.trigger_number(),
            source = %fragment.source(),
            timestamp = fragment.timestamp(),
            present_time = self.correlator.present(),
            held = self.held.len(),
            "removing fragment without decision"
        );
        self.correlator.metrics().record_discarded(1);
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        while let Some(record) = self.outbox.pop_front() {
            match self.records.push(record, self.timeout) {
                Ok(()) => {}
                Err(QueueError::Timeout(record)) => {
                    warn!(
                        id = %record.trigger_id(),
                        backlog = self.outbox.len() + 1,
                        "record queue full, retrying next cycle"
                    );
                    self.outbox.push_front(record);
                    return Ok(());
                }
                Err(QueueError::Disconnected(_)) => return Err(PipelineError::Disconnected("record")),
            }
        }
        Ok(())
    }

    fn drain_outbox(&mut self) -> Result<(), PipelineError> {
        while !self.outbox.is_empty() {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ComponentRequest, SourceId};
    use crate::pipeline::queue::bounded;
    use crossbeam_channel::{Receiver, Sender};

    const TICK: Duration = Duration::from_millis(1);

    struct Harness {
        decisions: Sender<TriggerDecision>,
        fragments: Sender<Fragment>,
        records: Receiver<TriggerRecord>,
        worker: CorrelatorWorker<Receiver<TriggerDecision>, Receiver<Fragment>, Sender<TriggerRecord>>,
    }

    fn harness(threshold: u64, record_capacity: usize) -> Harness {
        let (dtx, drx) = bounded(64);
        let (ftx, frx) = bounded(64);
        let (rtx, rrx) = bounded(record_capacity);
        let config = CorrelatorConfig {
            staleness_threshold: threshold,
            decision_batch: 8,
            fragment_batch: 8,
            max_held_fragments: 4,
        };
        Harness {
            decisions: dtx,
            fragments: ftx,
            records: rrx,
            worker: CorrelatorWorker::new(Correlator::new(), drx, frx, rtx, config, TICK),
        }
    }

    fn decision(trig: u64, ts: u64, expects: u32) -> TriggerDecision {
        let components = (0..expects)
            .map(|e| ComponentRequest::new(SourceId::new(1, e), ts, ts + 10))
            .collect();
        TriggerDecision::new(1, trig, ts, components)
    }

    fn fragment(trig: u64, element: u32, ts: u64) -> Fragment {
        Fragment::new(1, trig, SourceId::new(1, element), ts, vec![element as u8; 4])
    }

    #[test]
    fn test_cycle_emits_complete_record() {
        let mut h = harness(100, 4);
        h.decisions.send(decision(1, 10, 2)).unwrap();
        h.fragments.send(fragment(1, 0, 10)).unwrap();
        h.fragments.send(fragment(1, 1, 10)).unwrap();

        let (step, stats) = h.worker.run_once().unwrap();
        assert_eq!(step, Step::Progress);
        assert_eq!(stats.emitted, 1);

        let record = h.records.try_recv().unwrap();
        assert_eq!(record.fragments().len(), 2);
        assert_eq!(record.fragments()[0].source(), SourceId::new(1, 0));
    }

    #[test]
    fn test_early_fragment_is_held_then_attached() {
        let mut h = harness(100, 4);
        h.fragments.send(fragment(5, 0, 10)).unwrap();
        h.worker.run_once().unwrap();
        assert_eq!(h.worker.held().len(), 1);

        h.decisions.send(decision(5, 10, 1)).unwrap();
        h.worker.run_once().unwrap();
        assert!(h.worker.held().is_empty());
        assert_eq!(h.records.try_recv().unwrap().trigger_id().trigger_number, 5);
    }

    #[test]
    fn test_stale_held_fragment_discarded() {
        let mut h = harness(10, 4);
        h.fragments.send(fragment(9, 0, 0)).unwrap();
        h.worker.run_once().unwrap();
        assert_eq!(h.worker.held().len(), 1);

        // Unrelated decision moves the present past the threshold.
        h.decisions.send(decision(1, 50, 1)).unwrap();
        h.worker.run_once().unwrap();
        assert!(h.worker.held().is_empty());
        assert_eq!(h.worker.correlator().metrics().snapshot().discarded_fragments, 1);
    }

    #[test]
    fn test_decision_evicted_after_threshold() {
        let mut h = harness(10, 4);
        h.decisions.send(decision(2, 0, 1)).unwrap();
        h.worker.run_once().unwrap();
        assert_eq!(h.worker.correlator().len(), 1);

        h.decisions.send(decision(3, 11, 1)).unwrap();
        let (_, stats) = h.worker.run_once().unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(!h.worker.correlator().contains(&crate::core::TriggerId::new(1, 2)));
    }

    #[test]
    fn test_full_record_queue_keeps_record() {
        let mut h = harness(100, 1);
        for trig in 0..3 {
            h.decisions.send(decision(trig, 10, 1)).unwrap();
            h.fragments.send(fragment(trig, 0, 10)).unwrap();
        }
        h.worker.run_once().unwrap();
        assert_eq!(h.worker.backlog(), 2);

        let mut seen = 0;
        while seen < 3 {
            if h.records.try_recv().is_ok() {
                seen += 1;
            }
            h.worker.run_once().unwrap();
        }
        assert_eq!(h.worker.backlog(), 0);
    }

    #[test]
    fn test_closed_inputs_end_run() {
        let h = harness(100, 4);
        let Harness {
            decisions,
            fragments,
            records,
            worker,
        } = h;
        decisions.send(decision(1, 10, 1)).unwrap();
        fragments.send(fragment(1, 0, 10)).unwrap();
        drop(decisions);
        drop(fragments);

        let running = AtomicBool::new(true);
        let correlator = worker.run(&running).unwrap();
        assert!(correlator.is_empty());
        assert_eq!(records.try_recv().unwrap().trigger_id().trigger_number, 1);
    }

    #[test]
    fn test_held_fragments_capped_without_decisions() {
        let mut h = harness(1_000, 4);
        for trig in 0..6 {
            h.fragments.send(fragment(100 + trig, 0, 10)).unwrap();
        }
        h.worker.run_once().unwrap();

        let held: Vec<u64> = h.worker.held().iter().map(|f| f.trigger_number()).collect();
        assert_eq!(held, vec![102, 103, 104, 105]);
        assert_eq!(h.worker.correlator().metrics().snapshot().discarded_fragments, 2);
    }
}
