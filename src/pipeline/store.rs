//! Writer thread body: pop records, store them block by block.
//!
//! Layout per record: one header block (the 32-byte [`TriggerRecordHeader`],
//! zero-padded) followed by one block per fragment payload, in arrival order.
//!
//! [`TriggerRecordHeader`]: crate::core::TriggerRecordHeader

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};
use zerocopy::IntoBytes;

use super::queue::{QueueError, QueueSource};
use super::{PipelineError, Step};
use crate::core::persistence::{AffinityPolicy, BlockWriter, IoDriver};
use crate::core::TriggerRecord;

/// Totals at worker exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    pub records: u64,
    pub blocks: u64,
    pub payload_bytes: u64,
}

pub struct WriterWorker<Q, D: IoDriver, A: AffinityPolicy> {
    writer: BlockWriter<D, A>,
    records: Q,
    timeout: Duration,
    core_affinity: Option<usize>,
    progress_interval: Duration,
    summary: WriterSummary,
    last_report: Instant,
    bytes_at_report: u64,
}

impl<Q, D, A> WriterWorker<Q, D, A>
where
    Q: QueueSource<TriggerRecord>,
    D: IoDriver,
    A: AffinityPolicy,
{
    pub fn new(writer: BlockWriter<D, A>, records: Q, timeout: Duration) -> Self {
        Self {
            writer,
            records,
            timeout,
            core_affinity: None,
            progress_interval: Duration::from_secs(5),
            summary: WriterSummary::default(),
            last_report: Instant::now(),
            bytes_at_report: 0,
        }
    }

    pub fn with_core_affinity(mut self, core: Option<usize>) -> Self {
        self.core_affinity = core;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn writer(&self) -> &BlockWriter<D, A> {
        &self.writer
    }

    pub fn summary(&self) -> WriterSummary {
        self.summary
    }

    /// Pop at most one record and store it.
    pub fn run_once(&mut self) -> Result<Step, PipelineError> {
        let step = match self.records.pop(self.timeout) {
            Ok(record) => {
                self.store_record(&record)?;
                Step::Progress
            }
            Err(QueueError::Timeout(())) => Step::Idle,
            Err(QueueError::Disconnected(())) => Step::Closed,
        };
        self.report_progress();
        Ok(step)
    }

    /// Store until the record queue closes or `running` clears. The first storage fault ends the thread.
    pub fn run(mut self, running: &AtomicBool) -> Result<WriterSummary, PipelineError> {
        info!(
            path = %self.writer.path().display(),
            block_size = self.writer.block_size(),
            "writer worker started"
        );

        while running.load(Ordering::Acquire) {
            match self.run_once() {
                Ok(Step::Closed) => {
                    debug!("record queue closed");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, records = self.summary.records, "writer worker halted");
                    return Err(e);
                }
            }
        }

        let summary = self.summary;
        self.writer.close()?;
        info!(
            records = summary.records,
            blocks = summary.blocks,
            payload_bytes = summary.payload_bytes,
            "writer worker stopped"
        );
        Ok(summary)
    }

    fn store_record(&mut self, record: &TriggerRecord) -> Result<(), PipelineError> {
        let core = self.core_affinity;
        self.writer.store(record.header().as_bytes(), core)?;
        self.summary.blocks += 1;

        for fragment in record.fragments() {
            self.writer.store(fragment.payload(), core)?;
            self.summary.blocks += 1;
            self.summary.payload_bytes += fragment.size() as u64;
        }

        self.summary.records += 1;
        Ok(())
    }

    fn report_progress(&mut self) {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.progress_interval {
            return;
        }
        let bytes = self.summary.payload_bytes - self.bytes_at_report;
        let mb_per_s = bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();
        info!(
            records = self.summary.records,
            throughput_mb_s = mb_per_s,
            "writer progress"
        );
        self.last_report = Instant::now();
        self.bytes_at_report = self.summary.payload_bytes;
    }
}
