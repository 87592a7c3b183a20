//! Two-thread pipeline: correlator thread → bounded record queue → writer thread.
//!
//! Neither thread touches the other's state. The record queue is the only handoff.

pub mod correlate;
pub mod queue;
pub mod store;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, ConfigError, DriverKind};
use crate::core::persistence::{BlockWriter, SchedAffinity, StorageError};
use crate::core::{Correlator, CorrelatorMetrics, Fragment, StorageMetrics, TriggerDecision};

pub use correlate::{CorrelatorWorker, CycleStats};
pub use queue::{QueueError, QueueSink, QueueSource};
pub use store::{WriterSummary, WriterWorker};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} queue disconnected")]
    Disconnected(&'static str),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Progress,
    Idle,
    /// Inputs are gone; the worker has nothing left to do.
    Closed,
}

/// Running pipeline. Dropping it detaches both threads.
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    correlator: JoinHandle<Result<Correlator, PipelineError>>,
    writer: JoinHandle<Result<WriterSummary, PipelineError>>,
    correlator_metrics: Arc<CorrelatorMetrics>,
    storage_metrics: Arc<StorageMetrics>,
}

impl PipelineHandle {
    pub fn correlator_metrics(&self) -> &Arc<CorrelatorMetrics> {
        &self.correlator_metrics
    }

    pub fn storage_metrics(&self) -> &Arc<StorageMetrics> {
        &self.storage_metrics
    }

    /// Stop correlating, flush pending records, then wait for the writer to drain.
    pub fn shutdown(self) -> Result<WriterSummary, PipelineError> {
        self.running.store(false, Ordering::Release);
        self.join()
    }

    /// Wait for both threads. Returns once the input queues close.
    pub fn join(self) -> Result<WriterSummary, PipelineError> {
        let correlated = self
            .correlator
            .join()
            .map_err(|_| PipelineError::Panicked("correlator"))?;
        let written = self
            .writer
            .join()
            .map_err(|_| PipelineError::Panicked("writer"))?;

        // A writer fault explains a disconnected record queue, so report it first.
        let summary = written?;
        correlated?;
        Ok(summary)
    }
}

/// Open the storage target and start both threads.
pub fn launch(
    config: &Config,
    decisions: Receiver<TriggerDecision>,
    fragments: Receiver<Fragment>,
) -> Result<PipelineHandle, PipelineError> {
    config.validate()?;

    let timeout = config.pipeline.queue_timeout();
    let (record_tx, record_rx) = queue::bounded(config.pipeline.record_queue_capacity);
    let correlator_metrics = Arc::new(CorrelatorMetrics::new());
    let storage_metrics = Arc::new(StorageMetrics::new());

    // The writer stops when the record queue closes, never on its own flag.
    let writer = match config.storage.driver {
        DriverKind::Uring => {
            let writer = BlockWriter::init(config.storage.writer_config())?
                .with_affinity(SchedAffinity)
                .with_metrics(Arc::clone(&storage_metrics));
            let worker = WriterWorker::new(writer, record_rx, timeout)
                .with_core_affinity(config.storage.core_affinity_id)
                .with_progress_interval(config.pipeline.progress_interval());
            spawn("trigstore-writer", move || worker.run(&AtomicBool::new(true)))?
        }
        DriverKind::Sync => {
            let writer = BlockWriter::init_sync(config.storage.writer_config())?
                .with_affinity(SchedAffinity)
                .with_metrics(Arc::clone(&storage_metrics));
            let worker = WriterWorker::new(writer, record_rx, timeout)
                .with_core_affinity(config.storage.core_affinity_id)
                .with_progress_interval(config.pipeline.progress_interval());
            spawn("trigstore-writer", move || worker.run(&AtomicBool::new(true)))?
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let correlator = {
        let running = Arc::clone(&running);
        let worker = CorrelatorWorker::new(
            Correlator::with_metrics(Arc::clone(&correlator_metrics)),
            decisions,
            fragments,
            record_tx,
            config.correlator.clone(),
            timeout,
        );
        spawn("trigstore-correlator", move || worker.run(&running))?
    };

    info!(
        path = %config.storage.path.display(),
        driver = ?config.storage.driver,
        "pipeline started"
    );

    Ok(PipelineHandle {
        running,
        correlator,
        writer,
        correlator_metrics,
        storage_metrics,
    })
}

fn spawn<T, F>(name: &'static str, body: F) -> Result<JoinHandle<T>, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| PipelineError::Spawn { name, source })
}
