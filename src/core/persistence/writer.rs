//! Sequential block writer on top of [`SubmissionEngine`].
//!
//! Every `store` lands one full block at `min_offset + n * block_size` and
//! returns only once nothing is in flight. Calls are strictly serialized;
//! throughput comes from issuing the next `store` right away.
//!
//! The first `min_offset` bytes of the target are never written. On a raw
//! device that region holds the partition table.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::affinity::{AffinityPolicy, NoAffinity};
use super::buffer::AlignedBuffer;
use super::driver::{IoDriver, SyncDriver, UringDriver};
use super::engine::{EngineConfig, SubmissionEngine};
use super::error::{Result, StorageError};
use super::file::{self, OpenMode};
use crate::core::metrics::StorageMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    pub path: PathBuf,
    pub block_size: usize,
    pub min_offset: u64,
    pub direct_io: bool,
    pub engine: EngineConfig,
}

impl WriterConfig {
    pub fn new(path: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            path: path.into(),
            block_size,
            min_offset: 4096,
            direct_io: true,
            engine: EngineConfig::default(),
        }
    }

    fn check(&self) -> Result<()> {
        self.engine.validate()?;
        let alignment = self.engine.alignment;
        if self.block_size == 0 {
            return Err(StorageError::InvalidSize(0));
        }
        if self.block_size % alignment != 0 {
            return Err(StorageError::Misaligned {
                what: "block size",
                value: self.block_size as u64,
                alignment,
            });
        }
        if self.min_offset % alignment as u64 != 0 {
            return Err(StorageError::Misaligned {
                what: "minimum offset",
                value: self.min_offset,
                alignment,
            });
        }
        let units = self.engine.units_for(self.block_size);
        if units > self.engine.max_concurrent_ops {
            return Err(StorageError::ExceedsCapacity {
                units,
                capacity: self.engine.max_concurrent_ops,
            });
        }
        Ok(())
    }
}

pub struct BlockWriter<D: IoDriver = UringDriver, A: AffinityPolicy = NoAffinity> {
    engine: SubmissionEngine<D>,
    file: File,
    path: PathBuf,
    block_size: usize,
    min_offset: u64,
    cursor: u64,
    stores: u64,
    staging: Option<AlignedBuffer>,
    affinity: A,
    pinned: Option<usize>,
    halted: bool,
    metrics: Arc<StorageMetrics>,
}

impl BlockWriter<UringDriver, NoAffinity> {
    /// Open the target and set up an io_uring engine.
    pub fn init(config: WriterConfig) -> Result<Self> {
        let engine = SubmissionEngine::new(config.engine)?;
        Self::with_engine(config, engine, NoAffinity)
    }
}

impl BlockWriter<SyncDriver, NoAffinity> {
    /// Same contract, synchronous `pwrite` underneath.
    pub fn init_sync(config: WriterConfig) -> Result<Self> {
        let engine = SubmissionEngine::synchronous(config.engine)?;
        Self::with_engine(config, engine, NoAffinity)
    }
}

impl<D: IoDriver, A: AffinityPolicy> BlockWriter<D, A> {
    pub fn with_engine(config: WriterConfig, engine: SubmissionEngine<D>, affinity: A) -> Result<Self> {
        config.check()?;

        let file = file::open(&config.path, OpenMode::WriteOnly, config.direct_io)?;
        if file::is_block_device(&file)? {
            debug!(path = %config.path.display(), "block device target, not truncating");
        } else {
            file.set_len(0)?;
        }

        let staging = AlignedBuffer::new(config.block_size, config.engine.alignment)?;

        info!(
            path = %config.path.display(),
            block_size = config.block_size,
            min_offset = config.min_offset,
            direct_io = config.direct_io,
            "block writer initialized"
        );

        Ok(Self {
            engine,
            file,
            path: config.path,
            block_size: config.block_size,
            min_offset: config.min_offset,
            cursor: config.min_offset,
            stores: 0,
            staging: Some(staging),
            affinity,
            pinned: None,
            halted: false,
            metrics: Arc::new(StorageMetrics::new()),
        })
    }

    /// Swap the affinity policy.
    pub fn with_affinity<B: AffinityPolicy>(self, affinity: B) -> BlockWriter<D, B> {
        BlockWriter {
            engine: self.engine,
            file: self.file,
            path: self.path,
            block_size: self.block_size,
            min_offset: self.min_offset,
            cursor: self.cursor,
            stores: self.stores,
            staging: self.staging,
            affinity,
            pinned: None,
            halted: self.halted,
            metrics: self.metrics,
        }
    }

    /// Share metrics with an observer.
    pub fn with_metrics(mut self, metrics: Arc<StorageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Write `payload` as the next block. Returns the offset it was written at.
    ///
    /// `payload` may be shorter than the block; the tail is zero-filled and the
    /// cursor still advances by a full block. Blocks until every in-flight
    /// operation has completed.
    pub fn store(&mut self, payload: &[u8], core_affinity: Option<usize>) -> Result<u64> {
        if self.halted {
            return Err(StorageError::Halted);
        }
        if payload.len() > self.block_size {
            return Err(StorageError::ExceedsBlock {
                size: payload.len(),
                block_size: self.block_size,
            });
        }

        if let Some(core) = core_affinity {
            self.pin(core);
        }

        let started = Instant::now();
        let offset = self.cursor;
        match self.write_block(payload, offset) {
            Ok(staging) => self.staging = Some(staging),
            Err(e) => {
                self.halted = true;
                error!(path = %self.path.display(), offset, error = %e, "block store failed, writer halted");
                return Err(e);
            }
        }

        self.cursor += self.block_size as u64;
        self.stores += 1;
        self.metrics.record_store(
            self.block_size as u64,
            payload.len() as u64,
            started.elapsed().as_nanos() as u64,
        );
        Ok(offset)
    }

    fn write_block(&mut self, payload: &[u8], offset: u64) -> Result<AlignedBuffer> {
        let mut staging = self.staging.take().ok_or(StorageError::BufferLost)?;
        staging.fill_from(payload)?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.engine.submit_write(
            self.file.as_raw_fd(),
            offset,
            staging,
            self.block_size,
            move |done| {
                let _ = tx.send(done.into_buffer());
            },
        )?;
        self.engine.wait_idle()?;

        rx.try_recv().map_err(|_| StorageError::BufferLost)
    }

    fn pin(&mut self, core: usize) {
        if self.pinned == Some(core) {
            return;
        }
        match self.affinity.pin_current_thread(core) {
            Ok(()) => self.pinned = Some(core),
            Err(e) => warn!(core, error = %e, "failed to pin writer thread"),
        }
    }

    /// Offset the next `store` will write at.
    #[inline(always)]
    pub fn next_offset(&self) -> u64 {
        self.cursor
    }

    #[inline(always)]
    pub fn stores(&self) -> u64 {
        self.stores
    }

    #[inline(always)]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline(always)]
    pub fn min_offset(&self) -> u64 {
        self.min_offset
    }

    #[inline(always)]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }

    pub fn engine(&self) -> &SubmissionEngine<D> {
        &self.engine
    }

    /// Writable size of the target in bytes (device size, or current file length).
    ///
    /// A zero-size target is an error.
    pub fn max_size(&self) -> Result<u64> {
        let mut file = &self.file;
        let end = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        if end == 0 {
            return Err(StorageError::EmptyTarget {
                path: self.path.clone(),
            });
        }
        Ok(end)
    }

    /// Drain anything still in flight, release the staging buffer and close the target.
    pub fn close(mut self) -> Result<()> {
        self.engine.wait_idle()?;
        self.staging = None;
        info!(path = %self.path.display(), stores = self.stores, "block writer closed");
        Ok(())
    }
}
