//! Bounded-concurrency submission/completion engine.
//!
//! Non-blocking at the syscall level, blocking at the API level: when a new
//! request would push the in-flight capacity units past the limit, `submit_*`
//! drains completions until it fits. Nothing is rejected or dropped for lack
//! of capacity.
//!
//! Capacity accounting is size-aware. A request larger than the preferred
//! block size may be split by the kernel, so it is charged
//! `ceil(size / preferred_block_size)` units.
//!
//! Per-operation bookkeeping lives in a fixed slot table sized to the capacity
//! and recycled through a free list; the completion tag is the slot index.
//!
//! Single owner. The engine is `Send` so it can be built on one thread and
//! moved to the writer thread, but it is not `Sync` and has no internal locks.

use std::os::fd::RawFd;

use tracing::{error, trace};

use super::buffer::AlignedBuffer;
use super::driver::{IoDriver, IoRequest, OpKind, RawCompletion, SyncDriver, UringDriver};
use super::error::{Result, StorageError};

/// Maximum in-flight capacity units. Kernel ring limit.
pub const MAX_CONCURRENT_OPS: usize = 32_768;

/// Operation completed in full. Returns the buffer to its owner.
#[derive(Debug)]
pub struct IoCompletion {
    pub kind: OpKind,
    pub offset: u64,
    pub bytes: usize,
    pub buffer: AlignedBuffer,
}

impl IoCompletion {
    pub fn into_buffer(self) -> AlignedBuffer {
        self.buffer
    }
}

/// One-shot completion callback. Invoked exactly once, on the polling thread.
pub type CompletionCallback = Box<dyn FnOnce(IoCompletion) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_concurrent_ops: usize,
    pub preferred_block_size: usize,
    /// Device/page alignment for offsets, lengths and buffer addresses.
    pub alignment: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 128,
            preferred_block_size: 65_536,
            alignment: 4096,
        }
    }
}

impl EngineConfig {
    /// Capacity units charged for a request of `size` bytes.
    #[inline]
    pub fn units_for(&self, size: usize) -> usize {
        if size <= self.preferred_block_size {
            1
        } else {
            size.div_ceil(self.preferred_block_size.max(1))
        }
    }

    /// Alignment must be a power of two, the preferred block a non-zero
    /// multiple of it, and the capacity at least one unit.
    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(StorageError::InvalidSetting {
                field: "alignment",
                value: self.alignment,
            });
        }
        if self.preferred_block_size == 0 {
            return Err(StorageError::InvalidSetting {
                field: "preferred_block_size",
                value: 0,
            });
        }
        if self.preferred_block_size % self.alignment != 0 {
            return Err(StorageError::Misaligned {
                what: "preferred block size",
                value: self.preferred_block_size as u64,
                alignment: self.alignment,
            });
        }
        if self.max_concurrent_ops == 0 || self.max_concurrent_ops > MAX_CONCURRENT_OPS {
            return Err(StorageError::InvalidSetting {
                field: "max_concurrent_ops",
                value: self.max_concurrent_ops,
            });
        }
        Ok(())
    }
}

struct InFlight {
    kind: OpKind,
    offset: u64,
    requested: usize,
    units: usize,
    buffer: AlignedBuffer,
    callback: CompletionCallback,
}

pub struct SubmissionEngine<D: IoDriver = UringDriver> {
    driver: D,
    config: EngineConfig,
    in_flight_units: usize,
    slots: Vec<Option<InFlight>>,
    free_slots: Vec<usize>,
    reaped: Vec<RawCompletion>,
}

impl SubmissionEngine<UringDriver> {
    /// io_uring engine with a ring sized to the capacity.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Self::with_driver(UringDriver::new(config.max_concurrent_ops as u32)?, config)
    }
}

impl SubmissionEngine<SyncDriver> {
    pub fn synchronous(config: EngineConfig) -> Result<Self> {
        Self::with_driver(SyncDriver::new(), config)
    }
}

impl<D: IoDriver> SubmissionEngine<D> {
    pub fn with_driver(driver: D, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.max_concurrent_ops;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            driver,
            config,
            in_flight_units: 0,
            slots,
            free_slots: (0..capacity).rev().collect(),
            reaped: Vec::with_capacity(capacity),
        })
    }

    #[inline(always)]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Capacity units currently in flight.
    #[inline(always)]
    pub fn pending_count(&self) -> usize {
        self.in_flight_units
    }

    /// Number of operations currently in flight.
    #[inline]
    pub fn in_flight_ops(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Submit a write of `size` bytes from the front of `buffer` at `offset`.
    ///
    /// The buffer is owned by the engine until `callback` hands it back.
    pub fn submit_write<F>(
        &mut self,
        fd: RawFd,
        offset: u64,
        buffer: AlignedBuffer,
        size: usize,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit(OpKind::Write, fd, offset, buffer, size, Box::new(callback))
    }

    /// Submit a read of `size` bytes at `offset` into the front of `buffer`.
    pub fn submit_read<F>(
        &mut self,
        fd: RawFd,
        offset: u64,
        buffer: AlignedBuffer,
        size: usize,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit(OpKind::Read, fd, offset, buffer, size, Box::new(callback))
    }

    fn submit(
        &mut self,
        kind: OpKind,
        fd: RawFd,
        offset: u64,
        mut buffer: AlignedBuffer,
        size: usize,
        callback: CompletionCallback,
    ) -> Result<()> {
        self.validate(fd, offset, &buffer, size)?;

        let units = self.config.units_for(size);
        if units > self.config.max_concurrent_ops {
            return Err(StorageError::ExceedsCapacity {
                units,
                capacity: self.config.max_concurrent_ops,
            });
        }

        // Backpressure: block until this request fits.
        while self.in_flight_units + units > self.config.max_concurrent_ops
            || self.free_slots.is_empty()
        {
            trace!(
                in_flight = self.in_flight_units,
                units,
                "engine at capacity, draining completions"
            );
            self.driver.wait()?;
            self.poll_completions()?;
        }

        let Some(slot) = self.free_slots.pop() else {
            return Err(StorageError::ExceedsCapacity {
                units,
                capacity: self.config.max_concurrent_ops,
            });
        };

        let req = IoRequest {
            kind,
            fd,
            ptr: buffer.as_mut_ptr(),
            len: size as u32,
            offset,
            tag: slot as u64,
        };

        // The heap allocation behind `buffer` does not move when the buffer is
        // parked in the slot table, so `req.ptr` stays valid until reaped.
        self.slots[slot] = Some(InFlight {
            kind,
            offset,
            requested: size,
            units,
            buffer,
            callback,
        });

        // SAFETY: the slot owns the buffer until the completion for `slot` is reaped.
        if let Err(e) = unsafe { self.driver.push(req) } {
            // Nothing queued, so the slot and the buffer are still ours.
            self.slots[slot] = None;
            self.free_slots.push(slot);
            error!(%kind, offset, error = %e, "submission failed");
            return Err(e);
        }
        self.in_flight_units += units;

        // Queued requests may still run, so the slot stays parked until reaped.
        if let Err(e) = self.driver.submit() {
            error!(%kind, offset, error = %e, in_flight = self.in_flight_units, "kernel submit failed");
            return Err(e);
        }

        trace!(%kind, offset, size, units, in_flight = self.in_flight_units, "submitted");
        Ok(())
    }

    fn validate(&self, fd: RawFd, offset: u64, buffer: &AlignedBuffer, size: usize) -> Result<()> {
        let alignment = self.config.alignment;
        if fd < 0 {
            return Err(StorageError::InvalidDescriptor(fd));
        }
        if size == 0 || size > u32::MAX as usize {
            return Err(StorageError::InvalidSize(size));
        }
        if size > buffer.len() {
            return Err(StorageError::BufferTooSmall {
                size,
                capacity: buffer.len(),
            });
        }
        if offset % alignment as u64 != 0 {
            return Err(StorageError::Misaligned {
                what: "offset",
                value: offset,
                alignment,
            });
        }
        if size % alignment != 0 {
            return Err(StorageError::Misaligned {
                what: "size",
                value: size as u64,
                alignment,
            });
        }
        if buffer.as_ptr() as usize % alignment != 0 {
            return Err(StorageError::Misaligned {
                what: "buffer address",
                value: buffer.as_ptr() as u64,
                alignment,
            });
        }
        Ok(())
    }

    /// Non-blocking check for finished operations.
    ///
    /// Each successful completion fires its callback exactly once. Failed
    /// operations do not fire; the whole batch is processed and the first
    /// failure is returned afterwards. Returns the number of callbacks fired.
    pub fn poll_completions(&mut self) -> Result<usize> {
        let mut reaped = std::mem::take(&mut self.reaped);
        reaped.clear();
        let reap_result = self.driver.reap(&mut reaped);

        let mut fired = 0;
        let mut first_err = reap_result.err();

        for completion in reaped.drain(..) {
            match self.complete(completion) {
                Ok(()) => fired += 1,
                Err(e) => {
                    error!(error = %e, "fatal completion");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        self.reaped = reaped;

        match first_err {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }

    fn complete(&mut self, completion: RawCompletion) -> Result<()> {
        let slot = completion.tag as usize;
        let op = self
            .slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(StorageError::UnknownCompletion(completion.tag))?;

        self.in_flight_units -= op.units;
        self.free_slots.push(slot);

        if completion.result < 0 {
            return Err(StorageError::Completion {
                kind: op.kind,
                offset: op.offset,
                source: std::io::Error::from_raw_os_error(-completion.result),
            });
        }

        let bytes = completion.result as usize;
        if bytes != op.requested {
            return Err(StorageError::ShortTransfer {
                kind: op.kind,
                offset: op.offset,
                requested: op.requested,
                completed: bytes,
            });
        }

        (op.callback)(IoCompletion {
            kind: op.kind,
            offset: op.offset,
            bytes,
            buffer: op.buffer,
        });
        Ok(())
    }

    /// Block until nothing is in flight.
    pub fn wait_idle(&mut self) -> Result<()> {
        while self.in_flight_units != 0 {
            self.driver.wait()?;
            self.poll_completions()?;
        }
        Ok(())
    }
}

impl<D: IoDriver> Drop for SubmissionEngine<D> {
    fn drop(&mut self) {
        // Buffers parked in the slot table must outlive the kernel's use of them.
        while self.in_flight_units != 0 {
            if let Err(e) = self.driver.wait() {
                error!(error = %e, in_flight = self.in_flight_units, "cannot drain on shutdown, leaking buffers");
                for op in self.slots.iter_mut().filter_map(Option::take) {
                    std::mem::forget(op.buffer);
                }
                return;
            }
            if let Err(e) = self.poll_completions() {
                error!(error = %e, "in-flight operation failed during shutdown");
            }
        }
    }
}
