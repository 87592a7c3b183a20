//! Storage faults. Every variant is fatal for the operation that raised it.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use thiserror::Error;

use super::driver::OpKind;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Offset, length or buffer address not a multiple of the device alignment.
    #[error("{what} {value:#x} is not aligned to {alignment} bytes")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: usize,
    },

    /// Request length larger than the buffer handed over with it.
    #[error("request of {size} bytes exceeds buffer capacity of {capacity} bytes")]
    BufferTooSmall { size: usize, capacity: usize },

    /// Requests must be non-empty and fit a single kernel request.
    #[error("invalid request size {0}")]
    InvalidSize(usize),

    /// Engine setting that cannot describe a usable device.
    #[error("invalid engine setting {field} = {value}")]
    InvalidSetting { field: &'static str, value: usize },

    #[error("invalid file descriptor {0}")]
    InvalidDescriptor(RawFd),

    /// A single request needs more capacity units than the engine has.
    #[error("request needs {units} capacity units, engine capacity is {capacity}")]
    ExceedsCapacity { units: usize, capacity: usize },

    /// `store` payload larger than the fixed block.
    #[error("payload of {size} bytes exceeds block size of {block_size} bytes")]
    ExceedsBlock { size: usize, block_size: usize },

    #[error("aligned allocation of {size} bytes at alignment {alignment} failed")]
    Alloc { size: usize, alignment: usize },

    #[error("failed to set up async I/O context: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to open '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel refused the request (resource exhaustion, bad context, ...).
    #[error("{kind} submission at offset {offset} failed: {source}")]
    Submit {
        kind: OpKind,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// The operation completed with an error code.
    #[error("{kind} at offset {offset} failed: {source}")]
    Completion {
        kind: OpKind,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Completed byte count differs from the requested one.
    #[error("{kind} at offset {offset} transferred {completed} of {requested} bytes")]
    ShortTransfer {
        kind: OpKind,
        offset: u64,
        requested: usize,
        completed: usize,
    },

    /// Completion carries a tag no in-flight operation owns.
    #[error("completion for unknown operation tag {0}")]
    UnknownCompletion(u64),

    /// Completion of our own buffer never came back through its callback.
    #[error("staging buffer was not returned by its completion")]
    BufferLost,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Target reports no size; a raw device is missing or a file was not pre-allocated.
    #[error("'{}' has zero size, pre-allocate the target", path.display())]
    EmptyTarget { path: PathBuf },

    /// A previous fatal fault stopped this writer.
    #[error("writer halted after a fatal storage fault")]
    Halted,
}

impl StorageError {
    /// Rejected before anything reached the kernel; writer state is untouched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            StorageError::Misaligned { .. }
                | StorageError::BufferTooSmall { .. }
                | StorageError::InvalidSize(_)
                | StorageError::InvalidDescriptor(_)
                | StorageError::InvalidSetting { .. }
                | StorageError::ExceedsCapacity { .. }
                | StorageError::ExceedsBlock { .. }
        )
    }
}
