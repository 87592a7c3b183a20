//! Unbuffered block storage over kernel async I/O (Linux only).
//!
//! Feature-gated: `persistence`.
//!
//! - [`AlignedBuffer`]: page-aligned owned region, the unit of I/O.
//! - [`SubmissionEngine`]: bounded in-flight submissions, one-shot callbacks.
//! - [`BlockWriter`]: strictly sequential block-sized stores past a reserved prefix.

mod affinity;
mod buffer;
mod driver;
mod engine;
mod error;
pub mod file;
mod writer;

pub use affinity::{AffinityPolicy, NoAffinity, SchedAffinity};
pub use buffer::{AlignedBuffer, PAGE_SIZE};
pub use driver::{IoDriver, IoRequest, OpKind, RawCompletion, SyncDriver, UringDriver};
pub use engine::{
    CompletionCallback, EngineConfig, IoCompletion, SubmissionEngine, MAX_CONCURRENT_OPS,
};
pub use error::{Result, StorageError};
pub use file::OpenMode;
pub use writer::{BlockWriter, WriterConfig};
