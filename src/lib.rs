#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod core;

#[cfg(all(feature = "persistence", target_os = "linux"))]
pub mod pipeline;

/// Prelude for convenient imports of primary API types.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::core::{
        ComponentRequest, Correlator, Fragment, IngestError, PendingEntry, RecordAssembler,
        SourceId, TriggerDecision, TriggerId, TriggerRecord, TriggerRecordHeader,
    };

    #[cfg(all(feature = "persistence", target_os = "linux"))]
    pub use crate::core::persistence::{
        AlignedBuffer, BlockWriter, EngineConfig, StorageError, SubmissionEngine, WriterConfig,
    };
}

// Re-export primary types at crate root for convenience.
pub use crate::config::{Config, ConfigError};
pub use crate::core::{
    Correlator, Fragment, IngestError, RecordAssembler, TriggerDecision, TriggerId,
    TriggerRecord,
};
