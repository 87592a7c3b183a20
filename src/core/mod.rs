//! The guts. Trigger identity, correlation, record assembly, storage.

pub mod correlator;
pub mod metrics;
pub mod record;
pub mod trigger;

#[cfg(all(feature = "persistence", target_os = "linux"))]
pub mod persistence;

pub use correlator::{Correlator, IngestError, PendingEntry};
pub use metrics::{CorrelatorMetrics, CorrelatorSnapshot, StorageMetrics, StorageSnapshot};
pub use record::{RecordAssembler, TriggerRecord, TriggerRecordHeader, RECORD_HEADER_SIZE};
pub use trigger::{
    ComponentRequest, Fragment, RunNumber, SourceId, Timestamp, TriggerDecision, TriggerId,
    TriggerNumber,
};
