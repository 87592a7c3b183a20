//! TriggerRecord: decision header + collected fragments, in arrival order.
//! Header layout on disk: [magic:4][run:4][trigger:8][timestamp:8][expected:4][count:4]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::correlator::PendingEntry;
use super::trigger::{Fragment, RunNumber, Timestamp, TriggerId, TriggerNumber};

pub const RECORD_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TriggerRecordHeader {
    pub magic: u32,
    pub run_number: RunNumber,
    pub trigger_number: TriggerNumber,
    pub trigger_timestamp: Timestamp,
    pub expected_components: u32,
    pub fragment_count: u32,
}

const _: () = {
    assert!(core::mem::size_of::<TriggerRecordHeader>() == RECORD_HEADER_SIZE);
};

impl TriggerRecordHeader {
    pub const MAGIC: u32 = 0x5452_4844; // "TRHD"

    #[inline(always)]
    pub fn trigger_id(&self) -> TriggerId {
        TriggerId::new(self.run_number, self.trigger_number)
    }

    /// Parse a header from the front of a block. `None` on short input or bad magic.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (header, _) = Self::read_from_prefix(bytes).ok()?;
        if header.magic != Self::MAGIC {
            return None;
        }
        Some(header)
    }
}

/// A fully assembled event. Produced once per completed id, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRecord {
    header: TriggerRecordHeader,
    fragments: Vec<Fragment>,
}

impl TriggerRecord {
    #[inline(always)]
    pub fn header(&self) -> &TriggerRecordHeader {
        &self.header
    }

    #[inline(always)]
    pub fn trigger_id(&self) -> TriggerId {
        self.header.trigger_id()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Sum of fragment payload sizes.
    pub fn payload_bytes(&self) -> usize {
        self.fragments.iter().map(Fragment::size).sum()
    }

    pub fn into_parts(self) -> (TriggerRecordHeader, Vec<Fragment>) {
        (self.header, self.fragments)
    }
}

/// Packages a completed entry into a record.
pub struct RecordAssembler;

impl RecordAssembler {
    /// Consumes the entry: header fields are copied from its decision and the
    /// fragment sequence moves into the record unchanged.
    pub fn assemble(entry: PendingEntry) -> TriggerRecord {
        let (decision, fragments) = entry.into_parts();
        let header = TriggerRecordHeader {
            magic: TriggerRecordHeader::MAGIC,
            run_number: decision.run_number(),
            trigger_number: decision.trigger_number(),
            trigger_timestamp: decision.trigger_timestamp(),
            expected_components: decision.expected_component_count() as u32,
            fragment_count: fragments.len() as u32,
        };
        TriggerRecord { header, fragments }
    }
}
