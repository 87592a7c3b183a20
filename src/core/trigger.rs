//! Correlation keys and the two inputs of the join: decisions and fragments.

use core::fmt;

pub type RunNumber = u32;
pub type TriggerNumber = u64;

/// Detector clock ticks. Only differences are meaningful.
pub type Timestamp = u64;

/// Composite correlation key. Ordered by run, then trigger number.
///
/// The derived `Ord` follows field declaration order, so `run_number` must stay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TriggerId {
    pub run_number: RunNumber,
    pub trigger_number: TriggerNumber,
}

impl TriggerId {
    #[inline(always)]
    pub const fn new(run_number: RunNumber, trigger_number: TriggerNumber) -> Self {
        Self {
            run_number,
            trigger_number,
        }
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trigger_number, self.run_number)
    }
}

impl From<&TriggerDecision> for TriggerId {
    #[inline(always)]
    fn from(decision: &TriggerDecision) -> Self {
        decision.trigger_id()
    }
}

impl From<&Fragment> for TriggerId {
    #[inline(always)]
    fn from(fragment: &Fragment) -> Self {
        fragment.trigger_id()
    }
}

/// Upstream source tag: which link/detector element produced a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId {
    pub system: u16,
    pub element: u32,
}

impl SourceId {
    #[inline(always)]
    pub const fn new(system: u16, element: u32) -> Self {
        Self { system, element }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.element)
    }
}

/// One expected component of a decision, with the readout window asked of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentRequest {
    pub source: SourceId,
    pub window_begin: Timestamp,
    pub window_end: Timestamp,
}

impl ComponentRequest {
    pub const fn new(source: SourceId, window_begin: Timestamp, window_end: Timestamp) -> Self {
        Self {
            source,
            window_begin,
            window_end,
        }
    }
}

/// Names which sources must deliver a fragment for one event. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    run_number: RunNumber,
    trigger_number: TriggerNumber,
    trigger_timestamp: Timestamp,
    components: Vec<ComponentRequest>,
}

impl TriggerDecision {
    pub fn new(
        run_number: RunNumber,
        trigger_number: TriggerNumber,
        trigger_timestamp: Timestamp,
        components: Vec<ComponentRequest>,
    ) -> Self {
        Self {
            run_number,
            trigger_number,
            trigger_timestamp,
            components,
        }
    }

    #[inline(always)]
    pub fn trigger_id(&self) -> TriggerId {
        TriggerId::new(self.run_number, self.trigger_number)
    }

    #[inline(always)]
    pub fn run_number(&self) -> RunNumber {
        self.run_number
    }

    #[inline(always)]
    pub fn trigger_number(&self) -> TriggerNumber {
        self.trigger_number
    }

    #[inline(always)]
    pub fn trigger_timestamp(&self) -> Timestamp {
        self.trigger_timestamp
    }

    pub fn components(&self) -> &[ComponentRequest] {
        &self.components
    }

    /// Number of fragments that completes this decision.
    #[inline(always)]
    pub fn expected_component_count(&self) -> usize {
        self.components.len()
    }
}

/// One slice of detector data. Owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    run_number: RunNumber,
    trigger_number: TriggerNumber,
    source: SourceId,
    timestamp: Timestamp,
    payload: Vec<u8>,
}

impl Fragment {
    pub fn new(
        run_number: RunNumber,
        trigger_number: TriggerNumber,
        source: SourceId,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            run_number,
            trigger_number,
            source,
            timestamp,
            payload,
        }
    }

    #[inline(always)]
    pub fn trigger_id(&self) -> TriggerId {
        TriggerId::new(self.run_number, self.trigger_number)
    }

    #[inline(always)]
    pub fn run_number(&self) -> RunNumber {
        self.run_number
    }

    #[inline(always)]
    pub fn trigger_number(&self) -> TriggerNumber {
        self.trigger_number
    }

    #[inline(always)]
    pub fn source(&self) -> SourceId {
        self.source
    }

    #[inline(always)]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Payload size in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
