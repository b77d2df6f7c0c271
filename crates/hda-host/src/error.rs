use std::time::Duration;

use thiserror::Error;

use crate::dma::EngineState;
use crate::verb::NodeId;

pub type Result<T> = std::result::Result<T, HdaError>;

/// Broad error classes used by callers to decide between aborting, retrying with another
/// resource, or reporting a bug.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    /// Sticky hardware fault (ring memory error, overrun, descriptor/FIFO error, verification).
    HardwareFault,
    /// A bounded poll did not observe the expected hardware condition.
    Timeout,
    /// No free engine, stream number or route matches the request.
    ResourceExhausted,
    /// The caller issued an operation in a state where it is not permitted.
    ProtocolMisuse,
    /// The codec reported a topology that cannot be decoded consistently.
    Topology,
    /// The requested format/route combination is not supported by the codec.
    Unsupported,
    /// Invalid configuration.
    Config,
    /// Failure reported by a platform collaborator (allocator, bus).
    Platform,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Resource {
    DmaEngine,
    StreamNumber,
    Route,
    Codec,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Resource::DmaEngine => "DMA engine",
            Resource::StreamNumber => "stream number",
            Resource::Route => "route",
            Resource::Codec => "codec",
        };
        f.write_str(name)
    }
}

/// Unified error type for the HDA bus core.
#[derive(Debug, Error)]
pub enum HdaError {
    #[error("CORB memory error is pending and must be acknowledged")]
    CorbMemoryError,

    #[error("RIRB overrun is pending and must be acknowledged")]
    RirbOverrun,

    #[error("descriptor error on DMA engine {engine}")]
    DescriptorError { engine: usize },

    #[error("FIFO error on DMA engine {engine}")]
    FifoError { engine: usize },

    #[error(
        "stream {stream} position drifted: expected {expected} got {actual} (tolerance {tolerance})"
    )]
    PositionDrift {
        stream: u8,
        expected: u32,
        actual: u32,
        tolerance: u32,
    },

    #[error("stream {stream} IOC mismatch at position {position}: {detail}")]
    IocMismatch {
        stream: u8,
        position: u64,
        detail: &'static str,
    },

    #[error("interrupt status inconsistent: INTSTS={intsts:#010x} expected={expected:#010x}")]
    InterruptInconsistency { intsts: u32, expected: u32 },

    #[error("timed out after {timeout:?} waiting for {op} ({detail})")]
    Timeout {
        op: &'static str,
        timeout: Duration,
        detail: String,
    },

    #[error("no free {0}")]
    ResourceExhausted(Resource),

    #[error("command rings are busy ({detail})")]
    ProtocolBusy { detail: String },

    #[error("immediate command issued while CORB/RIRB DMA is running")]
    ImmediateWhileRingsActive,

    #[error("ring must be stopped before {0}")]
    RingRunning(&'static str),

    #[error("ring base address is not programmed")]
    RingNotProgrammed,

    #[error("short push: {pushed} of {requested} verbs fit in the CORB")]
    ShortPush { requested: usize, pushed: usize },

    #[error("batch of {len} verbs exceeds CORB capacity {capacity}")]
    BatchTooLarge { len: usize, capacity: usize },

    #[error("expected {expected} responses, received {received}")]
    ResponseCountMismatch { expected: usize, received: usize },

    #[error("response from codec {received}, expected codec {expected}")]
    ResponseAddressMismatch { expected: u8, received: u8 },

    #[error("illegal DMA engine {engine} transition {from:?} -> {to:?}")]
    IllegalTransition {
        engine: usize,
        from: EngineState,
        to: EngineState,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("codec {codec} node {nid:#04x}: unknown function group type {kind:#04x}")]
    UnknownFunctionGroup { codec: u8, nid: NodeId, kind: u8 },

    #[error("codec {codec} node {nid:#04x}: unknown widget type {kind:#x}")]
    UnknownNodeType { codec: u8, nid: NodeId, kind: u8 },

    #[error(
        "codec {codec} node {nid:#04x}: connection list decoded {decoded} entries, declared {declared}"
    )]
    ConnectionListShort {
        codec: u8,
        nid: NodeId,
        declared: usize,
        decoded: usize,
    },

    #[error("codec {codec}: topology is not {expected}")]
    TopologyState { codec: u8, expected: &'static str },

    #[error("codec {codec} node {nid:#04x} not found")]
    NoSuchNode { codec: u8, nid: NodeId },

    #[error("no codec at address {0}")]
    NoSuchCodec(u8),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DMA allocation of {len} bytes failed: {reason}")]
    DmaAllocation { len: usize, reason: String },
}

impl HdaError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HdaError::CorbMemoryError
            | HdaError::RirbOverrun
            | HdaError::DescriptorError { .. }
            | HdaError::FifoError { .. }
            | HdaError::PositionDrift { .. }
            | HdaError::IocMismatch { .. }
            | HdaError::InterruptInconsistency { .. } => ErrorClass::HardwareFault,
            HdaError::Timeout { .. } => ErrorClass::Timeout,
            HdaError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            HdaError::ProtocolBusy { .. }
            | HdaError::ImmediateWhileRingsActive
            | HdaError::RingRunning(_)
            | HdaError::RingNotProgrammed
            | HdaError::ShortPush { .. }
            | HdaError::BatchTooLarge { .. }
            | HdaError::ResponseCountMismatch { .. }
            | HdaError::ResponseAddressMismatch { .. }
            | HdaError::IllegalTransition { .. }
            | HdaError::InvalidOperation(_) => ErrorClass::ProtocolMisuse,
            HdaError::UnknownFunctionGroup { .. }
            | HdaError::UnknownNodeType { .. }
            | HdaError::ConnectionListShort { .. }
            | HdaError::TopologyState { .. }
            | HdaError::NoSuchNode { .. }
            | HdaError::NoSuchCodec(_) => ErrorClass::Topology,
            HdaError::Unsupported(_) => ErrorClass::Unsupported,
            HdaError::InvalidConfig(_) => ErrorClass::Config,
            HdaError::DmaAllocation { .. } => ErrorClass::Platform,
        }
    }

    /// Whether this error must abort the current high-level operation.
    ///
    /// Resource exhaustion and unsupported combinations are ordinary negative results; callers
    /// are expected to try another engine or route.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.class(),
            ErrorClass::ResourceExhausted | ErrorClass::Unsupported
        )
    }

    /// Build a protocol-misuse error, logging it loudly since it indicates a caller bug.
    pub(crate) fn misuse(err: HdaError) -> HdaError {
        debug_assert_eq!(err.class(), ErrorClass::ProtocolMisuse);
        tracing::error!(error = %err, "HDA protocol misuse");
        err
    }
}

impl From<serde_json::Error> for HdaError {
    fn from(value: serde_json::Error) -> Self {
        HdaError::InvalidConfig(value.to_string())
    }
}
