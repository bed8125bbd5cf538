use rcdb_common::RecordType;
use thiserror::Error;

/// Errors surfaced by the journal.
///
/// Capture paths absorb most of these into counters; they reach a caller only
/// through the drain and dump operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The arena or a ring buffer has no room for the record
    #[error("no space for {requested} bytes ({remaining} bytes remaining)")]
    Full { requested: usize, remaining: usize },

    /// The gate or a reentrancy guard is held elsewhere
    #[error("journal is busy")]
    Busy,

    /// The requested id is outside the retrievable window
    #[error("record {id} is not available")]
    NotFound { id: u32 },

    /// No ring buffer has been registered for the record type
    #[error("no ring buffer registered for {record_type:?}")]
    NoRingBuffer { record_type: RecordType },

    /// Growing a ring buffer would exceed its per-owner cap
    #[error("ring buffer for {record_type:?} cannot grow past {limit} bytes")]
    GrowLimit {
        record_type: RecordType,
        limit: usize,
    },

    /// Zero-sized requests, record types that cannot be stored, and similar
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The record exists but the owner/process filter rejected it
    #[error("record rejected by the owner/process filter")]
    InsufficientPermissions,

    /// Another device dump has not finished yet
    #[error("a device dump is already in progress")]
    DumpInProgress,

    /// Bytes in a slot do not match the layout of the requested record
    #[error("record layout mismatch for {record_type:?}")]
    Layout { record_type: RecordType },

    /// The dump producer failed
    #[error("dump producer error: {0}")]
    Producer(#[from] ProduceError),

    /// The record encoder failed
    #[error("record encoder error: {0}")]
    Encoder(Box<dyn std::error::Error + Send + Sync>),
}

/// A specialized Result type for journal operations
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors reported by a [`VolatileStore`](crate::collab::VolatileStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The platform has no volatile store
    #[error("volatile store is not supported on this platform")]
    NotSupported,

    /// A value exists but has the wrong size for its key
    #[error("value for {key} has unexpected size {len}")]
    BadSize { key: String, len: usize },

    /// Value is not valid UTF-8 where a string was expected
    #[error("value for {key} is not valid UTF-8")]
    InvalidUtf8 { key: String },

    #[error("volatile store backend error: {0}")]
    Backend(String),
}

/// Errors reported by a [`DumpProducer`](crate::collab::DumpProducer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProduceError {
    /// The dump cannot be allocated from the current context; retry later
    #[error("dump allocation is not possible in this context")]
    WouldBlock,

    #[error("dump collection failed: {0}")]
    Failed(String),
}
