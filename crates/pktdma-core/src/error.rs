//! Error types for the pktdma engine.

use thiserror::Error;

/// Engine errors
///
/// `Unavailable`, `Busy` and `NoHandler` are per-packet outcomes rather than
/// failures; see [`Error::is_outcome`].
#[derive(Debug, Error)]
pub enum Error {
    /// Allocation or DMA mapping failure
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Packet consumed, redirected or dropped by the filter
    #[error("packet unavailable")]
    Unavailable,

    /// Transient exhaustion on the zero-copy or redirect path
    #[error("resource busy")]
    Busy,

    /// Malformed packet or request
    #[error("invalid parameter: {0}")]
    Param(String),

    /// No consumer registered for this packet
    #[error("no handler")]
    NoHandler,

    /// Packet header rejected during transmit pre-processing
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// A zero-copy pool is already bound on this device
    #[error("zero-copy pool already bound to queue {queue}")]
    AlreadyBound {
        /// Queue holding the existing binding
        queue: u32,
    },

    /// Queue index outside the configured range
    #[error("queue {queue} out of range (limit {limit})")]
    QueueOutOfRange {
        /// Requested queue
        queue: u32,
        /// Number of configured queues
        limit: u32,
    },

    /// Required buffer mode is not enabled
    #[error("buffer mode not enabled: {0}")]
    ModeNotEnabled(String),

    /// Referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists
    #[error("already exists: {0}")]
    Exists(String),

    /// Buffer released twice
    #[error("double free of {0}")]
    DoubleFree(String),

    /// Background worker could not be started
    #[error("worker error: {0}")]
    Worker(String),
}

impl Error {
    /// Whether the caller should back off and retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Memory(_) | Self::Busy)
    }

    /// Whether this is a terminal per-packet outcome rather than a failure
    pub fn is_outcome(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Busy | Self::NoHandler)
    }

    /// Whether this is a programming error that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AlreadyBound { .. } | Self::QueueOutOfRange { .. } | Self::DoubleFree(_)
        )
    }
}

/// Memory errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Buffer or page allocation failed
    #[error("allocation of {size} bytes failed")]
    Alloc {
        /// Requested size
        size: usize,
    },

    /// Platform refused to map a buffer for DMA
    #[error("DMA mapping of {len} bytes failed")]
    Mapping {
        /// Requested mapping length
        len: usize,
    },

    /// Zero-copy pool has no free frame
    #[error("zero-copy pool empty")]
    PoolEmpty,
}

/// Packet header errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Buffer too short to hold the header
    #[error("buffer too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Header length fields disagree with the buffer length
    #[error("packet length {actual} does not match header length {expected}")]
    LengthMismatch {
        /// Length implied by the header
        expected: usize,
        /// Length of the buffer
        actual: usize,
    },

    /// Signature does not match the configured one
    #[error("invalid packet signature 0x{actual:04x} (expected 0x{expected:04x})")]
    Signature {
        /// Configured signature
        expected: u16,
        /// Signature found in the packet
        actual: u16,
    },

    /// Not enough room behind the packet to grow it
    #[error("no tailroom: need {needed} bytes, have {available}")]
    NoTailroom {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Interface requires metadata but has none configured
    #[error("no metadata configured")]
    NoMetadata,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
