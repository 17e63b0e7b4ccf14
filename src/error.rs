//! Error types for slotq

use crate::template::ElementType;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for slotq operations
pub type Result<T> = std::result::Result<T, SlotqError>;

/// Which part of a `put` call failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Image,
    Label,
    Metadata,
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Image => f.write_str("image"),
            Payload::Label => f.write_str("label"),
            Payload::Metadata => f.write_str("metadata"),
        }
    }
}

/// How a payload differs from what the queue stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    ElementType { expected: ElementType, got: ElementType },
    Shape { expected: Vec<usize>, got: Vec<usize> },
    ByteLength { expected: usize, got: usize },
    TooLong { max: usize, got: usize },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::ElementType { expected, got } => {
                write!(f, "elements need to be of type {expected} but are {got}")
            }
            Mismatch::Shape { expected, got } => {
                write!(f, "shape needs to be {expected:?} but is {got:?}")
            }
            Mismatch::ByteLength { expected, got } => {
                write!(f, "byte count needs to be {expected} but is {got}")
            }
            Mismatch::TooLong { max, got } => {
                write!(f, "length may be at most {max} bytes but is {got}")
            }
        }
    }
}

/// Errors that can occur in slotq operations
#[derive(Debug, Error)]
pub enum SlotqError {
    /// A payload handed to `put` does not match the queue's templates.
    /// Raised before any slot is touched.
    #[error("invalid {payload}: {mismatch}")]
    Validation { payload: Payload, mismatch: Mismatch },

    /// No free slot became available within the wait policy
    #[error("queue is full")]
    Full,

    /// No published item became available within the wait policy
    #[error("queue is empty")]
    Empty,

    /// Invalid capacity or template at construction
    #[error("invalid queue configuration: {0}")]
    Configuration(String),

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Another queue already lives under this name
    #[error("Shared memory '{name}' already exists")]
    AlreadyExists { name: String },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Invalid queue magic number
    #[error("Invalid queue magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Region was laid out by an incompatible version or is truncated
    #[error("Incompatible queue layout: {0}")]
    IncompatibleLayout(String),

    /// Namespace too long
    #[error("Namespace too long: max {max} chars, got {got}")]
    NamespaceTooLong { max: usize, got: usize },
}

impl SlotqError {
    pub fn is_full(&self) -> bool {
        matches!(self, SlotqError::Full)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SlotqError::Empty)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SlotqError::Validation { .. })
    }

    pub(crate) fn validation(payload: Payload, mismatch: Mismatch) -> Self {
        SlotqError::Validation { payload, mismatch }
    }
}
