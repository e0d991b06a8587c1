//! Error types for the nano-cnn-core library.
//!
//! Every fallible operation returns `NanoResult<T>`. Nothing in the library
//! panics: on a microcontroller a panic halts the device.
//!
//! Two levels:
//! - [`NanoError`]: what the caller sees (configuration faults at `init`,
//!   caller-contract violations, and node failures wrapped with the node's
//!   identity).
//! - [`Fault`]: what a single layer node reports from `validate`/`forward`.

use thiserror::Error;

use crate::tensor::{ArenaKind, Shape};

/// Fault raised by one layer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("node is not bound to an arena")]
    NotInitialized,
    #[error("shape mismatch: expected {expected}, found {actual}")]
    ShapeMismatch { expected: Shape, actual: Shape },
    #[error("buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall { required: usize, available: usize },
    #[error("buffer [{offset}, {end}) lies outside the arena")]
    BufferOutOfBounds { offset: usize, end: usize },
    #[error("buffers overlap at byte {offset}")]
    BufferOverlap { offset: usize },
    #[error("buffer at byte {offset} is not aligned for its element type")]
    Misaligned { offset: usize },
    #[error("missing {role} tensor")]
    MissingTensor { role: &'static str },
    #[error("tensor format not supported by this layer")]
    UnsupportedFormat,
    #[error("tensor lives in the {actual} arena")]
    WrongArena { actual: ArenaKind },
    #[error("invalid layer parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("non-finite value at output element {index}")]
    NonFinite { index: usize },
}

/// All error conditions surfaced by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NanoError {
    // -- configuration faults (init) --
    #[error("{arena} arena has no backing memory")]
    NullBase { arena: ArenaKind },
    #[error("{arena} arena too small: {required} bytes required, {available} available")]
    ArenaTooSmall {
        arena: ArenaKind,
        required: usize,
        available: usize,
    },
    #[error("{arena} arena base is not {align}-byte aligned")]
    Misaligned { arena: ArenaKind, align: usize },
    #[error("model signature mismatch: expected {expected:#010x}, got {actual:#010x}")]
    SignatureMismatch { expected: u32, actual: u32 },

    // -- execution faults (run_forward) --
    #[error("network is not initialized")]
    NotInitialized,
    #[error("network is faulted; call init again")]
    Faulted,
    #[error("no completed forward pass")]
    NoOutput,
    #[error("node {node} ({kind}) failed: {fault}")]
    Node {
        node: usize,
        kind: &'static str,
        fault: Fault,
    },

    // -- caller contract --
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidInputLength { expected: usize, actual: usize },

    // -- graph construction / table decoding --
    #[error("node {node} ({kind}) is invalid: {fault}")]
    InvalidNode {
        node: usize,
        kind: &'static str,
        fault: Fault,
    },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid layer parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("graph capacity exceeded: at most {limit} {what}")]
    CapacityExceeded { what: &'static str, limit: usize },
    #[error("invalid graph: {0}")]
    InvalidGraph(&'static str),
    #[error("invalid graph table: {0}")]
    InvalidTable(&'static str),
    #[error("buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall { required: usize, available: usize },
}

pub type NanoResult<T> = Result<T, NanoError>;
