// File: error.rs
//
// The purpose of this file is to define the error taxonomy shared by the
// ring, storage, and channel layers.

use std::fmt;

/// Errors surfaced by the ring and storage engine. Mirrors the taxonomy
/// described for the protocol: transient transport failures, timeouts,
/// routing inconsistencies, rejected invariant-violating updates,
/// malformed messages, and shutdown.
#[derive(Debug, Clone)]
pub enum ChordError {
    /// connect/send/receive failed; treated as a missed maintenance cycle.
    Transport(String),
    /// A synchronous request exceeded its budget.
    Timeout,
    /// Both the original hop and one forwarding hop failed to find the
    /// responsible node.
    NoResponsible,
    /// UPDATE_SUCCESSOR or UPDATE_PREDECESSOR named this node itself.
    InvariantViolation(String),
    /// A message was missing required fields or carried an unknown type.
    Malformed(String),
    /// The node has left the ring; pending operations fail fast.
    ShutDown,
}

impl fmt::Display for ChordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChordError::Transport(msg) => write!(f, "transport error: {}", msg),
            ChordError::Timeout => write!(f, "request timed out"),
            ChordError::NoResponsible => write!(f, "no responsible node found after forwarding"),
            ChordError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
            ChordError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            ChordError::ShutDown => write!(f, "node is shutting down"),
        }
    }
}

impl std::error::Error for ChordError {}

pub type Result<T> = std::result::Result<T, ChordError>;
