//! Error types surfaced across the planner, runtime, and peer layers.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PlasmaError>;

/// Structured errors emitted by the query engine.
///
/// Only [`PlasmaError::PlanInvalid`] is fatal to a query; every other kind
/// is reported as an event on the result stream or closes a single remote
/// branch, per the engine's drop-and-continue policy.
#[derive(Debug, Error)]
pub enum PlasmaError {
    /// The plan is structurally unusable: missing root, broken dep,
    /// unknown operator, or an unbound parameter.
    #[error("invalid plan: {0}")]
    PlanInvalid(String),
    /// A node id was not found where one is required.
    #[error("node {0} not found")]
    GraphMissing(String),
    /// An expression evaluated against a wrong-typed property.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A remote peer was unreachable or a connection dropped mid-stream.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Wall-clock or per-channel timeout expired.
    #[error("timed out: {0}")]
    Timeout(String),
    /// A recursive plan exhausted its hop budget.
    #[error("hops-to-live exhausted")]
    HtlExhausted,
    /// Structured error returned by a remote peer.
    #[error("remote error: {0}")]
    Remote(String),
    /// I/O error from the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Wire payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlasmaError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            PlasmaError::PlanInvalid(_) => "plan-invalid",
            PlasmaError::GraphMissing(_) => "graph-missing",
            PlasmaError::TypeMismatch(_) => "type-mismatch",
            PlasmaError::Transport(_) => "transport",
            PlasmaError::Timeout(_) => "timeout",
            PlasmaError::HtlExhausted => "htl-reached",
            PlasmaError::Remote(_) => "remote",
            PlasmaError::Io(_) => "io",
            PlasmaError::Serialization(_) => "serialization",
        }
    }

    /// Whether the error aborts the whole query rather than a single tuple
    /// or branch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlasmaError::PlanInvalid(_))
    }
}
