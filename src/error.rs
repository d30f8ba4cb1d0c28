//! Error taxonomy for graph execution.
//!
//! All variants abort the current `run` call; none are retried internally.
//! Errors surface through `anyhow::Error`, so callers that need to match on
//! the taxonomy can use `err.downcast_ref::<ExecError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The scheduler could not bind a required variable instance.
    #[error("missing value: no execution path binds {0}")]
    MissingValue(String),

    /// Frame arithmetic for Enter/Exit/NextIteration was violated.
    #[error("frame iteration error: {0}")]
    FrameIterationError(String),

    /// A predicate or index operand has the wrong element type or rank.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A placeholder required by the subgraph was not bound by the caller.
    #[error("unbound placeholder: {0}")]
    UnboundPlaceholder(String),

    /// Output shape calculation failed or disagreed with declared outputs.
    #[error("allocation error: {0}")]
    AllocationError(String),

    /// An alias outlived its source's release. Always a programming defect.
    #[error("alias lifetime violation: {0}")]
    AliasLifetimeViolation(String),
}
