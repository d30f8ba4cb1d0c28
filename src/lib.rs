//! Dataflow graph execution engine.
//!
//! Given an immutable graph of named operations and variables, a [`Session`]
//! discovers the minimal subgraph needed for a set of requested outputs,
//! executes it in dependency order (including nested loops and conditionals
//! expressed through control-flow primitives), and releases intermediate
//! tensor buffers as soon as no remaining consumer can read them.

pub mod logging;

mod deps;
mod dispatch;
mod error;
mod frame;
mod graph;
mod session;
mod tensor;

pub use deps::DependencyTracker;
pub use dispatch::{OpDispatcher, ShapeDesc};
pub use error::ExecError;
pub use frame::{FrameIter, VarId, MAIN_FRAME};
pub use graph::{Graph, GraphBuilder, OpKind, Operation, VarKind, Variable};
pub use session::{MemoryStats, Session};
pub use tensor::{DType, Tensor, TensorData};
