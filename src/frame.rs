//! Frame and iteration addressing.
//!
//! Control-flow primitives execute variables inside *frames*: one activation
//! of a loop body is a frame, repeated activations are distinguished by an
//! iteration counter, and nesting is captured by a parent link. A `FrameIter`
//! is a pure value type: the same logical frame/iteration is reconstructed
//! repeatedly during traversal, so equality and hashing are structural.

use serde::{Deserialize, Serialize};

/// Name of the implicit root frame every execution starts in.
pub const MAIN_FRAME: &str = "main";

/// One frame activation at a specific iteration, with its enclosing frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameIter {
    pub frame: String,
    pub iteration: u64,
    pub parent: Option<Box<FrameIter>>,
}

impl FrameIter {
    /// The root frame: `main`, iteration 0, no parent.
    pub fn root() -> Self {
        Self {
            frame: MAIN_FRAME.to_string(),
            iteration: 0,
            parent: None,
        }
    }

    /// Same frame at a different iteration.
    pub fn with_iteration(&self, iteration: u64) -> Self {
        Self {
            frame: self.frame.clone(),
            iteration,
            parent: self.parent.clone(),
        }
    }

    /// Same frame, iteration incremented by one.
    pub fn next_iteration(&self) -> Self {
        self.with_iteration(self.iteration + 1)
    }

    /// A child frame entered from this one, starting at iteration 0.
    pub fn enter(&self, frame: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            iteration: 0,
            parent: Some(Box::new(self.clone())),
        }
    }

    /// The enclosing frame, if any.
    pub fn parent(&self) -> Option<&FrameIter> {
        self.parent.as_deref()
    }

    /// This frame chain with every iteration counter reset to 0.
    ///
    /// Used when resolving values forwarded by constant Enter ops, which are
    /// bound once at iteration 0 of every activation level.
    pub fn zeroed(&self) -> Self {
        Self {
            frame: self.frame.clone(),
            iteration: 0,
            parent: self.parent.as_ref().map(|p| Box::new(p.zeroed())),
        }
    }
}

impl std::fmt::Display for FrameIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}/{}@{}", parent, self.frame, self.iteration),
            None => write!(f, "{}@{}", self.frame, self.iteration),
        }
    }
}

/// Unique key for one bound instance of a variable's value.
///
/// At most one live tensor buffer is bound to a given `VarId` at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId {
    pub name: String,
    pub frame_iter: FrameIter,
}

impl VarId {
    pub fn new(name: impl Into<String>, frame_iter: FrameIter) -> Self {
        Self {
            name: name.into(),
            frame_iter,
        }
    }

    /// A variable instance in the root frame.
    pub fn in_root(name: impl Into<String>) -> Self {
        Self::new(name, FrameIter::root())
    }
}

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.frame_iter)
    }
}
