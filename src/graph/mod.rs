//! Immutable graph definition: variables, operations, reverse indices.
//!
//! Graphs are assembled through [`GraphBuilder`] and frozen by `build()`,
//! which validates arities, wires the variable -> consuming-ops index, and
//! runs the frame-invariance pre-pass. A frozen `Graph` is read-only and may
//! be shared across concurrent sessions.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, Tensor};

/// Role of a variable in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    /// Bound by the caller per run.
    Placeholder,
    /// Fixed value baked into the graph definition.
    Constant,
    /// Trainable value baked into the graph definition.
    Parameter,
    /// Produced by exactly one operation during execution.
    Computed,
}

/// A named variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub kind: VarKind,
    /// Declared element type; `None` for computed variables whose type is
    /// inferred by the dispatcher at execution time.
    pub dtype: Option<DType>,
    /// Optional static shape.
    pub shape: Option<Vec<usize>>,
    /// Bound value for constants and parameters.
    pub value: Option<Tensor>,
}

/// Control-flow tag of an operation.
///
/// A closed enum resolved at graph-build time; execution never inspects
/// runtime op metadata beyond this tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Ordinary computation dispatched to the external kernel provider.
    Plain,
    /// Forward the input unchanged in the same frame/iteration (zero-copy).
    Identity,
    /// Forward the input into `frame` at iteration 0 (zero-copy).
    /// `is_constant` marks values that stay fixed for every iteration of
    /// every activation, enabling cross-frame constant resolution.
    Enter { frame: String, is_constant: bool },
    /// Forward the input to the parent frame at its current iteration.
    Exit,
    /// Forward the input to the same frame, iteration + 1 (zero-copy).
    NextIteration,
    /// Validate and forward a scalar boolean.
    LoopCond,
    /// Route the value input to one of two outputs by a boolean predicate.
    Switch,
    /// Forward whichever of the two inputs is bound (loop-carried cycles).
    Merge,
    /// Create a per-frame growable tensor list; output is the list handle.
    ListNew,
    /// Read `list[index]`.
    ListRead,
    /// Copy a value into `list[index]`, growing the list as needed.
    ListWrite,
    /// Current length of the list as a scalar.
    ListSize,
    /// Stack `list[indices]` along a new leading axis (`[-1]` = all).
    ListGather,
    /// Scatter leading-axis slices into `list[indices]` (`[-1]` = all).
    ListScatter,
    /// Split leading-axis ranges of a value into consecutive list slots.
    ListSplit,
    /// Concatenate all list entries along the leading axis.
    ListConcat,
}

impl OpKind {
    /// Expected (inputs, outputs) arity, `None` when unconstrained.
    fn arity(&self) -> Option<(usize, usize)> {
        match self {
            OpKind::Plain => None,
            OpKind::Identity
            | OpKind::Enter { .. }
            | OpKind::Exit
            | OpKind::NextIteration
            | OpKind::LoopCond => Some((1, 1)),
            OpKind::Switch => Some((2, 2)),
            OpKind::Merge => Some((2, 1)),
            OpKind::ListNew => Some((0, 1)),
            OpKind::ListRead => Some((2, 1)),
            OpKind::ListWrite => Some((3, 1)),
            OpKind::ListSize => Some((1, 1)),
            OpKind::ListGather => Some((2, 1)),
            OpKind::ListScatter => Some((3, 1)),
            OpKind::ListSplit => Some((3, 1)),
            OpKind::ListConcat => Some((1, 1)),
        }
    }

    pub fn is_control_flow(&self) -> bool {
        !matches!(self, OpKind::Plain)
    }
}

/// A named operation with ordered inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Frozen graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    vars: HashMap<String, Variable>,
    ops: HashMap<String, Operation>,
    var_order: Vec<String>,
    op_order: Vec<String>,
    /// Producing op per computed variable.
    producer: HashMap<String, String>,
    /// Reverse index: variable -> operations that consume it.
    consumers: HashMap<String, Vec<String>>,
    /// Variables whose value is the same in every frame/iteration.
    frame_invariant: HashSet<String>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn var(&self, name: &str) -> Result<&Variable> {
        self.vars
            .get(name)
            .ok_or_else(|| anyhow!("unknown variable: {}", name))
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn op(&self, name: &str) -> Result<&Operation> {
        self.ops
            .get(name)
            .ok_or_else(|| anyhow!("unknown operation: {}", name))
    }

    /// The operation producing a computed variable, if any.
    pub fn producer(&self, var: &str) -> Option<&Operation> {
        self.producer.get(var).and_then(|op| self.ops.get(op))
    }

    /// Operations that consume a variable, in declaration order.
    pub fn consumers(&self, var: &str) -> &[String] {
        self.consumers.get(var).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if the variable holds the same value in every frame/iteration
    /// (placeholders, constants, parameters, constant-Enter outputs).
    pub fn is_frame_invariant(&self, var: &str) -> bool {
        self.frame_invariant.contains(var)
    }

    /// Variable names in declaration order.
    pub fn var_names(&self) -> &[String] {
        &self.var_order
    }

    /// Operation names in declaration order.
    pub fn op_names(&self) -> &[String] {
        &self.op_order
    }
}

/// Incremental graph assembly with build-time validation.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    vars: HashMap<String, Variable>,
    ops: HashMap<String, Operation>,
    var_order: Vec<String>,
    op_order: Vec<String>,
}

impl GraphBuilder {
    /// Declare a placeholder bound by the caller at run time.
    pub fn placeholder(mut self, name: impl Into<String>, dtype: DType) -> Self {
        let name = name.into();
        self.push_var(Variable {
            name: name.clone(),
            kind: VarKind::Placeholder,
            dtype: Some(dtype),
            shape: None,
            value: None,
        });
        self
    }

    /// Declare a constant with its baked-in value.
    pub fn constant(mut self, name: impl Into<String>, value: Tensor) -> Self {
        let name = name.into();
        self.push_var(Variable {
            name: name.clone(),
            kind: VarKind::Constant,
            dtype: Some(value.dtype()),
            shape: Some(value.shape().to_vec()),
            value: Some(value),
        });
        self
    }

    /// Declare a parameter with its current value.
    pub fn parameter(mut self, name: impl Into<String>, value: Tensor) -> Self {
        let name = name.into();
        self.push_var(Variable {
            name: name.clone(),
            kind: VarKind::Parameter,
            dtype: Some(value.dtype()),
            shape: Some(value.shape().to_vec()),
            value: Some(value),
        });
        self
    }

    /// Declare an operation. Output variables are registered as computed.
    pub fn op(
        mut self,
        name: impl Into<String>,
        kind: OpKind,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Self {
        let name = name.into();
        for out in outputs {
            self.push_var(Variable {
                name: (*out).to_string(),
                kind: VarKind::Computed,
                dtype: None,
                shape: None,
                value: None,
            });
        }
        let op = Operation {
            name: name.clone(),
            kind,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        };
        if self.ops.insert(name.clone(), op).is_none() {
            self.op_order.push(name);
        }
        self
    }

    fn push_var(&mut self, var: Variable) {
        if !self.vars.contains_key(&var.name) {
            self.var_order.push(var.name.clone());
            self.vars.insert(var.name.clone(), var);
        }
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph> {
        let mut producer: HashMap<String, String> = HashMap::new();
        let mut consumers: HashMap<String, Vec<String>> = HashMap::new();

        for op_name in &self.op_order {
            let op = &self.ops[op_name];
            if let Some((n_in, n_out)) = op.kind.arity() {
                if op.inputs.len() != n_in || op.outputs.len() != n_out {
                    return Err(anyhow!(
                        "op {} ({:?}) expects {} inputs / {} outputs, got {} / {}",
                        op.name,
                        op.kind,
                        n_in,
                        n_out,
                        op.inputs.len(),
                        op.outputs.len()
                    ));
                }
            }
            if let OpKind::Enter { frame, .. } = &op.kind {
                if frame.is_empty() {
                    return Err(anyhow!("op {}: Enter frame name must not be empty", op.name));
                }
            }
            for input in &op.inputs {
                if !self.vars.contains_key(input) {
                    return Err(anyhow!("op {} reads undeclared variable {}", op.name, input));
                }
                consumers
                    .entry(input.clone())
                    .or_default()
                    .push(op.name.clone());
            }
            for output in &op.outputs {
                let var = &self.vars[output];
                if var.kind != VarKind::Computed {
                    return Err(anyhow!(
                        "op {} writes {} which is declared as {:?}",
                        op.name,
                        output,
                        var.kind
                    ));
                }
                if let Some(prev) = producer.insert(output.clone(), op.name.clone()) {
                    return Err(anyhow!(
                        "variable {} has two producers: {} and {}",
                        output,
                        prev,
                        op.name
                    ));
                }
            }
        }

        let frame_invariant = compute_frame_invariant(&self.vars, &self.ops);

        Ok(Graph {
            vars: self.vars,
            ops: self.ops,
            var_order: self.var_order,
            op_order: self.op_order,
            producer,
            consumers,
            frame_invariant,
        })
    }
}

/// Fixpoint pass marking variables whose value never changes across frames:
/// placeholders, constants, parameters, and chains of constant Enter ops
/// rooted at such values.
fn compute_frame_invariant(
    vars: &HashMap<String, Variable>,
    ops: &HashMap<String, Operation>,
) -> HashSet<String> {
    let mut invariant: HashSet<String> = vars
        .values()
        .filter(|v| v.kind != VarKind::Computed)
        .map(|v| v.name.clone())
        .collect();

    loop {
        let mut changed = false;
        for op in ops.values() {
            if let OpKind::Enter {
                is_constant: true, ..
            } = op.kind
            {
                let input_invariant = op.inputs.iter().all(|i| invariant.contains(i));
                if input_invariant {
                    for out in &op.outputs {
                        if invariant.insert(out.clone()) {
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    invariant
}
