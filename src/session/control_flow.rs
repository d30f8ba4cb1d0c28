//! Control-flow operation semantics.
//!
//! Enter/Exit/NextIteration/Switch/Merge forward values across frame and
//! iteration boundaries by rebinding the same shared tensor handle under a
//! new `VarId`; no buffer is copied. The dynamic-list family mutates per-run
//! list state owned by the session.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::error::ExecError;
use crate::frame::{FrameIter, VarId};
use crate::graph::{OpKind, Operation};
use crate::tensor::Tensor;
use crate::trace;

use super::memory::SharedTensor;
use super::{OpOutcome, Session};
use crate::dispatch::OpDispatcher;

impl<'g, D: OpDispatcher> Session<'g, D> {
    pub(super) fn exec_control_flow(
        &mut self,
        op: &Operation,
        at: &FrameIter,
    ) -> Result<OpOutcome> {
        match &op.kind {
            OpKind::Identity => self.exec_identity(op, at),
            OpKind::Enter { frame, .. } => self.exec_enter(op, at, frame),
            OpKind::Exit => self.exec_exit(op, at),
            OpKind::NextIteration => self.exec_next_iteration(op, at),
            OpKind::LoopCond => self.exec_loop_cond(op, at),
            OpKind::Switch => self.exec_switch(op, at),
            OpKind::Merge => self.exec_merge(op, at),
            OpKind::ListNew => self.exec_list_new(op, at),
            OpKind::ListRead => self.exec_list_read(op, at),
            OpKind::ListWrite => self.exec_list_write(op, at),
            OpKind::ListSize => self.exec_list_size(op, at),
            OpKind::ListGather => self.exec_list_gather(op, at),
            OpKind::ListScatter => self.exec_list_scatter(op, at),
            OpKind::ListSplit => self.exec_list_split(op, at),
            OpKind::ListConcat => self.exec_list_concat(op, at),
            OpKind::Plain => Err(anyhow!("op {} is not a control-flow op", op.name)),
        }
    }

    /// Forward the input unchanged, zero-copy, in the same frame/iteration.
    fn exec_identity(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (in_id, tensor) = self.input_tensor(&op.inputs[0], at)?;
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id.clone(), tensor)],
            aliases: vec![(in_id.clone(), out_id)],
            consumed: vec![in_id],
        })
    }

    /// Forward the input into the child frame at iteration 0, zero-copy.
    fn exec_enter(&mut self, op: &Operation, at: &FrameIter, frame: &str) -> Result<OpOutcome> {
        let (in_id, tensor) = self.input_tensor(&op.inputs[0], at)?;
        let out_id = VarId::new(op.outputs[0].clone(), at.enter(frame));
        Ok(OpOutcome {
            bindings: vec![(out_id.clone(), tensor)],
            aliases: vec![(in_id.clone(), out_id)],
            consumed: vec![in_id],
        })
    }

    /// Forward the input to the parent frame at its current iteration.
    fn exec_exit(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (in_id, tensor) = self.input_tensor(&op.inputs[0], at)?;
        let parent = at.parent().cloned().ok_or_else(|| {
            ExecError::FrameIterationError(format!(
                "op {} exits frame {} which has no parent",
                op.name, at
            ))
        })?;
        let out_id = VarId::new(op.outputs[0].clone(), parent);
        Ok(OpOutcome {
            bindings: vec![(out_id.clone(), tensor)],
            aliases: vec![(in_id.clone(), out_id)],
            consumed: vec![in_id],
        })
    }

    /// Forward the input to the same frame at iteration + 1, zero-copy.
    fn exec_next_iteration(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (in_id, tensor) = self.input_tensor(&op.inputs[0], at)?;
        if in_id.frame_iter.iteration != at.iteration {
            return Err(ExecError::FrameIterationError(format!(
                "op {}: input {} does not belong to iteration {}",
                op.name, in_id, at.iteration
            ))
            .into());
        }
        let out_id = VarId::new(op.outputs[0].clone(), at.next_iteration());
        if self.node_outputs.contains_key(&out_id) {
            return Err(ExecError::FrameIterationError(format!(
                "op {}: destination {} is already bound",
                op.name, out_id
            ))
            .into());
        }
        Ok(OpOutcome {
            bindings: vec![(out_id.clone(), tensor)],
            aliases: vec![(in_id.clone(), out_id)],
            consumed: vec![in_id],
        })
    }

    /// Validate a scalar boolean condition and forward a copy of it.
    ///
    /// The output is an independent buffer, so the condition value can be
    /// reclaimed separately from whatever still reads the forwarded flag.
    fn exec_loop_cond(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (in_id, tensor) = self.input_tensor(&op.inputs[0], at)?;
        tensor.as_scalar_bool()?;
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        let copy: SharedTensor = Arc::new(tensor.as_ref().clone());
        Ok(OpOutcome {
            bindings: vec![(out_id, copy)],
            aliases: Vec::new(),
            consumed: vec![in_id],
        })
    }

    /// Route the value input to output 0 (false) or output 1 (true); the
    /// untaken output is left unbound, pruning its downstream ops.
    fn exec_switch(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (value_id, value) = self.input_tensor(&op.inputs[0], at)?;
        let (pred_id, pred) = self.input_tensor(&op.inputs[1], at)?;
        let branch = pred.as_scalar_bool().map_err(|_| {
            ExecError::TypeMismatch(format!(
                "op {}: switch predicate {} must be a scalar bool",
                op.name, pred_id
            ))
        })?;
        let taken = if branch { 1 } else { 0 };
        trace!("switch {} takes output {}", op.name, taken);
        let out_id = VarId::new(op.outputs[taken].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id.clone(), value)],
            aliases: vec![(value_id.clone(), out_id)],
            consumed: vec![value_id, pred_id],
        })
    }

    /// Forward whichever input is bound at this exact frame/iteration.
    ///
    /// When both are bound the first declared input wins, so merge output is
    /// deterministic regardless of arrival order.
    fn exec_merge(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let mut winner = None;
        for input in &op.inputs {
            let id = VarId::new(input.clone(), at.clone());
            if let Some(tensor) = self.node_outputs.get(&id) {
                winner = Some((id, tensor.clone()));
                break;
            }
        }
        let (in_id, tensor) = winner.ok_or_else(|| {
            ExecError::MissingValue(format!(
                "op {}: no merge input bound at {}",
                op.name, at
            ))
        })?;
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id.clone(), tensor)],
            aliases: vec![(in_id.clone(), out_id)],
            consumed: vec![in_id],
        })
    }

    /// Locate the session list a handle variable refers to.
    ///
    /// Handle chains are followed in two directions: through Enter ops up
    /// into parent frames (handles created in an enclosing frame must reach
    /// inner frames through Enter), and through the handle outputs of
    /// mutating list ops, which downstream ops consume to order themselves
    /// after the mutation.
    fn resolve_list_id(&self, name: &str, at: &FrameIter) -> Result<VarId> {
        let mut name = name.to_string();
        let mut fi = at.clone();
        while let Some(op) = self.graph.producer(&name) {
            match &op.kind {
                OpKind::Enter { .. } => {
                    let input = op.inputs[0].clone();
                    fi = fi.parent().cloned().ok_or_else(|| {
                        ExecError::FrameIterationError(format!(
                            "list handle {} escapes above the root frame",
                            name
                        ))
                    })?;
                    name = input;
                }
                OpKind::ListWrite | OpKind::ListScatter | OpKind::ListSplit => {
                    name = op.inputs[0].clone();
                }
                _ => break,
            }
        }
        let exact = VarId::new(name.clone(), fi.clone());
        if self.lists.contains_key(&exact) {
            return Ok(exact);
        }
        // Creation may have happened at iteration 0 of an activation that
        // has since advanced.
        let zeroed = VarId::new(name, fi.zeroed());
        if self.lists.contains_key(&zeroed) {
            return Ok(zeroed);
        }
        Err(ExecError::MissingValue(format!("list {}", exact)).into())
    }

    /// Create an empty list; the handle output is a scalar marker value.
    fn exec_list_new(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let list_id = VarId::new(op.outputs[0].clone(), at.clone());
        if self.lists.contains_key(&list_id) {
            return Err(anyhow!("op {}: list {} already exists", op.name, list_id));
        }
        trace!("created list {}", list_id);
        self.lists.insert(list_id.clone(), Vec::new());
        Ok(OpOutcome {
            bindings: vec![(list_id, Arc::new(Tensor::scalar_bool(true)))],
            aliases: Vec::new(),
            consumed: Vec::new(),
        })
    }

    fn exec_list_read(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let (index_id, index) = self.input_tensor(&op.inputs[1], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        let i = checked_index(index.as_scalar_index()?, &op.name)?;
        let list = self.lists.get(&list_id).expect("list resolved");
        let value = list
            .get(i)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| {
                ExecError::MissingValue(format!(
                    "op {}: list {} has no value at index {}",
                    op.name, list_id, i
                ))
            })?
            .clone();
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id, Arc::new(value))],
            aliases: Vec::new(),
            consumed: vec![handle_id, index_id],
        })
    }

    fn exec_list_write(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let (index_id, index) = self.input_tensor(&op.inputs[1], at)?;
        let (value_id, value) = self.input_tensor(&op.inputs[2], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        let i = checked_index(index.as_scalar_index()?, &op.name)?;
        let list = self.lists.get_mut(&list_id).expect("list resolved");
        if list.len() <= i {
            list.resize(i + 1, None);
        }
        // Written values are copied in; the list never aliases live arrays.
        list[i] = Some(value.as_ref().clone());
        trace!("wrote list {} index {}", list_id, i);
        Ok(OpOutcome {
            bindings: vec![flow_binding(op, at)],
            aliases: Vec::new(),
            consumed: vec![handle_id, index_id, value_id],
        })
    }

    fn exec_list_size(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        let len = self.lists.get(&list_id).expect("list resolved").len();
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id, Arc::new(Tensor::scalar_i64(len as i64)))],
            aliases: Vec::new(),
            consumed: vec![handle_id],
        })
    }

    /// Stack selected entries along a new leading axis; indices `[-1]` means
    /// every entry in order.
    fn exec_list_gather(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let (indices_id, indices) = self.input_tensor(&op.inputs[1], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        let list = self.lists.get(&list_id).expect("list resolved");
        let picks = expand_indices(indices.as_index_vector()?, list.len(), &op.name)?;
        let mut parts = Vec::with_capacity(picks.len());
        for i in &picks {
            let entry = list.get(*i).and_then(|slot| slot.as_ref()).ok_or_else(|| {
                ExecError::MissingValue(format!(
                    "op {}: list {} has no value at index {}",
                    op.name, list_id, i
                ))
            })?;
            parts.push(entry);
        }
        let stacked = Tensor::stack(&parts)?;
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id, Arc::new(stacked))],
            aliases: Vec::new(),
            consumed: vec![handle_id, indices_id],
        })
    }

    /// Scatter leading-axis slices of the value into list slots; indices
    /// `[-1]` means slice `k` goes to slot `k`.
    fn exec_list_scatter(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let (value_id, value) = self.input_tensor(&op.inputs[1], at)?;
        let (indices_id, indices) = self.input_tensor(&op.inputs[2], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        if value.rank() == 0 {
            return Err(ExecError::TypeMismatch(format!(
                "op {}: scatter value must have a leading axis",
                op.name
            ))
            .into());
        }
        let slices = value.shape()[0];
        let targets = expand_indices(indices.as_index_vector()?, slices, &op.name)?;
        if targets.len() != slices {
            return Err(anyhow!(
                "op {}: {} indices for {} leading-axis slices",
                op.name,
                targets.len(),
                slices
            ));
        }
        let list = self.lists.get_mut(&list_id).expect("list resolved");
        for (k, slot) in targets.into_iter().enumerate() {
            if list.len() <= slot {
                list.resize(slot + 1, None);
            }
            list[slot] = Some(value.index_axis0(k)?);
        }
        Ok(OpOutcome {
            bindings: vec![flow_binding(op, at)],
            aliases: Vec::new(),
            consumed: vec![handle_id, value_id, indices_id],
        })
    }

    /// Split consecutive leading-axis ranges of the value into slots 0..n.
    fn exec_list_split(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let (value_id, value) = self.input_tensor(&op.inputs[1], at)?;
        let (sizes_id, sizes) = self.input_tensor(&op.inputs[2], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        if value.rank() == 0 {
            return Err(ExecError::TypeMismatch(format!(
                "op {}: split value must have a leading axis",
                op.name
            ))
            .into());
        }
        let sizes = sizes.as_index_vector()?;
        let total: i64 = sizes.iter().sum();
        if total != value.shape()[0] as i64 {
            return Err(anyhow!(
                "op {}: split sizes sum to {} but leading axis is {}",
                op.name,
                total,
                value.shape()[0]
            ));
        }
        let mut parts = Vec::with_capacity(sizes.len());
        let mut start = 0usize;
        for size in &sizes {
            let size = checked_index(*size, &op.name)?;
            parts.push(value.slice_axis0(start, start + size)?);
            start += size;
        }
        let list = self.lists.get_mut(&list_id).expect("list resolved");
        if list.len() < parts.len() {
            list.resize(parts.len(), None);
        }
        for (i, part) in parts.into_iter().enumerate() {
            list[i] = Some(part);
        }
        Ok(OpOutcome {
            bindings: vec![flow_binding(op, at)],
            aliases: Vec::new(),
            consumed: vec![handle_id, value_id, sizes_id],
        })
    }

    /// Concatenate every entry along the existing leading axis.
    fn exec_list_concat(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let (handle_id, _) = self.input_tensor(&op.inputs[0], at)?;
        let list_id = self.resolve_list_id(&op.inputs[0], at)?;
        let list = self.lists.get(&list_id).expect("list resolved");
        let mut parts = Vec::with_capacity(list.len());
        for (i, slot) in list.iter().enumerate() {
            let entry = slot.as_ref().ok_or_else(|| {
                ExecError::MissingValue(format!(
                    "op {}: list {} has no value at index {}",
                    op.name, list_id, i
                ))
            })?;
            parts.push(entry);
        }
        let joined = Tensor::concat_axis0(&parts)?;
        let out_id = VarId::new(op.outputs[0].clone(), at.clone());
        Ok(OpOutcome {
            bindings: vec![(out_id, Arc::new(joined))],
            aliases: Vec::new(),
            consumed: vec![handle_id],
        })
    }
}

/// The scalar flow value bound by list-mutating ops so downstream ops can
/// order themselves after the mutation.
fn flow_binding(op: &Operation, at: &FrameIter) -> (VarId, SharedTensor) {
    (
        VarId::new(op.outputs[0].clone(), at.clone()),
        Arc::new(Tensor::scalar_f32(0.0)),
    )
}

fn checked_index(index: i64, op: &str) -> Result<usize> {
    usize::try_from(index).map_err(|_| anyhow!("op {}: negative list index {}", op, index))
}

/// Expand an index vector; `[-1]` selects all `len` entries in order.
fn expand_indices(indices: Vec<i64>, len: usize, op: &str) -> Result<Vec<usize>> {
    if indices.len() == 1 && indices[0] == -1 {
        return Ok((0..len).collect());
    }
    indices
        .into_iter()
        .map(|i| checked_index(i, op))
        .collect()
}
