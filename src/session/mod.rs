//! Session: subgraph discovery, execution scheduling, release bookkeeping.
//!
//! A session owns all mutable per-execution state for one graph: bound
//! variable instances, the op-readiness tracker, the array-use tracker, the
//! memory manager and the dynamic lists. One session must only ever be
//! driven from a single thread; the graph definition itself is shared and
//! read-only.

mod control_flow;
mod memory;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::deps::DependencyTracker;
use crate::dispatch::OpDispatcher;
use crate::error::ExecError;
use crate::frame::{FrameIter, VarId, MAIN_FRAME};
use crate::graph::{Graph, OpKind, Operation, VarKind};
use crate::tensor::Tensor;
use crate::{critical, error, trace, warning};

pub use memory::MemoryStats;
use memory::{MemoryManager, SharedTensor};

/// One scheduled execution of an operation at a frame/iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExecStep {
    op: String,
    frame_iter: FrameIter,
}

impl std::fmt::Display for ExecStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.op, self.frame_iter)
    }
}

/// Event that must occur before an array can be released.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ExecDep {
    /// The named op finished executing at the given frame/iteration.
    Op { op: String, frame_iter: FrameIter },
    /// The frame activation has no more iterations pending.
    Frame {
        frame: String,
        parent: Option<FrameIter>,
    },
}

impl std::fmt::Display for ExecDep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecDep::Op { op, frame_iter } => write!(f, "op {}({})", op, frame_iter),
            ExecDep::Frame { frame, .. } => write!(f, "frame {}", frame),
        }
    }
}

/// Everything an op execution produced, fed into release bookkeeping.
struct OpOutcome {
    /// Output bindings created by this step.
    bindings: Vec<(VarId, SharedTensor)>,
    /// Zero-copy alias edges (source, alias) introduced by this step.
    aliases: Vec<(VarId, VarId)>,
    /// Input instances whose dependency on this step is now satisfied.
    consumed: Vec<VarId>,
}

/// Execution session over a frozen graph and an external kernel dispatcher.
pub struct Session<'g, D> {
    graph: &'g Graph,
    dispatcher: D,
    mmgr: MemoryManager,
    node_outputs: HashMap<VarId, SharedTensor>,
    lists: HashMap<VarId, Vec<Option<Tensor>>>,
    exec_tracker: DependencyTracker<ExecStep, VarId>,
    array_tracker: DependencyTracker<VarId, ExecDep>,
    registered: HashSet<ExecStep>,
    subgraph_ops: HashSet<String>,
    subgraph_vars: HashSet<String>,
    retained: HashSet<String>,
    /// Exit ops expected per frame name, from the static frame labeling.
    exits_expected: HashMap<String, usize>,
    /// Exit ops fired per frame activation.
    exits_fired: HashMap<(String, Option<FrameIter>), usize>,
}

impl<'g, D: OpDispatcher> Session<'g, D> {
    pub fn new(graph: &'g Graph, dispatcher: D) -> Self {
        Self {
            graph,
            dispatcher,
            mmgr: MemoryManager::new(),
            node_outputs: HashMap::new(),
            lists: HashMap::new(),
            exec_tracker: DependencyTracker::new(),
            array_tracker: DependencyTracker::new(),
            registered: HashSet::new(),
            subgraph_ops: HashSet::new(),
            subgraph_vars: HashSet::new(),
            retained: HashSet::new(),
            exits_expected: HashMap::new(),
            exits_fired: HashMap::new(),
        }
    }

    /// Allocation/release counters for the most recent run.
    pub fn memory_stats(&self) -> MemoryStats {
        self.mmgr.stats()
    }

    /// Arrays released during the most recent run, in release order.
    pub fn released_arrays(&self) -> &[VarId] {
        self.mmgr.released()
    }

    /// Execute the graph for the requested outputs.
    ///
    /// Deterministic for a deterministic dispatcher and identical inputs.
    /// Either every requested output is returned or the call fails; partial
    /// results are never produced.
    pub fn run(
        &mut self,
        requested: &[&str],
        placeholders: HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>> {
        self.reset();

        for name in requested {
            if !self.graph.has_var(name) {
                return Err(anyhow!("requested unknown variable: {}", name));
            }
        }
        for name in placeholders.keys() {
            let var = self.graph.var(name)?;
            if var.kind != VarKind::Placeholder {
                return Err(anyhow!("value bound for non-placeholder variable: {}", name));
            }
        }

        self.discover_subgraph(requested)?;
        self.label_exit_frames()?;
        self.bind_initial_values(requested, &placeholders)?;
        self.register_invariant_ops();

        while let Some(step) = self.exec_tracker.new_all_satisfied() {
            if let Err(err) = self.execute_step(&step) {
                error!("execution of {} failed: {}", step, err);
                return Err(err);
            }
        }

        let mut outputs = HashMap::new();
        for name in requested {
            let id = VarId::in_root(*name);
            let tensor = self
                .node_outputs
                .get(&id)
                .ok_or_else(|| ExecError::MissingValue(id.to_string()))?;
            outputs.insert((*name).to_string(), tensor.as_ref().clone());
        }
        Ok(outputs)
    }

    fn reset(&mut self) {
        self.mmgr.reset();
        self.node_outputs.clear();
        self.lists.clear();
        self.exec_tracker.clear();
        self.array_tracker.clear();
        self.registered.clear();
        self.subgraph_ops.clear();
        self.subgraph_vars.clear();
        self.retained.clear();
        self.exits_expected.clear();
        self.exits_fired.clear();
    }

    /// Backward reachability from the requested outputs over producer edges.
    fn discover_subgraph(&mut self, requested: &[&str]) -> Result<()> {
        let mut pending: VecDeque<String> = VecDeque::new();
        for name in requested {
            self.subgraph_vars.insert((*name).to_string());
            pending.push_back((*name).to_string());
        }
        while let Some(var) = pending.pop_front() {
            let Some(op) = self.graph.producer(&var) else {
                continue;
            };
            if !self.subgraph_ops.insert(op.name.clone()) {
                continue;
            }
            for out in &op.outputs {
                self.subgraph_vars.insert(out.clone());
            }
            for input in &op.inputs {
                if self.subgraph_vars.insert(input.clone()) {
                    pending.push_back(input.clone());
                }
            }
        }
        trace!(
            "subgraph: {} ops, {} variables",
            self.subgraph_ops.len(),
            self.subgraph_vars.len()
        );
        Ok(())
    }

    /// Static frame labeling for Exit ops: how many exits close each frame.
    ///
    /// Needed so a whole-frame lifetime dependency is only satisfied once
    /// every Exit of the activation has fired; satisfying it on the first
    /// exit could reclaim Enter values a sibling exit still forwards.
    fn label_exit_frames(&mut self) -> Result<()> {
        let mut frames: HashMap<String, String> = HashMap::new();
        let mut visiting: HashSet<String> = HashSet::new();
        for op_name in self.graph.op_names() {
            if !self.subgraph_ops.contains(op_name) {
                continue;
            }
            let op = self.graph.op(op_name)?;
            if op.kind == OpKind::Exit {
                let frame = self.frame_of(&op.inputs[0], &mut frames, &mut visiting)?;
                *self.exits_expected.entry(frame).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Frame a variable's value lives in, derived statically from producers.
    fn frame_of(
        &self,
        var: &str,
        memo: &mut HashMap<String, String>,
        visiting: &mut HashSet<String>,
    ) -> Result<String> {
        if let Some(frame) = memo.get(var) {
            return Ok(frame.clone());
        }
        if self.graph.is_frame_invariant(var) {
            return Ok(MAIN_FRAME.to_string());
        }
        let Some(op) = self.graph.producer(var) else {
            return Ok(MAIN_FRAME.to_string());
        };
        if !visiting.insert(var.to_string()) {
            // Loop-carried cycle; the caller falls back to another input.
            return Err(anyhow!("cyclic frame labeling through {}", var));
        }
        let result = (|| -> Result<String> {
            match &op.kind {
                OpKind::Enter { frame, .. } => Ok(frame.clone()),
                OpKind::Exit => {
                    // One level up from the input's frame: the input frame's
                    // own Enter determines the parent.
                    let inner = self.frame_of(&op.inputs[0], memo, visiting)?;
                    for op_name in self.graph.op_names() {
                        let candidate = self.graph.op(op_name)?;
                        if let OpKind::Enter { frame, .. } = &candidate.kind {
                            if *frame == inner {
                                return self.frame_of(&candidate.inputs[0], memo, visiting);
                            }
                        }
                    }
                    Ok(MAIN_FRAME.to_string())
                }
                _ => {
                    for input in &op.inputs {
                        if self.graph.is_frame_invariant(input) {
                            continue;
                        }
                        match self.frame_of(input, memo, visiting) {
                            Ok(frame) => return Ok(frame),
                            Err(_) => continue,
                        }
                    }
                    Ok(MAIN_FRAME.to_string())
                }
            }
        })();
        visiting.remove(var);
        if let Ok(frame) = &result {
            memo.insert(var.to_string(), frame.clone());
        }
        result
    }

    /// Bind constants, parameters and caller placeholders in the root frame.
    fn bind_initial_values(
        &mut self,
        requested: &[&str],
        placeholders: &HashMap<String, Tensor>,
    ) -> Result<()> {
        for name in requested {
            self.retained.insert((*name).to_string());
        }
        for name in placeholders.keys() {
            if !self.subgraph_vars.contains(name) {
                warning!("binding for {} is outside the requested subgraph", name);
            }
        }
        for name in self.graph.var_names() {
            if !self.subgraph_vars.contains(name) {
                continue;
            }
            let var = self.graph.var(name)?;
            match var.kind {
                VarKind::Constant | VarKind::Parameter => {
                    let value = var
                        .value
                        .clone()
                        .ok_or_else(|| anyhow!("{:?} {} has no bound value", var.kind, name))?;
                    self.retained.insert(name.clone());
                    self.bind(VarId::in_root(name.clone()), Arc::new(value))?;
                }
                VarKind::Placeholder => {
                    let value = placeholders
                        .get(name)
                        .ok_or_else(|| ExecError::UnboundPlaceholder(name.clone()))?;
                    if let Some(dtype) = var.dtype {
                        if value.dtype() != dtype {
                            return Err(ExecError::TypeMismatch(format!(
                                "placeholder {} declared {:?}, bound {:?}; the engine \
                                 performs no implicit coercion",
                                name,
                                dtype,
                                value.dtype()
                            ))
                            .into());
                        }
                    }
                    self.retained.insert(name.clone());
                    self.bind(VarId::in_root(name.clone()), Arc::new(value.clone()))?;
                }
                VarKind::Computed => {}
            }
        }
        Ok(())
    }

    /// Register steps for ops whose inputs are all frame-invariant; they
    /// execute once, in the root frame.
    fn register_invariant_ops(&mut self) {
        let op_names: Vec<String> = self
            .graph
            .op_names()
            .iter()
            .filter(|n| self.subgraph_ops.contains(*n))
            .cloned()
            .collect();
        for op_name in op_names {
            let all_invariant = {
                let op = self.graph.op(&op_name).expect("subgraph op exists");
                op.inputs.iter().all(|i| {
                    self.graph.is_frame_invariant(i)
                        && self
                            .graph
                            .var(i)
                            .map_or(false, |v| v.kind != VarKind::Computed)
                })
            };
            if all_invariant {
                self.try_register_step(&op_name, FrameIter::root());
            }
        }
    }

    /// Publish a value under a `VarId` and wake anything waiting on it.
    fn bind(&mut self, id: VarId, value: SharedTensor) -> Result<()> {
        if self.node_outputs.contains_key(&id) {
            return Err(anyhow!("value already bound for {}", id));
        }
        trace!("bound {}", id);
        self.node_outputs.insert(id.clone(), value);
        self.on_binding(&id);
        Ok(())
    }

    /// Reactive step discovery after a binding appears.
    fn on_binding(&mut self, id: &VarId) {
        self.exec_tracker.mark_satisfied(id);
        let var = match self.graph.var(&id.name) {
            Ok(v) => v,
            Err(_) => return,
        };
        // Constants/placeholders/parameters do not pin their consumers to
        // the root frame; consumers are discovered from their non-invariant
        // inputs instead. Computed frame-invariant values (constant Enter
        // outputs) do drive discovery at their own frame.
        if var.kind != VarKind::Computed && self.graph.is_frame_invariant(&id.name) {
            return;
        }
        let consumers: Vec<String> = self
            .graph
            .consumers(&id.name)
            .iter()
            .filter(|c| self.subgraph_ops.contains(*c))
            .cloned()
            .collect();
        for consumer in consumers {
            self.try_register_step(&consumer, id.frame_iter.clone());
        }
    }

    /// Register an execution step once, with its input dependencies.
    fn try_register_step(&mut self, op_name: &str, frame_iter: FrameIter) {
        let step = ExecStep {
            op: op_name.to_string(),
            frame_iter,
        };
        if !self.registered.insert(step.clone()) {
            return;
        }
        let op = self.graph.op(op_name).expect("registered op exists");
        if op.kind == OpKind::Merge {
            // Either input unblocks a merge; exact-frame resolution only,
            // loop-carried inputs are mutually exclusive by construction.
            let a = VarId::new(op.inputs[0].clone(), step.frame_iter.clone());
            let b = VarId::new(op.inputs[1].clone(), step.frame_iter.clone());
            self.exec_tracker.add_or_dependency(&step, a, b);
        } else {
            let inputs = op.inputs.clone();
            for input in inputs {
                let resolved = self.resolve_input(&input, &step.frame_iter);
                if self.node_outputs.contains_key(&resolved) {
                    continue;
                }
                self.exec_tracker.add_dependency(&step, resolved);
            }
        }
        self.exec_tracker.check_and_queue(&step);
    }

    /// Map a variable read at a frame/iteration to the `VarId` that holds it.
    ///
    /// Plain values live exactly at the reading frame. Frame-invariant
    /// values resolve to the root frame, or through the zeroed activation
    /// chain for constant Enter outputs. Non-constant Enter outputs are
    /// bound at iteration 0 of their frame and stay addressable for every
    /// later iteration.
    fn resolve_input(&self, name: &str, at: &FrameIter) -> VarId {
        if self.graph.is_frame_invariant(name) {
            let var = self.graph.var(name).ok();
            if var.map_or(false, |v| v.kind != VarKind::Computed) {
                return VarId::in_root(name);
            }
            // Constant Enter output: bound at iteration 0 of every level of
            // its activation chain.
            if let Some(op) = self.graph.producer(name) {
                if let OpKind::Enter { frame, .. } = &op.kind {
                    let mut fi = at.zeroed();
                    loop {
                        if fi.frame == *frame {
                            return VarId::new(name, fi);
                        }
                        match fi.parent() {
                            Some(parent) => fi = parent.clone(),
                            None => break,
                        }
                    }
                }
            }
            return VarId::new(name, at.zeroed());
        }
        if let Some(op) = self.graph.producer(name) {
            if matches!(op.kind, OpKind::Enter { .. }) {
                return VarId::new(name, at.with_iteration(0));
            }
        }
        VarId::new(name, at.clone())
    }

    /// Fetch the tensor bound for an input read at a frame/iteration.
    fn input_tensor(&self, name: &str, at: &FrameIter) -> Result<(VarId, SharedTensor)> {
        let id = self.resolve_input(name, at);
        let tensor = self
            .node_outputs
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecError::MissingValue(id.to_string()))?;
        Ok((id, tensor))
    }

    fn execute_step(&mut self, step: &ExecStep) -> Result<()> {
        let op = self.graph.op(&step.op)?.clone();
        trace!("executing {}", step);
        let outcome = if op.kind.is_control_flow() {
            self.exec_control_flow(&op, &step.frame_iter)?
        } else {
            self.exec_plain(&op, &step.frame_iter)?
        };

        let bound_ids: Vec<VarId> = outcome.bindings.iter().map(|(id, _)| id.clone()).collect();
        for (id, tensor) in outcome.bindings {
            self.bind(id, tensor)?;
        }

        // Release bookkeeping, strictly ordered: new dependencies and alias
        // edges first, then removal of this op's own input dependencies,
        // then the zero-dependency drain.
        self.add_output_dependencies(&op, &bound_ids, &outcome.aliases)?;
        self.remove_input_dependencies(&op, &step.frame_iter, &outcome.consumed);
        if op.kind == OpKind::Exit {
            self.on_exit_fired(&step.frame_iter);
        }
        self.drain_releasable();
        Ok(())
    }

    /// Plain op: infer shapes, allocate output buffers, dispatch the kernel.
    fn exec_plain(&mut self, op: &Operation, at: &FrameIter) -> Result<OpOutcome> {
        let mut consumed = Vec::with_capacity(op.inputs.len());
        let mut arcs = Vec::with_capacity(op.inputs.len());
        for input in &op.inputs {
            let (id, tensor) = self.input_tensor(input, at)?;
            consumed.push(id);
            arcs.push(tensor);
        }
        let inputs: Vec<&Tensor> = arcs.iter().map(|a| a.as_ref()).collect();

        let descs = self.dispatcher.calculate_output_shape(op, &inputs)?;
        if descs.len() != op.outputs.len() {
            return Err(ExecError::AllocationError(format!(
                "op {} declared {} outputs but shape calculation returned {}",
                op.name,
                op.outputs.len(),
                descs.len()
            ))
            .into());
        }

        let in_loop = at.frame != MAIN_FRAME && at.iteration > 0;
        let mut buffers = Vec::with_capacity(descs.len());
        for (i, desc) in descs.iter().enumerate() {
            let slot = (op.name.clone(), i);
            let is_output = self.retained.contains(&op.outputs[i]);
            buffers.push(self.mmgr.allocate(is_output, desc, &slot, in_loop));
        }
        self.dispatcher.execute(op, &inputs, &mut buffers)?;

        let mut bindings = Vec::with_capacity(buffers.len());
        for (i, buffer) in buffers.into_iter().enumerate() {
            let shared: SharedTensor = Arc::new(buffer);
            self.mmgr.record_slot((op.name.clone(), i), shared.clone());
            bindings.push((VarId::new(op.outputs[i].clone(), at.clone()), shared));
        }
        Ok(OpOutcome {
            bindings,
            aliases: Vec::new(),
            consumed,
        })
    }

    /// Step 1 of release bookkeeping: alias edges, then one dependency per
    /// future consumer of each produced array (a whole-frame dependency for
    /// Enter outputs, which must outlive every iteration of their frame).
    fn add_output_dependencies(
        &mut self,
        op: &Operation,
        bound: &[VarId],
        aliases: &[(VarId, VarId)],
    ) -> Result<()> {
        for (source, alias) in aliases {
            if !self.node_outputs.contains_key(source) {
                critical!("alias {} registered for unbound source {}", alias, source);
                return Err(ExecError::AliasLifetimeViolation(format!(
                    "alias {} registered for unbound source {}",
                    alias, source
                ))
                .into());
            }
            self.array_tracker.add_alias(source, alias.clone());
            trace!("alias {} -> {}", source, alias);
        }
        for id in bound {
            let consumers: Vec<String> = self
                .graph
                .consumers(&id.name)
                .iter()
                .filter(|c| self.subgraph_ops.contains(*c))
                .cloned()
                .collect();
            if consumers.is_empty() {
                if !self.array_tracker.is_alias(id) && !self.array_tracker.has_dependency(id) {
                    self.array_tracker.check_and_queue(id);
                }
                continue;
            }
            if matches!(op.kind, OpKind::Enter { .. }) {
                let dep = ExecDep::Frame {
                    frame: id.frame_iter.frame.clone(),
                    parent: id.frame_iter.parent().cloned(),
                };
                trace!("added dependency {} -> {}", dep, id);
                self.array_tracker.add_dependency(id, dep);
            } else {
                for consumer in consumers {
                    let dep = ExecDep::Op {
                        op: consumer,
                        frame_iter: id.frame_iter.clone(),
                    };
                    trace!("added dependency {} -> {}", dep, id);
                    self.array_tracker.add_dependency(id, dep);
                }
            }
        }
        Ok(())
    }

    /// Step 2: the just-finished op no longer blocks its input arrays.
    fn remove_input_dependencies(&mut self, op: &Operation, at: &FrameIter, consumed: &[VarId]) {
        let dep = ExecDep::Op {
            op: op.name.clone(),
            frame_iter: at.clone(),
        };
        for id in consumed {
            trace!("removed dependency {} -> {}", dep, id);
            self.array_tracker.remove_dependency(id, &dep);
        }
    }

    /// Step 3: reclaim every array whose dependency set has drained, unless
    /// some member of its alias group is retained.
    fn drain_releasable(&mut self) {
        while let Some(root) = self.array_tracker.new_all_satisfied() {
            if !self.node_outputs.contains_key(&root) {
                continue;
            }
            let group = self.array_tracker.alias_group(&root);
            let keep = group.iter().any(|member| {
                self.retained.contains(&member.name)
                    || self
                        .graph
                        .var(&member.name)
                        .map_or(false, |v| v.kind != VarKind::Computed)
            });
            if keep {
                continue;
            }
            for member in &group {
                self.node_outputs.remove(member);
            }
            self.array_tracker.remove_item(&root);
            self.mmgr.release(root);
        }
    }

    /// A frame's lifetime dependency is satisfied once all of its Exit ops
    /// have fired for the activation.
    fn on_exit_fired(&mut self, at: &FrameIter) {
        let key = (at.frame.clone(), at.parent().cloned());
        let fired = self.exits_fired.entry(key).or_insert(0);
        *fired += 1;
        let expected = self.exits_expected.get(&at.frame).copied().unwrap_or(1);
        if *fired >= expected {
            let dep = ExecDep::Frame {
                frame: at.frame.clone(),
                parent: at.parent().cloned(),
            };
            trace!("frame complete: {}", dep);
            self.array_tracker.mark_satisfied(&dep);
        }
    }
}
