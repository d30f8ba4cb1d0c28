//! Tensor buffer lifecycle: allocation, per-slot reuse, release accounting.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::ShapeDesc;
use crate::frame::VarId;
use crate::tensor::Tensor;

/// Shared handle to a bound tensor buffer. Control-flow aliasing binds the
/// same handle under several `VarId`s without copying.
pub type SharedTensor = Arc<Tensor>;

/// Output-slot key: producing operation name and output index.
pub type SlotId = (String, usize);

/// Allocation/release counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Fresh buffers allocated.
    pub allocations: u64,
    /// Buffers handed back after their last dependent fired.
    pub releases: u64,
    /// Allocations served by reusing a previous same-slot buffer.
    pub reuses: u64,
}

/// Allocator for operation output buffers.
///
/// A buffer can be reused for the same (op, output slot) when the requested
/// shape/dtype matches, the previous buffer has no live bindings left, and
/// the op is not executing inside a loop iteration > 0 — later iterations
/// always allocate fresh so past-iteration values stay addressable.
#[derive(Debug, Default)]
pub struct MemoryManager {
    slots: HashMap<SlotId, SharedTensor>,
    stats: MemoryStats,
    released: Vec<VarId>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all per-run state and counters.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.stats = MemoryStats::default();
        self.released.clear();
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    /// Arrays released so far this run, in release order.
    pub fn released(&self) -> &[VarId] {
        &self.released
    }

    /// Produce a buffer for an output slot.
    ///
    /// `is_requested_output` is accepted for parity with the release rules
    /// (requested outputs are never reclaimed) but does not change the
    /// allocation itself.
    pub fn allocate(
        &mut self,
        is_requested_output: bool,
        desc: &ShapeDesc,
        slot: &SlotId,
        in_loop: bool,
    ) -> Tensor {
        let _ = is_requested_output;
        if !in_loop {
            if let Some(existing) = self.slots.get(slot) {
                if desc.matches(existing) && Arc::strong_count(existing) == 1 {
                    let existing = self.slots.remove(slot).expect("slot entry present");
                    if let Ok(buffer) = Arc::try_unwrap(existing) {
                        self.stats.reuses += 1;
                        return buffer;
                    }
                }
            }
        }
        self.stats.allocations += 1;
        Tensor::zeros(desc.dtype, desc.shape.clone())
    }

    /// Remember the published buffer for a slot so it can be reused once all
    /// of its bindings are gone.
    pub fn record_slot(&mut self, slot: SlotId, buffer: SharedTensor) {
        self.slots.insert(slot, buffer);
    }

    /// Account for the release of an array's buffer.
    pub fn release(&mut self, id: VarId) {
        crate::trace!("released array {}", id);
        self.stats.releases += 1;
        self.released.push(id);
    }
}
