//! Architecture layer seam.
//!
//! The slot mutation path calls into an [`ArchHooks`] implementation at each
//! stage so an architecture layer can maintain shadow paging state, second
//! level translation tables and the like. The core itself only needs the
//! default behavior: tearing down a slot forces every vCPU to drop cached
//! translation state.

use std::fmt;

use crate::slots::{MemorySlot, SlotChange, SlotError};
use crate::vm::Vm;

/// Opaque per-slot extension data owned by the architecture layer.
pub trait SlotData: fmt::Debug + Send + Sync {}

/// Per-stage hooks invoked by [`Vm::set_memory_region`].
///
/// All hooks default to no-ops except [`ArchHooks::flush_shadow_slot`], which
/// broadcasts a remote translation flush.
pub trait ArchHooks: Send + Sync {
    /// A slot is being created; the hook may attach [`MemorySlot::arch`]
    /// data. A failure aborts the operation before anything is published.
    fn create_slot(&self, _slot: &mut MemorySlot) -> Result<(), SlotError> {
        Ok(())
    }

    /// Last veto point before the final table is published.
    fn prepare_region(
        &self,
        _vm: &Vm,
        _new: &MemorySlot,
        _change: SlotChange,
    ) -> Result<(), SlotError> {
        Ok(())
    }

    /// The final table has been published.
    fn commit_region(&self, _vm: &Vm, _old: &MemorySlot, _new: &MemorySlot, _change: SlotChange) {}

    /// The slot was published as invalid (delete or move) and in-flight
    /// readers have drained; drop any cached mappings derived from it.
    fn flush_shadow_slot(&self, vm: &Vm, _slot: &MemorySlot) {
        vm.flush_remote_tlbs();
    }

    /// A slot's backing went away (delete, or rollback of a failed create);
    /// release any external state attached to it.
    fn free_slot(&self, _slot: &MemorySlot) {}
}

/// Default hooks: no architecture state beyond the remote flush on teardown.
#[derive(Debug, Default)]
pub struct NoopArch;

impl ArchHooks for NoopArch {}
