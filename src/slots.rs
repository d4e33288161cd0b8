//! Memory slots and the slot table.
//!
//! A [`MemorySlot`] maps a contiguous run of guest physical pages onto a host
//! virtual address range. The [`MemSlots`] table holds every slot of one VM at
//! one point in time; it is immutable once published and replaced wholesale by
//! the mutation path in [`crate::Vm::set_memory_region`]. Slots are kept
//! sorted by descending page count so lookups probe the largest (hottest)
//! slots first.

use std::cmp::Reverse;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::arch::SlotData;
use crate::dirty::DirtyBitmap;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Slot ids below this are user-visible; the rest are internal/private and
/// exempt from the overlap check and from guest visibility.
pub const USER_MEM_SLOTS: u16 = 125;
/// Internal slot ids reserved for the architecture layer.
pub const PRIVATE_MEM_SLOTS: u16 = 3;
/// Total slot id space.
pub const MEM_SLOTS: u16 = USER_MEM_SLOTS + PRIVATE_MEM_SLOTS;

/// Upper bound on pages per slot.
pub const MAX_SLOT_PAGES: u64 = (1 << 31) - 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemFlags: u32 {
        /// Track writes to this slot in a dirty bitmap.
        const LOG_DIRTY = 1 << 0;
        /// Reject guest writes to this slot.
        const READ_ONLY = 1 << 1;
        /// Internal: the slot is mid-teardown; translation must treat it as
        /// unmapped. Never accepted from a request.
        const INVALID = 1 << 16;
    }
}

impl MemFlags {
    /// Flags a region request may carry.
    pub const USER_SETTABLE: MemFlags = MemFlags::LOG_DIRTY.union(MemFlags::READ_ONLY);
}

/// A slot install/modify/delete request.
///
/// `memory_size == 0` deletes the slot with the given id (or is a no-op if
/// the id was empty).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub slot: u16,
    pub flags: MemFlags,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// How a request changes the existing slot at its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChange {
    Create,
    Delete,
    Move,
    FlagsOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("invalid memory region flags {flags:#x}")]
    InvalidFlags { flags: u32 },
    #[error("address or size not page-aligned: gpa={gpa:#x} size={size:#x} hva={hva:#x}")]
    Misaligned { gpa: u64, size: u64, hva: u64 },
    #[error("guest physical range wraps the address space")]
    AddressWrap,
    #[error("slot id {id} out of range")]
    InvalidId { id: u16 },
    #[error("slot spans {npages} pages (limit {limit})")]
    TooLarge { npages: u64, limit: u64 },
    #[error("guest physical range overlaps slot {id}")]
    Overlap { id: u16 },
    #[error("slots are immutable in size and backing; delete and recreate instead")]
    InvalidChange,
    #[error("slot {id} has no dirty bitmap")]
    NoDirtyLog { id: u16 },
    #[error("dirty log buffer too small: {got} bytes, need {need}")]
    BufferTooSmall { got: usize, need: usize },
    #[error("architecture hook rejected the region: {0}")]
    Arch(String),
}

/// One contiguous guest-physical to host-virtual mapping.
#[derive(Debug, Clone, Default)]
pub struct MemorySlot {
    pub id: u16,
    pub base_gfn: u64,
    pub npages: u64,
    pub userspace_addr: u64,
    pub flags: MemFlags,
    /// Carried by `Arc` between old and new slot values so a replace does not
    /// lose accumulated dirty bits or reallocate.
    pub dirty_bitmap: Option<Arc<DirtyBitmap>>,
    /// Architecture-opaque extension data.
    pub arch: Option<Arc<dyn SlotData>>,
}

impl MemorySlot {
    pub(crate) fn empty(id: u16) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.npages == 0
    }

    pub fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn < self.base_gfn + self.npages
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MemFlags::READ_ONLY)
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.flags.contains(MemFlags::INVALID)
    }

    /// Host virtual address of the page `gfn`, which must be in this slot.
    pub fn hva_for(&self, gfn: u64) -> u64 {
        debug_assert!(self.contains(gfn));
        self.userspace_addr + (gfn - self.base_gfn) * PAGE_SIZE
    }
}

/// The full slot collection of one VM at one point in time.
///
/// Immutable once published: mutation clones the table, edits the clone and
/// swaps it in (see [`crate::Vm`]). The generation strictly increases on
/// every published replacement, giving readers a cheap staleness check.
#[derive(Debug, Clone)]
pub struct MemSlots {
    /// All [`MEM_SLOTS`] slots, sorted by descending page count (empty slots
    /// last); stable by id on equal sizes.
    slots: Vec<MemorySlot>,
    id_to_index: Vec<usize>,
    generation: u64,
}

impl Default for MemSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl MemSlots {
    pub fn new() -> Self {
        Self {
            slots: (0..MEM_SLOTS).map(MemorySlot::empty).collect(),
            id_to_index: (0..MEM_SLOTS as usize).collect(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The slot with the given id (possibly empty). `id` must be below
    /// [`MEM_SLOTS`].
    pub fn slot(&self, id: u16) -> &MemorySlot {
        &self.slots[self.id_to_index[id as usize]]
    }

    pub(crate) fn slot_mut(&mut self, id: u16) -> &mut MemorySlot {
        &mut self.slots[self.id_to_index[id as usize]]
    }

    /// Iterate the non-empty slots, largest first.
    pub fn iter(&self) -> impl Iterator<Item = &MemorySlot> {
        self.slots.iter().take_while(|s| !s.is_empty())
    }

    /// The slot covering `gfn`, if any. Invalid (mid-teardown) slots are
    /// still returned here; translation rejects them.
    pub fn gfn_to_slot(&self, gfn: u64) -> Option<&MemorySlot> {
        self.iter().find(|s| s.contains(gfn))
    }

    /// Whether `gfn` is backed by a user-visible, live slot.
    pub fn is_visible_gfn(&self, gfn: u64) -> bool {
        match self.gfn_to_slot(gfn) {
            Some(slot) => slot.id < USER_MEM_SLOTS && !slot.is_invalid(),
            None => false,
        }
    }

    /// Replace the slot value for `new.id` (if given) and stamp the next
    /// generation. Re-sorts and rebuilds the id map when the slot's size
    /// changed.
    pub(crate) fn update(&mut self, new: Option<MemorySlot>, last_generation: u64) {
        if let Some(new) = new {
            let id = new.id;
            let old_npages = self.slot(id).npages;
            let changed_size = new.npages != old_npages;
            *self.slot_mut(id) = new;
            if changed_size {
                self.sort();
            }
        }
        self.generation = last_generation + 1;
    }

    fn sort(&mut self) {
        self.slots
            .sort_by_key(|s| (Reverse(s.npages), s.id));
        for (index, slot) in self.slots.iter().enumerate() {
            self.id_to_index[slot.id as usize] = index;
        }
    }
}
