//! Generation-validated guest address cache.
//!
//! Repeated accesses to one guest structure (a shared info page, a steal-time
//! record) should not pay slot lookup every time. The cache resolves the
//! window's host address once and revalidates only when the slot table
//! generation moved. A window spanning a slot boundary cannot be a single
//! host range, so it caches no address and falls back to full guest copies,
//! which handle the split.

use crate::dirty::gpa_to_gfn;
use crate::slots::{MemorySlot, PAGE_SIZE};
use crate::translate::{slot_hva, TranslateError};
use crate::vm::Vm;

#[derive(Debug)]
pub struct GpaCache {
    gpa: u64,
    len: u64,
    generation: u64,
    /// Host address of the window start, when the window sits in one slot.
    hva: Option<u64>,
    slot: Option<MemorySlot>,
}

impl GpaCache {
    /// Resolve a cache over `[gpa, gpa + len)`. Fails if any page in the
    /// window is unmapped or read-only.
    pub fn new(vm: &Vm, gpa: u64, len: u64) -> Result<Self, TranslateError> {
        let mut cache = Self {
            gpa,
            len,
            generation: 0,
            hva: None,
            slot: None,
        };
        cache.refresh(vm)?;
        Ok(cache)
    }

    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// Re-resolve against the current slot table.
    pub fn refresh(&mut self, vm: &Vm) -> Result<(), TranslateError> {
        let slots = vm.memslots();
        self.generation = slots.generation();
        self.hva = None;
        self.slot = None;

        // A zero-length window still validates its one page.
        let last = self
            .gpa
            .checked_add(self.len.saturating_sub(1))
            .ok_or(TranslateError::Fault)?;
        let start_gfn = gpa_to_gfn(self.gpa);
        let end_gfn = gpa_to_gfn(last);

        if start_gfn == end_gfn {
            let slot = slots.gfn_to_slot(start_gfn).cloned();
            let hva = slot_hva(slot.as_ref(), start_gfn, true)?;
            self.hva = Some(hva + (self.gpa & (PAGE_SIZE - 1)));
            self.slot = slot;
        } else {
            for gfn in start_gfn..=end_gfn {
                slot_hva(slots.gfn_to_slot(gfn), gfn, true)?;
            }
        }
        Ok(())
    }

    fn validate(&mut self, vm: &Vm) -> Result<(), TranslateError> {
        if self.generation != vm.memslots().generation() {
            self.refresh(vm)?;
        }
        Ok(())
    }

    /// Read from the cached window. `data` must fit inside it.
    pub fn read(&mut self, vm: &Vm, data: &mut [u8]) -> Result<(), TranslateError> {
        assert!(data.len() as u64 <= self.len, "read past the cached window");
        self.validate(vm)?;
        match self.hva {
            Some(hva) => vm
                .host()
                .read(hva, data)
                .map_err(|_| TranslateError::Fault),
            None => vm.read_guest(self.gpa, data),
        }
    }

    /// Write through the cached window, marking the page dirty. `data` must
    /// fit inside it.
    pub fn write(&mut self, vm: &Vm, data: &[u8]) -> Result<(), TranslateError> {
        assert!(data.len() as u64 <= self.len, "write past the cached window");
        self.validate(vm)?;
        match self.hva {
            Some(hva) => {
                vm.host()
                    .write(hva, data)
                    .map_err(|_| TranslateError::Fault)?;
                if let Some(slot) = &self.slot {
                    if let Some(bitmap) = &slot.dirty_bitmap {
                        bitmap.set(gpa_to_gfn(self.gpa) - slot.base_gfn);
                    }
                }
                Ok(())
            }
            None => vm.write_guest(self.gpa, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HeapMemory;
    use crate::slots::{MemFlags, MemoryRegion};
    use std::sync::Arc;

    const BASE: u64 = 0x7f00_0000_0000;

    fn vm_with_slot(flags: MemFlags) -> Vm {
        let vm = Vm::new(Arc::new(HeapMemory::new(BASE, 0x10000)));
        vm.set_memory_region(&MemoryRegion {
            slot: 0,
            flags,
            guest_phys_addr: 0,
            memory_size: 0x4000,
            userspace_addr: BASE,
        })
        .unwrap();
        vm
    }

    #[test]
    fn single_page_window_reads_and_writes_through() {
        let vm = vm_with_slot(MemFlags::empty());
        let mut cache = GpaCache::new(&vm, 0x1008, 16).unwrap();

        cache.write(&vm, b"cached").unwrap();
        let mut buf = [0u8; 6];
        vm.read_guest(0x1008, &mut buf).unwrap();
        assert_eq!(&buf, b"cached");

        let mut back = [0u8; 6];
        cache.read(&vm, &mut back).unwrap();
        assert_eq!(&back, b"cached");
    }

    #[test]
    fn cross_page_window_falls_back_to_guest_copies() {
        let vm = vm_with_slot(MemFlags::empty());
        let mut cache = GpaCache::new(&vm, 0xffc, 8).unwrap();
        assert!(cache.hva.is_none());

        cache.write(&vm, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 8];
        vm.read_guest(0xffc, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn unmapped_window_fails_resolution() {
        let vm = vm_with_slot(MemFlags::empty());
        assert_eq!(
            GpaCache::new(&vm, 0x10_0000, 8).unwrap_err(),
            TranslateError::NoSlot
        );
        // A window leaking past the slot end fails too.
        assert_eq!(
            GpaCache::new(&vm, 0x3ffc, 8).unwrap_err(),
            TranslateError::NoSlot
        );
    }

    #[test]
    fn writes_mark_the_cached_page_dirty() {
        let vm = vm_with_slot(MemFlags::LOG_DIRTY);
        let mut cache = GpaCache::new(&vm, 0x2000, 8).unwrap();
        cache.write(&vm, &[0xaa; 8]).unwrap();

        let mut log = vec![0u8; 8];
        assert!(vm.get_dirty_log(0, &mut log).unwrap());
        assert_eq!(log[0] & (1 << 2), 1 << 2);
    }
}
