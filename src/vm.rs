//! The VM core: slot table ownership, guest access, I/O dispatch and
//! cross-processor coordination.
//!
//! Readers of the slot table and the I/O buses never take a lock across an
//! access: they clone the current `Arc` snapshot and work on that. Mutators
//! serialize on `slots_lock`, build a modified copy and swap it in; the old
//! snapshot is freed when the last in-flight reader drops its clone. A
//! published table therefore never changes underneath anyone.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::arch::{ArchHooks, NoopArch};
use crate::bus::{AddressSpace, BusError, IoBus, IoDevice};
use crate::dirty::{gpa_to_gfn, DirtyBitmap};
use crate::host::HostMemory;
use crate::slots::{
    MemFlags, MemSlots, MemoryRegion, MemorySlot, SlotChange, SlotError, MAX_SLOT_PAGES,
    MEM_SLOTS, PAGE_SHIFT, PAGE_SIZE, USER_MEM_SLOTS,
};
use crate::translate::{gfn_to_pfn_slot, slot_hva, PageFrame, PinRequest, TranslateError};
use crate::vcpu::{GuestMode, Vcpu, VcpuRequest};

/// Event counters. Monotonic; never reset.
#[derive(Debug, Default)]
pub struct VmStats {
    remote_tlb_flush: AtomicU64,
}

impl VmStats {
    /// Remote flush broadcasts that actually kicked at least one vCPU.
    pub fn remote_tlb_flushes(&self) -> u64 {
        self.remote_tlb_flush.load(Ordering::SeqCst)
    }
}

pub struct Vm {
    host: Arc<dyn HostMemory>,
    arch: Arc<dyn ArchHooks>,
    /// Serializes slot-table and bus mutation. Never held by readers.
    slots_lock: Mutex<()>,
    memslots: RwLock<Arc<MemSlots>>,
    buses: [RwLock<Arc<IoBus>>; AddressSpace::COUNT],
    vcpus: RwLock<Vec<Arc<Vcpu>>>,
    /// Flushes deferred by a paravirt guest; folded into the next broadcast.
    tlbs_dirty: AtomicU64,
    stats: VmStats,
}

impl Vm {
    pub fn new(host: Arc<dyn HostMemory>) -> Self {
        Self::with_arch(host, Arc::new(NoopArch))
    }

    pub fn with_arch(host: Arc<dyn HostMemory>, arch: Arc<dyn ArchHooks>) -> Self {
        Self {
            host,
            arch,
            slots_lock: Mutex::new(()),
            memslots: RwLock::new(Arc::new(MemSlots::new())),
            buses: [
                RwLock::new(Arc::new(IoBus::new())),
                RwLock::new(Arc::new(IoBus::new())),
            ],
            vcpus: RwLock::new(Vec::new()),
            tlbs_dirty: AtomicU64::new(0),
            stats: VmStats::default(),
        }
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub(crate) fn host(&self) -> &dyn HostMemory {
        &*self.host
    }

    /// The current slot table snapshot. Callers work on the returned `Arc`
    /// and never observe a partially applied mutation.
    pub fn memslots(&self) -> Arc<MemSlots> {
        read_lock(&self.memslots).clone()
    }

    /// Install a slot value (or just bump the generation) as a newly
    /// published table.
    fn publish(&self, new: Option<MemorySlot>) {
        let mut guard = write_lock(&self.memslots);
        let mut next = MemSlots::clone(&guard);
        let last = guard.generation();
        next.update(new, last);
        *guard = Arc::new(next);
    }

    /// Create, move, reflag or delete a memory slot.
    ///
    /// `memory_size == 0` deletes the slot. Size, backing address and the
    /// read-only flag are immutable once a slot exists; delete and recreate
    /// instead. A failure leaves the published table exactly as it was.
    pub fn set_memory_region(&self, region: &MemoryRegion) -> Result<(), SlotError> {
        let _mutator = mutex_lock(&self.slots_lock);

        if !MemFlags::USER_SETTABLE.contains(region.flags) {
            return Err(SlotError::InvalidFlags {
                flags: region.flags.bits(),
            });
        }
        let page_mask = PAGE_SIZE - 1;
        if region.guest_phys_addr & page_mask != 0
            || region.memory_size & page_mask != 0
            || region.userspace_addr & page_mask != 0
        {
            return Err(SlotError::Misaligned {
                gpa: region.guest_phys_addr,
                size: region.memory_size,
                hva: region.userspace_addr,
            });
        }
        if region.slot >= MEM_SLOTS {
            return Err(SlotError::InvalidId { id: region.slot });
        }
        if region
            .guest_phys_addr
            .checked_add(region.memory_size)
            .is_none()
        {
            return Err(SlotError::AddressWrap);
        }

        let base_gfn = region.guest_phys_addr >> PAGE_SHIFT;
        let npages = region.memory_size >> PAGE_SHIFT;
        if npages > MAX_SLOT_PAGES {
            return Err(SlotError::TooLarge {
                npages,
                limit: MAX_SLOT_PAGES,
            });
        }

        let slots = self.memslots();
        let old = slots.slot(region.slot).clone();

        let mut flags = region.flags;
        if npages == 0 {
            // A delete request's flags are meaningless.
            flags = MemFlags::empty();
        }

        let change = if npages == 0 {
            if old.is_empty() {
                return Ok(());
            }
            SlotChange::Delete
        } else if old.is_empty() {
            SlotChange::Create
        } else {
            if npages != old.npages
                || region.userspace_addr != old.userspace_addr
                || (flags ^ old.flags).contains(MemFlags::READ_ONLY)
            {
                return Err(SlotError::InvalidChange);
            }
            if base_gfn != old.base_gfn {
                SlotChange::Move
            } else if flags != old.flags {
                SlotChange::FlagsOnly
            } else {
                return Ok(());
            }
        };

        if change == SlotChange::Create || change == SlotChange::Move {
            for other in slots.iter() {
                if other.id == region.slot || other.id >= USER_MEM_SLOTS {
                    continue;
                }
                if base_gfn < other.base_gfn + other.npages
                    && other.base_gfn < base_gfn + npages
                {
                    return Err(SlotError::Overlap { id: other.id });
                }
            }
        }

        let mut new = MemorySlot {
            id: region.slot,
            base_gfn,
            npages,
            userspace_addr: region.userspace_addr,
            flags,
            dirty_bitmap: old.dirty_bitmap.clone(),
            arch: old.arch.clone(),
        };
        if change == SlotChange::Delete {
            new = MemorySlot::empty(region.slot);
        }
        if change == SlotChange::Create {
            new.dirty_bitmap = None;
            new.arch = None;
            self.arch.create_slot(&mut new)?;
        }
        if new.flags.contains(MemFlags::LOG_DIRTY) {
            if new.dirty_bitmap.is_none() {
                new.dirty_bitmap = Some(Arc::new(DirtyBitmap::new(npages)));
            }
        } else {
            new.dirty_bitmap = None;
        }

        // Phase 1 for delete and move: publish the old slot marked invalid
        // so translation stops resolving through it, then drop every cached
        // mapping derived from it. In-flight readers keep their snapshot;
        // the range going quiet only needs *new* lookups to miss.
        if change == SlotChange::Delete || change == SlotChange::Move {
            let mut invalid = old.clone();
            invalid.flags.insert(MemFlags::INVALID);
            self.publish(Some(invalid));
            self.arch.flush_shadow_slot(self, &old);
        }

        if let Err(err) = self.arch.prepare_region(self, &new, change) {
            // Back out: re-publish the original slot value so the failure
            // is invisible, and release anything the new value acquired.
            if change == SlotChange::Delete || change == SlotChange::Move {
                self.publish(Some(old));
            }
            if change == SlotChange::Create {
                self.arch.free_slot(&new);
            }
            return Err(err);
        }

        self.publish(Some(new.clone()));
        self.arch.commit_region(self, &old, &new, change);
        if change == SlotChange::Delete {
            self.arch.free_slot(&old);
        }

        debug!(
            slot = region.slot,
            ?change,
            base_gfn,
            npages,
            "memory region updated"
        );
        Ok(())
    }

    /// Copy a user slot's dirty bitmap into `buf` and report whether any
    /// page in it is dirty. The bitmap is not cleared; log rotation is the
    /// caller's (typically the architecture layer's) policy.
    pub fn get_dirty_log(&self, id: u16, buf: &mut [u8]) -> Result<bool, SlotError> {
        if id >= USER_MEM_SLOTS {
            return Err(SlotError::InvalidId { id });
        }
        let slots = self.memslots();
        let slot = slots.slot(id);
        let bitmap = slot
            .dirty_bitmap
            .as_ref()
            .ok_or(SlotError::NoDirtyLog { id })?;
        let need = bitmap.bytes();
        if buf.len() < need {
            return Err(SlotError::BufferTooSmall {
                got: buf.len(),
                need,
            });
        }
        bitmap.copy_to(&mut buf[..need]);
        // Compute from the copy, so the answer matches the returned bytes
        // even while writers keep setting bits.
        Ok(buf[..need].iter().any(|b| *b != 0))
    }

    fn mark_dirty_in_slot(slot: &MemorySlot, gfn: u64) {
        if let Some(bitmap) = &slot.dirty_bitmap {
            bitmap.set(gfn - slot.base_gfn);
        }
    }

    /// Mark the page at `gfn` dirty if its slot logs dirty pages.
    pub fn mark_page_dirty(&self, gfn: u64) {
        let slots = self.memslots();
        if let Some(slot) = slots.gfn_to_slot(gfn) {
            Self::mark_dirty_in_slot(slot, gfn);
        }
    }

    /// Whether `gfn` is backed by a user-visible, live slot.
    pub fn is_visible_gfn(&self, gfn: u64) -> bool {
        self.memslots().is_visible_gfn(gfn)
    }

    /// Host virtual address of `gfn` for writing. Fails on read-only slots.
    pub fn gfn_to_hva(&self, gfn: u64) -> Result<u64, TranslateError> {
        let slots = self.memslots();
        slot_hva(slots.gfn_to_slot(gfn), gfn, true)
    }

    /// Host virtual address of `gfn` for reading; read-only slots resolve.
    pub fn gfn_to_hva_read(&self, gfn: u64) -> Result<u64, TranslateError> {
        let slots = self.memslots();
        slot_hva(slots.gfn_to_slot(gfn), gfn, false)
    }

    /// Pin the frame behind `gfn` writable, blocking as needed.
    pub fn gfn_to_pfn(&self, gfn: u64) -> Result<PageFrame, TranslateError> {
        self.pin_gfn(
            gfn,
            PinRequest {
                atomic: false,
                nowait: false,
                write: true,
                want_writable: true,
            },
        )
    }

    /// Pin the frame behind `gfn` writable without blocking at all. Safe to
    /// call with other locks held.
    pub fn gfn_to_pfn_atomic(&self, gfn: u64) -> Result<PageFrame, TranslateError> {
        self.pin_gfn(
            gfn,
            PinRequest {
                atomic: true,
                nowait: false,
                write: true,
                want_writable: true,
            },
        )
    }

    /// Pin the frame behind `gfn` with an explicit access intent.
    /// `want_writable` asks for a writable mapping even on a read fault when
    /// one is cheaply available; [`PageFrame::writable`] reports the result.
    pub fn gfn_to_pfn_prot(
        &self,
        gfn: u64,
        write: bool,
        want_writable: bool,
    ) -> Result<PageFrame, TranslateError> {
        self.pin_gfn(
            gfn,
            PinRequest {
                atomic: false,
                nowait: false,
                write,
                want_writable,
            },
        )
    }

    /// Like [`Vm::gfn_to_pfn`] but gives up instead of waiting for host
    /// I/O; the caller retries asynchronously on
    /// [`TranslateError::WouldBlock`].
    pub fn gfn_to_pfn_nowait(&self, gfn: u64) -> Result<PageFrame, TranslateError> {
        self.pin_gfn(
            gfn,
            PinRequest {
                atomic: false,
                nowait: true,
                write: true,
                want_writable: true,
            },
        )
    }

    fn pin_gfn(&self, gfn: u64, req: PinRequest) -> Result<PageFrame, TranslateError> {
        let slots = self.memslots();
        gfn_to_pfn_slot(self.host(), slots.gfn_to_slot(gfn), gfn, req)
    }

    /// Release a pinned frame, optionally marking the host page dirty
    /// and/or accessed. Device pass-through frames carry no pin and are
    /// dropped as-is.
    pub fn release_page(&self, frame: PageFrame, dirty: bool, accessed: bool) {
        if frame.is_device() {
            return;
        }
        self.host.unpin(frame.pfn(), dirty, accessed);
    }

    /// Copy guest memory at `gpa` into `data`, spanning slots as needed.
    pub fn read_guest(&self, gpa: u64, data: &mut [u8]) -> Result<(), TranslateError> {
        self.for_each_segment(gpa, data.len(), |hva, start, len| {
            self.host
                .read(hva, &mut data[start..start + len])
                .map_err(|_| TranslateError::Fault)
        })
    }

    /// Copy `data` into guest memory at `gpa`, marking each touched page
    /// dirty.
    pub fn write_guest(&self, gpa: u64, data: &[u8]) -> Result<(), TranslateError> {
        self.guest_store(gpa, data.len(), |hva, len, start| {
            self.host
                .write(hva, &data[start..start + len])
                .map_err(|_| TranslateError::Fault)
        })
    }

    /// Zero `len` bytes of guest memory at `gpa`, marking each touched page
    /// dirty.
    pub fn clear_guest(&self, gpa: u64, len: usize) -> Result<(), TranslateError> {
        const ZERO: [u8; PAGE_SIZE as usize] = [0; PAGE_SIZE as usize];
        self.guest_store(gpa, len, |hva, len, _start| {
            self.host
                .write(hva, &ZERO[..len])
                .map_err(|_| TranslateError::Fault)
        })
    }

    /// Non-blocking read of guest memory: fails instead of faulting host
    /// pages in. Safe to call with other locks held.
    pub fn read_guest_atomic(&self, gpa: u64, data: &mut [u8]) -> Result<(), TranslateError> {
        self.for_each_segment(gpa, data.len(), |hva, start, len| {
            self.host
                .read_atomic(hva, &mut data[start..start + len])
                .map_err(|_| TranslateError::Fault)
        })
    }

    fn guest_store(
        &self,
        gpa: u64,
        len: usize,
        mut store: impl FnMut(u64, usize, usize) -> Result<(), TranslateError>,
    ) -> Result<(), TranslateError> {
        let slots = self.memslots();
        let mut gpa = gpa;
        let mut start = 0usize;
        let mut remaining = len;
        while remaining > 0 {
            let gfn = gpa_to_gfn(gpa);
            let offset = gpa & (PAGE_SIZE - 1);
            let seg = ((PAGE_SIZE - offset) as usize).min(remaining);
            let slot = slots.gfn_to_slot(gfn);
            let hva = slot_hva(slot, gfn, true)? + offset;
            store(hva, seg, start)?;
            if let Some(slot) = slot {
                Self::mark_dirty_in_slot(slot, gfn);
            }
            gpa += seg as u64;
            start += seg;
            remaining -= seg;
        }
        Ok(())
    }

    fn for_each_segment(
        &self,
        gpa: u64,
        len: usize,
        mut access: impl FnMut(u64, usize, usize) -> Result<(), TranslateError>,
    ) -> Result<(), TranslateError> {
        let slots = self.memslots();
        let mut gpa = gpa;
        let mut start = 0usize;
        let mut remaining = len;
        while remaining > 0 {
            let gfn = gpa_to_gfn(gpa);
            let offset = gpa & (PAGE_SIZE - 1);
            let seg = ((PAGE_SIZE - offset) as usize).min(remaining);
            let hva = slot_hva(slots.gfn_to_slot(gfn), gfn, false)? + offset;
            access(hva, start, seg)?;
            gpa += seg as u64;
            start += seg;
            remaining -= seg;
        }
        Ok(())
    }

    /// Register an emulated device for `[addr, addr + len)` on a bus.
    /// Overlapping registrations are legal; dispatch offers the access to
    /// each containing range in address order until one accepts.
    pub fn register_io_device(
        &self,
        space: AddressSpace,
        addr: u64,
        len: u64,
        dev: Arc<dyn IoDevice>,
    ) -> Result<(), BusError> {
        let _mutator = mutex_lock(&self.slots_lock);
        let bus = &self.buses[space.index()];
        let mut next = IoBus::clone(&read_lock(bus));
        next.insert(addr, len, dev)?;
        *write_lock(bus) = Arc::new(next);
        trace!(?space, addr, len, "i/o device registered");
        Ok(())
    }

    /// Unregister a device by identity (`Arc` pointer equality).
    pub fn unregister_io_device(
        &self,
        space: AddressSpace,
        dev: &Arc<dyn IoDevice>,
    ) -> Result<(), BusError> {
        let _mutator = mutex_lock(&self.slots_lock);
        let bus = &self.buses[space.index()];
        let mut next = IoBus::clone(&read_lock(bus));
        next.remove(dev)?;
        *write_lock(bus) = Arc::new(next);
        Ok(())
    }

    pub fn io_bus_read(
        &self,
        space: AddressSpace,
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), BusError> {
        let bus = read_lock(&self.buses[space.index()]).clone();
        bus.read(addr, data)
    }

    pub fn io_bus_write(
        &self,
        space: AddressSpace,
        addr: u64,
        data: &[u8],
    ) -> Result<(), BusError> {
        let bus = read_lock(&self.buses[space.index()]).clone();
        bus.write(addr, data)
    }

    pub fn add_vcpu(&self, vcpu: Arc<Vcpu>) {
        write_lock(&self.vcpus).push(vcpu);
    }

    pub fn vcpus(&self) -> Vec<Arc<Vcpu>> {
        read_lock(&self.vcpus).clone()
    }

    /// Post `req` to every vCPU and kick the ones currently executing guest
    /// code. Returns whether any vCPU was kicked.
    pub fn make_all_vcpus_request(&self, req: VcpuRequest) -> bool {
        let vcpus = read_lock(&self.vcpus);
        for vcpu in vcpus.iter() {
            vcpu.make_request(req);
        }
        // Order the request stores before the mode reads below; a vCPU that
        // enters guest mode after this point will see the request on entry.
        fence(Ordering::SeqCst);
        let mut kicked = false;
        for vcpu in vcpus.iter() {
            let engine = vcpu.engine();
            if engine != -1 && vcpu.mode_for_kick() == GuestMode::InGuest {
                vcpu.kick(engine);
                kicked = true;
            }
        }
        kicked
    }

    /// Broadcast a TLB flush to every vCPU, folding in any flushes the
    /// guest deferred since the last broadcast.
    pub fn flush_remote_tlbs(&self) {
        let deferred = self.tlbs_dirty.load(Ordering::SeqCst);
        // The deferred count must be sampled before the request is posted,
        // or a flush deferred concurrently could be absorbed without ever
        // being executed.
        fence(Ordering::SeqCst);
        if self.make_all_vcpus_request(VcpuRequest::TLB_FLUSH) {
            self.stats.remote_tlb_flush.fetch_add(1, Ordering::SeqCst);
        }
        // Only absorb the flushes we sampled; newer ones stay pending.
        let _ = self.tlbs_dirty.compare_exchange(
            deferred,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        trace!(deferred, "remote tlb flush");
    }

    /// Ask every vCPU to rebuild its MMU context before re-entering the
    /// guest.
    pub fn reload_remote_mmus(&self) {
        self.make_all_vcpus_request(VcpuRequest::MMU_RELOAD);
    }

    /// Record a flush the guest deferred; the next broadcast satisfies it.
    pub fn note_tlb_dirty(&self) {
        self.tlbs_dirty.fetch_add(1, Ordering::SeqCst);
    }

    /// Deferred flushes not yet absorbed by a broadcast.
    pub fn tlbs_dirty(&self) -> u64 {
        self.tlbs_dirty.load(Ordering::SeqCst)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HeapMemory;

    const BASE: u64 = 0x7f00_0000_0000;

    fn vm(size: usize) -> Vm {
        Vm::new(Arc::new(HeapMemory::new(BASE, size)))
    }

    fn region(slot: u16, gpa: u64, size: u64, hva: u64, flags: MemFlags) -> MemoryRegion {
        MemoryRegion {
            slot,
            flags,
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: hva,
        }
    }

    #[test]
    fn request_validation() {
        let vm = vm(0x10000);

        let mut bad = region(0, 0, 0x1000, BASE, MemFlags::empty());
        bad.flags = MemFlags::INVALID;
        assert!(matches!(
            vm.set_memory_region(&bad),
            Err(SlotError::InvalidFlags { .. })
        ));

        assert!(matches!(
            vm.set_memory_region(&region(0, 0x800, 0x1000, BASE, MemFlags::empty())),
            Err(SlotError::Misaligned { .. })
        ));
        assert!(matches!(
            vm.set_memory_region(&region(MEM_SLOTS, 0, 0x1000, BASE, MemFlags::empty())),
            Err(SlotError::InvalidId { .. })
        ));
        assert_eq!(
            vm.set_memory_region(&region(
                0,
                u64::MAX - 0xfff,
                0x2000,
                BASE,
                MemFlags::empty()
            )),
            Err(SlotError::AddressWrap)
        );
    }

    #[test]
    fn slots_are_immutable_in_size_and_backing() {
        let vm = vm(0x10000);
        vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::empty()))
            .unwrap();

        assert_eq!(
            vm.set_memory_region(&region(0, 0, 0x4000, BASE, MemFlags::empty())),
            Err(SlotError::InvalidChange)
        );
        assert_eq!(
            vm.set_memory_region(&region(0, 0, 0x2000, BASE + 0x1000, MemFlags::empty())),
            Err(SlotError::InvalidChange)
        );
        assert_eq!(
            vm.set_memory_region(&region(0, 0, 0x2000, BASE, MemFlags::READ_ONLY)),
            Err(SlotError::InvalidChange)
        );
    }

    #[test]
    fn identical_reregister_is_a_no_op() {
        let vm = vm(0x10000);
        let r = region(0, 0, 0x2000, BASE, MemFlags::empty());
        vm.set_memory_region(&r).unwrap();
        let generation = vm.memslots().generation();

        vm.set_memory_region(&r).unwrap();
        assert_eq!(vm.memslots().generation(), generation);
    }

    #[test]
    fn deferred_flushes_are_absorbed_by_a_broadcast() {
        let vm = vm(0x1000);
        vm.note_tlb_dirty();
        vm.note_tlb_dirty();
        assert_eq!(vm.tlbs_dirty(), 2);

        vm.flush_remote_tlbs();
        assert_eq!(vm.tlbs_dirty(), 0);
    }
}
