//! Host memory collaborator seam.
//!
//! The core translates guest physical addresses to host virtual addresses and
//! then needs the host environment to copy bytes at an HVA and to pin the
//! backing page frame for the duration of an access. [`HostMemory`] is that
//! seam; [`HeapMemory`] is an in-process reference backend with pin
//! accounting, poison injection and pass-through device windows, used by the
//! integration tests and by emulated-host setups.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::slots::{PAGE_SHIFT, PAGE_SIZE};

/// A host copy failed: the HVA is unmapped, poisoned, or otherwise
/// inaccessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("host memory fault at hva {hva:#x}")]
pub struct HostFault {
    pub hva: u64,
}

/// Why a pin attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PinError {
    /// The backing host page is marked defective.
    #[error("host page is poisoned")]
    Poisoned,
    /// Non-waiting mode was requested and the pin would have had to wait for
    /// host I/O.
    #[error("pin would block on host i/o")]
    WouldBlock,
    /// No resolvable host mapping.
    #[error("no host mapping for the address")]
    Fault,
}

/// A successfully pinned (or pass-through) host page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPin {
    /// Ordinary pageable RAM; must be released via [`HostMemory::unpin`].
    Ram(u64),
    /// Device pass-through frame: not pinned, never reference-counted and
    /// never marked dirty or accessed.
    Device(u64),
}

/// Host-environment primitives the core builds on.
///
/// Implementations must be callable from multiple vCPU threads concurrently.
pub trait HostMemory: Send + Sync {
    /// Copy host memory at `hva` into `dst`, faulting pages in as needed.
    fn read(&self, hva: u64, dst: &mut [u8]) -> Result<(), HostFault>;

    /// Copy `src` to host memory at `hva`, faulting pages in as needed.
    fn write(&self, hva: u64, src: &[u8]) -> Result<(), HostFault>;

    /// Non-blocking copy: fails instead of faulting a page in. Safe to call
    /// with other locks held.
    fn read_atomic(&self, hva: u64, dst: &mut [u8]) -> Result<(), HostFault>;

    /// Non-blocking attempt to pin the page containing `hva` writable.
    /// Returns the page frame number on success.
    fn pin_fast(&self, hva: u64) -> Option<u64>;

    /// Blocking pin of the page containing `hva`. With `nowait` the
    /// implementation gives up with [`PinError::WouldBlock`] rather than
    /// waiting for host I/O, signalling the caller to retry asynchronously.
    fn pin(&self, hva: u64, write: bool, nowait: bool) -> Result<HostPin, PinError>;

    /// Release one pin previously returned by [`Self::pin_fast`] or
    /// [`Self::pin`], optionally marking the page dirty and/or accessed
    /// first.
    fn unpin(&self, pfn: u64, dirty: bool, accessed: bool);
}

struct DeviceWindow {
    hva: u64,
    len: u64,
    base_pfn: u64,
}

/// In-process [`HostMemory`] backend backed by heap storage.
///
/// HVAs `[base, base + size)` map linearly onto the backing bytes; the page
/// frame number of an HVA is `hva >> PAGE_SHIFT`. Byte access is atomic so
/// concurrent guest-access paths are well-defined without extra locking.
pub struct HeapMemory {
    base: u64,
    bytes: Box<[AtomicU8]>,
    /// pfn -> outstanding pin count.
    pins: Mutex<HashMap<u64, usize>>,
    /// pfns whose backing is defective.
    poisoned: Mutex<HashSet<u64>>,
    /// pfns that require a blocking fault-in before access.
    swapped: Mutex<HashSet<u64>>,
    devices: Mutex<Vec<DeviceWindow>>,
    released_dirty: AtomicUsize,
    released_accessed: AtomicUsize,
}

impl HeapMemory {
    /// Create a backend spanning `[base, base + size)`. `base` must be
    /// page-aligned.
    pub fn new(base: u64, size: usize) -> Self {
        assert_eq!(base & (PAGE_SIZE - 1), 0, "base must be page-aligned");
        Self {
            base,
            bytes: (0..size).map(|_| AtomicU8::new(0)).collect(),
            pins: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
            swapped: Mutex::new(HashSet::new()),
            devices: Mutex::new(Vec::new()),
            released_dirty: AtomicUsize::new(0),
            released_accessed: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Mark the page containing `hva` defective: copies and pins fail with
    /// poison errors.
    pub fn poison(&self, hva: u64) {
        lock(&self.poisoned).insert(hva >> PAGE_SHIFT);
    }

    /// Mark the page containing `hva` non-resident: fast/atomic paths fail
    /// until a blocking access faults it back in.
    pub fn swap_out(&self, hva: u64) {
        lock(&self.swapped).insert(hva >> PAGE_SHIFT);
    }

    /// Register a pass-through device window outside the heap range. Pins
    /// inside it resolve to [`HostPin::Device`] frames starting at
    /// `base_pfn`.
    pub fn map_device(&self, hva: u64, len: u64, base_pfn: u64) {
        lock(&self.devices).push(DeviceWindow { hva, len, base_pfn });
    }

    /// Outstanding pins on the page containing `hva`.
    pub fn pin_count(&self, hva: u64) -> usize {
        lock(&self.pins)
            .get(&(hva >> PAGE_SHIFT))
            .copied()
            .unwrap_or(0)
    }

    /// Outstanding pins across all pages.
    pub fn total_pins(&self) -> usize {
        lock(&self.pins).values().sum()
    }

    /// How many pins were released with the dirty mark.
    pub fn released_dirty(&self) -> usize {
        self.released_dirty.load(Ordering::SeqCst)
    }

    /// How many pins were released with the accessed mark.
    pub fn released_accessed(&self) -> usize {
        self.released_accessed.load(Ordering::SeqCst)
    }

    fn offset(&self, hva: u64, len: usize) -> Result<usize, HostFault> {
        let start = hva.checked_sub(self.base).ok_or(HostFault { hva })?;
        let end = start.checked_add(len as u64).ok_or(HostFault { hva })?;
        if end > self.bytes.len() as u64 {
            return Err(HostFault { hva });
        }
        Ok(start as usize)
    }

    fn check_pages(&self, hva: u64, len: usize, fault_in: bool) -> Result<(), HostFault> {
        if len == 0 {
            return Ok(());
        }
        let first = hva >> PAGE_SHIFT;
        let last = (hva + len as u64 - 1) >> PAGE_SHIFT;
        let poisoned = lock(&self.poisoned);
        let mut swapped = lock(&self.swapped);
        for pfn in first..=last {
            if poisoned.contains(&pfn) {
                return Err(HostFault { hva });
            }
            if swapped.contains(&pfn) {
                if !fault_in {
                    return Err(HostFault { hva });
                }
                swapped.remove(&pfn);
            }
        }
        Ok(())
    }

    fn device_pin(&self, hva: u64) -> Option<u64> {
        let devices = lock(&self.devices);
        for dev in devices.iter() {
            if hva >= dev.hva && hva < dev.hva + dev.len {
                return Some(dev.base_pfn + ((hva - dev.hva) >> PAGE_SHIFT));
            }
        }
        None
    }

    fn copy(&self, hva: u64, dst: &mut [u8]) -> Result<(), HostFault> {
        let start = self.offset(hva, dst.len())?;
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.bytes[start + i].load(Ordering::Relaxed);
        }
        Ok(())
    }
}

impl HostMemory for HeapMemory {
    fn read(&self, hva: u64, dst: &mut [u8]) -> Result<(), HostFault> {
        self.check_pages(hva, dst.len(), true)?;
        self.copy(hva, dst)
    }

    fn write(&self, hva: u64, src: &[u8]) -> Result<(), HostFault> {
        self.check_pages(hva, src.len(), true)?;
        let start = self.offset(hva, src.len())?;
        for (i, byte) in src.iter().copied().enumerate() {
            self.bytes[start + i].store(byte, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_atomic(&self, hva: u64, dst: &mut [u8]) -> Result<(), HostFault> {
        self.check_pages(hva, dst.len(), false)?;
        self.copy(hva, dst)
    }

    fn pin_fast(&self, hva: u64) -> Option<u64> {
        let pfn = hva >> PAGE_SHIFT;
        self.offset(hva, 1).ok()?;
        if lock(&self.poisoned).contains(&pfn) || lock(&self.swapped).contains(&pfn) {
            return None;
        }
        *lock(&self.pins).entry(pfn).or_insert(0) += 1;
        Some(pfn)
    }

    fn pin(&self, hva: u64, _write: bool, nowait: bool) -> Result<HostPin, PinError> {
        if let Some(pfn) = self.device_pin(hva) {
            return Ok(HostPin::Device(pfn));
        }
        let pfn = hva >> PAGE_SHIFT;
        if self.offset(hva, 1).is_err() {
            return Err(PinError::Fault);
        }
        if lock(&self.poisoned).contains(&pfn) {
            return Err(PinError::Poisoned);
        }
        {
            let mut swapped = lock(&self.swapped);
            if swapped.contains(&pfn) {
                if nowait {
                    return Err(PinError::WouldBlock);
                }
                // The blocking path "waits for I/O": the page is resident
                // from here on.
                swapped.remove(&pfn);
            }
        }
        *lock(&self.pins).entry(pfn).or_insert(0) += 1;
        Ok(HostPin::Ram(pfn))
    }

    fn unpin(&self, pfn: u64, dirty: bool, accessed: bool) {
        if dirty {
            self.released_dirty.fetch_add(1, Ordering::SeqCst);
        }
        if accessed {
            self.released_accessed.fetch_add(1, Ordering::SeqCst);
        }
        let mut pins = lock(&self.pins);
        match pins.get_mut(&pfn) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&pfn);
            }
            None => debug_assert!(false, "unpin without a matching pin: pfn {pfn:#x}"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
