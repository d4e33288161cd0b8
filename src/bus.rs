//! Address-range-sorted I/O dispatch bus.
//!
//! One bus per address space (MMIO, port I/O). Each bus is an immutable,
//! published snapshot: registration copies the range list, inserts in sorted
//! position and swaps the new bus in under the VM's mutator lock, mirroring
//! the slot table's publish protocol. Dispatch binary-searches for the first
//! range containing the access and offers it to each containing range in
//! address order until a device accepts.

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

/// Fixed upper bound on devices per bus.
pub const MAX_BUS_DEVICES: usize = 1000;

/// Which bus an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// Memory-mapped I/O (guest physical addresses not backed by RAM).
    Mmio,
    /// Port I/O.
    Pio,
}

impl AddressSpace {
    pub(crate) const COUNT: usize = 2;

    pub(crate) fn index(self) -> usize {
        match self {
            AddressSpace::Mmio => 0,
            AddressSpace::Pio => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("i/o bus device capacity exceeded")]
    CapacityExceeded,
    #[error("device is not registered on this bus")]
    NotFound,
    #[error("no device claimed the access at {addr:#x} (+{len})")]
    Unsupported { addr: u64, len: u64 },
}

/// An emulated device registered on a bus.
///
/// A device reports accept/decline as a bare `bool`; declining lets the next
/// overlapping registration try.
pub trait IoDevice: Send + Sync {
    fn read(&self, addr: u64, data: &mut [u8]) -> bool;
    fn write(&self, addr: u64, data: &[u8]) -> bool;
}

#[derive(Clone)]
struct IoRange {
    addr: u64,
    len: u64,
    dev: Arc<dyn IoDevice>,
}

impl IoRange {
    fn end(&self) -> u64 {
        self.addr + self.len
    }

    /// `Equal` when the access `[addr, addr + len)` is contained in this
    /// range; otherwise orders the range against the access start/end.
    fn cmp_access(&self, addr: u64, len: u64) -> Ordering {
        if self.addr > addr {
            Ordering::Greater
        } else if self.end() < addr + len {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

/// Immutable, published snapshot of one address space's device registry.
#[derive(Clone, Default)]
pub struct IoBus {
    ranges: Vec<IoRange>,
}

impl IoBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.ranges.len()
    }

    /// Insert a registration in sorted position (ascending start address,
    /// then ascending end; insertion order on full ties).
    pub(crate) fn insert(
        &mut self,
        addr: u64,
        len: u64,
        dev: Arc<dyn IoDevice>,
    ) -> Result<(), BusError> {
        if self.ranges.len() >= MAX_BUS_DEVICES {
            return Err(BusError::CapacityExceeded);
        }
        let end = addr + len;
        let idx = self
            .ranges
            .partition_point(|r| (r.addr, r.end()) <= (addr, end));
        self.ranges.insert(idx, IoRange { addr, len, dev });
        Ok(())
    }

    pub(crate) fn remove(&mut self, dev: &Arc<dyn IoDevice>) -> Result<(), BusError> {
        let idx = self
            .ranges
            .iter()
            .position(|r| Arc::ptr_eq(&r.dev, dev))
            .ok_or(BusError::NotFound)?;
        self.ranges.remove(idx);
        Ok(())
    }

    /// First (leftmost) range containing the access, if any.
    fn first_candidate(&self, addr: u64, len: u64) -> Option<usize> {
        let mut idx = self
            .ranges
            .binary_search_by(|r| r.cmp_access(addr, len))
            .ok()?;
        while idx > 0 && self.ranges[idx - 1].cmp_access(addr, len) == Ordering::Equal {
            idx -= 1;
        }
        Some(idx)
    }

    fn dispatch(
        &self,
        addr: u64,
        len: u64,
        mut offer: impl FnMut(&dyn IoDevice) -> bool,
    ) -> Result<(), BusError> {
        if let Some(first) = self.first_candidate(addr, len) {
            for range in &self.ranges[first..] {
                if range.cmp_access(addr, len) != Ordering::Equal {
                    break;
                }
                if offer(&*range.dev) {
                    return Ok(());
                }
            }
        }
        Err(BusError::Unsupported { addr, len })
    }

    /// Offer a read to each containing range in address order until one
    /// accepts.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BusError> {
        self.dispatch(addr, data.len() as u64, |dev| dev.read(addr, data))
    }

    /// Offer a write to each containing range in address order until one
    /// accepts.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BusError> {
        self.dispatch(addr, data.len() as u64, |dev| dev.write(addr, data))
    }
}
