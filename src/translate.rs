//! Guest physical address translation and page pinning.
//!
//! Translation happens in two steps: the slot table maps a guest page number
//! to a host virtual address, then the host environment pins the backing
//! frame. Pinning has a non-blocking fast path and a blocking slow path with
//! an optional non-waiting mode; see [`crate::HostMemory`].

use thiserror::Error;

use crate::host::{HostMemory, HostPin, PinError};
use crate::slots::MemorySlot;

/// Per-access translation failure. Always recoverable by the caller; never
/// fatal to the slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("no memory slot covers the guest address")]
    NoSlot,
    #[error("write access to a read-only memory slot")]
    ReadOnlyViolation,
    #[error("host page is poisoned")]
    Poisoned,
    #[error("unresolvable host mapping")]
    Fault,
    #[error("host page not resident; retry the access asynchronously")]
    WouldBlock,
}

/// A resolved, pinned guest page frame.
///
/// Move-only: the pin is released exactly once via
/// [`crate::Vm::release_page`]. Device frames are pass-through and carry no
/// pin.
#[derive(Debug)]
#[must_use = "a pinned frame must be released exactly once"]
pub struct PageFrame {
    pub(crate) pfn: u64,
    pub(crate) writable: bool,
    pub(crate) device: bool,
}

impl PageFrame {
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// Whether the host mapping behind this frame is writable. May be `true`
    /// for a read request when a writable mapping was cheaply available;
    /// callers treat that as an optimization, never a requirement.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Device pass-through frames are never reference-counted and never
    /// marked dirty or accessed.
    pub fn is_device(&self) -> bool {
        self.device
    }
}

/// Pinning policy for one translation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PinRequest {
    /// The caller cannot block at all; fail instead.
    pub atomic: bool,
    /// The slow path may run but must not wait for host I/O.
    pub nowait: bool,
    /// The access intends to write.
    pub write: bool,
    /// A writable mapping is welcome even for a read access.
    pub want_writable: bool,
}

/// Resolve `gfn` to a host virtual address through `slot`.
///
/// `None`, invalid (mid-teardown) slots and out-of-slot gfns all translate
/// to [`TranslateError::NoSlot`].
pub(crate) fn slot_hva(
    slot: Option<&MemorySlot>,
    gfn: u64,
    write: bool,
) -> Result<u64, TranslateError> {
    let slot = slot.ok_or(TranslateError::NoSlot)?;
    if slot.is_invalid() || !slot.contains(gfn) {
        return Err(TranslateError::NoSlot);
    }
    if write && slot.is_read_only() {
        return Err(TranslateError::ReadOnlyViolation);
    }
    Ok(slot.hva_for(gfn))
}

/// Pin the host page behind `hva` per the request policy.
pub(crate) fn hva_to_pfn(
    host: &dyn HostMemory,
    hva: u64,
    req: PinRequest,
) -> Result<PageFrame, TranslateError> {
    // Fast pin a writable frame, but only when the caller cannot block (or
    // prefers not to) and the access either needs or welcomes a writable
    // mapping.
    if (req.atomic || req.nowait) && (req.write || req.want_writable) {
        if let Some(pfn) = host.pin_fast(hva) {
            return Ok(PageFrame {
                pfn,
                writable: true,
                device: false,
            });
        }
    }

    if req.atomic {
        return Err(TranslateError::Fault);
    }

    match host.pin(hva, req.write, req.nowait) {
        Ok(HostPin::Ram(pfn)) => {
            // Map a read fault as writable when that is cheaply possible.
            if !req.write && req.want_writable {
                if let Some(wpfn) = host.pin_fast(hva) {
                    host.unpin(pfn, false, false);
                    return Ok(PageFrame {
                        pfn: wpfn,
                        writable: true,
                        device: false,
                    });
                }
            }
            Ok(PageFrame {
                pfn,
                writable: req.write,
                device: false,
            })
        }
        Ok(HostPin::Device(pfn)) => Ok(PageFrame {
            pfn,
            writable: req.write,
            device: true,
        }),
        Err(PinError::Poisoned) => Err(TranslateError::Poisoned),
        Err(PinError::WouldBlock) => Err(TranslateError::WouldBlock),
        Err(PinError::Fault) => Err(TranslateError::Fault),
    }
}

/// Full slot-level translation: gfn -> hva -> pinned frame.
pub(crate) fn gfn_to_pfn_slot(
    host: &dyn HostMemory,
    slot: Option<&MemorySlot>,
    gfn: u64,
    mut req: PinRequest,
) -> Result<PageFrame, TranslateError> {
    let hva = slot_hva(slot, gfn, req.write)?;
    // A read-only slot must never produce a writable mapping.
    if slot.is_some_and(|s| s.is_read_only()) {
        req.want_writable = false;
    }
    hva_to_pfn(host, hva, req)
}
