//! Guest physical memory core for a virtual machine monitor.
//!
//! This crate owns the machinery between a guest physical address and the
//! host memory behind it:
//! - A fixed table of memory slots, each mapping a run of guest pages onto a
//!   host virtual range, replaced atomically as a whole so readers never see
//!   a half-applied change
//! - Translation from guest page numbers to host addresses and pinned page
//!   frames, with non-blocking and non-waiting pinning modes
//! - Per-slot dirty page tracking for live migration style consumers
//! - Address-sorted I/O buses dispatching MMIO and port accesses to emulated
//!   devices
//! - Cross-processor request bits and the kick/flush coordination built on
//!   them
//!
//! The host environment (how bytes are actually copied and pages actually
//! pinned) and the architecture layer (shadow paging state tied to slots)
//! plug in through the [`HostMemory`] and [`ArchHooks`] seams.

#![forbid(unsafe_code)]

mod arch;
mod bus;
mod cache;
mod dirty;
mod host;
mod slots;
mod translate;
mod vcpu;
mod vm;

pub use arch::{ArchHooks, NoopArch, SlotData};
pub use bus::{AddressSpace, BusError, IoBus, IoDevice, MAX_BUS_DEVICES};
pub use cache::GpaCache;
pub use dirty::{bitmap_bytes, DirtyBitmap};
pub use host::{HeapMemory, HostFault, HostMemory, HostPin, PinError};
pub use slots::{
    MemFlags, MemSlots, MemoryRegion, MemorySlot, SlotChange, SlotError, MAX_SLOT_PAGES,
    MEM_SLOTS, PAGE_SHIFT, PAGE_SIZE, PRIVATE_MEM_SLOTS, USER_MEM_SLOTS,
};
pub use translate::{PageFrame, TranslateError};
pub use vcpu::{null_kick, GuestMode, Vcpu, VcpuKick, VcpuRequest};
pub use vm::{Vm, VmStats};
