//! Per-vCPU request flags and cross-processor kick plumbing.
//!
//! A request is a bit in an atomic word that a remote thread sets before
//! kicking the vCPU out of guest mode; the vCPU consumes requests at the
//! top of its run loop with [`Vcpu::check_request`]. The mode word tells
//! kickers whether an IPI is actually needed: a vCPU outside guest mode
//! will see the request on its next entry without one.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    /// Asynchronous work posted to a vCPU by another thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VcpuRequest: u32 {
        /// Flush this vCPU's TLB before re-entering the guest.
        const TLB_FLUSH = 1 << 0;
        /// Rebuild this vCPU's MMU context before re-entering the guest.
        const MMU_RELOAD = 1 << 1;
        /// Wake the vCPU from a halted state.
        const UNHALT = 1 << 2;
    }
}

/// Where a vCPU thread currently is relative to guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuestMode {
    /// Not running guest code; requests are picked up on the next entry.
    Outside = 0,
    /// Executing guest code.
    InGuest = 1,
    /// Kicked; on its way out of guest mode.
    Exiting = 2,
}

impl GuestMode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => GuestMode::InGuest,
            2 => GuestMode::Exiting,
            _ => GuestMode::Outside,
        }
    }
}

/// Delivers the actual cross-processor interrupt (or its emulation).
///
/// The coordinator decides *whether* a kick is needed; the kicker only has
/// to make the vCPU thread leave guest execution.
pub trait VcpuKick: Send + Sync {
    fn kick(&self, vcpu_id: u32, engine: i64);
}

impl<F: Fn(u32, i64) + Send + Sync> VcpuKick for F {
    fn kick(&self, vcpu_id: u32, engine: i64) {
        self(vcpu_id, engine)
    }
}

/// No-op kicker for vCPUs whose run loop polls requests anyway.
pub fn null_kick() -> Arc<dyn VcpuKick> {
    Arc::new(|_: u32, _: i64| {})
}

pub struct Vcpu {
    id: u32,
    requests: AtomicU32,
    mode: AtomicU8,
    /// Execution engine (physical CPU or worker slot) the vCPU last ran on,
    /// or -1 when descheduled.
    engine: AtomicI64,
    kicker: Arc<dyn VcpuKick>,
}

impl Vcpu {
    pub fn new(id: u32, kicker: Arc<dyn VcpuKick>) -> Self {
        Self {
            id,
            requests: AtomicU32::new(0),
            mode: AtomicU8::new(GuestMode::Outside as u8),
            engine: AtomicI64::new(-1),
            kicker,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Post a request without kicking. Broadcast paths kick separately so
    /// the flag is guaranteed visible before the IPI lands.
    pub fn make_request(&self, req: VcpuRequest) {
        self.requests.fetch_or(req.bits(), Ordering::SeqCst);
    }

    pub fn has_request(&self, req: VcpuRequest) -> bool {
        self.requests.load(Ordering::SeqCst) & req.bits() != 0
    }

    /// Consume a request: returns true and clears the bit if it was set.
    ///
    /// The cheap load first avoids the atomic RMW in the common no-request
    /// case on the run-loop hot path.
    pub fn check_request(&self, req: VcpuRequest) -> bool {
        if self.requests.load(Ordering::SeqCst) & req.bits() == 0 {
            return false;
        }
        self.requests.fetch_and(!req.bits(), Ordering::SeqCst) & req.bits() != 0
    }

    pub fn guest_mode(&self) -> GuestMode {
        GuestMode::from_raw(self.mode.load(Ordering::SeqCst))
    }

    /// Run-loop hook: the thread is about to execute guest code.
    pub fn enter_guest(&self) {
        self.mode.store(GuestMode::InGuest as u8, Ordering::SeqCst);
    }

    /// Run-loop hook: the thread has left guest code.
    pub fn exit_guest(&self) {
        self.mode.store(GuestMode::Outside as u8, Ordering::SeqCst);
    }

    pub fn schedule(&self, engine: i64) {
        self.engine.store(engine, Ordering::SeqCst);
    }

    pub fn deschedule(&self) {
        self.engine.store(-1, Ordering::SeqCst);
    }

    pub fn engine(&self) -> i64 {
        self.engine.load(Ordering::SeqCst)
    }

    /// Atomically flip InGuest to Exiting so at most one kicker sends the
    /// IPI; returns the mode observed before the flip.
    pub(crate) fn mode_for_kick(&self) -> GuestMode {
        match self.mode.compare_exchange(
            GuestMode::InGuest as u8,
            GuestMode::Exiting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(prev) | Err(prev) => GuestMode::from_raw(prev),
        }
    }

    pub(crate) fn kick(&self, engine: i64) {
        self.kicker.kick(self.id, engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn check_request_clears_only_the_consumed_bit() {
        let vcpu = Vcpu::new(0, null_kick());
        vcpu.make_request(VcpuRequest::TLB_FLUSH | VcpuRequest::UNHALT);

        assert!(vcpu.check_request(VcpuRequest::TLB_FLUSH));
        assert!(!vcpu.check_request(VcpuRequest::TLB_FLUSH));
        assert!(vcpu.has_request(VcpuRequest::UNHALT));
    }

    #[test]
    fn first_kicker_wins_the_mode_flip() {
        let vcpu = Vcpu::new(0, null_kick());
        vcpu.enter_guest();

        assert_eq!(vcpu.mode_for_kick(), GuestMode::InGuest);
        assert_eq!(vcpu.mode_for_kick(), GuestMode::Exiting);
        assert_eq!(vcpu.guest_mode(), GuestMode::Exiting);

        vcpu.exit_guest();
        assert_eq!(vcpu.mode_for_kick(), GuestMode::Outside);
    }

    #[test]
    fn closure_kicker_receives_id_and_engine() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let vcpu = Vcpu::new(7, Arc::new(move |id: u32, engine: i64| {
            assert_eq!(id, 7);
            assert_eq!(engine, 3);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        vcpu.schedule(3);
        vcpu.kick(vcpu.engine());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
