use std::cell::UnsafeCell;
use std::fmt;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::histogram::PathHistogram;
use crate::metrics::{MetricValues, ThreadCounters, MAX_METRICS};
use crate::trace::TraceFile;
use crate::trigger::ThreadArm;
use crate::unwind::BaseDepth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadLifecycle {
    Uninitialized = 0,
    Initializing = 1,
    Active = 2,
    /// Active, with samples currently being dropped.
    Suspended = 3,
    Finalizing = 4,
    Finalized = 5,
}

impl ThreadLifecycle {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ThreadLifecycle::Initializing,
            2 => ThreadLifecycle::Active,
            3 => ThreadLifecycle::Suspended,
            4 => ThreadLifecycle::Finalizing,
            5 => ThreadLifecycle::Finalized,
            _ => ThreadLifecycle::Uninitialized,
        }
    }
}

impl fmt::Display for ThreadLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadLifecycle::Uninitialized => "uninitialized",
            ThreadLifecycle::Initializing => "initializing",
            ThreadLifecycle::Active => "active",
            ThreadLifecycle::Suspended => "suspended",
            ThreadLifecycle::Finalizing => "finalizing",
            ThreadLifecycle::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Default)]
pub struct SampleCounters {
    pub taken: AtomicU64,
    pub accepted: AtomicU64,
    pub dropped_reentrant: AtomicU64,
    pub dropped_suspended: AtomicU64,
    pub histogram_overflows: AtomicU64,
}

impl SampleCounters {
    pub fn snapshot(&self) -> SampleStats {
        SampleStats {
            taken: self.taken.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_reentrant: self.dropped_reentrant.load(Ordering::Relaxed),
            dropped_suspended: self.dropped_suspended.load(Ordering::Relaxed),
            histogram_overflows: self.histogram_overflows.load(Ordering::Relaxed),
        }
    }
}

/// Counter values of one thread. Every sample taken is either accepted or
/// dropped for exactly one reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub taken: u64,
    pub accepted: u64,
    pub dropped_reentrant: u64,
    pub dropped_suspended: u64,
    /// Accepted samples whose stack did not fit the histogram. They are
    /// charged to their context only.
    pub histogram_overflows: u64,
}

impl SampleStats {
    pub fn is_conserved(&self) -> bool {
        self.taken == self.accepted + self.dropped_reentrant + self.dropped_suspended
    }
}

pub struct SlotData {
    pub previous: MetricValues,
    pub start_us: u64,
    pub previous_sample_us: u64,
    pub histogram: Option<PathHistogram>,
    pub trace: Option<TraceFile>,
    pub counters: ThreadCounters,
    pub arm: ThreadArm,
}

impl SlotData {
    fn new() -> Self {
        SlotData {
            previous: [0.0; MAX_METRICS],
            start_us: 0,
            previous_sample_us: 0,
            histogram: None,
            trace: None,
            counters: ThreadCounters::empty(),
            arm: ThreadArm::None,
        }
    }
}

pub struct ThreadSlot {
    lifecycle: AtomicU8,
    suspend_depth: AtomicU32,
    handler_depth: AtomicU32,
    overflow_fd: AtomicI32,
    pub counters: SampleCounters,
    pub base_depth: BaseDepth,
    data: UnsafeCell<SlotData>,
}

// SAFETY: `data` is only reached through `data_mut`, whose callers follow
// its ownership rules; everything else is atomic.
unsafe impl Sync for ThreadSlot {}
unsafe impl Send for ThreadSlot {}

impl ThreadSlot {
    pub fn new() -> Self {
        ThreadSlot {
            lifecycle: AtomicU8::new(ThreadLifecycle::Uninitialized as u8),
            suspend_depth: AtomicU32::new(0),
            handler_depth: AtomicU32::new(0),
            overflow_fd: AtomicI32::new(-1),
            counters: SampleCounters::default(),
            base_depth: BaseDepth::new(),
            data: UnsafeCell::new(SlotData::new()),
        }
    }

    pub fn lifecycle(&self) -> ThreadLifecycle {
        match ThreadLifecycle::from_raw(self.lifecycle.load(Ordering::SeqCst)) {
            ThreadLifecycle::Active if self.is_suspended() => ThreadLifecycle::Suspended,
            lifecycle => lifecycle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == ThreadLifecycle::Active as u8
    }

    pub fn set_lifecycle(&self, lifecycle: ThreadLifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    pub fn transition(&self, from: ThreadLifecycle, to: ThreadLifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // Suspension is read by handlers on the same thread, SeqCst keeps the
    // compiler from moving slot accesses across it.
    pub fn is_suspended(&self) -> bool {
        self.suspend_depth.load(Ordering::SeqCst) > 0
    }

    pub fn suspend(&self) {
        self.suspend_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let _ = self
            .suspend_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }

    /// Marks a handler as running on this slot until the guard drops.
    pub fn enter_handler(&self) -> HandlerGuard<'_> {
        self.handler_depth.fetch_add(1, Ordering::SeqCst);
        HandlerGuard { slot: self }
    }

    /// Spins until no handler runs on this slot. Only meaningful once the
    /// slot has left `Active`, so no new handler can start processing.
    pub fn wait_for_handlers(&self) {
        while self.handler_depth.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    pub fn overflow_fd(&self) -> Option<c_int> {
        let fd = self.overflow_fd.load(Ordering::Relaxed);
        (fd >= 0).then_some(fd)
    }

    pub fn set_overflow_fd(&self, fd: Option<c_int>) {
        self.overflow_fd.store(fd.unwrap_or(-1), Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// The caller must be the owning thread (in normal context with the slot
    /// not `Active`, or holding both a handler guard and the suspension), or
    /// a finalizer that moved the slot out of `Active` and waited for
    /// handlers.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut SlotData {
        &mut *self.data.get()
    }
}

impl Default for ThreadSlot {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HandlerGuard<'a> {
    slot: &'a ThreadSlot,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.slot.handler_depth.fetch_sub(1, Ordering::SeqCst);
    }
}
