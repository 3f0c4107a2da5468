use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::metrics::{compute_deltas, realtime_us, wall_clock_us, MAX_METRICS};
use crate::perf_events::rearm;
use crate::sampler::Sampler;
use crate::state::{SlotData, ThreadSlot};
use crate::thread::{current_thread_id, inside_library_depth};
use crate::timers::{CostCenterId, MAX_STACK_DEPTH};
use crate::trace::TraceRecord;
use crate::trigger::chain_previous;
use crate::unwind::StackKey;
use crate::util::program_counter;

static ACTIVE: AtomicPtr<Sampler> = AtomicPtr::new(ptr::null_mut());
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Makes `sampler` the target of sampling signals. Fails if another
/// sampler is attached.
pub(crate) fn attach(sampler: &Arc<Sampler>) -> bool {
    let target = Arc::as_ptr(sampler) as *mut Sampler;
    match ACTIVE.compare_exchange(ptr::null_mut(), target, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => true,
        Err(current) => current == target,
    }
}

/// Detaches `sampler` if it is attached and waits for running handlers.
pub(crate) fn detach(sampler: &Sampler) {
    let target = sampler as *const Sampler as *mut Sampler;
    if ACTIVE
        .compare_exchange(target, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }
}

pub(crate) fn is_attached(sampler: &Sampler) -> bool {
    ptr::eq(ACTIVE.load(Ordering::SeqCst), sampler)
}

pub(crate) extern "C" fn on_signal(signal: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let saved = errno::errno();

    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let sampler = ACTIVE.load(Ordering::SeqCst);
    if !sampler.is_null() {
        // SAFETY: `detach` waits for IN_FLIGHT to drain before the sampler
        // can be released.
        let sampler = unsafe { &*sampler };
        let pc = unsafe { program_counter(ucontext) }.unwrap_or(0);
        sampler.handle_sample(pc);
        sampler.rearm_overflow();
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);

    chain_previous(signal, info, ucontext);
    errno::set_errno(saved);
}

impl Sampler {
    /// Processes or drops one sample taken on the calling thread.
    pub(crate) fn handle_sample(&self, pc: u64) {
        let Some(thread) = current_thread_id() else {
            self.unregistered_samples.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let slot = &self.slots[thread];
        let counters = &slot.counters;
        // Entered before counting so a finalizer waiting on this slot sees
        // every taken sample resolved.
        let _handler = slot.enter_handler();
        counters.taken.fetch_add(1, Ordering::Relaxed);

        if !slot.is_active() {
            counters.dropped_suspended.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !self.enabled.load(Ordering::Relaxed)
            || (inside_library_depth() > 0 && !self.config.sample_inside_library)
        {
            counters.dropped_reentrant.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if slot.is_suspended() {
            counters.dropped_suspended.fetch_add(1, Ordering::Relaxed);
            return;
        }

        slot.suspend();
        // SAFETY: this is the owning thread, the slot is active and nested
        // samples are dropped while the suspension is held.
        let data = unsafe { slot.data_mut() };
        self.record_sample(thread, slot, data, pc);
        counters.accepted.fetch_add(1, Ordering::Relaxed);
        slot.resume();
    }

    fn record_sample(&self, thread: usize, slot: &ThreadSlot, data: &mut SlotData, pc: u64) {
        let metric_count = self.metrics.len();
        let mut current = [0.0; MAX_METRICS];
        let mut deltas = [0.0; MAX_METRICS];
        self.metrics.read(&data.counters, &mut current);
        compute_deltas(
            metric_count,
            &current,
            &data.previous,
            self.metrics.source_index(),
            self.config.period,
            &mut deltas,
        );
        data.previous = current;
        let deltas = &deltas[..metric_count];

        let frame = self.timers.current_cost_center(thread);
        let context = frame.map_or(self.placeholder, |frame| frame.sampling_context());

        let mut key = StackKey::empty();
        match &self.unwinder {
            Some(unwinder) => unwinder.unwind(pc, &slot.base_depth, &mut key),
            None => {
                key.push(pc);
            }
        }

        if let Some(trace) = &data.trace {
            let now = wall_clock_us() as u64;
            trace.write_record(&TraceRecord {
                timestamp: realtime_us() as u64,
                delta_begin: data.previous_sample_us.saturating_sub(data.start_us),
                delta_end: now.saturating_sub(data.start_us),
                metrics: deltas,
                callpath_id: context.index(),
                pcs: key.as_slice(),
            });
            data.previous_sample_us = now;
        }

        if !self.config.profile {
            return;
        }
        let Some(histogram) = data.histogram.as_mut() else {
            return;
        };

        let target = self.runtime_state_context(thread).unwrap_or(context);
        if !histogram.accumulate(target, &key, deltas).is_recorded() {
            slot.counters
                .histogram_overflows
                .fetch_add(1, Ordering::Relaxed);
        }

        if !self.config.inclusive {
            return;
        }
        // Enclosing contexts get an empty-key observation each, once per
        // sample even under recursion.
        let empty = StackKey::empty();
        let mut charged = [target; MAX_STACK_DEPTH + 2];
        charged[1] = context;
        let mut charged_len = 2;
        let mut enclosing = frame.and_then(|frame| self.timers.parent(&frame));
        while let Some(parent) = enclosing {
            let parent_context = parent.sampling_context();
            if charged_len < charged.len() && !charged[..charged_len].contains(&parent_context) {
                charged[charged_len] = parent_context;
                charged_len += 1;
                if !histogram.accumulate(parent_context, &empty, deltas).is_recorded() {
                    slot.counters
                        .histogram_overflows
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            enclosing = self.timers.parent(&parent);
        }
    }

    fn runtime_state_context(&self, thread: usize) -> Option<CostCenterId> {
        if self.state_cost_centers.is_empty() {
            return None;
        }
        let state = self.runtime.current_state(thread)?;
        self.state_cost_centers.get(state.index()).copied()
    }

    /// Re-enables the calling thread's overflow counter after a sample.
    pub(crate) fn rearm_overflow(&self) {
        if let Some(fd) = current_thread_id().and_then(|thread| self.slots[thread].overflow_fd()) {
            rearm(fd);
        }
    }
}
