use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use lazy_static::lazy_static;
use tracing::{debug, info, span, warn, Level};

use crate::callsite::{AddressKind, CallSiteCache};
use crate::config::SamplerConfig;
use crate::error::SamplerError;
use crate::finalize::{Candidate, Collapser};
use crate::handler::{self, on_signal};
use crate::histogram::{Accumulator, PathHistogram};
use crate::metrics::{wall_clock_us, MetricSet};
use crate::runtime_state::{RuntimeEventSource, RuntimeState};
use crate::state::{SampleStats, ThreadLifecycle, ThreadSlot};
use crate::symbols::{BlazeResolver, SymbolResolver};
use crate::thread::{current_thread_id, register_current_thread, LibraryGuard, MAX_THREADS};
use crate::timers::{CostCenterId, CostCenterKind, CostCenterRegistry, TimerContext};
use crate::trace::{definitions_path, scan_raw_trace, write_definitions, TraceFile};
use crate::trigger::{TimerMode, Trigger};
use crate::unwind::{
    BacktraceWalker, FrameClassifier, FrameWalker, InterruptedPcClassifier, StackKey, Unwinder,
};
use crate::util::arch::{architecture, Architecture};
use crate::util::program_counter;

/// Context of samples taken outside every timer.
pub const PLACEHOLDER_NAME: &str = ".application";

lazy_static! {
    static ref INSTALLED: Mutex<Option<Arc<Sampler>>> = Mutex::new(None);
}

static EXIT_HOOK: Once = Once::new();

extern "C" fn finalize_at_exit() {
    let sampler = match INSTALLED.lock() {
        Ok(mut installed) => installed.take(),
        Err(_) => None,
    };
    if let Some(sampler) = sampler {
        sampler.finalize();
    }
}

pub struct SamplerBuilder {
    config: SamplerConfig,
    timers: Option<Arc<dyn TimerContext>>,
    resolver: Option<Arc<dyn SymbolResolver>>,
    walker: Option<Box<dyn FrameWalker>>,
    classifier: Option<Box<dyn FrameClassifier>>,
    runtime: Option<RuntimeEventSource>,
}

impl SamplerBuilder {
    pub fn new(config: SamplerConfig) -> Self {
        SamplerBuilder {
            config,
            timers: None,
            resolver: None,
            walker: None,
            classifier: None,
            runtime: None,
        }
    }

    pub fn timers(mut self, timers: Arc<dyn TimerContext>) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn walker(mut self, walker: Box<dyn FrameWalker>) -> Self {
        self.walker = Some(walker);
        self
    }

    pub fn classifier(mut self, classifier: Box<dyn FrameClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn runtime(mut self, runtime: RuntimeEventSource) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Arc<Sampler>, SamplerError> {
        let config = self.config;
        config.validate()?;
        if !config.enabled {
            return Err(SamplerError::Disabled);
        }

        let metrics = MetricSet::resolve(&config.metrics, &config.source)?;
        let timers = self
            .timers
            .unwrap_or_else(|| Arc::new(CostCenterRegistry::new()));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(BlazeResolver::new()));
        let callsites = CallSiteCache::new(resolver, config.keep_unresolved_addr);

        let unwinder = config.unwind.then(|| {
            Unwinder::new(
                self.walker.unwrap_or_else(|| Box::new(BacktraceWalker)),
                self.classifier
                    .unwrap_or_else(|| Box::new(InterruptedPcClassifier)),
                config.unwind_depth,
            )
        });

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None if config.track_runtime_states => RuntimeEventSource::probe(),
            None => RuntimeEventSource::None,
        };

        let placeholder = timers.create_or_get_named_cost_center(
            PLACEHOLDER_NAME,
            CostCenterKind::Placeholder,
            "USER",
        );
        let state_cost_centers = match (&runtime, config.track_runtime_states) {
            (RuntimeEventSource::None, true) => {
                warn!("runtime state tracking requested but no runtime interface is available");
                Vec::new()
            }
            (_, true) => RuntimeState::ALL
                .iter()
                .map(|state| {
                    timers.create_or_get_named_cost_center(
                        &state.cost_center_name(),
                        CostCenterKind::RuntimeState,
                        "OpenMP",
                    )
                })
                .collect(),
            (_, false) => Vec::new(),
        };

        debug!(
            "sampler built: source {}, period {}, metrics {:?}, unwind {}",
            config.source,
            config.period,
            metrics.names().collect::<Vec<_>>(),
            config.unwind
        );
        if architecture() == Architecture::Other {
            warn!("interrupted program counters are not available on this architecture, samples carry no address");
        }

        Ok(Arc::new(Sampler {
            trigger: Trigger::new(&config),
            metrics,
            timers,
            callsites,
            unwinder,
            runtime,
            slots: (0..MAX_THREADS).map(|_| ThreadSlot::new()).collect(),
            placeholder,
            state_cost_centers,
            enabled: AtomicBool::new(true),
            unregistered_samples: AtomicU64::new(0),
            installed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            shared_timer_armed: AtomicBool::new(false),
            pid: std::process::id(),
            config,
        }))
    }
}

pub struct Sampler {
    pub(crate) config: SamplerConfig,
    pub(crate) metrics: MetricSet,
    pub(crate) timers: Arc<dyn TimerContext>,
    pub(crate) callsites: CallSiteCache,
    pub(crate) unwinder: Option<Unwinder>,
    pub(crate) runtime: RuntimeEventSource,
    pub(crate) trigger: Trigger,
    pub(crate) slots: Box<[ThreadSlot]>,
    pub(crate) placeholder: CostCenterId,
    pub(crate) state_cost_centers: Vec<CostCenterId>,
    pub(crate) enabled: AtomicBool,
    pub(crate) unregistered_samples: AtomicU64,
    installed: AtomicBool,
    finalized: AtomicBool,
    shared_timer_armed: AtomicBool,
    pid: u32,
}

impl Sampler {
    pub fn builder(config: SamplerConfig) -> SamplerBuilder {
        SamplerBuilder::new(config)
    }

    pub fn new(config: SamplerConfig) -> Result<Arc<Self>, SamplerError> {
        SamplerBuilder::new(config).build()
    }

    /// Installs the signal handler, attaches this sampler to it and
    /// registers the exit hook. Idempotent.
    pub fn install(self: &Arc<Self>) -> Result<(), SamplerError> {
        let _guard = LibraryGuard::enter();
        if self.installed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.finalized.load(Ordering::SeqCst) {
            return Err(SamplerError::Disabled);
        }

        if self.trigger.signal().is_some() {
            self.trigger.install_handler(on_signal)?;
            if !handler::attach(self) {
                return Err(SamplerError::AlreadyInstalled);
            }
        }

        {
            let mut installed = INSTALLED.lock().expect("lock");
            if installed.is_none() {
                *installed = Some(Arc::clone(self));
            }
        }
        EXIT_HOOK.call_once(|| {
            if unsafe { libc::atexit(finalize_at_exit) } != 0 {
                warn!("could not register the exit hook, call finalize explicitly");
            }
        });

        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Starts sampling on the calling thread and returns its thread id.
    /// Initializing an active thread again is a no-op.
    pub fn init_thread(self: &Arc<Self>) -> Result<usize, SamplerError> {
        let _guard = LibraryGuard::enter();
        if self.finalized.load(Ordering::SeqCst) {
            return Err(SamplerError::Disabled);
        }
        let thread = register_current_thread()?;
        let slot = &self.slots[thread];

        match slot.lifecycle() {
            ThreadLifecycle::Uninitialized => {}
            ThreadLifecycle::Finalizing | ThreadLifecycle::Finalized => {
                return Err(SamplerError::ThreadFinalized(thread));
            }
            lifecycle => {
                warn!("thread {} already initialized ({})", thread, lifecycle);
                return Ok(thread);
            }
        }
        if !slot.transition(ThreadLifecycle::Uninitialized, ThreadLifecycle::Initializing) {
            return Ok(thread);
        }

        match self.setup_thread(thread, slot) {
            Ok(()) => self.activate(thread, slot),
            Err(e) => {
                self.teardown_thread(slot);
                slot.set_lifecycle(ThreadLifecycle::Uninitialized);
                self.diagnostic(&format!("thread {} initialization failed: {}", thread, e));
                Err(e)
            }
        }
    }

    /// Moves a set-up slot to `Active`. A global finalize that ran during
    /// setup skipped the slot, so it is torn down here instead.
    fn activate(&self, thread: usize, slot: &ThreadSlot) -> Result<usize, SamplerError> {
        slot.set_lifecycle(ThreadLifecycle::Active);
        if self.finalized.load(Ordering::SeqCst) {
            if slot.transition(ThreadLifecycle::Active, ThreadLifecycle::Finalizing) {
                slot.wait_for_handlers();
                self.teardown_thread(slot);
                slot.set_lifecycle(ThreadLifecycle::Finalized);
            }
            return Err(SamplerError::Disabled);
        }
        debug!("sampling started on thread {}", thread);
        Ok(thread)
    }

    fn setup_thread(self: &Arc<Self>, thread: usize, slot: &ThreadSlot) -> Result<(), SamplerError> {
        self.install()?;
        self.trigger.check_handler(on_signal)?;

        // SAFETY: the slot is `Initializing` and owned by this thread, the
        // handler drops every sample until it becomes `Active`.
        let data = unsafe { slot.data_mut() };

        data.counters = self.metrics.open_thread_counters(self.config.period)?;
        let overflow_fd = self
            .metrics
            .source_index()
            .and_then(|index| data.counters.fd(index));
        slot.set_overflow_fd(overflow_fd);

        data.histogram = self
            .config
            .profile
            .then(|| PathHistogram::with_capacity(self.config.histogram_capacity));
        data.trace = if self.config.trace {
            Some(TraceFile::create(&self.config.trace_dir, self.pid, thread)?)
        } else {
            None
        };

        self.metrics.read(&data.counters, &mut data.previous);
        data.start_us = wall_clock_us() as u64;
        data.previous_sample_us = data.start_us;
        slot.base_depth.reset();

        self.trigger.unblock_signal()?;
        data.arm = self.trigger.arm_thread(overflow_fd)?;

        if self.trigger.mode() == TimerMode::Shared
            && self.trigger.signal().is_some()
            && !self.shared_timer_armed.swap(true, Ordering::SeqCst)
        {
            if let Err(e) = self.trigger.arm_shared() {
                self.shared_timer_armed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Releases everything a slot holds. The slot must not be `Active`.
    fn teardown_thread(&self, slot: &ThreadSlot) {
        slot.set_overflow_fd(None);
        // SAFETY: callers moved the slot out of `Active` and no handler runs
        // on it.
        let data = unsafe { slot.data_mut() };
        self.trigger.disarm_thread(&mut data.arm);
        data.counters.close();
        data.histogram = None;
        data.trace = None;
    }

    /// Stops sampling on the calling thread and folds its histogram into
    /// cost centers. Finalizing twice is a no-op.
    pub fn finalize_thread(&self) -> Result<(), SamplerError> {
        let _guard = LibraryGuard::enter();
        let Some(thread) = current_thread_id() else {
            return Ok(());
        };
        let slot = &self.slots[thread];
        if !slot.transition(ThreadLifecycle::Active, ThreadLifecycle::Finalizing) {
            return Ok(());
        }
        if let Err(e) = self.trigger.block_signal() {
            warn!("could not block the sampling signal on thread {}: {}", thread, e);
        }
        slot.wait_for_handlers();
        self.retire(thread, slot);
        Ok(())
    }

    /// Collapses and releases a slot in `Finalizing` with no handler
    /// running on it.
    fn retire(&self, thread: usize, slot: &ThreadSlot) {
        let _span = span!(Level::DEBUG, "retire", thread).entered();
        slot.set_overflow_fd(None);
        // SAFETY: the slot left `Active` and its handlers have drained.
        let data = unsafe { slot.data_mut() };
        self.trigger.disarm_thread(&mut data.arm);
        data.counters.close();

        let candidates: Vec<Candidate> = data
            .histogram
            .take()
            .map(|mut histogram| histogram.drain_all())
            .unwrap_or_default()
            .into_iter()
            .map(Candidate::from)
            .collect();
        let summary = Collapser {
            timers: self.timers.as_ref(),
            callsites: &self.callsites,
            metric_count: self.metrics.len(),
            annotate_callees: self.config.annotate_callees,
        }
        .collapse(thread, candidates);
        if summary.orphaned > 0 {
            self.diagnostic(&format!(
                "{} histogram entries on thread {} had no context name",
                summary.orphaned, thread
            ));
        }

        if let Some(trace) = data.trace.take() {
            self.write_trace_definitions(thread, &trace);
        }
        self.emit_metadata(thread, slot);
        slot.set_lifecycle(ThreadLifecycle::Finalized);
    }

    fn write_trace_definitions(&self, thread: usize, trace: &TraceFile) {
        let refs = match scan_raw_trace(trace.path()) {
            Ok(refs) => refs,
            Err(e) => {
                warn!("could not read back {}: {}", trace.path().display(), e);
                return;
            }
        };
        let path = definitions_path(&self.config.trace_dir, self.pid, thread);
        let keep_addr = self.callsites.keep_unresolved_addr();
        let result = write_definitions(
            &path,
            self.metrics.names(),
            &refs,
            |id| self.timers.name(CostCenterId::from_index(id)),
            |address| {
                self.callsites
                    .resolve(address, AddressKind::ProgramCounter)
                    .display(keep_addr)
                    .to_string()
            },
        );
        if let Err(e) = result {
            warn!("could not write {}: {}", path.display(), e);
        }
    }

    fn emit_metadata(&self, thread: usize, slot: &ThreadSlot) {
        let stats = slot.counters.snapshot();
        let unwind_depth = match &self.unwinder {
            Some(unwinder) => unwinder.depth().to_string(),
            None => "off".to_string(),
        };
        let entries = [
            ("EBS Samples Taken", stats.taken.to_string()),
            ("EBS Samples Accepted", stats.accepted.to_string()),
            ("EBS Samples Dropped Reentrant", stats.dropped_reentrant.to_string()),
            ("EBS Samples Dropped Suspended", stats.dropped_suspended.to_string()),
            ("EBS Histogram Overflows", stats.histogram_overflows.to_string()),
            ("EBS Source", self.config.source.to_string()),
            ("EBS Period", self.config.period.to_string()),
            ("EBS Unwind Depth", unwind_depth),
            ("EBS Runtime Events", self.runtime.kind().to_string()),
        ];
        for (key, value) in entries {
            self.timers.set_metadata(thread, key, value);
        }
        if !stats.is_conserved() {
            warn!("sample counters of thread {} do not add up: {:?}", thread, stats);
        }
    }

    /// Stops sampling everywhere and collapses every remaining thread.
    /// Only the first call does anything.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = LibraryGuard::enter();
        let _span = span!(Level::DEBUG, "finalize").entered();

        self.enabled.store(false, Ordering::SeqCst);
        handler::detach(self);
        if self.shared_timer_armed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.trigger.disarm_shared() {
                warn!("could not disarm the shared timer: {}", e);
            }
        }

        let current = current_thread_id();
        let mut swept = 0;
        for (thread, slot) in self.slots.iter().enumerate() {
            if Some(thread) == current {
                if slot.is_active() {
                    swept += 1;
                }
                if let Err(e) = self.finalize_thread() {
                    warn!("finalizing thread {} failed: {}", thread, e);
                }
                continue;
            }
            if slot.transition(ThreadLifecycle::Active, ThreadLifecycle::Finalizing) {
                slot.wait_for_handlers();
                self.retire(thread, slot);
                swept += 1;
            }
        }

        let unregistered = self.unregistered_samples.load(Ordering::Relaxed);
        self.timers
            .set_metadata(0, "EBS Unregistered Samples", unregistered.to_string());
        self.runtime.shutdown();
        info!(
            "sampling finalized, {} threads collapsed, {} samples from unregistered threads",
            swept, unregistered
        );

        let mine = {
            let mut installed = INSTALLED.lock().expect("lock");
            match installed.as_ref() {
                Some(sampler) if std::ptr::eq(Arc::as_ptr(sampler), self) => installed.take(),
                _ => None,
            }
        };
        drop(mine);
    }

    /// Takes a sample at `pc` on the calling thread as if a signal had
    /// arrived. Used by manual sampling.
    pub fn sample_now(&self, pc: u64) {
        self.handle_sample(pc);
    }

    /// Entry point for embedders that deliver sampling signals themselves.
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or the context passed to a signal handler
    /// running on the calling thread.
    pub unsafe fn handle_signal(&self, ucontext: *const c_void) {
        let pc = program_counter(ucontext).unwrap_or(0);
        self.handle_sample(pc);
        self.rearm_overflow();
    }

    /// Drops samples on the calling thread until the guard goes away.
    /// Guards nest.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        let slot = current_thread_id().map(|thread| &self.slots[thread]);
        if let Some(slot) = slot {
            slot.suspend();
        }
        SuspendGuard { slot }
    }

    /// Removes and returns the histogram entries of `context` on `thread`.
    /// Only the calling thread can drain its own active histogram.
    pub fn drain(
        &self,
        context: CostCenterId,
        thread: usize,
    ) -> Result<Vec<(StackKey, Accumulator)>, SamplerError> {
        let Some(slot) = self.slots.get(thread) else {
            return Ok(Vec::new());
        };
        if current_thread_id() != Some(thread) {
            return match slot.lifecycle() {
                ThreadLifecycle::Uninitialized | ThreadLifecycle::Finalized => Ok(Vec::new()),
                _ => Err(SamplerError::ThreadActive(thread)),
            };
        }

        let _handler = slot.enter_handler();
        if !slot.is_active() {
            return Ok(Vec::new());
        }
        slot.suspend();
        // SAFETY: owning thread with a handler guard and the suspension held,
        // so neither its own handler nor a finalizer touches the data.
        let drained = unsafe { slot.data_mut() }
            .histogram
            .as_mut()
            .map(|histogram| histogram.drain(context))
            .unwrap_or_default();
        slot.resume();
        Ok(drained)
    }

    pub fn thread_stats(&self, thread: usize) -> Option<SampleStats> {
        self.slots.get(thread).map(|slot| slot.counters.snapshot())
    }

    pub fn lifecycle(&self, thread: usize) -> ThreadLifecycle {
        self.slots
            .get(thread)
            .map_or(ThreadLifecycle::Uninitialized, |slot| slot.lifecycle())
    }

    pub fn unregistered_samples(&self) -> u64 {
        self.unregistered_samples.load(Ordering::Relaxed)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        handler::is_attached(self)
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricSet {
        &self.metrics
    }

    pub fn timers(&self) -> &Arc<dyn TimerContext> {
        &self.timers
    }

    pub fn callsites(&self) -> &CallSiteCache {
        &self.callsites
    }

    pub fn placeholder(&self) -> CostCenterId {
        self.placeholder
    }

    fn diagnostic(&self, message: &str) {
        if self.config.verbose {
            warn!("{}", message);
        } else {
            debug!("{}", message);
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        handler::detach(self);
        if !self.is_finalized() && self.slots.iter().any(|slot| slot.is_active()) {
            debug!("sampler dropped with active threads, finalizing");
            self.finalize();
        }
    }
}

pub struct SuspendGuard<'a> {
    slot: Option<&'a ThreadSlot>,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            slot.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingSource;
    use crate::runtime_state::OmptStates;
    use crate::symbols::{ResolvedSymbol, StaticResolver};
    use crate::unwind::StaticWalker;
    use std::sync::{OnceLock, Weak};
    use tempfile::TempDir;

    const PC: u64 = 0x1010;
    const CALLER: u64 = 0x2020;

    fn manual_config() -> SamplerConfig {
        SamplerConfig {
            source: SamplingSource::Manual,
            ..Default::default()
        }
    }

    fn resolver() -> Arc<StaticResolver> {
        Arc::new(
            StaticResolver::new()
                .with_symbol(0x1000, 0x1100, ResolvedSymbol::new("compute", "compute.c", 12))
                .with_symbol(0x2000, 0x2100, ResolvedSymbol::new("driver", "driver.c", 40))
                .with_module(0x0, 0x10000, "app"),
        )
    }

    fn sampler(config: SamplerConfig) -> (Arc<Sampler>, Arc<CostCenterRegistry>) {
        let registry = Arc::new(CostCenterRegistry::new());
        let sampler = Sampler::builder(config)
            .timers(registry.clone())
            .resolver(resolver())
            .build()
            .unwrap();
        (sampler, registry)
    }

    #[test]
    fn disabled_sampler_is_not_built() {
        let config = SamplerConfig {
            enabled: false,
            ..manual_config()
        };
        assert!(matches!(Sampler::new(config), Err(SamplerError::Disabled)));
    }

    #[test]
    fn samples_are_conserved_and_collapsed() {
        let (sampler, registry) = sampler(manual_config());
        let thread = sampler.init_thread().unwrap();
        assert_eq!(sampler.lifecycle(thread), ThreadLifecycle::Active);

        let work = registry.start("work").unwrap();
        for _ in 0..5 {
            sampler.sample_now(PC);
        }
        registry.stop(work.timer).unwrap();
        sampler.sample_now(PC);
        {
            let _suspended = sampler.suspend();
            assert_eq!(sampler.lifecycle(thread), ThreadLifecycle::Suspended);
            sampler.sample_now(PC);
        }
        {
            let _inside = LibraryGuard::enter();
            sampler.sample_now(PC);
        }

        let stats = sampler.thread_stats(thread).unwrap();
        assert_eq!(stats.taken, 8);
        assert_eq!(stats.accepted, 6);
        assert_eq!(stats.dropped_suspended, 1);
        assert_eq!(stats.dropped_reentrant, 1);
        assert!(stats.is_conserved());

        sampler.finalize_thread().unwrap();
        assert_eq!(sampler.lifecycle(thread), ThreadLifecycle::Finalized);

        let leaf = registry.find("[CONTEXT] work").unwrap();
        assert_eq!(leaf.thread(thread).unwrap().calls, 5);
        let placeholder = registry.find("[CONTEXT] .application").unwrap();
        assert_eq!(placeholder.thread(thread).unwrap().calls, 1);
        let sample = registry.find("[SAMPLE] compute [{compute.c} {12}]").unwrap();
        assert_eq!(sample.thread(thread).unwrap().calls, 6);

        let metadata = registry.metadata(thread);
        assert_eq!(metadata["EBS Samples Taken"], "8");
        assert_eq!(metadata["EBS Samples Accepted"], "6");
        assert_eq!(metadata["EBS Source"], "manual");

        // Finalizing twice changes nothing.
        sampler.finalize_thread().unwrap();
        assert_eq!(
            registry.find("[CONTEXT] work").unwrap().thread(thread).unwrap().calls,
            5
        );
        assert!(matches!(
            sampler.init_thread(),
            Err(SamplerError::ThreadFinalized(t)) if t == thread
        ));
    }

    #[test]
    fn overflowing_samples_still_reach_their_context() {
        // Given a histogram with room for six stacks
        let config = SamplerConfig {
            histogram_capacity: 8,
            ..manual_config()
        };
        let (sampler, registry) = sampler(config);
        let thread = sampler.init_thread().unwrap();

        // When a hundred distinct stacks are sampled under one timer
        let work = registry.start("crowded").unwrap();
        for i in 0..100 {
            sampler.sample_now(0x1000 + i);
        }
        registry.stop(work.timer).unwrap();
        sampler.finalize_thread().unwrap();

        // Then every accepted sample is charged to the context
        let stats = sampler.thread_stats(thread).unwrap();
        assert_eq!(stats.accepted, 100);
        assert_eq!(stats.histogram_overflows, 94);
        let context = registry.find("[CONTEXT] crowded").unwrap();
        assert_eq!(context.thread(thread).unwrap().calls, stats.accepted);
    }

    #[test]
    fn finalize_during_setup_leaves_no_active_thread() {
        // Given a thread that finished setup after a global finalize
        let (sampler, _) = sampler(manual_config());
        let thread = register_current_thread().unwrap();
        let slot = &sampler.slots[thread];
        assert!(slot.transition(ThreadLifecycle::Uninitialized, ThreadLifecycle::Initializing));
        sampler.finalize();
        assert_eq!(sampler.lifecycle(thread), ThreadLifecycle::Initializing);

        // When it becomes active
        let activated = sampler.activate(thread, slot);

        // Then it is torn down instead
        assert!(matches!(activated, Err(SamplerError::Disabled)));
        assert_eq!(sampler.lifecycle(thread), ThreadLifecycle::Finalized);
        assert!(!sampler.is_attached());
        sampler.sample_now(PC);
        let stats = sampler.thread_stats(thread).unwrap();
        assert_eq!(stats.accepted, 0);
        assert!(stats.is_conserved());
    }

    #[test]
    fn initializing_twice_is_a_no_op() {
        let (sampler, _) = sampler(manual_config());
        let first = sampler.init_thread().unwrap();
        sampler.sample_now(PC);
        let second = sampler.init_thread().unwrap();
        assert_eq!(first, second);
        assert_eq!(sampler.thread_stats(first).unwrap().accepted, 1);
        sampler.finalize();
    }

    #[test]
    fn samples_before_initialization_are_dropped() {
        let (sampler, _) = sampler(manual_config());
        let thread = register_current_thread().unwrap();
        sampler.sample_now(PC);
        let stats = sampler.thread_stats(thread).unwrap();
        assert_eq!(stats.taken, 1);
        assert_eq!(stats.dropped_suspended, 1);
        assert!(stats.is_conserved());
    }

    #[test]
    fn unregistered_threads_are_counted_separately() {
        let (sampler, registry) = sampler(manual_config());
        let other = Arc::clone(&sampler);
        std::thread::spawn(move || other.sample_now(PC))
            .join()
            .unwrap();
        assert_eq!(sampler.unregistered_samples(), 1);

        sampler.finalize();
        assert_eq!(registry.metadata(0)["EBS Unregistered Samples"], "1");
    }

    #[test]
    fn drained_samples_are_not_finalized_again() {
        // Given two samples under one timer
        let (sampler, registry) = sampler(manual_config());
        let thread = sampler.init_thread().unwrap();
        let work = registry.start("drained").unwrap();
        sampler.sample_now(PC);
        sampler.sample_now(PC);
        registry.stop(work.timer).unwrap();

        // When the context is drained
        let drained = sampler.drain(work.timer, thread).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.as_slice(), &[PC]);
        assert_eq!(drained[0].1.count, 2);
        assert!(sampler.drain(work.timer, thread).unwrap().is_empty());

        // Then finalization has nothing left to collapse
        sampler.finalize_thread().unwrap();
        assert!(registry.find("[CONTEXT] drained").is_none());
    }

    #[test]
    fn other_active_threads_cannot_be_drained() {
        let (sampler, registry) = sampler(manual_config());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let worker = {
            let sampler = Arc::clone(&sampler);
            std::thread::spawn(move || {
                let thread = sampler.init_thread().unwrap();
                ready_tx.send(thread).unwrap();
                done_rx.recv().unwrap();
                sampler.finalize_thread().unwrap();
            })
        };

        let thread = ready_rx.recv().unwrap();
        let context = registry.start("elsewhere").unwrap();
        assert!(matches!(
            sampler.drain(context.timer, thread),
            Err(SamplerError::ThreadActive(t)) if t == thread
        ));
        registry.stop(context.timer).unwrap();
        done_tx.send(()).unwrap();
        worker.join().unwrap();
        assert!(sampler.drain(context.timer, thread).unwrap().is_empty());
    }

    #[test]
    fn unwound_samples_record_callers() {
        let config = SamplerConfig {
            unwind: true,
            ..manual_config()
        };
        let registry = Arc::new(CostCenterRegistry::new());
        let sampler = Sampler::builder(config)
            .timers(registry.clone())
            .resolver(resolver())
            .walker(Box::new(StaticWalker::new(vec![0x9999, PC, CALLER + 1])))
            .build()
            .unwrap();
        let thread = sampler.init_thread().unwrap();
        let work = registry.start("unwound").unwrap();
        sampler.sample_now(PC);
        registry.stop(work.timer).unwrap();
        sampler.finalize_thread().unwrap();

        let path = registry
            .find(
                "unwound => [CONTEXT] unwound => [SAMPLE] compute [{compute.c} {12}] \
                 => [UNWIND] driver [{driver.c} {40}]",
            )
            .unwrap();
        assert_eq!(path.thread(thread).unwrap().calls, 1);
        let caller = registry.find("[UNWIND] driver [{driver.c} {40}]").unwrap();
        assert_eq!(caller.thread(thread).unwrap().exclusive[0], 0.0);
    }

    /// Walks by sampling again, as a signal landing mid-unwind would.
    struct ReentrantWalker {
        sampler: Arc<OnceLock<Weak<Sampler>>>,
        reentered: AtomicBool,
    }

    impl FrameWalker for ReentrantWalker {
        fn walk(&self, visit: &mut dyn FnMut(u64) -> bool) {
            if !self.reentered.swap(true, Ordering::SeqCst) {
                if let Some(sampler) = self.sampler.get().and_then(Weak::upgrade) {
                    sampler.sample_now(PC);
                }
            }
            for address in [PC, CALLER] {
                if !visit(address) {
                    return;
                }
            }
        }
    }

    #[test]
    fn nested_samples_are_dropped() {
        let cell = Arc::new(OnceLock::new());
        let config = SamplerConfig {
            unwind: true,
            ..manual_config()
        };
        let registry = Arc::new(CostCenterRegistry::new());
        let sampler = Sampler::builder(config)
            .timers(registry.clone())
            .resolver(resolver())
            .walker(Box::new(ReentrantWalker {
                sampler: cell.clone(),
                reentered: AtomicBool::new(false),
            }))
            .build()
            .unwrap();
        cell.set(Arc::downgrade(&sampler)).unwrap();

        let thread = sampler.init_thread().unwrap();
        sampler.sample_now(PC);

        let stats = sampler.thread_stats(thread).unwrap();
        assert_eq!(stats.taken, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.dropped_suspended, 1);
        assert!(stats.is_conserved());
        sampler.finalize_thread().unwrap();
    }

    #[test]
    fn inclusive_mode_charges_enclosing_timers_once() {
        let config = SamplerConfig {
            inclusive: true,
            ..manual_config()
        };
        let (sampler, registry) = sampler(config);
        let thread = sampler.init_thread().unwrap();
        let outer = registry.start("outer").unwrap();
        let recursive = registry.start("outer").unwrap();
        let inner = registry.start("inner").unwrap();
        sampler.sample_now(PC);

        let outer_entries = sampler.drain(outer.timer, thread).unwrap();
        assert_eq!(outer_entries.len(), 1);
        assert!(outer_entries[0].0.is_empty());
        assert_eq!(outer_entries[0].1.count, 1);
        assert_eq!(sampler.drain(inner.timer, thread).unwrap().len(), 1);

        registry.stop(inner.timer).unwrap();
        registry.stop(recursive.timer).unwrap();
        registry.stop(outer.timer).unwrap();
        sampler.finalize_thread().unwrap();
    }

    #[test]
    fn runtime_states_take_over_the_context() {
        let states = Arc::new(OmptStates::new());
        let config = SamplerConfig {
            track_runtime_states: true,
            ..manual_config()
        };
        let registry = Arc::new(CostCenterRegistry::new());
        let sampler = Sampler::builder(config)
            .timers(registry.clone())
            .resolver(resolver())
            .runtime(RuntimeEventSource::Ompt(states.clone()))
            .build()
            .unwrap();
        let thread = sampler.init_thread().unwrap();

        states.set_state(thread, RuntimeState::ImplicitBarrier);
        sampler.sample_now(PC);
        states.set_state(thread, RuntimeState::Working);
        sampler.sample_now(PC);
        sampler.finalize_thread().unwrap();

        let barrier = registry
            .find(&format!("[CONTEXT] {}", RuntimeState::ImplicitBarrier.cost_center_name()))
            .unwrap();
        assert_eq!(barrier.thread(thread).unwrap().calls, 1);
        let working = registry
            .find(&format!("[CONTEXT] {}", RuntimeState::Working.cost_center_name()))
            .unwrap();
        assert_eq!(working.thread(thread).unwrap().calls, 1);
        // State owners are charged time directly.
        let owner = registry
            .find(&RuntimeState::ImplicitBarrier.cost_center_name())
            .unwrap();
        assert!(owner.thread(thread).is_some());
    }

    #[test]
    fn trace_files_are_written_with_definitions() {
        let dir = TempDir::new().unwrap();
        let config = SamplerConfig {
            trace: true,
            profile: false,
            trace_dir: dir.path().to_path_buf(),
            ..manual_config()
        };
        let (sampler, registry) = sampler(config);
        let thread = sampler.init_thread().unwrap();
        let work = registry.start("traced").unwrap();
        sampler.sample_now(PC);
        sampler.sample_now(PC);
        registry.stop(work.timer).unwrap();
        sampler.finalize_thread().unwrap();

        let pid = std::process::id();
        let raw = std::fs::read_to_string(crate::trace::raw_trace_path(dir.path(), pid, thread))
            .unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().all(|line| line.starts_with("$ | ")));
        assert!(raw.contains(&format!(" | {} | 0x1010", work.timer.index())));

        let definitions =
            std::fs::read_to_string(definitions_path(dir.path(), pid, thread)).unwrap();
        assert!(definitions.contains(&format!("# callpath {} | traced", work.timer.index())));
        assert!(definitions.contains("# address 0x1010 | compute [{compute.c} {12}]"));
        assert!(registry.find("[CONTEXT] traced").is_none());
    }

    #[test]
    fn global_finalize_sweeps_and_latches() {
        let (sampler, registry) = sampler(manual_config());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let worker = {
            let sampler = Arc::clone(&sampler);
            let registry = registry.clone();
            std::thread::spawn(move || {
                let thread = sampler.init_thread().unwrap();
                let timer = registry.start("swept").unwrap();
                sampler.sample_now(PC);
                ready_tx.send(thread).unwrap();
                done_rx.recv().unwrap();
                registry.stop(timer.timer).unwrap();
            })
        };

        // When another thread finalizes while the worker is still active
        let thread = ready_rx.recv().unwrap();
        sampler.finalize();

        // Then the worker is swept exactly once
        assert!(sampler.is_finalized());
        assert_eq!(sampler.lifecycle(thread), ThreadLifecycle::Finalized);
        let swept = registry.find("[CONTEXT] swept").unwrap();
        assert_eq!(swept.thread(thread).unwrap().calls, 1);

        sampler.finalize();
        assert_eq!(registry.find("[CONTEXT] swept").unwrap().calls(), 1);
        assert!(matches!(sampler.init_thread(), Err(SamplerError::Disabled)));

        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }
}
