use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::metrics::{wall_clock_us, MetricValues, MAX_METRICS};
use crate::thread::{register_current_thread, LibraryGuard, ThreadSlotsExhausted, MAX_THREADS};

/// Timer stack capacity per thread.
pub const MAX_STACK_DEPTH: usize = 64;

pub const CALLPATH_SEPARATOR: &str = " => ";

const NO_COST_CENTER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CostCenterId(u32);

impl CostCenterId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> Self {
        CostCenterId(index as u32)
    }

    fn from_raw(raw: u32) -> Option<Self> {
        (raw != NO_COST_CENTER).then_some(CostCenterId(raw))
    }

    fn raw(id: Option<CostCenterId>) -> u32 {
        id.map_or(NO_COST_CENTER, |id| id.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CostCenterKind {
    Timer,
    CallPath,
    CallSite,
    Placeholder,
    RuntimeState,
    /// `[CONTEXT]` records created from sampled histograms.
    Context,
    /// `[SAMPLE]` and `[UNWIND]` records created from sampled histograms.
    Sample,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostCenterStats {
    pub calls: u64,
    pub inclusive: MetricValues,
    pub exclusive: MetricValues,
}

#[derive(Debug)]
struct CostCenter {
    name: String,
    kind: CostCenterKind,
    group: String,
    stats: Mutex<BTreeMap<usize, CostCenterStats>>,
}

/// One live timer on a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFrame {
    pub thread: usize,
    pub depth: usize,
    pub timer: CostCenterId,
    pub callpath: Option<CostCenterId>,
    pub callsite: Option<CostCenterId>,
}

impl TimerFrame {
    /// The most specific context a sample in this frame belongs to:
    /// call site, else call path, else the timer itself.
    pub fn sampling_context(&self) -> CostCenterId {
        self.callsite.or(self.callpath).unwrap_or(self.timer)
    }
}

/// What the sampler needs from timer bookkeeping.
///
/// `current_cost_center` and `parent` are called from the signal handler
/// and must not lock or allocate.
pub trait TimerContext: Send + Sync {
    fn current_cost_center(&self, thread: usize) -> Option<TimerFrame>;
    fn parent(&self, frame: &TimerFrame) -> Option<TimerFrame>;
    fn create_or_get_named_cost_center(
        &self,
        name: &str,
        kind: CostCenterKind,
        group: &str,
    ) -> CostCenterId;
    fn name(&self, id: CostCenterId) -> Option<String>;
    fn add_inclusive_time(&self, id: CostCenterId, metric: usize, thread: usize, value: f64);
    fn add_exclusive_time(&self, id: CostCenterId, metric: usize, thread: usize, value: f64);
    fn increment_call_count(&self, id: CostCenterId, thread: usize, delta: u64);
    fn set_metadata(&self, thread: usize, key: &str, value: String);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error(transparent)]
    ThreadSlots(#[from] ThreadSlotsExhausted),
    #[error("timer stack of thread {thread} is full ({max} frames)")]
    StackOverflow { thread: usize, max: usize },
    #[error("no timer is running on thread {thread}")]
    StackEmpty { thread: usize },
    #[error("stopping {stopped} but {running} is running")]
    Mismatch { stopped: String, running: String },
}

struct StackSlot {
    timer: AtomicU32,
    callpath: AtomicU32,
    callsite: AtomicU32,
    start_us: AtomicU64,
    child_us: AtomicU64,
}

impl StackSlot {
    fn new() -> Self {
        StackSlot {
            timer: AtomicU32::new(NO_COST_CENTER),
            callpath: AtomicU32::new(NO_COST_CENTER),
            callsite: AtomicU32::new(NO_COST_CENTER),
            start_us: AtomicU64::new(0),
            child_us: AtomicU64::new(0),
        }
    }
}

struct TimerStack {
    depth: AtomicUsize,
    frames: Box<[StackSlot]>,
}

impl TimerStack {
    fn new() -> Self {
        TimerStack {
            depth: AtomicUsize::new(0),
            frames: (0..MAX_STACK_DEPTH).map(|_| StackSlot::new()).collect(),
        }
    }

    fn frame(&self, thread: usize, depth: usize) -> Option<TimerFrame> {
        let slot = self.frames.get(depth)?;
        Some(TimerFrame {
            thread,
            depth,
            timer: CostCenterId::from_raw(slot.timer.load(Ordering::Relaxed))?,
            callpath: CostCenterId::from_raw(slot.callpath.load(Ordering::Relaxed)),
            callsite: CostCenterId::from_raw(slot.callsite.load(Ordering::Relaxed)),
        })
    }
}

#[derive(Default)]
struct Table {
    by_name: HashMap<String, CostCenterId>,
    entries: Vec<Arc<CostCenter>>,
}

/// In-memory cost-center table with per-thread timer stacks.
///
/// Timers account wall-clock microseconds into metric 0. With call paths
/// on, every start also opens a `parent => child` cost center that becomes
/// the sampling context of the frame.
pub struct CostCenterRegistry {
    table: RwLock<Table>,
    stacks: Box<[TimerStack]>,
    callpaths: bool,
    metadata: Mutex<BTreeMap<usize, BTreeMap<String, String>>>,
}

impl CostCenterRegistry {
    pub fn new() -> Self {
        Self::with_callpaths(false)
    }

    pub fn with_callpaths(callpaths: bool) -> Self {
        CostCenterRegistry {
            table: RwLock::new(Table::default()),
            stacks: (0..MAX_THREADS).map(|_| TimerStack::new()).collect(),
            callpaths,
            metadata: Mutex::new(BTreeMap::new()),
        }
    }

    fn entry(&self, id: CostCenterId) -> Option<Arc<CostCenter>> {
        self.table
            .read()
            .expect("lock")
            .entries
            .get(id.index())
            .cloned()
    }

    fn update_stats<F>(&self, id: CostCenterId, thread: usize, update: F)
    where
        F: FnOnce(&mut CostCenterStats),
    {
        match self.entry(id) {
            Some(entry) => {
                let mut stats = entry.stats.lock().expect("lock");
                update(stats.entry(thread).or_default());
            }
            None => warn!("unknown cost center {:?}", id),
        }
    }

    /// Starts `name` on the calling thread.
    pub fn start(&self, name: &str) -> Result<TimerFrame, TimerError> {
        self.start_at(name, None)
    }

    /// Starts `name` on the calling thread and, with `site`, opens a
    /// `name [@] site` call-site context for it.
    pub fn start_at(&self, name: &str, site: Option<&str>) -> Result<TimerFrame, TimerError> {
        let _guard = LibraryGuard::enter();
        let thread = register_current_thread()?;
        let stack = &self.stacks[thread];
        let depth = stack.depth.load(Ordering::Relaxed);
        if depth >= MAX_STACK_DEPTH {
            return Err(TimerError::StackOverflow {
                thread,
                max: MAX_STACK_DEPTH,
            });
        }

        let timer = self.create_or_get_named_cost_center(name, CostCenterKind::Timer, "USER");

        let callpath = if self.callpaths {
            let path = match depth.checked_sub(1).and_then(|d| stack.frame(thread, d)) {
                Some(parent) => {
                    let parent_name = self
                        .name(parent.callpath.unwrap_or(parent.timer))
                        .unwrap_or_default();
                    format!("{}{}{}", parent_name, CALLPATH_SEPARATOR, name)
                }
                None => name.to_string(),
            };
            Some(self.create_or_get_named_cost_center(&path, CostCenterKind::CallPath, "USER"))
        } else {
            None
        };

        let callsite = site.map(|site| {
            self.create_or_get_named_cost_center(
                &format!("{} [@] {}", name, site),
                CostCenterKind::CallSite,
                "USER",
            )
        });

        let slot = &stack.frames[depth];
        slot.timer.store(timer.0, Ordering::Relaxed);
        slot.callpath.store(CostCenterId::raw(callpath), Ordering::Relaxed);
        slot.callsite.store(CostCenterId::raw(callsite), Ordering::Relaxed);
        slot.start_us.store(wall_clock_us().to_bits(), Ordering::Relaxed);
        slot.child_us.store(0f64.to_bits(), Ordering::Relaxed);
        // Publish the frame only once it is complete.
        stack.depth.store(depth + 1, Ordering::Release);

        Ok(TimerFrame {
            thread,
            depth,
            timer,
            callpath,
            callsite,
        })
    }

    /// Stops the innermost timer of the calling thread, which must be `id`.
    pub fn stop(&self, id: CostCenterId) -> Result<(), TimerError> {
        let _guard = LibraryGuard::enter();
        let thread = register_current_thread()?;
        let stack = &self.stacks[thread];
        let depth = stack.depth.load(Ordering::Relaxed);
        let frame = depth
            .checked_sub(1)
            .and_then(|d| stack.frame(thread, d))
            .ok_or(TimerError::StackEmpty { thread })?;

        if frame.timer != id {
            return Err(TimerError::Mismatch {
                stopped: self.name(id).unwrap_or_default(),
                running: self.name(frame.timer).unwrap_or_default(),
            });
        }

        let slot = &stack.frames[frame.depth];
        let elapsed = wall_clock_us() - f64::from_bits(slot.start_us.load(Ordering::Relaxed));
        let exclusive = elapsed - f64::from_bits(slot.child_us.load(Ordering::Relaxed));

        stack.depth.store(frame.depth, Ordering::Release);

        if let Some(parent) = frame.depth.checked_sub(1) {
            let parent = &stack.frames[parent].child_us;
            let children = f64::from_bits(parent.load(Ordering::Relaxed)) + elapsed;
            parent.store(children.to_bits(), Ordering::Relaxed);
        }

        for id in [Some(frame.timer), frame.callpath, frame.callsite]
            .into_iter()
            .flatten()
        {
            self.update_stats(id, thread, |stats| {
                stats.calls += 1;
                stats.inclusive[0] += elapsed;
                stats.exclusive[0] += exclusive;
            });
        }
        Ok(())
    }

    /// Starts `name` and stops it when the returned guard is dropped.
    pub fn scoped(&self, name: &str) -> Result<ScopedTimer<'_>, TimerError> {
        let frame = self.start(name)?;
        Ok(ScopedTimer {
            registry: self,
            timer: frame.timer,
        })
    }

    /// Depth of the calling thread's timer stack.
    pub fn depth(&self) -> usize {
        crate::thread::current_thread_id()
            .map(|thread| self.stacks[thread].depth.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn find(&self, name: &str) -> Option<CostCenterSnapshot> {
        let id = *self.table.read().expect("lock").by_name.get(name)?;
        self.snapshot_of(id)
    }

    fn snapshot_of(&self, id: CostCenterId) -> Option<CostCenterSnapshot> {
        let entry = self.entry(id)?;
        let threads = entry.stats.lock().expect("lock").clone();
        Some(CostCenterSnapshot {
            id,
            name: entry.name.clone(),
            kind: entry.kind,
            group: entry.group.clone(),
            threads,
        })
    }

    /// Every cost center, sorted by name.
    pub fn snapshot(&self) -> Vec<CostCenterSnapshot> {
        let ids: Vec<CostCenterId> = {
            let table = self.table.read().expect("lock");
            (0..table.entries.len())
                .map(|i| CostCenterId(i as u32))
                .collect()
        };
        let mut snapshots: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.snapshot_of(id))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn metadata(&self, thread: usize) -> BTreeMap<String, String> {
        self.metadata
            .lock()
            .expect("lock")
            .get(&thread)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for CostCenterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerContext for CostCenterRegistry {
    fn current_cost_center(&self, thread: usize) -> Option<TimerFrame> {
        let stack = self.stacks.get(thread)?;
        let depth = stack.depth.load(Ordering::Acquire);
        stack.frame(thread, depth.checked_sub(1)?)
    }

    fn parent(&self, frame: &TimerFrame) -> Option<TimerFrame> {
        let stack = self.stacks.get(frame.thread)?;
        stack.frame(frame.thread, frame.depth.checked_sub(1)?)
    }

    fn create_or_get_named_cost_center(
        &self,
        name: &str,
        kind: CostCenterKind,
        group: &str,
    ) -> CostCenterId {
        if let Some(id) = self.table.read().expect("lock").by_name.get(name) {
            return *id;
        }

        let mut table = self.table.write().expect("lock");
        // Another thread may have inserted it between the two locks.
        if let Some(id) = table.by_name.get(name) {
            return *id;
        }
        let id = CostCenterId(table.entries.len() as u32);
        table.entries.push(Arc::new(CostCenter {
            name: name.to_string(),
            kind,
            group: group.to_string(),
            stats: Mutex::new(BTreeMap::new()),
        }));
        table.by_name.insert(name.to_string(), id);
        id
    }

    fn name(&self, id: CostCenterId) -> Option<String> {
        self.entry(id).map(|entry| entry.name.clone())
    }

    fn add_inclusive_time(&self, id: CostCenterId, metric: usize, thread: usize, value: f64) {
        if metric < MAX_METRICS {
            self.update_stats(id, thread, |stats| stats.inclusive[metric] += value);
        }
    }

    fn add_exclusive_time(&self, id: CostCenterId, metric: usize, thread: usize, value: f64) {
        if metric < MAX_METRICS {
            self.update_stats(id, thread, |stats| stats.exclusive[metric] += value);
        }
    }

    fn increment_call_count(&self, id: CostCenterId, thread: usize, delta: u64) {
        self.update_stats(id, thread, |stats| stats.calls += delta);
    }

    fn set_metadata(&self, thread: usize, key: &str, value: String) {
        self.metadata
            .lock()
            .expect("lock")
            .entry(thread)
            .or_default()
            .insert(key.to_string(), value);
    }
}

pub struct ScopedTimer<'a> {
    registry: &'a CostCenterRegistry,
    timer: CostCenterId,
}

impl ScopedTimer<'_> {
    pub fn id(&self) -> CostCenterId {
        self.timer
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.registry.stop(self.timer) {
            warn!("failed to stop scoped timer: {}", e);
        }
    }
}

/// Point-in-time copy of one cost center.
#[derive(Debug, Clone, PartialEq)]
pub struct CostCenterSnapshot {
    pub id: CostCenterId,
    pub name: String,
    pub kind: CostCenterKind,
    pub group: String,
    pub threads: BTreeMap<usize, CostCenterStats>,
}

impl CostCenterSnapshot {
    pub fn calls(&self) -> u64 {
        self.threads.values().map(|s| s.calls).sum()
    }

    pub fn inclusive(&self, metric: usize) -> f64 {
        self.threads.values().map(|s| s.inclusive[metric]).sum()
    }

    pub fn exclusive(&self, metric: usize) -> f64 {
        self.threads.values().map(|s| s.exclusive[metric]).sum()
    }

    pub fn thread(&self, thread: usize) -> Option<&CostCenterStats> {
        self.threads.get(&thread)
    }
}

/// The last element of a call path, so recursive paths collapse onto one
/// name.
pub fn strip_callpath(name: &str) -> &str {
    name.rsplit(CALLPATH_SEPARATOR)
        .next()
        .unwrap_or(name)
        .trim()
}
