use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use crate::config::UnwindDepth;
use crate::symbols::SymbolResolver;

pub const MAX_UNWIND_DEPTH: usize = 32;

/// Frames walked while looking for the first frame of the measured program.
pub const MAX_CALIBRATION_FRAMES: usize = 64;

const UNCALIBRATED: isize = -1;

/// Bounded address sequence identifying a sampled call stack.
#[derive(Clone, Copy)]
pub struct StackKey {
    len: usize,
    addresses: [u64; MAX_UNWIND_DEPTH],
}

impl StackKey {
    pub const fn empty() -> Self {
        StackKey {
            len: 0,
            addresses: [0; MAX_UNWIND_DEPTH],
        }
    }

    pub fn from_pc(pc: u64) -> Self {
        let mut key = Self::empty();
        key.push(pc);
        key
    }

    /// Truncates to the first `MAX_UNWIND_DEPTH` addresses.
    pub fn from_slice(addresses: &[u64]) -> Self {
        let mut key = Self::empty();
        for address in addresses.iter().take(MAX_UNWIND_DEPTH) {
            key.push(*address);
        }
        key
    }

    /// Returns false once the key is full.
    pub fn push(&mut self, address: u64) -> bool {
        if self.len == MAX_UNWIND_DEPTH {
            return false;
        }
        self.addresses[self.len] = address;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.addresses[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, address: u64) -> bool {
        self.as_slice().contains(&address)
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The count-prefixed external form `[n, a0, .., an-1]`.
    pub fn to_counted(&self) -> Vec<u64> {
        let mut counted = Vec::with_capacity(self.len + 1);
        counted.push(self.len as u64);
        counted.extend_from_slice(self.as_slice());
        counted
    }
}

impl Default for StackKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for StackKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for StackKey {}

impl Hash for StackKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl PartialOrd for StackKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StackKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl fmt::Debug for StackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|a| format!("{:#x}", a)))
            .finish()
    }
}

/// Produces the instruction pointers of the current call stack, innermost
/// first. Called from the signal handler.
pub trait FrameWalker: Send + Sync {
    /// Calls `visit` for each frame until it returns false or the stack
    /// ends.
    fn walk(&self, visit: &mut dyn FnMut(u64) -> bool);
}

/// Walks the real stack with the `backtrace` crate's unsynchronized tracer.
#[derive(Debug, Default)]
pub struct BacktraceWalker;

impl FrameWalker for BacktraceWalker {
    fn walk(&self, visit: &mut dyn FnMut(u64) -> bool) {
        // SAFETY: only this thread unwinds its own stack here and no other
        // backtrace call is running on it.
        unsafe {
            backtrace::trace_unsynchronized(|frame| visit(frame.ip() as u64));
        }
    }
}

/// Replays a fixed list of frames.
#[derive(Debug, Clone, Default)]
pub struct StaticWalker {
    frames: Vec<u64>,
}

impl StaticWalker {
    pub fn new(frames: Vec<u64>) -> Self {
        StaticWalker { frames }
    }
}

impl FrameWalker for StaticWalker {
    fn walk(&self, visit: &mut dyn FnMut(u64) -> bool) {
        for frame in &self.frames {
            if !visit(*frame) {
                break;
            }
        }
    }
}

/// Decides whether a frame is part of the sampler or the parallel runtime
/// rather than the measured program.
pub trait FrameClassifier: Send + Sync {
    fn is_internal(&self, address: u64, pc: u64) -> bool;
}

/// Everything above the frame executing the interrupted PC is internal.
/// Async-signal-safe.
#[derive(Debug, Default)]
pub struct InterruptedPcClassifier;

impl FrameClassifier for InterruptedPcClassifier {
    fn is_internal(&self, address: u64, pc: u64) -> bool {
        address != pc
    }
}

pub const DEFAULT_INTERNAL_PREFIXES: &[&str] = &[
    "ebsampler::",
    "backtrace::",
    "_Unwind_",
    "__restore_rt",
    "__kmp",
    "__kmpc_",
    "GOMP_",
    "gomp_",
];

/// Classifies frames by symbol-name prefix. Resolving allocates, so this is
/// only suitable when calibration runs outside a signal handler or the
/// resolver is known to be signal-safe.
pub struct SymbolPrefixClassifier {
    resolver: Arc<dyn SymbolResolver>,
    prefixes: Vec<String>,
}

impl SymbolPrefixClassifier {
    pub fn new(resolver: Arc<dyn SymbolResolver>) -> Self {
        Self::with_prefixes(resolver, DEFAULT_INTERNAL_PREFIXES)
    }

    pub fn with_prefixes(resolver: Arc<dyn SymbolResolver>, prefixes: &[&str]) -> Self {
        SymbolPrefixClassifier {
            resolver,
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl FrameClassifier for SymbolPrefixClassifier {
    fn is_internal(&self, address: u64, _pc: u64) -> bool {
        match self.resolver.resolve(address) {
            Some(symbol) => {
                // Trait impls demangle as `<Type as Trait>::method`.
                let name = symbol.function.trim_start_matches('<');
                self.prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix.as_str()))
            }
            None => false,
        }
    }
}

/// Per-thread base depth, the number of frames skipped before the
/// interrupted one.
#[derive(Debug)]
pub struct BaseDepth(AtomicIsize);

impl BaseDepth {
    pub const fn new() -> Self {
        BaseDepth(AtomicIsize::new(UNCALIBRATED))
    }

    pub fn get(&self) -> Option<usize> {
        let depth = self.0.load(Ordering::Relaxed);
        (depth != UNCALIBRATED).then_some(depth as usize)
    }

    fn set(&self, depth: usize) {
        self.0.store(depth as isize, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(UNCALIBRATED, Ordering::Relaxed);
    }
}

impl Default for BaseDepth {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Unwinder {
    walker: Box<dyn FrameWalker>,
    classifier: Box<dyn FrameClassifier>,
    depth: UnwindDepth,
}

impl Unwinder {
    pub fn new(
        walker: Box<dyn FrameWalker>,
        classifier: Box<dyn FrameClassifier>,
        depth: UnwindDepth,
    ) -> Self {
        Unwinder {
            walker,
            classifier,
            depth,
        }
    }

    pub fn depth(&self) -> UnwindDepth {
        self.depth
    }

    fn limit(&self) -> usize {
        match self.depth {
            UnwindDepth::Fixed(callers) => (callers + 1).min(MAX_UNWIND_DEPTH),
            UnwindDepth::Automatic => MAX_UNWIND_DEPTH,
        }
    }

    /// Fills `key` with `pc` followed by its callers. Never fails: a walk
    /// that ends early leaves the prefix captured so far.
    ///
    /// The first call on a thread finds the first frame of the measured
    /// program in the same walk that fills the key, so the stored base depth
    /// is measured from this frame. Falls back to zero when no such frame
    /// shows up within `MAX_CALIBRATION_FRAMES`.
    pub fn unwind(&self, pc: u64, base: &BaseDepth, key: &mut StackKey) {
        key.clear();
        key.push(pc);

        let limit = self.limit();
        if key.len() >= limit {
            return;
        }

        let automatic = self.depth == UnwindDepth::Automatic;
        let mut base_depth = base.get();
        let calibrating = base_depth.is_none();
        let mut index = 0;
        self.walker.walk(&mut |address| {
            let current = index;
            index += 1;
            match base_depth {
                None => {
                    if self.classifier.is_internal(address, pc) {
                        return index < MAX_CALIBRATION_FRAMES;
                    }
                    base_depth = Some(current);
                    return true;
                }
                // The interrupted frame itself is already in slot 0.
                Some(depth) if current <= depth => return true,
                Some(_) => {}
            }
            if automatic && key.contains(address) {
                return false;
            }
            key.push(address) && key.len() < limit
        });

        if calibrating {
            base.set(base_depth.unwrap_or(0));
        }
    }
}
