use std::ffi::{c_void, CStr};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::thread::MAX_THREADS;

/// Names of cost centers that reconcile sampled runtime state back into
/// the timer hierarchy start with this.
pub const RUNTIME_STATE_PREFIX: &str = "OpenMP_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuntimeState {
    Unknown = 0,
    Overhead = 1,
    Working = 2,
    ImplicitBarrier = 3,
    ExplicitBarrier = 4,
    Idle = 5,
    Serial = 6,
    Reduction = 7,
    LockWait = 8,
    CriticalWait = 9,
    OrderedWait = 10,
    AtomicWait = 11,
    TaskCreate = 12,
    TaskSchedule = 13,
    TaskSuspend = 14,
    TaskSteal = 15,
}

impl RuntimeState {
    pub const ALL: [RuntimeState; 16] = [
        RuntimeState::Unknown,
        RuntimeState::Overhead,
        RuntimeState::Working,
        RuntimeState::ImplicitBarrier,
        RuntimeState::ExplicitBarrier,
        RuntimeState::Idle,
        RuntimeState::Serial,
        RuntimeState::Reduction,
        RuntimeState::LockWait,
        RuntimeState::CriticalWait,
        RuntimeState::OrderedWait,
        RuntimeState::AtomicWait,
        RuntimeState::TaskCreate,
        RuntimeState::TaskSchedule,
        RuntimeState::TaskSuspend,
        RuntimeState::TaskSteal,
    ];

    pub fn from_raw(raw: u32) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(RuntimeState::Unknown)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeState::Unknown => "UNKNOWN",
            RuntimeState::Overhead => "OVERHEAD",
            RuntimeState::Working => "WORKING",
            RuntimeState::ImplicitBarrier => "IMPLICIT_BARRIER",
            RuntimeState::ExplicitBarrier => "EXPLICIT_BARRIER",
            RuntimeState::Idle => "IDLE",
            RuntimeState::Serial => "SERIAL",
            RuntimeState::Reduction => "REDUCTION",
            RuntimeState::LockWait => "LOCK_WAIT",
            RuntimeState::CriticalWait => "CRITICAL_WAIT",
            RuntimeState::OrderedWait => "ORDERED_WAIT",
            RuntimeState::AtomicWait => "ATOMIC_WAIT",
            RuntimeState::TaskCreate => "TASK_CREATE",
            RuntimeState::TaskSchedule => "TASK_SCHEDULE",
            RuntimeState::TaskSuspend => "TASK_SUSPEND",
            RuntimeState::TaskSteal => "TASK_STEAL",
        }
    }

    pub fn cost_center_name(self) -> String {
        format!("{}{}", RUNTIME_STATE_PREFIX, self.name())
    }
}

pub fn is_runtime_state_name(name: &str) -> bool {
    name.starts_with(RUNTIME_STATE_PREFIX)
}

pub type CollectorApiFn = unsafe extern "C" fn(*mut c_void) -> c_int;

const OMP_REQ_START: c_int = 0;
const OMP_REQ_STATE: c_int = 3;
const OMP_REQ_STOP: c_int = 6;
const OMP_ERRCODE_OK: c_int = 0;

const COLLECTOR_SYMBOL: &CStr = match CStr::from_bytes_with_nul(b"__omp_collector_api\0") {
    Ok(symbol) => symbol,
    Err(_) => panic!("symbol is nul-terminated"),
};

/// The pull-model collector interface some OpenMP runtimes export.
///
/// Requests are a sequence of `[size, request, errcode, reply size,
/// payload..]` records terminated by a zero size. All buffers live on the
/// caller's stack, so querying is usable from a signal handler as long as
/// the runtime's entry point is.
#[derive(Clone, Copy)]
pub struct CollectorApi {
    api: CollectorApiFn,
}

impl std::fmt::Debug for CollectorApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorApi").finish_non_exhaustive()
    }
}

impl CollectorApi {
    pub fn from_fn(api: CollectorApiFn) -> Self {
        CollectorApi { api }
    }

    fn lookup() -> Option<Self> {
        let symbol = unsafe { libc::dlsym(libc::RTLD_DEFAULT, COLLECTOR_SYMBOL.as_ptr()) };
        if symbol.is_null() {
            return None;
        }
        // SAFETY: the symbol is the runtime's collector entry point.
        let api: CollectorApiFn = unsafe { std::mem::transmute(symbol) };
        Some(CollectorApi { api })
    }

    /// Sends a single request and returns the first reply word.
    fn request(&self, request: c_int) -> Option<c_int> {
        const HEADER_WORDS: usize = 4;
        let mut message: [c_int; HEADER_WORDS + 2] = [0; HEADER_WORDS + 2];
        let word = std::mem::size_of::<c_int>() as c_int;

        message[0] = word * (HEADER_WORDS as c_int + 1);
        message[1] = request;
        message[2] = OMP_ERRCODE_OK;
        message[3] = word;
        // message[4] receives the reply, message[5] terminates the list.

        let ret = unsafe { (self.api)(message.as_mut_ptr() as *mut c_void) };
        (ret == 0 && message[2] == OMP_ERRCODE_OK).then_some(message[4])
    }

    fn start(&self) -> bool {
        self.request(OMP_REQ_START).is_some()
    }

    fn stop(&self) {
        let _ = self.request(OMP_REQ_STOP);
    }

    pub fn state(&self) -> Option<RuntimeState> {
        self.request(OMP_REQ_STATE)
            .map(|raw| RuntimeState::from_raw(raw as u32))
    }
}

/// Push-model state table fed by OMPT-style callbacks. Each runtime thread
/// stores its own state; the sampler only reads.
#[derive(Debug)]
pub struct OmptStates {
    states: Box<[AtomicU8]>,
}

impl OmptStates {
    pub fn new() -> Self {
        OmptStates {
            states: (0..MAX_THREADS)
                .map(|_| AtomicU8::new(RuntimeState::Unknown as u8))
                .collect(),
        }
    }

    pub fn set_state(&self, thread: usize, state: RuntimeState) {
        if let Some(slot) = self.states.get(thread) {
            slot.store(state as u8, Ordering::Relaxed);
        }
    }

    pub fn state(&self, thread: usize) -> RuntimeState {
        self.states
            .get(thread)
            .map(|slot| RuntimeState::from_raw(slot.load(Ordering::Relaxed) as u32))
            .unwrap_or(RuntimeState::Unknown)
    }
}

impl Default for OmptStates {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the current runtime state of a thread comes from.
#[derive(Debug, Clone, Default)]
pub enum RuntimeEventSource {
    #[default]
    None,
    CollectorApi(CollectorApi),
    Ompt(Arc<OmptStates>),
}

impl RuntimeEventSource {
    /// Looks for a runtime exporting the collector interface and starts it.
    /// Falls back to no state tracking.
    pub fn probe() -> Self {
        match CollectorApi::lookup() {
            Some(api) if api.start() => {
                debug!("OpenMP collector API found and started");
                RuntimeEventSource::CollectorApi(api)
            }
            Some(_) => {
                debug!("OpenMP collector API found but refused to start");
                RuntimeEventSource::None
            }
            None => {
                debug!("no OpenMP collector API, runtime state tracking unavailable");
                RuntimeEventSource::None
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEventSource::None => "none",
            RuntimeEventSource::CollectorApi(_) => "collector-api",
            RuntimeEventSource::Ompt(_) => "ompt",
        }
    }

    /// State of `thread` at the time of the call. Called from the signal
    /// handler.
    pub fn current_state(&self, thread: usize) -> Option<RuntimeState> {
        match self {
            RuntimeEventSource::None => None,
            RuntimeEventSource::CollectorApi(api) => api.state(),
            RuntimeEventSource::Ompt(states) => Some(states.state(thread)),
        }
    }

    pub fn shutdown(&self) {
        if let RuntimeEventSource::CollectorApi(api) = self {
            api.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn fake_collector(message: *mut c_void) -> c_int {
        let words = message as *mut c_int;
        match *words.add(1) {
            OMP_REQ_START | OMP_REQ_STOP => 0,
            OMP_REQ_STATE => {
                *words.add(4) = RuntimeState::ImplicitBarrier as c_int;
                0
            }
            _ => {
                *words.add(2) = 1;
                0
            }
        }
    }

    #[test]
    fn state_names() {
        assert_eq!(RuntimeState::Working.cost_center_name(), "OpenMP_WORKING");
        assert_eq!(RuntimeState::from_raw(9), RuntimeState::CriticalWait);
        assert_eq!(RuntimeState::from_raw(99), RuntimeState::Unknown);
        assert!(is_runtime_state_name("OpenMP_IDLE"));
        assert!(!is_runtime_state_name("main"));
    }

    #[test]
    fn collector_api_protocol() {
        let source = RuntimeEventSource::CollectorApi(CollectorApi::from_fn(fake_collector));
        assert_eq!(source.kind(), "collector-api");
        assert_eq!(source.current_state(0), Some(RuntimeState::ImplicitBarrier));
    }

    #[test]
    fn ompt_states_are_per_thread() {
        let states = Arc::new(OmptStates::new());
        let source = RuntimeEventSource::Ompt(states.clone());

        states.set_state(1, RuntimeState::Working);
        assert_eq!(source.current_state(1), Some(RuntimeState::Working));
        assert_eq!(source.current_state(2), Some(RuntimeState::Unknown));

        // Out of range threads are ignored.
        states.set_state(MAX_THREADS, RuntimeState::Idle);
        assert_eq!(states.state(MAX_THREADS), RuntimeState::Unknown);
    }

    #[test]
    fn probe_without_runtime() {
        // The test binary links no OpenMP runtime.
        assert!(matches!(
            RuntimeEventSource::probe(),
            RuntimeEventSource::None
        ));
    }
}
