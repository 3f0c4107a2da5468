use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

pub const MAX_THREADS: usize = 256;

const UNASSIGNED: usize = usize::MAX;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

// Const-initialized and destructor-free, so safe to read from a signal
// handler.
thread_local! {
    static THREAD_ID: Cell<usize> = const { Cell::new(UNASSIGNED) };
    static INSIDE_LIBRARY: Cell<u32> = const { Cell::new(0) };
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("all {max} thread slots are in use")]
pub struct ThreadSlotsExhausted {
    pub max: usize,
}

/// The calling thread's id, if it registered. Async-signal-safe.
pub fn current_thread_id() -> Option<usize> {
    THREAD_ID
        .try_with(|id| id.get())
        .ok()
        .filter(|id| *id != UNASSIGNED)
}

/// Assigns the calling thread an id on first use and returns it. Ids are
/// never recycled.
pub fn register_current_thread() -> Result<usize, ThreadSlotsExhausted> {
    if let Some(id) = current_thread_id() {
        return Ok(id);
    }

    let id = NEXT_THREAD_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
            (next < MAX_THREADS).then_some(next + 1)
        })
        .map_err(|_| ThreadSlotsExhausted { max: MAX_THREADS })?;

    THREAD_ID.with(|slot| slot.set(id));
    Ok(id)
}

/// Marks the calling thread as running inside the instrumentation for as
/// long as the guard lives. Guards nest.
pub struct LibraryGuard {
    // Must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl LibraryGuard {
    pub fn enter() -> Self {
        let _ = INSIDE_LIBRARY.try_with(|depth| depth.set(depth.get().saturating_add(1)));
        LibraryGuard {
            _not_send: PhantomData,
        }
    }
}

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        let _ = INSIDE_LIBRARY.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Async-signal-safe.
pub fn inside_library_depth() -> u32 {
    INSIDE_LIBRARY.try_with(|depth| depth.get()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_sticky_per_thread() {
        let first = register_current_thread().unwrap();
        let second = register_current_thread().unwrap();
        assert_eq!(first, second);
        assert_eq!(current_thread_id(), Some(first));
    }

    #[test]
    fn threads_get_distinct_ids() {
        let main = register_current_thread().unwrap();
        let other = std::thread::spawn(|| {
            assert_eq!(current_thread_id(), None);
            register_current_thread().unwrap()
        })
        .join()
        .unwrap();
        assert_ne!(main, other);
    }

    #[test]
    fn library_guards_nest() {
        assert_eq!(inside_library_depth(), 0);
        {
            let _outer = LibraryGuard::enter();
            assert_eq!(inside_library_depth(), 1);
            {
                let _inner = LibraryGuard::enter();
                assert_eq!(inside_library_depth(), 2);
            }
            assert_eq!(inside_library_depth(), 1);
        }
        assert_eq!(inside_library_depth(), 0);
    }
}
