use std::ffi::c_void;
use std::os::raw::c_int;
use std::sync::OnceLock;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::config::{SamplerConfig, SamplingSource};
use crate::error::SamplerError;
use crate::perf_events::arm_overflow_signal;

type SignalFn = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

static PREVIOUS_SIGPROF: OnceLock<SigAction> = OnceLock::new();
static PREVIOUS_SIGALRM: OnceLock<SigAction> = OnceLock::new();

fn previous_slot(signal: Signal) -> Option<&'static OnceLock<SigAction>> {
    match signal {
        Signal::SIGPROF => Some(&PREVIOUS_SIGPROF),
        Signal::SIGALRM => Some(&PREVIOUS_SIGALRM),
        _ => None,
    }
}

/// Runs the handler that was installed before ours, if it was a real one.
/// The default action of the sampling signals terminates the process, so
/// it is never chained.
pub fn chain_previous(signal: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let Ok(signal) = Signal::try_from(signal) else {
        return;
    };
    let Some(previous) = previous_slot(signal).and_then(OnceLock::get) else {
        return;
    };
    match previous.handler() {
        SigHandler::Handler(handler) => handler(signal as c_int),
        SigHandler::SigAction(handler) => handler(signal as c_int, info, ucontext),
        SigHandler::SigDfl | SigHandler::SigIgn => {}
    }
}

fn current_disposition(signal: Signal) -> Result<usize, SamplerError> {
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signal as c_int, std::ptr::null(), &mut current) } != 0 {
        return Err(SamplerError::last_os_error("sigaction"));
    }
    Ok(current.sa_sigaction)
}

/// How timer interrupts reach threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// One POSIX timer per thread, delivered to that thread.
    PerThread,
    /// One process interval timer shared by every thread.
    Shared,
}

/// Interrupt source armed on one thread.
#[derive(Debug)]
pub enum ThreadArm {
    None,
    Timer(libc::timer_t),
    /// Overflow of the perf counter with this descriptor.
    Counter(c_int),
    /// Covered by the process-wide timer.
    Shared,
}

pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn timeval(us: u64) -> libc::timeval {
    libc::timeval {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_usec: (us % 1_000_000) as libc::suseconds_t,
    }
}

fn timespec(us: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_nsec: ((us % 1_000_000) * 1_000) as libc::c_long,
    }
}

#[derive(Debug, Clone)]
pub struct Trigger {
    source: SamplingSource,
    mode: TimerMode,
    period: u64,
}

impl Trigger {
    pub fn new(config: &SamplerConfig) -> Self {
        let mode = if config.per_thread_timers && cfg!(target_os = "linux") {
            TimerMode::PerThread
        } else {
            TimerMode::Shared
        };
        Trigger {
            source: config.source.clone(),
            mode,
            period: config.period,
        }
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    /// The signal interrupts arrive on, `None` for manual sampling.
    pub fn signal(&self) -> Option<Signal> {
        match (&self.source, self.mode) {
            (SamplingSource::Manual, _) => None,
            (SamplingSource::WallClock, TimerMode::Shared) => Some(Signal::SIGALRM),
            _ => Some(Signal::SIGPROF),
        }
    }

    /// Installs `handler` for the sampling signal, remembering the previous
    /// disposition for chaining. Installing again is a no-op as long as our
    /// handler is still in place.
    pub fn install_handler(&self, handler: SignalFn) -> Result<(), SamplerError> {
        let Some(signal) = self.signal() else {
            return Ok(());
        };
        let Some(previous_slot) = previous_slot(signal) else {
            return Ok(());
        };

        if previous_slot.get().is_some() {
            return self.check_handler(handler);
        }

        let action = SigAction::new(
            SigHandler::SigAction(handler),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(signal, &action) }.map_err(|errno| SamplerError::Os {
            call: "sigaction",
            errno: errno::Errno(errno as i32),
        })?;

        if let SigHandler::SigAction(existing) = previous.handler() {
            if existing as usize == handler as usize {
                // Already ours, nothing to chain to.
                let _ = previous_slot.set(SigAction::new(
                    SigHandler::SigDfl,
                    SaFlags::empty(),
                    SigSet::empty(),
                ));
                return Ok(());
            }
        }
        if !matches!(previous.handler(), SigHandler::SigDfl | SigHandler::SigIgn) {
            debug!("chaining to the previous {} handler", signal.as_str());
        }
        let _ = previous_slot.set(previous);
        Ok(())
    }

    /// Fails if something replaced our handler after it was installed.
    pub fn check_handler(&self, handler: SignalFn) -> Result<(), SamplerError> {
        let Some(signal) = self.signal() else {
            return Ok(());
        };
        if current_disposition(signal)? != handler as usize {
            return Err(SamplerError::HandlerConflict {
                signal: signal.as_str(),
            });
        }
        Ok(())
    }

    /// Arms the interrupt source of the calling thread. `overflow_fd` is the
    /// perf descriptor of the source counter for counter sampling.
    pub fn arm_thread(&self, overflow_fd: Option<c_int>) -> Result<ThreadArm, SamplerError> {
        match &self.source {
            SamplingSource::Manual => Ok(ThreadArm::None),
            SamplingSource::Counter(name) => {
                let fd = overflow_fd.ok_or_else(|| SamplerError::SourceMetricMissing(name.clone()))?;
                arm_overflow_signal(fd, gettid(), Signal::SIGPROF as c_int)
                    .map_err(SamplerError::PerfEvent)?;
                Ok(ThreadArm::Counter(fd))
            }
            SamplingSource::Itimer | SamplingSource::WallClock => match self.mode {
                TimerMode::Shared => Ok(ThreadArm::Shared),
                TimerMode::PerThread => self.create_thread_timer().map(ThreadArm::Timer),
            },
        }
    }

    fn create_thread_timer(&self) -> Result<libc::timer_t, SamplerError> {
        let clock = match self.source {
            SamplingSource::WallClock => libc::CLOCK_MONOTONIC,
            _ => libc::CLOCK_THREAD_CPUTIME_ID,
        };

        let mut event: libc::sigevent = unsafe { std::mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = Signal::SIGPROF as c_int;
        event.sigev_notify_thread_id = gettid();

        let mut timer: libc::timer_t = std::ptr::null_mut();
        if unsafe { libc::timer_create(clock, &mut event, &mut timer) } != 0 {
            return Err(SamplerError::last_os_error("timer_create"));
        }

        let spec = libc::itimerspec {
            it_interval: timespec(self.period),
            it_value: timespec(self.period),
        };
        if unsafe { libc::timer_settime(timer, 0, &spec, std::ptr::null_mut()) } != 0 {
            let err = SamplerError::last_os_error("timer_settime");
            unsafe { libc::timer_delete(timer) };
            return Err(err);
        }
        Ok(timer)
    }

    /// Stops the thread's interrupt source. Counter descriptors are owned by
    /// the thread's metric counters and closed with them.
    pub fn disarm_thread(&self, arm: &mut ThreadArm) {
        if let ThreadArm::Timer(timer) = arm {
            unsafe { libc::timer_delete(*timer) };
        }
        *arm = ThreadArm::None;
    }

    fn shared_timer(&self) -> Option<c_int> {
        match (&self.source, self.mode) {
            (SamplingSource::Itimer, TimerMode::Shared) => Some(libc::ITIMER_PROF),
            (SamplingSource::WallClock, TimerMode::Shared) => Some(libc::ITIMER_REAL),
            _ => None,
        }
    }

    pub fn arm_shared(&self) -> Result<(), SamplerError> {
        self.set_shared(self.period)
    }

    pub fn disarm_shared(&self) -> Result<(), SamplerError> {
        self.set_shared(0)
    }

    fn set_shared(&self, period: u64) -> Result<(), SamplerError> {
        let Some(which) = self.shared_timer() else {
            return Ok(());
        };
        let value = libc::itimerval {
            it_interval: timeval(period),
            it_value: timeval(period),
        };
        if unsafe { libc::setitimer(which, &value, std::ptr::null_mut()) } != 0 {
            return Err(SamplerError::last_os_error("setitimer"));
        }
        Ok(())
    }

    /// Lets the sampling signal reach the calling thread.
    pub fn unblock_signal(&self) -> Result<(), SamplerError> {
        self.thread_mask(true)
    }

    /// Keeps the sampling signal away from the calling thread from now on.
    pub fn block_signal(&self) -> Result<(), SamplerError> {
        self.thread_mask(false)
    }

    fn thread_mask(&self, unblock: bool) -> Result<(), SamplerError> {
        let Some(signal) = self.signal() else {
            return Ok(());
        };
        let mut set = SigSet::empty();
        set.add(signal);
        let result = if unblock {
            set.thread_unblock()
        } else {
            set.thread_block()
        };
        result.map_err(|errno| SamplerError::Os {
            call: "pthread_sigmask",
            errno: errno::Errno(errno as i32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {}

    fn trigger(source: SamplingSource, per_thread_timers: bool) -> Trigger {
        Trigger::new(&SamplerConfig {
            source,
            per_thread_timers,
            ..SamplerConfig::default()
        })
    }

    #[test]
    fn signal_per_source() {
        assert_eq!(trigger(SamplingSource::Manual, true).signal(), None);
        assert_eq!(
            trigger(SamplingSource::Itimer, false).signal(),
            Some(Signal::SIGPROF)
        );
        assert_eq!(
            trigger(SamplingSource::WallClock, false).signal(),
            Some(Signal::SIGALRM)
        );
        assert_eq!(
            trigger(SamplingSource::WallClock, true).signal(),
            Some(Signal::SIGPROF)
        );
    }

    #[test]
    fn manual_source_arms_nothing() {
        let trigger = trigger(SamplingSource::Manual, true);
        trigger.install_handler(noop).unwrap();
        trigger.check_handler(noop).unwrap();
        let mut arm = trigger.arm_thread(None).unwrap();
        assert!(matches!(arm, ThreadArm::None));
        trigger.disarm_thread(&mut arm);
        trigger.block_signal().unwrap();
    }

    #[test]
    fn counter_source_needs_a_descriptor() {
        let trigger = trigger(SamplingSource::Counter("cycles".to_string()), true);
        assert!(matches!(
            trigger.arm_thread(None),
            Err(SamplerError::SourceMetricMissing(_))
        ));
    }

    #[test]
    fn time_conversions() {
        let tv = timeval(2_500_000);
        assert_eq!((tv.tv_sec, tv.tv_usec), (2, 500_000));
        let ts = timespec(10_000);
        assert_eq!((ts.tv_sec, ts.tv_nsec), (0, 10_000_000));
    }
}
