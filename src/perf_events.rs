use std::os::raw::c_int;

use anyhow::{anyhow, Result};
use errno::errno;

use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

/// Linux fcntl ABI items that the `libc` crate does not export for glibc
/// targets (values from the kernel's asm-generic/fcntl.h).
mod fcntl_abi {
    pub const F_SETSIG: libc::c_int = 10;
    pub const F_SETOWN_EX: libc::c_int = 15;
    pub const F_OWNER_TID: libc::c_int = 0;

    #[repr(C)]
    #[allow(non_camel_case_types)]
    pub struct f_owner_ex {
        pub type_: libc::c_int,
        pub pid: libc::pid_t,
    }
}

/// A perf event that can back a metric or drive overflow sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEvent {
    pub type_: u32,
    pub config: u64,
}

impl CounterEvent {
    /// Accepts perf-style names and the common PAPI preset aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        use sys::bindings::*;

        let (type_, config) = match name {
            "cycles" | "cpu-cycles" | "CPU_CYCLES" | "PAPI_TOT_CYC" => {
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES)
            }
            "instructions" | "PAPI_TOT_INS" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
            "cache-references" | "PAPI_L3_TCA" => {
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES)
            }
            "cache-misses" | "PAPI_L3_TCM" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
            "branches" | "PAPI_BR_INS" => {
                (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS)
            }
            "branch-misses" | "PAPI_BR_MSP" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
            "cpu-clock" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
            "task-clock" | "TASK_CLOCK" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
            "page-faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
            "context-switches" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
            _ => return None,
        };

        Some(CounterEvent {
            type_,
            config: config as u64,
        })
    }
}

/// Opens `event` for the calling thread on any CPU. With `sample_period` the
/// counter starts disabled and overflows every `sample_period` events once
/// armed; without it the counter starts counting immediately.
pub fn open_counter(event: CounterEvent, sample_period: Option<u64>) -> Result<c_int> {
    let mut attrs: perf_event_attr = perf_event_attr {
        size: std::mem::size_of::<sys::bindings::perf_event_attr>() as u32,
        type_: event.type_,
        config: event.config,
        ..Default::default()
    };
    attrs.set_exclude_kernel(1);
    attrs.set_exclude_hv(1);

    if let Some(period) = sample_period {
        attrs.__bindgen_anon_1.sample_period = period;
        attrs.__bindgen_anon_2.wakeup_events = 1;
        attrs.set_disabled(1);
    }

    let ret = unsafe {
        sys::perf_event_open(
            &mut attrs, 0,  /* pid: calling thread */
            -1, /* cpu */
            -1, /* group_fd */
            sys::bindings::PERF_FLAG_FD_CLOEXEC as _,
        )
    };

    if ret < 0 {
        return Err(anyhow!("perf_event_open failed with errno {}", errno()));
    }

    Ok(ret)
}

/// Routes overflow notifications of `fd` to thread `tid` as `signal` and
/// enables the counter for one overflow.
pub fn arm_overflow_signal(fd: c_int, tid: libc::pid_t, signal: c_int) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC) < 0 {
            return Err(anyhow!("fcntl(O_ASYNC) failed with errno {}", errno()));
        }
        if libc::fcntl(fd, fcntl_abi::F_SETSIG, signal) < 0 {
            return Err(anyhow!("fcntl(F_SETSIG) failed with errno {}", errno()));
        }
        let owner = fcntl_abi::f_owner_ex {
            type_: fcntl_abi::F_OWNER_TID,
            pid: tid,
        };
        if libc::fcntl(fd, fcntl_abi::F_SETOWN_EX, &owner as *const fcntl_abi::f_owner_ex) < 0 {
            return Err(anyhow!("fcntl(F_SETOWN_EX) failed with errno {}", errno()));
        }
    }

    if !rearm(fd) {
        return Err(anyhow!("PERF_EVENT_IOC_REFRESH failed with errno {}", errno()));
    }
    Ok(())
}

/// Re-enables an overflowed counter. Async-signal-safe.
pub fn rearm(fd: c_int) -> bool {
    unsafe { sys::ioctls::REFRESH(fd, 1) >= 0 }
}

/// Current counter value. Async-signal-safe.
pub fn read_counter(fd: c_int) -> Option<u64> {
    let mut value: u64 = 0;
    let ret = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    (ret == std::mem::size_of::<u64>() as isize).then_some(value)
}

pub fn close_counter(fd: c_int) {
    if fd < 0 {
        return;
    }
    unsafe {
        sys::ioctls::DISABLE(fd, 0);
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("PAPI_TOT_CYC", "cycles")]
    #[case("PAPI_TOT_INS", "instructions")]
    #[case("TASK_CLOCK", "task-clock")]
    fn aliases_map_to_the_same_event(#[case] alias: &str, #[case] name: &str) {
        assert_eq!(CounterEvent::from_name(alias), CounterEvent::from_name(name));
        assert!(CounterEvent::from_name(name).is_some());
    }

    #[test]
    fn unknown_counter() {
        assert_eq!(CounterEvent::from_name("PAPI_NOT_A_COUNTER"), None);
    }

    #[test]
    fn closing_an_invalid_fd_is_a_noop() {
        close_counter(-1);
        assert_eq!(read_counter(-1), None);
    }
}
