use std::ffi::c_void;

#[derive(Debug, PartialEq)]
pub enum Architecture {
    Arm64,
    X86,
    Other,
}

#[cfg(target_arch = "aarch64")]
pub fn architecture() -> Architecture {
    Architecture::Arm64
}

#[cfg(target_arch = "x86_64")]
pub fn architecture() -> Architecture {
    Architecture::X86
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn architecture() -> Architecture {
    Architecture::Other
}

/// Reads the interrupted program counter out of the machine context handed
/// to an `SA_SIGINFO` signal handler.
///
/// # Safety
///
/// `ucontext` must be null or point to a valid `ucontext_t`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub unsafe fn program_counter(ucontext: *const c_void) -> Option<u64> {
    if ucontext.is_null() {
        return None;
    }
    let ucontext = &*(ucontext as *const libc::ucontext_t);
    Some(ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as u64)
}

/// # Safety
///
/// `ucontext` must be null or point to a valid `ucontext_t`.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub unsafe fn program_counter(ucontext: *const c_void) -> Option<u64> {
    if ucontext.is_null() {
        return None;
    }
    let ucontext = &*(ucontext as *const libc::ucontext_t);
    Some(ucontext.uc_mcontext.pc)
}

/// # Safety
///
/// Always safe, the context is not inspected on this platform.
#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub unsafe fn program_counter(_ucontext: *const c_void) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_context_has_no_pc() {
        assert_eq!(unsafe { program_counter(std::ptr::null()) }, None);
    }

    #[test]
    fn known_architecture() {
        assert_ne!(architecture(), Architecture::Other);
    }
}
