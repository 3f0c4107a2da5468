use std::ffi::c_void;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use ebsampler::{CostCenterRegistry, Sampler, SamplerConfig, SamplerError, SamplingSource};

static HOST_CALLS: AtomicUsize = AtomicUsize::new(0);
static REPLACEMENT_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn host_handler(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {
    HOST_CALLS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn replacement_handler(_: c_int) {
    REPLACEMENT_CALLS.fetch_add(1, Ordering::SeqCst);
}

fn install(handler: SigHandler, flags: SaFlags) {
    let action = SigAction::new(handler, flags, SigSet::empty());
    unsafe { sigaction(Signal::SIGPROF, &action) }.unwrap();
}

#[test]
fn host_handler_keeps_running_and_replacement_is_detected() {
    // Given a program that already handles SIGPROF
    install(SigHandler::SigAction(host_handler), SaFlags::SA_SIGINFO);

    let registry = Arc::new(CostCenterRegistry::new());
    let config = SamplerConfig {
        source: SamplingSource::Itimer,
        per_thread_timers: false,
        // Long enough that the process timer stays quiet during the test.
        period: 5_000_000,
        ..Default::default()
    };
    let sampler = Sampler::builder(config)
        .timers(registry.clone())
        .build()
        .unwrap();
    let thread = sampler.init_thread().unwrap();

    // When a sampling signal arrives
    assert_eq!(unsafe { libc::raise(libc::SIGPROF) }, 0);

    // Then both the sampler and the host handler saw it
    let stats = sampler.thread_stats(thread).unwrap();
    assert!(stats.taken >= 1, "{stats:?}");
    assert!(stats.accepted >= 1, "{stats:?}");
    assert!(HOST_CALLS.load(Ordering::SeqCst) >= 1);

    // When the program later replaces the handler
    install(SigHandler::Handler(replacement_handler), SaFlags::empty());

    // Then new threads refuse to start sampling
    let other = Arc::clone(&sampler);
    let result = std::thread::spawn(move || other.init_thread())
        .join()
        .unwrap();
    match result {
        Err(err @ SamplerError::HandlerConflict { .. }) => assert_eq!(err.return_code(), -7),
        unexpected => panic!("expected a handler conflict, got {unexpected:?}"),
    }

    sampler.finalize();
    assert!(sampler.is_finalized());
    assert!(!sampler.is_attached());
}
