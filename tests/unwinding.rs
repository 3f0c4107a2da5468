use std::hint::black_box;
use std::sync::Arc;

use ebsampler::symbols::{BlazeResolver, SymbolResolver};
use ebsampler::unwind::{
    BacktraceWalker, BaseDepth, FrameClassifier, FrameWalker, StackKey, SymbolPrefixClassifier,
    Unwinder,
};
use ebsampler::UnwindDepth;

const PC: u64 = 0x1000;

fn function_at(resolver: &BlazeResolver, return_address: u64) -> String {
    // Return addresses point past the call instruction.
    resolver
        .resolve(return_address - 1)
        .map(|symbol| symbol.function)
        .unwrap_or_default()
}

#[inline(never)]
fn first_measured_frame(resolver: &Arc<BlazeResolver>) -> Option<u64> {
    let classifier = SymbolPrefixClassifier::new(resolver.clone());
    let mut first = None;
    BacktraceWalker.walk(&mut |address| {
        if !classifier.is_internal(address, 0) {
            first = Some(address);
            return false;
        }
        true
    });
    black_box(first)
}

#[inline(never)]
fn unwind_target(unwinder: &Unwinder, base: &BaseDepth) -> StackKey {
    let mut key = StackKey::empty();
    unwinder.unwind(PC, base, &mut key);
    black_box(key)
}

#[inline(never)]
fn unwind_outer(unwinder: &Unwinder, base: &BaseDepth) -> StackKey {
    let key = unwind_target(unwinder, base);
    black_box(key)
}

#[test]
fn sampler_frames_are_internal_on_a_real_stack() {
    let resolver = Arc::new(BlazeResolver::new());
    let first = first_measured_frame(&resolver).expect("a frame outside the sampler");
    let name = function_at(&resolver, first);
    assert!(name.contains("first_measured_frame"), "{}", name);
}

#[test]
fn first_caller_is_the_interrupted_frames_caller() {
    // Given an unwinder that treats everything in the sampler as internal
    let resolver = Arc::new(BlazeResolver::new());
    let unwinder = Unwinder::new(
        Box::new(BacktraceWalker),
        Box::new(SymbolPrefixClassifier::new(resolver.clone())),
        UnwindDepth::Fixed(4),
    );
    let base = BaseDepth::new();

    // When unwinding from `unwind_target` called by `unwind_outer`
    let calibrating = unwind_outer(&unwinder, &base);
    let calibrated = unwind_outer(&unwinder, &base);

    // Then slot 1 is `unwind_outer` on the first walk and every later one
    assert!(base.get().is_some());
    for key in [calibrating, calibrated] {
        assert_eq!(key.as_slice()[0], PC);
        assert!(key.len() > 1, "{:?}", key);
        let caller = function_at(&resolver, key.as_slice()[1]);
        assert!(caller.contains("unwind_outer"), "{} in {:?}", caller, key);
    }
    assert_eq!(calibrating.as_slice()[1], calibrated.as_slice()[1]);
}
