use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};

use ebsampler::CostCenterRegistry;
use tracing::warn;

use crate::args::Workload;

const RECURSION_DEPTH: u32 = 12;

impl Workload {
    /// Runs until `running` is cleared, timing every phase in `registry`.
    pub(crate) fn run(self, registry: &CostCenterRegistry, running: &AtomicBool) {
        let Ok(_main) = registry.scoped("main") else {
            warn!("could not start the main timer");
            return;
        };
        while running.load(Ordering::Relaxed) {
            match self {
                Workload::Spin => {
                    if let Ok(_spin) = registry.scoped("spin") {
                        black_box(spin(200_000));
                    }
                }
                Workload::Recursive => {
                    black_box(recurse(registry, RECURSION_DEPTH));
                }
                Workload::Nested => {
                    if let Ok(_solve) = registry.scoped("solve") {
                        if let Ok(_a) = registry.scoped("kernel_a") {
                            black_box(spin(100_000));
                        }
                        if let Ok(_b) = registry.scoped("kernel_b") {
                            black_box(spin(300_000));
                        }
                    }
                }
            }
        }
    }
}

#[inline(never)]
fn spin(iterations: u64) -> f64 {
    let mut acc = 0.0f64;
    for i in 0..iterations {
        acc = (acc + i as f64).sqrt();
    }
    acc
}

#[inline(never)]
fn recurse(registry: &CostCenterRegistry, depth: u32) -> f64 {
    let Ok(_level) = registry.scoped("recurse") else {
        return 0.0;
    };
    if depth == 0 {
        return spin(20_000);
    }
    spin(5_000) + recurse(registry, depth - 1)
}
