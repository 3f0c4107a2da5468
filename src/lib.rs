//! Event-based sampling for programs instrumented with named timers.

pub mod callsite;
pub mod config;
pub mod error;
pub mod finalize;
pub mod handler;
pub mod histogram;
pub mod metrics;
pub mod perf_events;
pub mod report;
pub mod runtime_state;
pub mod sampler;
pub mod state;
pub mod symbols;
pub mod thread;
pub mod timers;
pub mod trace;
pub mod trigger;
pub mod unwind;
pub mod util;

pub use config::{SamplerConfig, SamplingSource, UnwindDepth};
pub use error::SamplerError;
pub use sampler::{Sampler, SamplerBuilder, SuspendGuard};
pub use state::{SampleStats, ThreadLifecycle};
pub use timers::{CostCenterId, CostCenterRegistry, TimerContext};
