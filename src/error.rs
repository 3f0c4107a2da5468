use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::thread::ThreadSlotsExhausted;

/// Setup-time failures. Nothing on the sampling path produces these; a
/// failed setup leaves sampling off and the host program untouched.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampling is disabled")]
    Disabled,
    #[error("no time-like metric available for sampling (requested {requested}, tried {tried})")]
    NoTimeMetric { requested: String, tried: String },
    #[error("sampling source {0} is not in the metric set")]
    SourceMetricMissing(String),
    #[error("unknown metric {0}")]
    UnknownMetric(String),
    #[error("too many metrics, at most {max} are supported")]
    TooManyMetrics { max: usize },
    #[error(transparent)]
    ThreadSlots(#[from] ThreadSlotsExhausted),
    #[error("thread {0} has already been finalized")]
    ThreadFinalized(usize),
    #[error("thread {0} is still sampling")]
    ThreadActive(usize),
    #[error("the {signal} handler was replaced by an unknown handler")]
    HandlerConflict { signal: &'static str },
    #[error("another sampler is already installed in this process")]
    AlreadyInstalled,
    #[error("{call} failed: {errno}")]
    Os {
        call: &'static str,
        errno: errno::Errno,
    },
    #[error("perf event setup failed: {0:#}")]
    PerfEvent(anyhow::Error),
    #[error("could not open trace file {path}")]
    Trace {
        path: PathBuf,
        #[source]
        io: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SamplerError {
    pub(crate) fn last_os_error(call: &'static str) -> Self {
        SamplerError::Os {
            call,
            errno: errno::errno(),
        }
    }

    /// Negative status code for hosts that only understand integers.
    pub fn return_code(&self) -> i32 {
        match self {
            SamplerError::Disabled => -1,
            SamplerError::NoTimeMetric { .. } => -2,
            SamplerError::SourceMetricMissing(_) => -3,
            SamplerError::UnknownMetric(_) | SamplerError::TooManyMetrics { .. } => -4,
            SamplerError::ThreadSlots(_) => -5,
            SamplerError::ThreadFinalized(_) | SamplerError::ThreadActive(_) => -6,
            SamplerError::HandlerConflict { .. } => -7,
            SamplerError::AlreadyInstalled => -8,
            SamplerError::Os { .. } => -9,
            SamplerError::PerfEvent(_) => -10,
            SamplerError::Trace { .. } => -11,
            SamplerError::Config(_) => -12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = SamplerError::NoTimeMetric {
            requested: "PAPI_L1_DCM".to_string(),
            tried: "TIME, WALL_CLOCK, CPU_TIME, TASK_CLOCK".to_string(),
        };
        insta::assert_snapshot!(err, @"no time-like metric available for sampling (requested PAPI_L1_DCM, tried TIME, WALL_CLOCK, CPU_TIME, TASK_CLOCK)");

        let err = SamplerError::HandlerConflict { signal: "SIGPROF" };
        insta::assert_snapshot!(err, @"the SIGPROF handler was replaced by an unknown handler");
    }

    #[test]
    fn return_codes_are_negative() {
        let errors = [
            SamplerError::Disabled,
            SamplerError::SourceMetricMissing("cycles".to_string()),
            SamplerError::ThreadFinalized(3),
            SamplerError::AlreadyInstalled,
            SamplerError::ThreadSlots(ThreadSlotsExhausted { max: 1 }),
        ];
        for err in errors {
            assert!(err.return_code() < 0, "{err}");
        }
    }
}
