use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::metrics::MAX_METRICS;
use crate::unwind::MAX_UNWIND_DEPTH;

pub const DEFAULT_HISTOGRAM_CAPACITY: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, got {value:?}")]
    InvalidBool { var: String, value: String },
    #[error("{var}: expected a positive integer, got {value:?}")]
    InvalidNumber { var: String, value: String },
    #[error("sampling source must not be empty")]
    EmptySource,
    #[error("unwind depth {0:?} is neither a number nor \"auto\"")]
    InvalidUnwindDepth(String),
    #[error("sampling period must be greater than zero")]
    ZeroPeriod,
    #[error("at least one and at most {max} metrics must be configured, got {count}")]
    MetricCount { count: usize, max: usize },
    #[error("histogram capacity must be greater than zero")]
    ZeroCapacity,
}

/// What drives the sampling interrupts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SamplingSource {
    /// Thread CPU-time interval timer.
    #[default]
    Itimer,
    /// Wall-clock interval timer.
    WallClock,
    /// Overflow of a named hardware or software counter. The counter must
    /// also be part of the metric set.
    Counter(String),
    /// No interrupt source; samples are injected by the host.
    Manual,
}

impl SamplingSource {
    pub fn is_time_based(&self) -> bool {
        matches!(self, SamplingSource::Itimer | SamplingSource::WallClock)
    }
}

impl FromStr for SamplingSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(ConfigError::EmptySource),
            "itimer" | "ITIMER" => Ok(SamplingSource::Itimer),
            "TIME" | "time" | "wall" => Ok(SamplingSource::WallClock),
            "manual" => Ok(SamplingSource::Manual),
            counter => Ok(SamplingSource::Counter(counter.to_string())),
        }
    }
}

impl fmt::Display for SamplingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingSource::Itimer => write!(f, "itimer"),
            SamplingSource::WallClock => write!(f, "TIME"),
            SamplingSource::Counter(name) => write!(f, "{}", name),
            SamplingSource::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindDepth {
    /// Number of caller frames recorded beyond the sampled PC.
    Fixed(usize),
    /// Walk until the first repeated address or the key is full.
    #[default]
    Automatic,
}

impl FromStr for UnwindDepth {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" | "automatic" | "0" => Ok(UnwindDepth::Automatic),
            n => n
                .parse::<usize>()
                .map(|n| UnwindDepth::Fixed(n.min(MAX_UNWIND_DEPTH - 1)))
                .map_err(|_| ConfigError::InvalidUnwindDepth(s.to_string())),
        }
    }
}

impl fmt::Display for UnwindDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnwindDepth::Fixed(n) => write!(f, "{}", n),
            UnwindDepth::Automatic => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub enabled: bool,
    pub source: SamplingSource,
    /// Microseconds for timer sources, events for counter sources.
    pub period: u64,
    pub metrics: Vec<String>,
    pub unwind: bool,
    pub unwind_depth: UnwindDepth,
    /// Charge every enclosing context of the sampled one as well.
    pub inclusive: bool,
    pub keep_unresolved_addr: bool,
    pub track_runtime_states: bool,
    pub trace: bool,
    pub trace_dir: PathBuf,
    pub profile: bool,
    pub per_thread_timers: bool,
    /// Process samples that land inside the instrumentation itself.
    pub sample_inside_library: bool,
    pub annotate_callees: bool,
    pub histogram_capacity: usize,
    pub verbose: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: SamplingSource::Itimer,
            period: 10_000,
            metrics: vec!["TIME".to_string()],
            unwind: false,
            unwind_depth: UnwindDepth::Automatic,
            inclusive: false,
            keep_unresolved_addr: true,
            track_runtime_states: false,
            trace: false,
            trace_dir: PathBuf::from("."),
            profile: true,
            per_thread_timers: true,
            sample_inside_library: false,
            annotate_callees: false,
            histogram_capacity: DEFAULT_HISTOGRAM_CAPACITY,
            verbose: false,
        }
    }
}

impl SamplerConfig {
    /// Defaults overridden by any `EBS_*` variable present in the
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = SamplerConfig::default();

        let boolean = |var: &str, target: &mut bool| -> Result<(), ConfigError> {
            if let Some(value) = lookup(var) {
                *target = parse_bool(var, &value)?;
            }
            Ok(())
        };

        boolean("EBS_SAMPLING", &mut config.enabled)?;
        boolean("EBS_UNWIND", &mut config.unwind)?;
        boolean("EBS_INCLUSIVE", &mut config.inclusive)?;
        boolean("EBS_KEEP_UNRESOLVED_ADDR", &mut config.keep_unresolved_addr)?;
        boolean("EBS_TRACK_RUNTIME_STATES", &mut config.track_runtime_states)?;
        boolean("EBS_TRACE", &mut config.trace)?;
        boolean("EBS_PROFILE", &mut config.profile)?;
        boolean("EBS_PER_THREAD_TIMERS", &mut config.per_thread_timers)?;
        boolean("EBS_SAMPLE_INSIDE_LIBRARY", &mut config.sample_inside_library)?;
        boolean("EBS_ANNOTATE_CALLEES", &mut config.annotate_callees)?;
        boolean("EBS_VERBOSE", &mut config.verbose)?;

        if let Some(source) = lookup("EBS_SOURCE") {
            config.source = source.parse()?;
        }
        if let Some(period) = lookup("EBS_PERIOD") {
            config.period = parse_positive("EBS_PERIOD", &period)?;
        }
        if let Some(metrics) = lookup("EBS_METRICS") {
            config.metrics = parse_metric_list(&metrics);
        }
        if let Some(depth) = lookup("EBS_UNWIND_DEPTH") {
            config.unwind_depth = depth.parse()?;
        }
        if let Some(dir) = lookup("EBS_TRACE_DIR") {
            config.trace_dir = PathBuf::from(dir);
        }
        if let Some(capacity) = lookup("EBS_HISTOGRAM_CAPACITY") {
            config.histogram_capacity =
                parse_positive("EBS_HISTOGRAM_CAPACITY", &capacity)? as usize;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.metrics.is_empty() || self.metrics.len() > MAX_METRICS {
            return Err(ConfigError::MetricCount {
                count: self.metrics.len(),
                max: MAX_METRICS,
            });
        }
        if self.histogram_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Splits a `:` or `,` separated metric list.
pub fn parse_metric_list(value: &str) -> Vec<String> {
    value
        .split([':', ','])
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_positive(var: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            var: var.to_string(),
            value: value.to_string(),
        })
}
