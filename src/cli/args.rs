use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use ebsampler::config::{parse_metric_list, ConfigError, DEFAULT_HISTOGRAM_CAPACITY};
use ebsampler::{SamplerConfig, SamplingSource, UnwindDepth};

use crate::validators::parse_duration;
use crate::validators::period_in_range;
use crate::validators::thread_count_in_range;
use crate::validators::value_is_power_of_two;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(PartialEq, clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum ProfileFormat {
    None,
    #[default]
    Table,
    Folded,
    FlameGraph,
}

#[derive(PartialEq, clap::ValueEnum, Debug, Clone, Copy, Default)]
pub(crate) enum Workload {
    /// Floating point loop inside a single timer
    #[default]
    Spin,
    /// Recursive calls, each level inside the same timer
    Recursive,
    /// An outer timer alternating between two inner ones
    Nested,
}

#[derive(Parser, Debug)]
#[command(about = "Runs a synthetic workload under the event-based sampler")]
pub(crate) struct CliArgs {
    /// Interrupt source: itimer, TIME, manual or a counter such as PAPI_TOT_CYC
    #[arg(long, default_value_t = SamplerConfig::default().source)]
    pub(crate) source: SamplingSource,
    /// Microseconds between timer interrupts, or events between counter overflows
    #[arg(long, default_value_t = SamplerConfig::default().period, value_parser = period_in_range)]
    pub(crate) period: u64,
    /// Metrics to record, separated by ':' or ','
    #[arg(long, default_value = "TIME")]
    pub(crate) metrics: String,
    /// Record the callers of every sampled address
    #[arg(long)]
    pub(crate) unwind: bool,
    /// Callers to record beyond the sampled address, or auto
    #[arg(long, default_value_t = SamplerConfig::default().unwind_depth)]
    pub(crate) unwind_depth: UnwindDepth,
    /// Also charge every enclosing timer of a sample
    #[arg(long)]
    pub(crate) inclusive: bool,
    /// Name timers after their full call path
    #[arg(long)]
    pub(crate) callpaths: bool,
    /// Write a raw trace per thread
    #[arg(long)]
    pub(crate) trace: bool,
    /// Where trace files go
    #[arg(long, default_value = SamplerConfig::default().trace_dir.into_os_string())]
    pub(crate) trace_dir: PathBuf,
    /// Skip the histogram and cost center output
    #[arg(long)]
    pub(crate) no_profile: bool,
    /// Use one process-wide timer instead of one per thread
    #[arg(long)]
    pub(crate) shared_timer: bool,
    /// Prefix unwound frames with the name of their callee
    #[arg(long)]
    pub(crate) annotate_callees: bool,
    /// Distinct (context, stack) entries each thread can hold
    #[arg(long, default_value_t = DEFAULT_HISTOGRAM_CAPACITY, value_parser = value_is_power_of_two)]
    pub(crate) histogram_capacity: usize,
    /// Read the sampler configuration from EBS_* variables, ignoring the flags above
    #[arg(long)]
    pub(crate) from_env: bool,
    /// How long the workload runs, in seconds
    #[arg(short = 'D', long, default_value = "1", value_parser = parse_duration)]
    pub(crate) duration: Duration,
    /// Worker threads running the workload
    #[arg(long, default_value_t = 2, value_parser = thread_count_in_range)]
    pub(crate) threads: usize,
    #[arg(long, default_value_t, value_enum)]
    pub(crate) workload: Workload,
    /// Set the logging level
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
    #[arg(long, default_value_t, value_enum)]
    pub(crate) profile_format: ProfileFormat,
    /// Path for the generated profile.
    #[arg(long)]
    pub(crate) profile_path: Option<PathBuf>,
    /// Name for the generated profile.
    #[arg(long)]
    pub(crate) profile_name: Option<PathBuf>,
    /// Log recoverable sampler problems as warnings
    #[arg(long)]
    pub(crate) verbose: bool,
}

impl CliArgs {
    pub(crate) fn sampler_config(&self) -> Result<SamplerConfig, ConfigError> {
        if self.from_env {
            return SamplerConfig::from_env();
        }
        let config = SamplerConfig {
            source: self.source.clone(),
            period: self.period,
            metrics: parse_metric_list(&self.metrics),
            unwind: self.unwind,
            unwind_depth: self.unwind_depth,
            inclusive: self.inclusive,
            trace: self.trace,
            trace_dir: self.trace_dir.clone(),
            profile: !self.no_profile,
            per_thread_timers: !self.shared_timer,
            annotate_callees: self.annotate_callees,
            histogram_capacity: self.histogram_capacity,
            verbose: self.verbose,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}
