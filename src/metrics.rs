use std::os::raw::c_int;

use tracing::debug;

use crate::config::SamplingSource;
use crate::error::SamplerError;
use crate::perf_events::{close_counter, open_counter, read_counter, CounterEvent};

pub const MAX_METRICS: usize = 8;

/// Time-like metrics tried in order when choosing the one timers account
/// against.
pub const TIME_METRIC_FALLBACKS: [&str; 4] = ["TIME", "WALL_CLOCK", "CPU_TIME", "TASK_CLOCK"];

pub type MetricValues = [f64; MAX_METRICS];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Microseconds of wall-clock time.
    WallClock,
    /// Microseconds of CPU time consumed by the calling thread.
    CpuTime,
    Counter(CounterEvent),
}

impl MetricKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TIME" | "WALL_CLOCK" => Some(MetricKind::WallClock),
            "CPU_TIME" => Some(MetricKind::CpuTime),
            counter => CounterEvent::from_name(counter).map(MetricKind::Counter),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
}

#[derive(Debug, Clone)]
pub struct MetricSet {
    metrics: Vec<Metric>,
    time_index: usize,
    source_index: Option<usize>,
}

impl MetricSet {
    pub fn resolve(names: &[String], source: &SamplingSource) -> Result<Self, SamplerError> {
        if names.len() > MAX_METRICS {
            return Err(SamplerError::TooManyMetrics { max: MAX_METRICS });
        }

        let metrics = names
            .iter()
            .map(|name| {
                MetricKind::from_name(name)
                    .map(|kind| Metric {
                        name: name.clone(),
                        kind,
                    })
                    .ok_or_else(|| SamplerError::UnknownMetric(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let time_index = TIME_METRIC_FALLBACKS
            .iter()
            .find_map(|wanted| metrics.iter().position(|m| m.name == *wanted))
            .ok_or_else(|| SamplerError::NoTimeMetric {
                requested: names.join(", "),
                tried: TIME_METRIC_FALLBACKS.join(", "),
            })?;

        let source_index = match source {
            SamplingSource::Counter(counter) => {
                let event = CounterEvent::from_name(counter)
                    .ok_or_else(|| SamplerError::UnknownMetric(counter.clone()))?;
                let index = metrics
                    .iter()
                    .position(|m| m.kind == MetricKind::Counter(event))
                    .ok_or_else(|| SamplerError::SourceMetricMissing(counter.clone()))?;
                Some(index)
            }
            _ => None,
        };

        debug!(
            "metrics: {:?}, time metric: {}, source metric: {:?}",
            metrics.iter().map(|m| &m.name).collect::<Vec<_>>(),
            metrics[time_index].name,
            source_index
        );

        Ok(MetricSet {
            metrics,
            time_index,
            source_index,
        })
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }

    pub fn time_index(&self) -> usize {
        self.time_index
    }

    /// Index of the counter driving overflow sampling, if any.
    pub fn source_index(&self) -> Option<usize> {
        self.source_index
    }

    /// Opens the per-thread perf descriptors backing counter metrics. The
    /// source counter is opened for overflow sampling every `period` events.
    pub fn open_thread_counters(&self, period: u64) -> Result<ThreadCounters, SamplerError> {
        let mut counters = ThreadCounters::empty();
        for (i, metric) in self.metrics.iter().enumerate() {
            if let MetricKind::Counter(event) = metric.kind {
                let sample_period = (self.source_index == Some(i)).then_some(period);
                match open_counter(event, sample_period) {
                    Ok(fd) => counters.fds[i] = fd,
                    Err(e) => {
                        counters.close();
                        return Err(SamplerError::PerfEvent(
                            e.context(format!("opening counter {}", metric.name)),
                        ));
                    }
                }
            }
        }
        Ok(counters)
    }

    /// Reads every metric for the calling thread. Async-signal-safe.
    pub fn read(&self, counters: &ThreadCounters, out: &mut MetricValues) {
        for (i, metric) in self.metrics.iter().enumerate() {
            out[i] = match metric.kind {
                MetricKind::WallClock => wall_clock_us(),
                MetricKind::CpuTime => thread_cpu_time_us(),
                MetricKind::Counter(_) => read_counter(counters.fds[i]).unwrap_or(0) as f64,
            };
        }
    }
}

/// Perf descriptors of one thread, `-1` where a metric is not a counter.
#[derive(Debug, Clone, Copy)]
pub struct ThreadCounters {
    fds: [c_int; MAX_METRICS],
}

impl ThreadCounters {
    pub const fn empty() -> Self {
        ThreadCounters {
            fds: [-1; MAX_METRICS],
        }
    }

    pub fn fd(&self, index: usize) -> Option<c_int> {
        self.fds.get(index).copied().filter(|fd| *fd >= 0)
    }

    pub fn close(&mut self) {
        for fd in self.fds.iter_mut() {
            close_counter(*fd);
            *fd = -1;
        }
    }
}

impl Default for ThreadCounters {
    fn default() -> Self {
        Self::empty()
    }
}

fn clock_us(clock: libc::clockid_t) -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
        return 0.0;
    }
    ts.tv_sec as f64 * 1e6 + ts.tv_nsec as f64 / 1e3
}

/// Elapsed-time base of the WALL_CLOCK metric and of timer accounting.
pub fn wall_clock_us() -> f64 {
    clock_us(libc::CLOCK_MONOTONIC)
}

/// Microseconds since the epoch, for trace timestamps only.
pub fn realtime_us() -> f64 {
    clock_us(libc::CLOCK_REALTIME)
}

pub fn thread_cpu_time_us() -> f64 {
    clock_us(libc::CLOCK_THREAD_CPUTIME_ID)
}

/// Per-metric difference against the previous snapshot. A source counter
/// reading below one period is taken to have wrapped and is charged a full
/// period. This is an approximation: an unrelated counter reset is charged
/// the same way.
pub fn compute_deltas(
    count: usize,
    current: &MetricValues,
    previous: &MetricValues,
    source_index: Option<usize>,
    period: u64,
    out: &mut MetricValues,
) {
    for i in 0..count.min(MAX_METRICS) {
        out[i] = if source_index == Some(i) && current[i] < period as f64 {
            period as f64
        } else {
            current[i] - previous[i]
        };
    }
}
