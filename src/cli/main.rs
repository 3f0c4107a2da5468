use std::error::Error;
use std::fs::File;
use std::io::IsTerminal;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{after, bounded, select};
use inferno::flamegraph;
use tracing::{debug, error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use ebsampler::report::{fold_cost_centers, format_table};
use ebsampler::{CostCenterRegistry, Sampler, SamplerError};

mod args;
mod validators;
mod workloads;

use crate::args::CliArgs;
use crate::args::LoggingLevel;
use crate::args::ProfileFormat;

/// Exit the main thread if any thread panics. A worker dying mid-run would
/// leave its timers open and its samples unaccounted for.
fn panic_thread_hook() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn write_flamegraph(path: &Path, folded: &str) -> anyhow::Result<()> {
    let mut options: flamegraph::Options<'_> = flamegraph::Options::default();
    let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    flamegraph::from_reader(&mut options, folded.as_bytes(), f)
        .context("rendering the flame graph")?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    panic_thread_hook();
    let args = CliArgs::parse();

    let level_filter = match args.logging {
        LoggingLevel::Trace => Level::TRACE,
        LoggingLevel::Debug => Level::DEBUG,
        LoggingLevel::Info => Level::INFO,
        LoggingLevel::Warn => Level::WARN,
        LoggingLevel::Error => Level::ERROR,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.sampler_config()?;
    debug!("sampler config: {:?}", config);
    let metric_names = config.metrics.clone();

    let registry = Arc::new(CostCenterRegistry::with_callpaths(args.callpaths));
    let sampler = match Sampler::builder(config).timers(registry.clone()).build() {
        Ok(sampler) => sampler,
        Err(e) => {
            error!("could not set up sampling: {}", e);
            std::process::exit(e.return_code().abs());
        }
    };

    let (stop_signal_sender, stop_signal_receive) = bounded(1);
    ctrlc::set_handler(move || {
        info!("received Ctrl+C, stopping...");
        let _ = stop_signal_sender.send(());
    })?;

    let running = Arc::new(AtomicBool::new(true));
    let mut workers = Vec::with_capacity(args.threads);
    for i in 0..args.threads {
        let sampler = Arc::clone(&sampler);
        let registry = Arc::clone(&registry);
        let running = Arc::clone(&running);
        let workload = args.workload;
        let worker = thread::Builder::new()
            .name(format!("worker-{i}"))
            .spawn(move || -> Result<usize, SamplerError> {
                let thread = sampler.init_thread()?;
                workload.run(&registry, &running);
                sampler.finalize_thread()?;
                Ok(thread)
            })?;
        workers.push(worker);
    }

    select! {
        recv(stop_signal_receive) -> _ => {},
        recv(after(args.duration)) -> _ => {},
    }
    running.store(false, Ordering::Relaxed);

    let mut threads = Vec::new();
    for worker in workers {
        match worker.join() {
            Ok(Ok(thread)) => threads.push(thread),
            Ok(Err(e)) => error!("worker failed: {}", e),
            Err(_) => error!("worker panicked"),
        }
    }
    sampler.finalize();

    for thread in &threads {
        if let Some(stats) = sampler.thread_stats(*thread) {
            info!(
                "thread {}: {} samples taken, {} accepted, {} dropped reentrant, {} dropped suspended, {} histogram overflows",
                thread,
                stats.taken,
                stats.accepted,
                stats.dropped_reentrant,
                stats.dropped_suspended,
                stats.histogram_overflows
            );
        }
    }

    let snapshots = registry.snapshot();
    let profile_path = args.profile_path.unwrap_or(PathBuf::from(""));
    match args.profile_format {
        ProfileFormat::Table => {
            print!(
                "{}",
                format_table(&snapshots, metric_names.iter().map(String::as_str))
            );
        }
        ProfileFormat::Folded => {
            println!("{}", fold_cost_centers(&snapshots, None));
        }
        ProfileFormat::FlameGraph => {
            let profile_name = args.profile_name.unwrap_or_else(|| "flame.svg".into());
            let profile_path = profile_path.join(profile_name);
            match write_flamegraph(&profile_path, &fold_cost_centers(&snapshots, None)) {
                Ok(()) => {
                    eprintln!(
                        "Flamegraph profile successfully written to {}",
                        profile_path.to_string_lossy()
                    );
                }
                Err(e) => {
                    error!("Failed to generate flamegraph: {:?}", e);
                }
            }
        }
        ProfileFormat::None => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use ebsampler::{SamplingSource, UnwindDepth};
    use rstest::rstest;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert()
    }

    #[test]
    fn defaults_match_the_library() {
        let args = CliArgs::try_parse_from(["ebsampler"]).unwrap();
        let config = args.sampler_config().unwrap();
        assert_eq!(
            config,
            ebsampler::SamplerConfig {
                trace_dir: config.trace_dir.clone(),
                ..Default::default()
            }
        );
    }

    #[rstest]
    #[case::itimer(&["--source", "itimer"], SamplingSource::Itimer)]
    #[case::wall_clock(&["--source", "TIME"], SamplingSource::WallClock)]
    #[case::manual(&["--source", "manual"], SamplingSource::Manual)]
    #[case::counter(
        &["--source", "PAPI_TOT_CYC", "--metrics", "TIME:PAPI_TOT_CYC"],
        SamplingSource::Counter("PAPI_TOT_CYC".to_string())
    )]
    #[trace]
    fn sources(#[case] flags: &[&str], #[case] expected: SamplingSource) {
        let args = CliArgs::try_parse_from(std::iter::once("ebsampler").chain(flags.iter().copied()))
            .unwrap();
        let config = args.sampler_config().unwrap();
        assert_eq!(config.source, expected);
    }

    #[rstest]
    #[case::period_zero(&["--period", "0"], "period not in allowed range")]
    #[case::capacity(&["--histogram-capacity", "1000"], "1000 is not a power of 2")]
    #[case::threads(&["--threads", "0"], "thread count must be between")]
    #[case::depth(&["--unwind-depth", "deep"], "deep")]
    #[trace]
    fn rejected_flags(#[case] flags: &[&str], #[case] expected_msg: &str) {
        let err = CliArgs::try_parse_from(std::iter::once("ebsampler").chain(flags.iter().copied()))
            .unwrap_err();
        assert!(err.to_string().contains(expected_msg), "{}", err);
    }

    #[test]
    fn unwinding_flags() {
        let args =
            CliArgs::try_parse_from(["ebsampler", "--unwind", "--unwind-depth", "4", "--inclusive"])
                .unwrap();
        let config = args.sampler_config().unwrap();
        assert!(config.unwind);
        assert!(config.inclusive);
        assert_eq!(config.unwind_depth, UnwindDepth::Fixed(4));
    }

    #[test]
    fn empty_metric_list_is_rejected() {
        let args = CliArgs::try_parse_from(["ebsampler", "--metrics", ":"]).unwrap();
        assert!(args.sampler_config().is_err());
    }
}
