use std::ops::RangeInclusive;
use std::time::Duration;

use ebsampler::thread::MAX_THREADS;

const PERIOD_RANGE: RangeInclusive<u64> = 1..=60_000_000;

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

pub(crate) fn period_in_range(s: &str) -> Result<u64, String> {
    let period: u64 = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid period"))?;
    if !PERIOD_RANGE.contains(&period) {
        return Err(format!(
            "period not in allowed range {}-{}",
            PERIOD_RANGE.start(),
            PERIOD_RANGE.end()
        ));
    }
    Ok(period)
}

// The main thread takes a slot too.
pub(crate) fn thread_count_in_range(s: &str) -> Result<usize, String> {
    let threads: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid thread count"))?;
    if threads == 0 || threads >= MAX_THREADS {
        return Err(format!(
            "thread count must be between 1 and {}",
            MAX_THREADS - 1
        ));
    }
    Ok(threads)
}

// Convert a &str into a usize, if possible, and return the result if it's a
// power of 2
pub(crate) fn value_is_power_of_two(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid usize"))?;
    if value.is_power_of_two() {
        Ok(value)
    } else {
        Err(format!("{} is not a power of 2", value))
    }
}
