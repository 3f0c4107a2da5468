use std::collections::HashMap;
use std::fmt::Write;

use itertools::Itertools;

use crate::timers::{CostCenterSnapshot, CALLPATH_SEPARATOR};

const CONTEXT_MARKER: &str = "[CONTEXT] ";
const SAMPLE_MARKER: &str = "[SAMPLE] ";
const UNWIND_MARKER: &str = "[UNWIND] ";

fn calls(snapshot: &CostCenterSnapshot, thread: Option<usize>) -> u64 {
    match thread {
        Some(thread) => snapshot.thread(thread).map_or(0, |stats| stats.calls),
        None => snapshot.calls(),
    }
}

/// Root to leaf frames of a cumulative `owner => [CONTEXT] .. => [SAMPLE]
/// .. => [UNWIND] ..` record.
fn folded_frames(name: &str) -> Option<Vec<String>> {
    let segments: Vec<&str> = name.split(CALLPATH_SEPARATOR).collect();
    let context = segments.iter().position(|s| s.starts_with(CONTEXT_MARKER))?;
    let owner = &segments[..context];
    let sampled = &segments[context + 1..];
    if owner.is_empty() {
        return None;
    }

    let frames = owner
        .iter()
        .copied()
        .chain(sampled.iter().rev().map(|segment| {
            segment
                .strip_prefix(SAMPLE_MARKER)
                .or_else(|| segment.strip_prefix(UNWIND_MARKER))
                .unwrap_or(segment)
        }))
        .map(|frame| frame.replace(';', ":"))
        .collect();
    Some(frames)
}

/// Folded stacks, one `frame;frame;frame count` line per distinct sampled
/// path, counting samples that ended exactly there. `thread` limits the
/// counts to one thread.
pub fn fold_cost_centers(snapshots: &[CostCenterSnapshot], thread: Option<usize>) -> String {
    let cumulative: HashMap<&str, u64> = snapshots
        .iter()
        .filter(|s| s.name.contains(CALLPATH_SEPARATOR) && s.name.contains(CONTEXT_MARKER))
        .map(|s| (s.name.as_str(), calls(s, thread)))
        .collect();

    let mut below: HashMap<&str, u64> = HashMap::new();
    for (name, count) in &cumulative {
        if let Some((parent, _)) = name.rsplit_once(CALLPATH_SEPARATOR) {
            if cumulative.contains_key(parent) {
                *below.entry(parent).or_default() += count;
            }
        }
    }

    cumulative
        .iter()
        .filter_map(|(name, count)| {
            let own = count.saturating_sub(below.get(name).copied().unwrap_or(0));
            if own == 0 {
                return None;
            }
            folded_frames(name).map(|frames| format!("{} {}", frames.join(";"), own))
        })
        .sorted()
        .join("\n")
}

/// Flat table of every cost center with calls, heaviest exclusive first.
pub fn format_table<'a>(
    snapshots: &[CostCenterSnapshot],
    metrics: impl Iterator<Item = &'a str>,
) -> String {
    let metrics: Vec<&str> = metrics.collect();
    let mut out = String::new();
    let _ = write!(out, "{:>10}", "calls");
    for metric in &metrics {
        let _ = write!(out, " {:>16} {:>16}", format!("incl {}", metric), format!("excl {}", metric));
    }
    let _ = writeln!(out, "  name");

    let rows = snapshots
        .iter()
        .filter(|s| s.calls() > 0)
        .sorted_by(|a, b| {
            b.exclusive(0)
                .total_cmp(&a.exclusive(0))
                .then_with(|| a.name.cmp(&b.name))
        });
    for snapshot in rows {
        let _ = write!(out, "{:>10}", snapshot.calls());
        for i in 0..metrics.len() {
            let _ = write!(
                out,
                " {:>16.1} {:>16.1}",
                snapshot.inclusive(i),
                snapshot.exclusive(i)
            );
        }
        let _ = writeln!(out, "  {}", snapshot.name);
    }
    out
}
