use tracing::{debug, span, warn, Level};

use crate::callsite::{AddressKind, CallSiteCache};
use crate::histogram::{Accumulator, HistogramEntry};
use crate::runtime_state::is_runtime_state_name;
use crate::timers::{
    strip_callpath, CostCenterId, CostCenterKind, TimerContext, CALLPATH_SEPARATOR,
};
use crate::unwind::StackKey;

pub const SAMPLE_GROUP: &str = "SAMPLE";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub context: CostCenterId,
    pub key: StackKey,
    pub accumulator: Accumulator,
}

impl From<HistogramEntry> for Candidate {
    fn from(entry: HistogramEntry) -> Self {
        Candidate {
            context: entry.context,
            key: entry.key,
            accumulator: entry.accumulator,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollapseSummary {
    pub candidates: usize,
    pub samples: u64,
    /// Candidates whose owning context had no name.
    pub orphaned: usize,
}

pub fn address_kind(depth: usize) -> AddressKind {
    if depth == 0 {
        AddressKind::ProgramCounter
    } else {
        AddressKind::ReturnAddress
    }
}

pub struct Collapser<'a> {
    pub timers: &'a dyn TimerContext,
    pub callsites: &'a CallSiteCache,
    pub metric_count: usize,
    pub annotate_callees: bool,
}

impl Collapser<'_> {
    fn charge(&self, id: CostCenterId, thread: usize, accumulator: &Accumulator, exclusive: bool) {
        self.timers
            .increment_call_count(id, thread, accumulator.count);
        for metric in 0..self.metric_count {
            let value = accumulator.sums[metric];
            self.timers.add_inclusive_time(id, metric, thread, value);
            if exclusive {
                self.timers.add_exclusive_time(id, metric, thread, value);
            }
        }
    }

    fn record(&self, name: &str, kind: CostCenterKind) -> CostCenterId {
        self.timers
            .create_or_get_named_cost_center(name, kind, SAMPLE_GROUP)
    }

    /// Folds every candidate of `thread` into cost centers. Candidates are
    /// processed in (context, key) order so record creation order does not
    /// depend on histogram layout.
    pub fn collapse(&self, thread: usize, mut candidates: Vec<Candidate>) -> CollapseSummary {
        let _span = span!(Level::DEBUG, "collapse", thread).entered();

        candidates.sort_by(|a, b| a.context.cmp(&b.context).then_with(|| a.key.cmp(&b.key)));

        let addresses: Vec<(u64, AddressKind)> = candidates
            .iter()
            .flat_map(|c| {
                c.key
                    .as_slice()
                    .iter()
                    .enumerate()
                    .map(|(depth, address)| (*address, address_kind(depth)))
            })
            .collect();
        self.callsites.prefetch(&addresses);

        let mut summary = CollapseSummary::default();
        for candidate in &candidates {
            summary.candidates += 1;
            summary.samples += candidate.accumulator.count;
            if !self.collapse_one(thread, candidate) {
                summary.orphaned += 1;
            }
        }

        debug!(
            "collapsed {} candidates ({} samples) on thread {}",
            summary.candidates, summary.samples, thread
        );
        summary
    }

    fn collapse_one(&self, thread: usize, candidate: &Candidate) -> bool {
        let Some(owner) = self.timers.name(candidate.context) else {
            warn!(
                "sampled context {:?} has no name, dropping {} samples",
                candidate.context, candidate.accumulator.count
            );
            return false;
        };
        let accumulator = &candidate.accumulator;
        let stripped = strip_callpath(&owner);

        let leaf = self.record(&format!("[CONTEXT] {}", stripped), CostCenterKind::Context);
        let full_path = format!("{}{}[CONTEXT] {}", owner, CALLPATH_SEPARATOR, stripped);
        let full = self.record(&full_path, CostCenterKind::Context);
        self.charge(leaf, thread, accumulator, false);
        self.charge(full, thread, accumulator, false);

        if is_runtime_state_name(&owner) {
            for metric in 0..self.metric_count {
                let value = accumulator.sums[metric];
                self.timers
                    .add_inclusive_time(candidate.context, metric, thread, value);
                self.timers
                    .add_exclusive_time(candidate.context, metric, thread, value);
            }
        }

        let mut path = full_path;
        let mut callee: Option<String> = None;
        for (depth, address) in candidate.key.as_slice().iter().enumerate() {
            let site = self.callsites.resolve(*address, address_kind(depth));
            let display = site.display(self.callsites.keep_unresolved_addr());
            let name = match (&callee, self.annotate_callees) {
                (Some(callee), true) => format!("{} [@] {}", callee, display),
                _ => display.to_string(),
            };
            let segment = if depth == 0 {
                format!("[SAMPLE] {}", name)
            } else {
                format!("[UNWIND] {}", name)
            };

            path.push_str(CALLPATH_SEPARATOR);
            path.push_str(&segment);

            let innermost = depth == 0;
            let cumulative = self.record(&path, CostCenterKind::Sample);
            let global = self.record(&segment, CostCenterKind::Sample);
            self.charge(cumulative, thread, accumulator, innermost);
            self.charge(global, thread, accumulator, innermost);

            callee = Some(site.short_name().to_string());
        }
        true
    }
}
