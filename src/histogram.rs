use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::metrics::{MetricValues, MAX_METRICS};
use crate::timers::CostCenterId;
use crate::unwind::StackKey;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub sums: MetricValues,
}

impl Accumulator {
    pub const fn zeroed() -> Self {
        Accumulator {
            count: 0,
            sums: [0.0; MAX_METRICS],
        }
    }

    pub fn add(&mut self, deltas: &[f64]) {
        self.count += 1;
        for (sum, delta) in self.sums.iter_mut().zip(deltas) {
            *sum += delta;
        }
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramEntry {
    pub context: CostCenterId,
    pub key: StackKey,
    pub accumulator: Accumulator,
}

/// Where `PathHistogram::accumulate` counted an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulated {
    Recorded,
    /// The stack did not fit; only the context got the observation.
    ContextOnly,
    Dropped,
}

impl Accumulated {
    pub fn is_recorded(self) -> bool {
        self == Accumulated::Recorded
    }
}

pub struct PathHistogram {
    slots: Box<[Option<HistogramEntry>]>,
    len: usize,
    max_len: usize,
}

impl PathHistogram {
    /// `capacity` is rounded up to a power of two. Full stacks fill at most
    /// three quarters of it, the rest is kept for context-only entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        PathHistogram {
            slots: vec![None; capacity].into_boxed_slice(),
            len: 0,
            max_len: (capacity / 4 * 3).max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn home(&self, context: CostCenterId, key: &StackKey) -> usize {
        let mut hasher = DefaultHasher::new();
        context.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish() as usize & (self.slots.len() - 1)
    }

    /// Index of the entry for `(context, key)` or of the free slot where it
    /// would go.
    fn probe(&self, context: CostCenterId, key: &StackKey) -> usize {
        let mask = self.slots.len() - 1;
        let mut index = self.home(context, key);
        loop {
            match &self.slots[index] {
                Some(entry) if entry.context == context && entry.key == *key => return index,
                Some(_) => index = (index + 1) & mask,
                None => return index,
            }
        }
    }

    /// Counts one observation. A new key that does not fit is counted on
    /// the context-only entry of `context` instead, which may use the
    /// reserved quarter of the table. Async-signal-safe.
    pub fn accumulate(
        &mut self,
        context: CostCenterId,
        key: &StackKey,
        deltas: &[f64],
    ) -> Accumulated {
        let context_only_limit = self.slots.len() - 1;
        if key.is_empty() {
            return match self.add(context, key, deltas, context_only_limit) {
                true => Accumulated::Recorded,
                false => Accumulated::Dropped,
            };
        }
        if self.add(context, key, deltas, self.max_len) {
            return Accumulated::Recorded;
        }
        match self.add(context, &StackKey::empty(), deltas, context_only_limit) {
            true => Accumulated::ContextOnly,
            false => Accumulated::Dropped,
        }
    }

    fn add(
        &mut self,
        context: CostCenterId,
        key: &StackKey,
        deltas: &[f64],
        limit: usize,
    ) -> bool {
        let index = self.probe(context, key);
        if let Some(entry) = &mut self.slots[index] {
            entry.accumulator.add(deltas);
            return true;
        }
        if self.len >= limit {
            return false;
        }

        let mut accumulator = Accumulator::zeroed();
        accumulator.add(deltas);
        self.slots[index] = Some(HistogramEntry {
            context,
            key: *key,
            accumulator,
        });
        self.len += 1;
        true
    }

    pub fn get(&self, context: CostCenterId, key: &StackKey) -> Option<&Accumulator> {
        self.slots[self.probe(context, key)]
            .as_ref()
            .map(|entry| &entry.accumulator)
    }

    /// Contexts with at least one entry, in id order.
    pub fn contexts(&self) -> Vec<CostCenterId> {
        let mut contexts: Vec<_> = self.slots.iter().flatten().map(|e| e.context).collect();
        contexts.sort_unstable();
        contexts.dedup();
        contexts
    }

    /// Removes and returns every entry of `context`.
    pub fn drain(&mut self, context: CostCenterId) -> Vec<(StackKey, Accumulator)> {
        let mut drained = Vec::new();
        let mut kept = Vec::new();
        for slot in self.slots.iter_mut() {
            match slot.take() {
                Some(entry) if entry.context == context => {
                    drained.push((entry.key, entry.accumulator))
                }
                Some(entry) => kept.push(entry),
                None => {}
            }
        }
        // Probe chains are rebuilt from scratch for the survivors.
        self.len = 0;
        for entry in kept {
            let index = self.probe(entry.context, &entry.key);
            self.slots[index] = Some(entry);
            self.len += 1;
        }
        drained
    }

    pub fn drain_all(&mut self) -> Vec<HistogramEntry> {
        self.len = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::{CostCenterKind, CostCenterRegistry, TimerContext};
    use rand::Rng;

    fn contexts() -> (CostCenterId, CostCenterId) {
        let registry = CostCenterRegistry::new();
        (
            registry.create_or_get_named_cost_center("a", CostCenterKind::Timer, "USER"),
            registry.create_or_get_named_cost_center("b", CostCenterKind::Timer, "USER"),
        )
    }

    #[test]
    fn repeated_keys_are_never_double_counted() {
        let (context, _) = contexts();
        let mut histogram = PathHistogram::with_capacity(64);
        let key = StackKey::from_slice(&[0x401000, 0x402000]);
        let mut rng = rand::thread_rng();

        let mut expected = [0.0; 2];
        let n = rng.gen_range(1..500);
        for _ in 0..n {
            let deltas = [rng.gen_range(0.0..100.0), rng.gen_range(0.0..1e6)];
            expected[0] += deltas[0];
            expected[1] += deltas[1];
            assert!(histogram.accumulate(context, &key, &deltas).is_recorded());
        }

        let accumulator = histogram.get(context, &key).unwrap();
        assert_eq!(accumulator.count, n);
        assert_eq!(&accumulator.sums[..2], &expected);
        assert_eq!(histogram.len(), 1);
    }

    #[test]
    fn drain_happens_once() {
        let (a, b) = contexts();
        let mut histogram = PathHistogram::with_capacity(16);
        for pc in 0..5u64 {
            histogram.accumulate(a, &StackKey::from_pc(pc), &[1.0]);
            histogram.accumulate(b, &StackKey::from_pc(pc), &[2.0]);
        }
        assert_eq!(histogram.contexts(), vec![a, b]);

        let mut drained = histogram.drain(a);
        drained.sort_by_key(|(key, _)| *key);
        assert_eq!(drained.len(), 5);
        assert!(drained.iter().all(|(_, acc)| acc.count == 1 && acc.sums[0] == 1.0));
        assert!(histogram.drain(a).is_empty());

        // The other context survives the rebuild.
        assert_eq!(histogram.contexts(), vec![b]);
        assert_eq!(histogram.get(b, &StackKey::from_pc(3)).unwrap().sums[0], 2.0);
        assert_eq!(histogram.drain_all().len(), 5);
        assert!(histogram.is_empty());
        assert!(histogram.drain(b).is_empty());
    }

    #[test]
    fn full_table_keeps_counting_new_keys_on_their_context() {
        // Given a table whose full-stack entries are used up
        let (a, b) = contexts();
        let mut histogram = PathHistogram::with_capacity(5);
        assert_eq!(histogram.capacity(), 8);
        for pc in 0..6u64 {
            assert_eq!(
                histogram.accumulate(a, &StackKey::from_pc(pc), &[1.0]),
                Accumulated::Recorded
            );
        }

        // When new stacks keep arriving
        let outcomes: Vec<_> = (100..110u64)
            .map(|pc| histogram.accumulate(a, &StackKey::from_pc(pc), &[2.0]))
            .collect();

        // Then they land on one context-only entry and known keys still count
        assert!(outcomes.iter().all(|o| *o == Accumulated::ContextOnly));
        let context_only = histogram.get(a, &StackKey::empty()).unwrap();
        assert_eq!(context_only.count, 10);
        assert_eq!(context_only.sums[0], 20.0);
        assert_eq!(histogram.get(a, &StackKey::from_pc(100)), None);
        assert!(histogram
            .accumulate(a, &StackKey::from_pc(1), &[1.0])
            .is_recorded());
        assert_eq!(histogram.get(a, &StackKey::from_pc(1)).unwrap().count, 2);

        // And only a completely full table drops observations
        assert_eq!(histogram.len(), 7);
        assert_eq!(
            histogram.accumulate(b, &StackKey::from_pc(1), &[1.0]),
            Accumulated::Dropped
        );
        let total: u64 = histogram.drain(a).iter().map(|(_, acc)| acc.count).sum();
        assert_eq!(total, 6 + 1 + 10);
    }

    #[test]
    fn same_key_in_different_contexts_is_distinct() {
        let (a, b) = contexts();
        let mut histogram = PathHistogram::with_capacity(8);
        let key = StackKey::from_pc(0x1234);
        histogram.accumulate(a, &key, &[1.0]);
        histogram.accumulate(b, &key, &[1.0]);
        histogram.accumulate(b, &key, &[1.0]);
        assert_eq!(histogram.get(a, &key).unwrap().count, 1);
        assert_eq!(histogram.get(b, &key).unwrap().count, 2);
    }
}
