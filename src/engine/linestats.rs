use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FunctionKey;

/// Execution statistics for one source line.
///
/// Counters only ever grow while profiling is active; they are zeroed by
/// an explicit reset or by a successful merge into the shared store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCounter {
    pub exec_count: u64,
    pub total_time: u64,
    pub max_time: u64,
}

impl LineCounter {
    /// Record one execution that took `elapsed` microseconds.
    pub fn record(&mut self, elapsed: u64) {
        self.exec_count += 1;
        self.total_time += elapsed;
        if elapsed > self.max_time {
            self.max_time = elapsed;
        }
    }

    /// Fold another counter into this one.
    pub fn add(&mut self, other: &LineCounter) {
        self.exec_count += other.exec_count;
        self.total_time += other.total_time;
        if other.max_time > self.max_time {
            self.max_time = other.max_time;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.exec_count == 0 && self.total_time == 0 && self.max_time == 0
    }
}

/// Per-line counters for one function.
///
/// The slot count is fixed when the entry is created from the source text
/// current at that moment. Slot 0 is the synthetic whole-function
/// aggregate, slots 1..N cover statement lines.
#[derive(Debug)]
pub struct LineStatsEntry {
    lines: Box<[LineCounter]>,
}

impl LineStatsEntry {
    fn new(line_count: usize) -> Self {
        Self {
            lines: vec![LineCounter::default(); line_count].into_boxed_slice(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[LineCounter] {
        &self.lines
    }

    pub fn is_zero(&self) -> bool {
        self.lines.iter().all(LineCounter::is_zero)
    }

    /// Zero all counters, keeping the slots.
    pub fn zero(&mut self) {
        for line in self.lines.iter_mut() {
            *line = LineCounter::default();
        }
    }
}

/// Session-local line statistics, keyed by function.
///
/// Owned exclusively by one session; the hooks never reenter concurrently
/// for the same session, so no locking is needed here.
#[derive(Debug, Default)]
pub struct LineStats {
    entries: HashMap<FunctionKey, LineStatsEntry>,
}

impl LineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for `key` sized to `line_count` if it does not
    /// exist yet. An existing entry keeps its original size.
    pub fn ensure_function(&mut self, key: FunctionKey, line_count: usize) {
        self.entries
            .entry(key)
            .or_insert_with(|| LineStatsEntry::new(line_count));
    }

    /// Slot count of the entry for `key`, if one exists.
    pub fn line_count(&self, key: &FunctionKey) -> Option<usize> {
        self.entries.get(key).map(LineStatsEntry::line_count)
    }

    /// Record one execution of `line`. Lines beyond the entry's slot
    /// count are ignored; the source may have changed since the entry
    /// was created.
    pub fn record_line(&mut self, key: &FunctionKey, line: usize, elapsed: u64) {
        let Some(entry) = self.entries.get_mut(key) else {
            debug!(function = key.function.raw(), "line stats entry not found");
            return;
        };
        if let Some(counter) = entry.lines.get_mut(line) {
            counter.record(elapsed);
        }
    }

    /// Record one whole invocation of the function into slot 0.
    pub fn record_function(&mut self, key: &FunctionKey, elapsed: u64) {
        self.record_line(key, 0, elapsed);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&FunctionKey, &LineStatsEntry)> {
        self.entries.iter()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&FunctionKey, &mut LineStatsEntry)> {
        self.entries.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &FunctionKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
