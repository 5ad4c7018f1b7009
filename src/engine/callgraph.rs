use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::{FunctionId, NamespaceId};

/// Maximum number of stack levels recorded individually. Deeper frames
/// are still counted but collapse onto the same truncated path key.
pub const MAX_STACK_DEPTH: usize = 200;

/// Identity of one aggregated call-graph row: a namespace plus the chain
/// of function ids from the outermost caller down to the function the
/// row describes. Unused slots hold the anonymous id.
///
/// Equality and hashing cover only the prefix up to the first unused
/// slot, so keys built from stacks of different depth compare correctly.
#[derive(Clone, Copy)]
pub struct CallPathKey {
    namespace: NamespaceId,
    stack: [FunctionId; MAX_STACK_DEPTH],
}

impl CallPathKey {
    /// Build a key from the recorded frames, outermost first. Frames past
    /// `MAX_STACK_DEPTH` are dropped.
    pub fn from_frames<I>(namespace: NamespaceId, frames: I) -> Self
    where
        I: IntoIterator<Item = FunctionId>,
    {
        let mut stack = [FunctionId::ANONYMOUS; MAX_STACK_DEPTH];
        for (slot, function) in stack.iter_mut().zip(frames) {
            *slot = function;
        }
        Self { namespace, stack }
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    /// The recorded call chain, outermost first.
    pub fn path(&self) -> &[FunctionId] {
        let len = self
            .stack
            .iter()
            .position(|f| *f == FunctionId::ANONYMOUS)
            .unwrap_or(MAX_STACK_DEPTH);
        &self.stack[..len]
    }
}

impl PartialEq for CallPathKey {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.path() == other.path()
    }
}

impl Eq for CallPathKey {}

impl Hash for CallPathKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.path().hash(state);
    }
}

impl fmt::Debug for CallPathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPathKey")
            .field("namespace", &self.namespace)
            .field("path", &self.path())
            .finish()
    }
}

/// Aggregated timing counters for one call path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGraphStats {
    pub call_count: u64,
    pub total_time: u64,
    pub child_time: u64,
    pub self_time: u64,
}

impl CallGraphStats {
    /// Record one completed invocation.
    pub fn record(&mut self, elapsed: u64, self_time: u64, child_time: u64) {
        self.call_count += 1;
        self.total_time += elapsed;
        self.child_time += child_time;
        self.self_time += self_time;
    }

    /// Fold another set of counters into this one.
    pub fn add(&mut self, other: &CallGraphStats) {
        self.call_count += other.call_count;
        self.total_time += other.total_time;
        self.child_time += other.child_time;
        self.self_time += other.self_time;
    }

    pub fn is_zero(&self) -> bool {
        self.call_count == 0
    }

    pub fn reset(&mut self) {
        *self = CallGraphStats::default();
    }
}

/// Session-local call-graph table.
///
/// Distinct call paths are never merged into one another here; only the
/// depth truncation in [`CallPathKey`] collapses keys, which is the
/// intended bound on deep recursion.
#[derive(Debug, Default)]
pub struct CallGraph {
    entries: HashMap<CallPathKey, CallGraphStats>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one invocation's timing under its call path.
    pub fn collect(&mut self, path: &CallPathKey, elapsed: u64, self_time: u64, child_time: u64) {
        self.entries
            .entry(*path)
            .or_default()
            .record(elapsed, self_time, child_time);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&CallPathKey, &CallGraphStats)> {
        self.entries.iter()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&CallPathKey, &mut CallGraphStats)> {
        self.entries.iter_mut()
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

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(key: &CallPathKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn path(ids: &[u32]) -> CallPathKey {
        CallPathKey::from_frames(NamespaceId(1), ids.iter().map(|id| FunctionId(*id)))
    }

    #[test]
    fn test_keys_compare_on_prefix_only() {
        assert_eq!(path(&[1, 2, 3]), path(&[1, 2, 3]));
        assert_ne!(path(&[1, 2, 3]), path(&[1, 2]));
        assert_ne!(path(&[1, 2, 3]), path(&[1, 2, 4]));
    }

    #[test]
    fn test_keys_distinguish_namespaces() {
        let a = CallPathKey::from_frames(NamespaceId(1), [FunctionId(5)]);
        let b = CallPathKey::from_frames(NamespaceId(2), [FunctionId(5)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_equal_keys_hash_equal() {
        assert_eq!(hash_of(&path(&[1, 2, 3])), hash_of(&path(&[1, 2, 3])));
    }

    #[test]
    fn test_frames_beyond_depth_limit_truncate_to_same_key() {
        let deep_a: Vec<u32> = (1..=(MAX_STACK_DEPTH as u32 + 5)).collect();
        let mut deep_b = deep_a.clone();
        deep_b.push(999);

        assert_eq!(path(&deep_a), path(&deep_b));
        assert_eq!(path(&deep_a).path().len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn test_collect_accumulates_per_path() {
        let mut graph = CallGraph::new();
        let key = path(&[1, 2]);

        graph.collect(&key, 100, 60, 40);
        graph.collect(&key, 50, 50, 0);
        graph.collect(&path(&[1]), 10, 10, 0);

        assert_eq!(graph.len(), 2);
        let stats = graph
            .entries()
            .find(|(k, _)| **k == key)
            .map(|(_, s)| *s)
            .expect("entry exists");
        assert_eq!(
            stats,
            CallGraphStats {
                call_count: 2,
                total_time: 150,
                child_time: 40,
                self_time: 110,
            }
        );
    }

    #[test]
    fn test_stats_self_plus_child_equals_total() {
        let mut stats = CallGraphStats::default();
        stats.record(100, 70, 30);
        stats.record(40, 40, 0);
        assert_eq!(stats.self_time + stats.child_time, stats.total_time);
    }
}
