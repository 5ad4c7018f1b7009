//! Shared statistics store.
//!
//! Holds the cross-session versions of the line-stats and call-graph
//! tables plus the process-wide activation switches. All structures are
//! fixed capacity, allocated once and never resized; running out of room
//! degrades to "stop recording new keys" behind a one-shot overflow flag
//! instead of ever failing the profiled workload.
//!
//! Locking discipline, strictly in this order:
//! 1. the table lock, shared for counter folding and exclusive for
//!    structural changes (inserts, resets, consistent line snapshots);
//! 2. a per-entry lock (call-graph rows) or atomic slot operations
//!    (line counters) for the counters themselves.

pub mod arena;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::warn;

use crate::engine::callgraph::{CallGraph, CallGraphStats, CallPathKey};
use crate::engine::linestats::LineStats;
use crate::engine::{FunctionKey, NamespaceId};
use crate::report::{CallGraphRow, LineStatsRow};

use self::arena::LineSlotArena;

/// Errors surfaced to operators of the profiler. The profiled workload
/// itself never observes these.
#[derive(Error, Debug)]
pub enum ProfilerError {
    /// The runtime was built without the shared store.
    #[error("shared aggregation is not enabled for this runtime")]
    SharedAggregationDisabled,

    /// A merge observed state the locking protocol makes impossible.
    /// This is a programming error; the merge aborts rather than risk
    /// corrupting the aggregate.
    #[error("shared table invariant violated during merge: {reason}")]
    MergeInvariant { reason: &'static str },
}

/// Shared call-graph entry. Counter updates take the entry lock while
/// holding the table lock in shared mode.
#[derive(Debug, Default)]
struct SharedCallGraphEntry {
    stats: Mutex<CallGraphStats>,
}

/// Shared line-stats entry. The line counters live in the slot arena;
/// `first_slot` is an index, never an address. `line_count` is zero when
/// the arena was exhausted at creation time.
#[derive(Debug, Clone, Copy)]
struct SharedFunctionEntry {
    line_count: usize,
    first_slot: usize,
}

/// Everything guarded by the table lock.
#[derive(Debug)]
struct SharedTables {
    functions: HashMap<FunctionKey, SharedFunctionEntry>,
    callgraph: HashMap<CallPathKey, SharedCallGraphEntry>,
    /// Free-running arena allocation cursor.
    lines_used: usize,
}

/// Either lock mode over [`SharedTables`]. Merges start shared and
/// escalate to exclusive the first time they need a structural insert,
/// then stay exclusive for the remainder of the pass.
enum TableLock<'a> {
    Shared(RwLockReadGuard<'a, SharedTables>),
    Exclusive(RwLockWriteGuard<'a, SharedTables>),
}

impl TableLock<'_> {
    fn tables(&self) -> &SharedTables {
        match self {
            TableLock::Shared(guard) => &**guard,
            TableLock::Exclusive(guard) => &**guard,
        }
    }
}

/// The shared aggregate: bounded tables, the line-slot arena, overflow
/// flags and the activation switches.
#[derive(Debug)]
pub struct SharedStats {
    tables: RwLock<SharedTables>,
    arena: LineSlotArena,
    max_functions: usize,
    max_call_paths: usize,

    callgraph_overflow: AtomicBool,
    functions_overflow: AtomicBool,
    lines_overflow: AtomicBool,

    enabled_global: AtomicBool,
    /// Session id the per-session switch selects; 0 means none.
    enabled_session: AtomicU32,
    collect_interval_us: AtomicU64,
}

impl SharedStats {
    pub fn new(max_functions: usize, max_call_paths: usize, max_line_slots: usize) -> Self {
        Self {
            tables: RwLock::new(SharedTables {
                functions: HashMap::with_capacity(max_functions),
                callgraph: HashMap::with_capacity(max_call_paths),
                lines_used: 0,
            }),
            arena: LineSlotArena::new(max_line_slots),
            max_functions,
            max_call_paths,
            callgraph_overflow: AtomicBool::new(false),
            functions_overflow: AtomicBool::new(false),
            lines_overflow: AtomicBool::new(false),
            enabled_global: AtomicBool::new(false),
            enabled_session: AtomicU32::new(0),
            collect_interval_us: AtomicU64::new(0),
        }
    }

    /// Fold a session's local tables into the shared store, zeroing every
    /// local counter that was merged. Returns the number of local entries
    /// folded. Entries whose counters are all zero are skipped, so a
    /// second call without intervening activity merges nothing.
    pub fn merge(
        &self,
        lines: &mut LineStats,
        callgraph: &mut CallGraph,
    ) -> Result<usize, ProfilerError> {
        let mut merged = 0usize;
        let mut lock = TableLock::Shared(self.tables.read());

        for (key, stats) in callgraph.entries_mut() {
            if stats.is_zero() {
                continue;
            }

            if lock.tables().callgraph.get(key).is_none() {
                let mut tables = match lock {
                    TableLock::Shared(guard) => {
                        drop(guard);
                        self.tables.write()
                    }
                    TableLock::Exclusive(guard) => guard,
                };

                // Another session may have created the entry while the
                // lock was released for escalation.
                if tables.callgraph.get(key).is_none() {
                    if tables.callgraph.len() >= self.max_call_paths {
                        self.note_callgraph_overflow();
                        lock = TableLock::Exclusive(tables);
                        break;
                    }
                    tables.callgraph.insert(*key, SharedCallGraphEntry::default());
                }
                lock = TableLock::Exclusive(tables);
            }

            let Some(entry) = lock.tables().callgraph.get(key) else {
                return Err(ProfilerError::MergeInvariant {
                    reason: "call graph entry missing after insert",
                });
            };
            entry.stats.lock().add(stats);
            stats.reset();
            merged += 1;
        }

        for (key, local_entry) in lines.entries_mut() {
            if local_entry.is_zero() {
                continue;
            }

            if lock.tables().functions.get(key).is_none() {
                let mut tables = match lock {
                    TableLock::Shared(guard) => {
                        drop(guard);
                        self.tables.write()
                    }
                    TableLock::Exclusive(guard) => guard,
                };

                if tables.functions.get(key).is_none() {
                    if tables.functions.len() >= self.max_functions {
                        self.note_functions_overflow();
                        lock = TableLock::Exclusive(tables);
                        break;
                    }

                    let line_count = local_entry.line_count();
                    let shared_entry = if line_count <= self.arena.capacity() - tables.lines_used {
                        let first_slot = tables.lines_used;
                        tables.lines_used += line_count;
                        self.arena.reset_range(first_slot, line_count);
                        SharedFunctionEntry {
                            line_count,
                            first_slot,
                        }
                    } else {
                        // Out of line slots: keep the function entry so
                        // its presence is still reported, without any
                        // per-line detail from here on.
                        self.note_lines_overflow();
                        SharedFunctionEntry {
                            line_count: 0,
                            first_slot: 0,
                        }
                    };
                    tables.functions.insert(*key, shared_entry);
                }
                lock = TableLock::Exclusive(tables);
            }

            let Some(shared_entry) = lock.tables().functions.get(key).copied() else {
                return Err(ProfilerError::MergeInvariant {
                    reason: "function entry missing after insert",
                });
            };
            if shared_entry.first_slot + shared_entry.line_count > self.arena.capacity() {
                return Err(ProfilerError::MergeInvariant {
                    reason: "line slot range outside the arena",
                });
            }

            let folded = local_entry.line_count().min(shared_entry.line_count);
            for (offset, counter) in local_entry.lines().iter().take(folded).enumerate() {
                self.arena.slot(shared_entry.first_slot + offset).add(counter);
            }
            local_entry.zero();
            merged += 1;
        }

        Ok(merged)
    }

    /// Consistent snapshot of the shared line statistics, optionally
    /// filtered to one namespace. Takes the table lock exclusively so no
    /// merge can interleave with the slot reads.
    pub fn line_rows(&self, namespace: Option<NamespaceId>) -> Vec<LineStatsRow> {
        let tables = self.tables.write();
        let mut rows = Vec::new();

        for (key, entry) in &tables.functions {
            if namespace.is_some_and(|ns| key.namespace != ns) {
                continue;
            }
            for line in 0..entry.line_count {
                let counter = self.arena.slot(entry.first_slot + line).load();
                rows.push(LineStatsRow {
                    namespace: key.namespace,
                    function: key.function,
                    line_number: line,
                    exec_count: counter.exec_count,
                    total_time: counter.total_time,
                    max_time: counter.max_time,
                });
            }
        }

        crate::report::sort_line_rows(&mut rows);
        rows
    }

    /// Snapshot of the shared call-graph statistics, optionally filtered
    /// to one namespace. Entry-level consistency: each row is read under
    /// its entry lock while the table lock is held shared.
    pub fn callgraph_rows(&self, namespace: Option<NamespaceId>) -> Vec<CallGraphRow> {
        let tables = self.tables.read();
        let mut rows = Vec::new();

        for (key, entry) in &tables.callgraph {
            if namespace.is_some_and(|ns| key.namespace() != ns) {
                continue;
            }
            let stats = *entry.stats.lock();
            rows.push(CallGraphRow::new(key, &stats));
        }

        crate::report::sort_callgraph_rows(&mut rows);
        rows
    }

    /// Functions with shared line statistics, optionally filtered to one
    /// namespace.
    pub fn functions(&self, namespace: Option<NamespaceId>) -> Vec<FunctionKey> {
        let tables = self.tables.read();
        let mut keys: Vec<FunctionKey> = tables
            .functions
            .keys()
            .filter(|key| !namespace.is_some_and(|ns| key.namespace != ns))
            .copied()
            .collect();
        keys.sort();
        keys
    }

    /// Drop all shared data and clear the overflow flags. The arena
    /// cursor restarts from zero; stale slots are zeroed when reclaimed.
    pub fn reset(&self) {
        let mut tables = self.tables.write();
        tables.functions.clear();
        tables.callgraph.clear();
        tables.lines_used = 0;

        self.callgraph_overflow.store(false, Ordering::Relaxed);
        self.functions_overflow.store(false, Ordering::Relaxed);
        self.lines_overflow.store(false, Ordering::Relaxed);
    }

    pub fn set_enabled_global(&self, enabled: bool) {
        self.enabled_global.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled_global(&self) -> bool {
        self.enabled_global.load(Ordering::Relaxed)
    }

    /// Select a single session to profile, or clear the selection.
    pub fn set_enabled_session(&self, session: Option<u32>) {
        self.enabled_session
            .store(session.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn enabled_session(&self) -> Option<u32> {
        match self.enabled_session.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Interval for automatic collection out of the function-exit hook.
    /// Zero disables automatic collection.
    pub fn set_collect_interval(&self, interval: Duration) {
        self.collect_interval_us
            .store(interval.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_micros(self.collect_interval_micros())
    }

    pub(crate) fn collect_interval_micros(&self) -> u64 {
        self.collect_interval_us.load(Ordering::Relaxed)
    }

    pub fn callgraph_overflowed(&self) -> bool {
        self.callgraph_overflow.load(Ordering::Relaxed)
    }

    pub fn functions_overflowed(&self) -> bool {
        self.functions_overflow.load(Ordering::Relaxed)
    }

    pub fn lines_overflowed(&self) -> bool {
        self.lines_overflow.load(Ordering::Relaxed)
    }

    fn note_callgraph_overflow(&self) {
        if !self.callgraph_overflow.swap(true, Ordering::Relaxed) {
            warn!("shared call graph table is full, new call paths will not be recorded");
        }
    }

    fn note_functions_overflow(&self) {
        if !self.functions_overflow.swap(true, Ordering::Relaxed) {
            warn!("shared function table is full, new functions will not be recorded");
        }
    }

    fn note_lines_overflow(&self) {
        if !self.lines_overflow.swap(true, Ordering::Relaxed) {
            warn!("shared line slot arena is full, per-line detail lost for new functions");
        }
    }
}
