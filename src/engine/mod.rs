//! Per-session profiling engine.
//!
//! A [`ProfilerSession`] belongs to exactly one interpreter execution
//! context. The host drives it through the [`ExecutorHooks`] trait; all
//! recording goes into session-local tables that are periodically folded
//! into the shared store. The hooks are synchronous and are never
//! reentered concurrently for one session, so the hot path takes no
//! locks at all.

pub mod callgraph;
pub mod linestats;
pub mod stack;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::report::{CallGraphRow, LineStatsRow};
use crate::runtime::ProfilerRuntime;
use crate::shared::{ProfilerError, SharedStats};
use crate::source::line_slots_for;

use self::callgraph::CallGraph;
use self::linestats::LineStats;
use self::stack::{CallStack, FrameSample};

/// Identifies a logical database/namespace the profiled code lives in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NamespaceId(pub u32);

impl NamespaceId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Identifies a profiled routine within a namespace. Id 0 is reserved
/// for anonymous code blocks, which are never profiled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub const ANONYMOUS: FunctionId = FunctionId(0);

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_anonymous(self) -> bool {
        self == Self::ANONYMOUS
    }
}

/// Fully qualified function identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FunctionKey {
    pub namespace: NamespaceId,
    pub function: FunctionId,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    Commit,
    Abort,
}

/// Per-invocation state handed to the host at function entry and
/// threaded back through the statement hooks.
///
/// This is the opaque plugin context: it holds only ephemeral statement
/// start times, so the host dropping it on an abnormal exit loses
/// nothing that matters. All durable counters live in the session.
#[derive(Debug)]
pub struct Invocation {
    function: FunctionId,
    statement_start: Box<[Option<u64>]>,
}

impl Invocation {
    fn new(function: FunctionId, line_count: usize) -> Self {
        Self {
            function,
            statement_start: vec![None; line_count].into_boxed_slice(),
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Remember when `line` started executing. Slot 0 is reserved for
    /// the whole-function aggregate and lines beyond the recorded source
    /// length are ignored.
    fn mark_statement_start(&mut self, line: usize, now: u64) {
        if line == 0 {
            return;
        }
        if let Some(slot) = self.statement_start.get_mut(line) {
            *slot = Some(now);
        }
    }

    fn take_statement_start(&mut self, line: usize) -> Option<u64> {
        self.statement_start.get_mut(line)?.take()
    }
}

/// The five executor callbacks plus the transaction boundary event.
///
/// Hosts call these synchronously from the interpreter; none of them
/// returns an error because a profiler failure must never become a
/// failure of the profiled workload.
pub trait ExecutorHooks {
    /// A function invocation is being set up. Returns the per-invocation
    /// context, or `None` when the session is inactive, the block is
    /// anonymous, or no source is available.
    fn on_function_enter(&mut self, function: FunctionId) -> Option<Invocation>;

    /// The invocation starts executing its body.
    fn on_function_begin(&mut self, invocation: &Invocation);

    /// A statement on `line` is about to execute.
    fn on_statement_before(&mut self, invocation: &mut Invocation, line: usize);

    /// The statement on `line` finished executing.
    fn on_statement_after(&mut self, invocation: &mut Invocation, line: usize);

    /// The invocation ran to completion.
    fn on_function_exit(&mut self, invocation: Invocation);

    /// The logical transaction ended. The host must deliver this for
    /// aborts as well; it is what repairs stacks after exceptions.
    fn on_transaction_boundary(&mut self, kind: BoundaryKind);
}

/// Profiler state for one interpreter execution context.
pub struct ProfilerSession {
    runtime: Arc<ProfilerRuntime>,
    namespace: NamespaceId,
    session_id: u32,

    local_enabled: bool,
    active: bool,
    first_call_in_txn: bool,
    /// Bumped at every transaction boundary.
    txn_generation: u64,
    /// Generation the current stack contents were pushed under.
    stack_generation: u64,
    /// Set by any recording operation, cleared when a merge starts.
    dirty: bool,
    last_collect_us: u64,

    stack: CallStack,
    line_stats: LineStats,
    callgraph: CallGraph,
}

impl ProfilerSession {
    pub(crate) fn new(
        runtime: Arc<ProfilerRuntime>,
        namespace: NamespaceId,
        session_id: u32,
        local_enabled: bool,
    ) -> Self {
        Self {
            runtime,
            namespace,
            session_id,
            local_enabled,
            active: false,
            first_call_in_txn: true,
            txn_generation: 0,
            stack_generation: 0,
            dirty: false,
            last_collect_us: 0,
            stack: CallStack::new(namespace),
            line_stats: LineStats::new(),
            callgraph: CallGraph::new(),
        }
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Set the session-local activation switch. Takes effect at the next
    /// transaction boundary, like every activation change.
    pub fn set_enabled_local(&mut self, enabled: bool) {
        self.local_enabled = enabled;
    }

    pub fn enabled_local(&self) -> bool {
        self.local_enabled
    }

    /// Whether the activation policy selected this session for the
    /// current transaction.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Fold the local tables into the shared store, zeroing merged local
    /// counters. Returns the number of entries folded; an immediate 0
    /// when nothing was recorded since the last merge.
    pub fn collect_into_shared(&mut self) -> Result<usize, ProfilerError> {
        let runtime = Arc::clone(&self.runtime);
        let shared = runtime
            .shared()
            .ok_or(ProfilerError::SharedAggregationDisabled)?;
        self.collect_into(shared)
    }

    fn collect_into(&mut self, shared: &SharedStats) -> Result<usize, ProfilerError> {
        if !self.dirty {
            return Ok(0);
        }
        self.dirty = false;
        shared.merge(&mut self.line_stats, &mut self.callgraph)
    }

    /// Snapshot of the session-local line statistics.
    pub fn local_line_rows(&self) -> Vec<LineStatsRow> {
        let mut rows = Vec::new();
        for (key, entry) in self.line_stats.entries() {
            for (line, counter) in entry.lines().iter().enumerate() {
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

    /// Snapshot of the session-local call-graph statistics.
    pub fn local_callgraph_rows(&self) -> Vec<CallGraphRow> {
        let mut rows: Vec<CallGraphRow> = self
            .callgraph
            .entries()
            .map(|(key, stats)| CallGraphRow::new(key, stats))
            .collect();
        crate::report::sort_callgraph_rows(&mut rows);
        rows
    }

    /// Functions with local line statistics.
    pub fn functions_local(&self) -> Vec<FunctionKey> {
        let mut keys: Vec<FunctionKey> = self.line_stats.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Drop all locally collected data.
    pub fn reset_local(&mut self) {
        self.line_stats.clear();
        self.callgraph.clear();
        self.dirty = false;
    }

    /// Run a stack operation with a sink that records emitted frame
    /// samples into the local tables and marks them dirty.
    fn with_stack<R>(
        &mut self,
        op: impl FnOnce(&mut CallStack, &mut dyn FnMut(FrameSample)) -> R,
    ) -> R {
        let namespace = self.namespace;
        let Self {
            stack,
            callgraph,
            line_stats,
            dirty,
            ..
        } = self;

        let mut sink = |sample: FrameSample| {
            *dirty = true;
            callgraph.collect(
                &sample.path,
                sample.elapsed,
                sample.self_time,
                sample.child_time,
            );
            line_stats.record_function(
                &FunctionKey {
                    namespace,
                    function: sample.function,
                },
                sample.elapsed,
            );
        };
        op(stack, &mut sink)
    }

    /// Collect into the shared store when the interval elapsed and the
    /// session is within global or per-session scope.
    fn maybe_collect(&mut self, now: u64) {
        let runtime = Arc::clone(&self.runtime);
        let Some(shared) = runtime.shared() else {
            return;
        };
        if !(shared.enabled_global() || shared.enabled_session() == Some(self.session_id)) {
            return;
        }
        let interval = shared.collect_interval_micros();
        if interval == 0 {
            return;
        }
        if now >= self.last_collect_us.saturating_add(interval) {
            if let Err(err) = self.collect_into(shared) {
                warn!(error = %err, "periodic collection into shared store failed");
            }
            self.last_collect_us = now;
        }
    }

    fn release_local(&mut self) {
        debug!(session = self.session_id, "profiler inactive, releasing local tables");
        self.line_stats.clear();
        self.callgraph.clear();
        self.dirty = false;
    }
}

impl ExecutorHooks for ProfilerSession {
    fn on_function_enter(&mut self, function: FunctionId) -> Option<Invocation> {
        // The active state is (re)evaluated only on the first call within
        // a transaction, so starting or stopping collection never splits
        // one in-flight execution.
        if self.first_call_in_txn {
            self.first_call_in_txn = false;
            self.active = match self.runtime.shared() {
                Some(shared) => {
                    shared.enabled_global()
                        || shared.enabled_session() == Some(self.session_id)
                        || self.local_enabled
                }
                None => self.local_enabled,
            };
        }

        if !self.active {
            if !self.line_stats.is_empty() || !self.callgraph.is_empty() {
                self.release_local();
            }
            return None;
        }

        if function.is_anonymous() {
            return None;
        }

        self.dirty = true;

        let key = FunctionKey {
            namespace: self.namespace,
            function,
        };
        let line_count = match self.line_stats.line_count(&key) {
            Some(count) => count,
            None => {
                let Some(source) = self.runtime.source().lookup(key) else {
                    debug!(function = function.raw(), "no source for function");
                    return None;
                };
                let count = line_slots_for(&source.text);
                self.line_stats.ensure_function(key, count);
                count
            }
        };

        Some(Invocation::new(function, line_count))
    }

    fn on_function_begin(&mut self, invocation: &Invocation) {
        if !self.active {
            return;
        }
        let now = self.runtime.clock().now_micros();

        if self.stack.is_empty() {
            self.stack_generation = self.txn_generation;
        } else if self.stack_generation != self.txn_generation {
            // A poisoned carry-over: the recorded path began in an
            // earlier transaction that never unwound properly.
            debug!(
                depth = self.stack.depth(),
                "call stack carried across a transaction boundary, unwinding"
            );
            self.with_stack(|stack, sink| stack.unwind_all(now, sink));
            self.stack_generation = self.txn_generation;
        }

        self.stack.push(invocation.function(), now);
    }

    fn on_statement_before(&mut self, invocation: &mut Invocation, line: usize) {
        if !self.active {
            return;
        }
        let now = self.runtime.clock().now_micros();
        invocation.mark_statement_start(line, now);

        // Repair the stack before resuming work in this frame; anything
        // above it was abandoned by an exception.
        let function = invocation.function();
        self.with_stack(|stack, sink| stack.check_top(function, now, sink));
    }

    fn on_statement_after(&mut self, invocation: &mut Invocation, line: usize) {
        if !self.active {
            return;
        }
        let now = self.runtime.clock().now_micros();
        let Some(start) = invocation.take_statement_start(line) else {
            return;
        };
        let elapsed = now.saturating_sub(start);

        self.dirty = true;
        let key = FunctionKey {
            namespace: self.namespace,
            function: invocation.function(),
        };
        self.line_stats.record_line(&key, line, elapsed);
    }

    fn on_function_exit(&mut self, invocation: Invocation) {
        if !self.active {
            return;
        }
        self.dirty = true;
        let now = self.runtime.clock().now_micros();

        let function = invocation.function();
        self.with_stack(|stack, sink| stack.pop(function, now, sink));

        self.maybe_collect(now);
    }

    fn on_transaction_boundary(&mut self, kind: BoundaryKind) {
        if self.active {
            let runtime = Arc::clone(&self.runtime);
            if let Some(shared) = runtime.shared() {
                if shared.collect_interval_micros() > 0 {
                    if let Err(err) = self.collect_into(shared) {
                        warn!(error = %err, "collection at transaction boundary failed");
                    }
                }
            }
        }

        self.first_call_in_txn = true;
        self.txn_generation += 1;

        // Close out whatever an abort left behind; the stack must be
        // empty between transactions.
        if !self.stack.is_empty() {
            debug!(
                ?kind,
                depth = self.stack.depth(),
                "unwinding frames left at transaction end"
            );
            let now = self.runtime.clock().now_micros();
            self.with_stack(|stack, sink| stack.unwind_all(now, sink));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::source::SourceCatalog;

    const NS: NamespaceId = NamespaceId(1);

    fn harness() -> (Arc<ManualClock>, Arc<SourceCatalog>, Arc<ProfilerRuntime>) {
        let clock = Arc::new(ManualClock::new());
        let catalog = Arc::new(SourceCatalog::new());
        let config = Config::default();
        let runtime = ProfilerRuntime::with_clock(
            &config,
            Arc::clone(&catalog) as Arc<dyn crate::source::SourceProvider>,
            Arc::clone(&clock) as Arc<dyn crate::clock::Clock>,
        );
        (clock, catalog, runtime)
    }

    fn register(catalog: &SourceCatalog, f: u32, name: &str, lines: usize) {
        let text = vec!["stmt;"; lines].join("\n");
        catalog.register(
            FunctionKey {
                namespace: NS,
                function: FunctionId(f),
            },
            name,
            text,
        );
    }

    #[test]
    fn test_statement_timing_accumulates_per_line() {
        let (clock, catalog, runtime) = harness();
        register(&catalog, 7, "f", 3);

        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);

        let mut invocation = session.on_function_enter(FunctionId(7)).expect("active");
        session.on_function_begin(&invocation);

        for elapsed in [10, 20, 15, 25, 30] {
            session.on_statement_before(&mut invocation, 2);
            clock.advance(elapsed);
            session.on_statement_after(&mut invocation, 2);
        }

        clock.set(200);
        session.on_function_exit(invocation);

        let rows = session.local_line_rows();
        let line2 = rows
            .iter()
            .find(|r| r.line_number == 2)
            .expect("line 2 recorded");
        assert_eq!(line2.exec_count, 5);
        assert_eq!(line2.total_time, 100);
        assert_eq!(line2.max_time, 30);

        // Slot 0 reflects the whole invocation, not the statement sum.
        let line0 = rows.iter().find(|r| r.line_number == 0).expect("slot 0");
        assert_eq!(line0.exec_count, 1);
        assert_eq!(line0.total_time, 200);
    }

    #[test]
    fn test_inactive_session_returns_no_invocation() {
        let (_clock, catalog, runtime) = harness();
        register(&catalog, 7, "f", 3);

        let mut session = runtime.session(NS, 1);
        assert!(session.on_function_enter(FunctionId(7)).is_none());
    }

    #[test]
    fn test_anonymous_blocks_are_not_profiled() {
        let (_clock, _catalog, runtime) = harness();
        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);
        assert!(session.on_function_enter(FunctionId::ANONYMOUS).is_none());
    }

    #[test]
    fn test_missing_source_skips_the_invocation() {
        let (_clock, _catalog, runtime) = harness();
        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);
        assert!(session.on_function_enter(FunctionId(99)).is_none());
    }

    #[test]
    fn test_activation_changes_wait_for_the_boundary() {
        let (_clock, catalog, runtime) = harness();
        register(&catalog, 7, "f", 3);

        let mut session = runtime.session(NS, 1);
        assert!(session.on_function_enter(FunctionId(7)).is_none());

        // Enabling mid-transaction must not take effect yet.
        session.set_enabled_local(true);
        assert!(session.on_function_enter(FunctionId(7)).is_none());

        session.on_transaction_boundary(BoundaryKind::Commit);
        assert!(session.on_function_enter(FunctionId(7)).is_some());
    }

    #[test]
    fn test_deactivation_releases_local_tables() {
        let (clock, catalog, runtime) = harness();
        register(&catalog, 7, "f", 3);

        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);

        let invocation = session.on_function_enter(FunctionId(7)).expect("active");
        session.on_function_begin(&invocation);
        clock.advance(10);
        session.on_function_exit(invocation);
        assert!(!session.local_line_rows().is_empty());

        session.set_enabled_local(false);
        session.on_transaction_boundary(BoundaryKind::Commit);
        assert!(session.on_function_enter(FunctionId(7)).is_none());
        assert!(session.local_line_rows().is_empty());
    }

    #[test]
    fn test_abort_unwinds_and_attributes_partial_time() {
        let (clock, catalog, runtime) = harness();
        register(&catalog, 1, "outer", 2);
        register(&catalog, 2, "inner", 2);

        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);

        let outer = session.on_function_enter(FunctionId(1)).expect("active");
        session.on_function_begin(&outer);
        clock.set(10);
        let inner = session.on_function_enter(FunctionId(2)).expect("active");
        session.on_function_begin(&inner);

        // The exception path: no statement or exit hooks ever fire for
        // either invocation.
        drop(inner);
        drop(outer);
        clock.set(50);
        session.on_transaction_boundary(BoundaryKind::Abort);

        let rows = session.local_callgraph_rows();
        assert_eq!(rows.len(), 2);

        let inner_row = rows
            .iter()
            .find(|r| r.call_path == vec![FunctionId(1), FunctionId(2)])
            .expect("inner path recorded");
        assert_eq!(inner_row.call_count, 1);
        assert_eq!(inner_row.total_time, 40);
        assert_eq!(inner_row.self_time, 40);

        let outer_row = rows
            .iter()
            .find(|r| r.call_path == vec![FunctionId(1)])
            .expect("outer path recorded");
        assert_eq!(outer_row.total_time, 50);
        assert_eq!(outer_row.child_time, 40);
        assert_eq!(outer_row.self_time, 10);
    }

    #[test]
    fn test_boundary_always_leaves_an_empty_stack() {
        let (clock, catalog, runtime) = harness();
        register(&catalog, 1, "outer", 2);
        register(&catalog, 2, "inner", 2);

        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);

        let outer = session.on_function_enter(FunctionId(1)).expect("active");
        session.on_function_begin(&outer);
        drop(outer);

        clock.set(30);
        session.on_transaction_boundary(BoundaryKind::Abort);
        assert!(session.stack.is_empty());

        let next = session.on_function_enter(FunctionId(2)).expect("active");
        session.on_function_begin(&next);
        assert_eq!(session.stack.depth(), 1);
    }

    #[test]
    fn test_out_of_range_statement_is_ignored() {
        let (clock, catalog, runtime) = harness();
        register(&catalog, 7, "f", 3);

        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);

        let mut invocation = session.on_function_enter(FunctionId(7)).expect("active");
        session.on_function_begin(&invocation);

        session.on_statement_before(&mut invocation, 40);
        clock.advance(10);
        session.on_statement_after(&mut invocation, 40);

        clock.advance(10);
        session.on_function_exit(invocation);

        let rows = session.local_line_rows();
        assert!(rows.iter().all(|r| r.line_number <= 4));
        assert!(rows
            .iter()
            .filter(|r| r.line_number > 0)
            .all(|r| r.exec_count == 0));
    }

    #[test]
    fn test_recursion_keys_by_distinct_paths() {
        let (clock, catalog, runtime) = harness();
        register(&catalog, 5, "fib", 2);

        let mut session = runtime.session(NS, 1);
        session.set_enabled_local(true);

        // fib calls itself once.
        let outer = session.on_function_enter(FunctionId(5)).expect("active");
        session.on_function_begin(&outer);
        clock.set(10);
        let inner = session.on_function_enter(FunctionId(5)).expect("active");
        session.on_function_begin(&inner);
        clock.set(30);
        session.on_function_exit(inner);
        clock.set(40);
        session.on_function_exit(outer);

        let rows = session.local_callgraph_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|r| r.call_path == vec![FunctionId(5), FunctionId(5)]));

        // Slot 0 counted both invocations.
        let line_rows = session.local_line_rows();
        let line0 = line_rows
            .iter()
            .find(|r| r.line_number == 0)
            .expect("slot 0");
        assert_eq!(line0.exec_count, 2);
    }
}
