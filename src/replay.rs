//! Trace replay.
//!
//! Replays a recorded interpreter event trace through the full hook
//! interface with a manually driven clock. Used by the CLI to inspect
//! profiles offline and by tests as an end-to-end driver.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::engine::{
    BoundaryKind, ExecutorHooks, FunctionId, FunctionKey, Invocation, NamespaceId,
};
use crate::report::{CallGraphRow, LineStatsRow};
use crate::runtime::ProfilerRuntime;
use crate::source::{SourceCatalog, SourceProvider};

/// A recorded interpreter run: the functions involved and the event
/// sequence, with microsecond timestamps.
#[derive(Debug, Serialize, Deserialize)]
pub struct Trace {
    pub namespace: u32,
    #[serde(default)]
    pub functions: Vec<TraceFunction>,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

/// Source registration for one function in a trace.
#[derive(Debug, Serialize, Deserialize)]
pub struct TraceFunction {
    pub id: u32,
    pub name: String,
    pub source: String,
}

/// One recorded interpreter event. Statement events apply to the
/// innermost open invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    Enter { at: u64, function: u32 },
    Exit { at: u64, function: u32 },
    StatementBegin { at: u64, line: usize },
    StatementEnd { at: u64, line: usize },
    TransactionEnd {
        at: u64,
        #[serde(default)]
        abort: bool,
    },
}

/// Reports produced by a replay, plus the catalog for name resolution.
pub struct ReplayOutcome {
    pub line_stats: Vec<LineStatsRow>,
    pub call_graph: Vec<CallGraphRow>,
    pub catalog: Arc<SourceCatalog>,
}

/// Replay a trace and return the session-local reports.
pub fn run(trace: &Trace, config: &Config) -> Result<ReplayOutcome> {
    let namespace = NamespaceId(trace.namespace);
    let catalog = Arc::new(SourceCatalog::new());
    for function in &trace.functions {
        catalog.register(
            FunctionKey {
                namespace,
                function: FunctionId(function.id),
            },
            &function.name,
            &function.source,
        );
    }

    let clock = Arc::new(ManualClock::new());
    let runtime = ProfilerRuntime::with_clock(
        config,
        Arc::clone(&catalog) as Arc<dyn SourceProvider>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let mut session = runtime.session(namespace, 1);
    session.set_enabled_local(true);

    // Mirrors the host's own frame stack. `None` marks invocations the
    // profiler declined (inactive, anonymous, unknown source).
    let mut frames: Vec<Option<Invocation>> = Vec::new();

    for event in &trace.events {
        match *event {
            TraceEvent::Enter { at, function } => {
                clock.set(at);
                let invocation = session.on_function_enter(FunctionId(function));
                if let Some(invocation) = &invocation {
                    session.on_function_begin(invocation);
                }
                frames.push(invocation);
            }
            TraceEvent::Exit { at, function } => {
                clock.set(at);
                match frames.pop() {
                    Some(Some(invocation)) => {
                        if invocation.function() != FunctionId(function) {
                            warn!(
                                expected = function,
                                found = invocation.function().raw(),
                                "trace exit does not match the open invocation"
                            );
                        }
                        session.on_function_exit(invocation);
                    }
                    Some(None) => {}
                    None => warn!(function, "trace exit without a matching enter"),
                }
            }
            TraceEvent::StatementBegin { at, line } => {
                clock.set(at);
                if let Some(Some(invocation)) = frames.last_mut() {
                    session.on_statement_before(invocation, line);
                }
            }
            TraceEvent::StatementEnd { at, line } => {
                clock.set(at);
                if let Some(Some(invocation)) = frames.last_mut() {
                    session.on_statement_after(invocation, line);
                }
            }
            TraceEvent::TransactionEnd { at, abort } => {
                clock.set(at);
                // An abort drops open frames without exit events, the
                // same way an interpreter exception would.
                frames.clear();
                session.on_transaction_boundary(if abort {
                    BoundaryKind::Abort
                } else {
                    BoundaryKind::Commit
                });
            }
        }
    }

    Ok(ReplayOutcome {
        line_stats: session.local_line_rows(),
        call_graph: session.local_callgraph_rows(),
        catalog,
    })
}

/// Load a JSON trace file and replay it.
pub fn run_file(path: &Path, config: &Config) -> Result<ReplayOutcome> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading trace file {}", path.display()))?;
    let trace: Trace = serde_json::from_str(&data)
        .with_context(|| format!("parsing trace file {}", path.display()))?;
    run(&trace, config)
}
