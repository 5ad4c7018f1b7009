//! Row types and rendering for the reporting layer.
//!
//! The engine exposes pull-only snapshots; this module defines the row
//! shapes those snapshots produce, stable sorting for deterministic
//! output, and simple text/JSON renderings used by the CLI.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::callgraph::{CallGraphStats, CallPathKey};
use crate::engine::{FunctionId, FunctionKey, NamespaceId};
use crate::source::SourceProvider;

/// One per-line statistics row. Line 0 carries the whole-function
/// aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStatsRow {
    pub namespace: NamespaceId,
    pub function: FunctionId,
    pub line_number: usize,
    pub exec_count: u64,
    pub total_time: u64,
    pub max_time: u64,
}

/// One call-graph statistics row; the path lists function ids from the
/// outermost caller to the function the row describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGraphRow {
    pub namespace: NamespaceId,
    pub call_path: Vec<FunctionId>,
    pub call_count: u64,
    pub total_time: u64,
    pub child_time: u64,
    pub self_time: u64,
}

impl CallGraphRow {
    pub(crate) fn new(key: &CallPathKey, stats: &CallGraphStats) -> Self {
        Self {
            namespace: key.namespace(),
            call_path: key.path().to_vec(),
            call_count: stats.call_count,
            total_time: stats.total_time,
            child_time: stats.child_time,
            self_time: stats.self_time,
        }
    }
}

/// One source line of a profiled function, for reports that interleave
/// statistics with source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub function: FunctionId,
    pub line_number: usize,
    pub line: String,
}

/// A point-in-time export of both report tables.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub line_stats: Vec<LineStatsRow>,
    pub call_graph: Vec<CallGraphRow>,
}

impl Snapshot {
    pub fn new(line_stats: Vec<LineStatsRow>, call_graph: Vec<CallGraphRow>) -> Self {
        Self {
            captured_at: Utc::now(),
            line_stats,
            call_graph,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub(crate) fn sort_line_rows(rows: &mut [LineStatsRow]) {
    rows.sort_by_key(|row| (row.namespace, row.function, row.line_number));
}

pub(crate) fn sort_callgraph_rows(rows: &mut [CallGraphRow]) {
    rows.sort_by(|a, b| {
        (a.namespace, &a.call_path).cmp(&(b.namespace, &b.call_path))
    });
}

/// Render a call path as `name() id=N` strings, outermost caller first.
pub fn describe_call_path(
    source: &dyn SourceProvider,
    namespace: NamespaceId,
    path: &[FunctionId],
) -> Vec<String> {
    path.iter()
        .map(|function| {
            let key = FunctionKey {
                namespace,
                function: *function,
            };
            match source.lookup(key) {
                Some(src) => format!("{}() id={}", src.name, function.raw()),
                None => format!("<unknown>() id={}", function.raw()),
            }
        })
        .collect()
}

/// Split a function's source into numbered line rows. Line 0 is the
/// synthetic whole-function slot. Unknown functions yield no rows.
pub fn function_source_rows(source: &dyn SourceProvider, key: FunctionKey) -> Vec<SourceRow> {
    let Some(src) = source.lookup(key) else {
        return Vec::new();
    };

    let mut rows = vec![SourceRow {
        function: key.function,
        line_number: 0,
        line: "-- line 0".to_string(),
    }];
    for (index, line) in src.text.lines().enumerate() {
        rows.push(SourceRow {
            function: key.function,
            line_number: index + 1,
            line: line.to_string(),
        });
    }
    rows
}

/// Write the line statistics as an aligned text table.
pub fn render_line_report<W: io::Write>(out: &mut W, rows: &[LineStatsRow]) -> io::Result<()> {
    writeln!(
        out,
        "{:>9} {:>9} {:>6} {:>12} {:>12} {:>12}",
        "namespace", "function", "line", "exec_count", "total_us", "max_us"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:>9} {:>9} {:>6} {:>12} {:>12} {:>12}",
            row.namespace.raw(),
            row.function.raw(),
            row.line_number,
            row.exec_count,
            row.total_time,
            row.max_time
        )?;
    }
    Ok(())
}

/// Write the call-graph statistics as an aligned text table. When a
/// source provider is given, paths render with function names.
pub fn render_callgraph_report<W: io::Write>(
    out: &mut W,
    rows: &[CallGraphRow],
    source: Option<&dyn SourceProvider>,
) -> io::Result<()> {
    writeln!(
        out,
        "{:>10} {:>12} {:>12} {:>12}  {}",
        "call_count", "total_us", "child_us", "self_us", "call_path"
    )?;
    for row in rows {
        let path = match source {
            Some(provider) => {
                describe_call_path(provider, row.namespace, &row.call_path).join(" -> ")
            }
            None => row
                .call_path
                .iter()
                .map(|f| f.raw().to_string())
                .collect::<Vec<_>>()
                .join(" -> "),
        };
        writeln!(
            out,
            "{:>10} {:>12} {:>12} {:>12}  {}",
            row.call_count, row.total_time, row.child_time, row.self_time, path
        )?;
    }
    Ok(())
}
