use dashmap::DashMap;

use crate::engine::FunctionKey;

/// Name and body of one profiled routine.
#[derive(Debug, Clone)]
pub struct FunctionSource {
    pub name: String,
    pub text: String,
}

/// Metadata collaborator that resolves a function to its source text.
///
/// Consulted once per function per session, on first encounter and
/// outside the statement hot path.
pub trait SourceProvider: Send + Sync {
    fn lookup(&self, key: FunctionKey) -> Option<FunctionSource>;
}

/// Number of per-line counter slots a function needs: one per source
/// line plus the synthetic whole-function slot 0.
pub fn line_slots_for(text: &str) -> usize {
    text.lines().count() + 1
}

/// Thread-safe in-memory catalog of function sources.
///
/// This is the provider used by tests and the trace replay tool; an
/// embedding interpreter will usually implement [`SourceProvider`]
/// against its own catalog instead.
#[derive(Debug, Default)]
pub struct SourceCatalog {
    entries: DashMap<FunctionKey, FunctionSource>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: FunctionKey, name: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(
            key,
            FunctionSource {
                name: name.into(),
                text: text.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SourceProvider for SourceCatalog {
    fn lookup(&self, key: FunctionKey) -> Option<FunctionSource> {
        self.entries.get(&key).map(|entry| entry.value().clone())
    }
}
