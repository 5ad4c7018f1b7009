//! Embeddable execution profiler for procedural-language interpreters.
//!
//! The host interpreter drives one [`ProfilerSession`] per execution
//! context through the [`ExecutorHooks`] callbacks. Sessions record
//! per-line and per-call-path timing into local tables with no locking,
//! then periodically fold them into the bounded shared store owned by a
//! [`ProfilerRuntime`], from which the reporting layer pulls consistent
//! snapshots.

pub mod clock;
pub mod config;
pub mod engine;
pub mod replay;
pub mod report;
pub mod runtime;
pub mod shared;
pub mod source;

pub use engine::{
    BoundaryKind, ExecutorHooks, FunctionId, FunctionKey, Invocation, NamespaceId,
    ProfilerSession,
};
pub use runtime::ProfilerRuntime;
pub use shared::ProfilerError;
