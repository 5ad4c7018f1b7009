use tracing::debug;

use super::callgraph::{CallPathKey, MAX_STACK_DEPTH};
use super::{FunctionId, NamespaceId};

/// One active stack level.
#[derive(Debug, Clone, Copy)]
struct StackFrame {
    function: FunctionId,
    entry_time: u64,
    child_time: u64,
}

/// Timing attribution for one finished (or force-finished) frame,
/// emitted on every pop.
#[derive(Debug, Clone, Copy)]
pub struct FrameSample {
    pub function: FunctionId,
    /// Full recorded call path including the popped frame.
    pub path: CallPathKey,
    pub elapsed: u64,
    pub self_time: u64,
    pub child_time: u64,
}

/// Bounded per-session call stack.
///
/// Tracks entry time and accumulated child time per level so that a pop
/// can split elapsed time into self and children. The stack never trusts
/// the host to be well formed: an exception in the interpreter skips the
/// exit hook, which [`CallStack::check_top`] later repairs by force
/// popping every frame above the one being resumed.
#[derive(Debug)]
pub struct CallStack {
    namespace: NamespaceId,
    frames: Vec<StackFrame>,
    /// Total depth including frames beyond `MAX_STACK_DEPTH`, which are
    /// counted but not individually recorded.
    depth: usize,
}

impl CallStack {
    pub fn new(namespace: NamespaceId) -> Self {
        Self {
            namespace,
            frames: Vec::with_capacity(MAX_STACK_DEPTH),
            depth: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    /// Begin a frame for `function` at time `now`.
    pub fn push(&mut self, function: FunctionId, now: u64) {
        if self.depth < MAX_STACK_DEPTH {
            self.frames.push(StackFrame {
                function,
                entry_time: now,
                child_time: 0,
            });
        }
        self.depth += 1;
    }

    fn top_matches(&self, function: FunctionId) -> bool {
        self.depth == self.frames.len()
            && self.frames.last().is_some_and(|f| f.function == function)
    }

    /// Force-pop frames until `function` is on top of the stack. Called
    /// before resuming work in a frame; any frames above it were
    /// abandoned by abnormal control flow and are closed as of `now`.
    pub fn check_top(&mut self, function: FunctionId, now: u64, sink: &mut dyn FnMut(FrameSample)) {
        while self.depth > 0 && !self.top_matches(function) {
            debug!(
                expected = function.raw(),
                depth = self.depth,
                "unwinding abandoned call stack frame"
            );
            self.pop_one(now, sink);
        }
    }

    /// Remove the top frame, emitting its timing sample and folding its
    /// elapsed time into the parent's child accumulator.
    pub fn pop_one(&mut self, now: u64, sink: &mut dyn FnMut(FrameSample)) {
        if self.depth == 0 {
            debug!("call stack underrun");
            return;
        }

        // Frames beyond the recording limit carry no timing.
        if self.depth > self.frames.len() {
            self.depth -= 1;
            return;
        }

        let path = CallPathKey::from_frames(self.namespace, self.frames.iter().map(|f| f.function));
        self.depth -= 1;
        let Some(frame) = self.frames.pop() else {
            return;
        };

        let elapsed = now.saturating_sub(frame.entry_time);
        let self_time = elapsed.saturating_sub(frame.child_time);
        sink(FrameSample {
            function: frame.function,
            path,
            elapsed,
            self_time,
            child_time: frame.child_time,
        });

        if let Some(parent) = self.frames.last_mut() {
            parent.child_time += elapsed;
        }
    }

    /// End the frame for `function`, repairing the stack first if needed.
    pub fn pop(&mut self, function: FunctionId, now: u64, sink: &mut dyn FnMut(FrameSample)) {
        self.check_top(function, now, sink);
        self.pop_one(now, sink);
    }

    /// Force-pop every remaining frame. Used at transaction boundaries;
    /// the stack must be empty between transactions.
    pub fn unwind_all(&mut self, now: u64, sink: &mut dyn FnMut(FrameSample)) {
        while self.depth > 0 {
            self.pop_one(now, sink);
        }
    }
}
