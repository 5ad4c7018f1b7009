//! Runtime object owning everything the sessions share.
//!
//! There is deliberately no global state: hosts construct one
//! [`ProfilerRuntime`], hand out sessions from it, and drop it when the
//! interpreter shuts down. Tests construct as many as they like.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::engine::{FunctionKey, NamespaceId, ProfilerSession};
use crate::report::{CallGraphRow, LineStatsRow};
use crate::shared::{ProfilerError, SharedStats};
use crate::source::SourceProvider;

/// Shared profiler state: the aggregate store (when enabled), the clock
/// and the source catalog, plus the defaults applied to new sessions.
pub struct ProfilerRuntime {
    shared: Option<Arc<SharedStats>>,
    clock: Arc<dyn Clock>,
    source: Arc<dyn SourceProvider>,
    default_local_enabled: bool,
}

impl ProfilerRuntime {
    /// Build a runtime from configuration with the monotonic clock.
    pub fn new(config: &Config, source: Arc<dyn SourceProvider>) -> Arc<Self> {
        Self::with_clock(config, source, Arc::new(MonotonicClock::new()))
    }

    /// Build a runtime with an explicit clock. Tests and the replay tool
    /// use this with a manual clock.
    pub fn with_clock(
        config: &Config,
        source: Arc<dyn SourceProvider>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let shared = config.shared.enabled.then(|| {
            Arc::new(SharedStats::new(
                config.shared.max_functions,
                config.shared.max_call_paths,
                config.shared.max_line_slots,
            ))
        });

        if let Some(shared) = &shared {
            shared.set_enabled_global(config.enabled_global);
            shared.set_collect_interval(config.collect_interval);
        }

        Arc::new(Self {
            shared,
            clock,
            source,
            default_local_enabled: config.enabled_local,
        })
    }

    /// Create the profiler session for one execution context. Session id
    /// 0 is reserved; a session with id 0 can never be selected by the
    /// per-session switch.
    pub fn session(self: &Arc<Self>, namespace: NamespaceId, session_id: u32) -> ProfilerSession {
        ProfilerSession::new(
            Arc::clone(self),
            namespace,
            session_id,
            self.default_local_enabled,
        )
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub fn source(&self) -> &dyn SourceProvider {
        &*self.source
    }

    pub(crate) fn shared(&self) -> Option<&SharedStats> {
        self.shared.as_deref()
    }

    fn require_shared(&self) -> Result<&SharedStats, ProfilerError> {
        self.shared().ok_or(ProfilerError::SharedAggregationDisabled)
    }

    /// Turn profiling on or off for every session.
    pub fn set_enabled_global(&self, enabled: bool) -> Result<(), ProfilerError> {
        self.require_shared()?.set_enabled_global(enabled);
        Ok(())
    }

    pub fn enabled_global(&self) -> Result<bool, ProfilerError> {
        Ok(self.require_shared()?.enabled_global())
    }

    /// Select a single session to profile, or clear the selection.
    pub fn set_enabled_session(&self, session: Option<u32>) -> Result<(), ProfilerError> {
        self.require_shared()?.set_enabled_session(session);
        Ok(())
    }

    pub fn enabled_session(&self) -> Result<Option<u32>, ProfilerError> {
        Ok(self.require_shared()?.enabled_session())
    }

    /// Interval for automatic collection; zero disables it.
    pub fn set_collect_interval(&self, interval: Duration) -> Result<(), ProfilerError> {
        self.require_shared()?.set_collect_interval(interval);
        Ok(())
    }

    pub fn collect_interval(&self) -> Result<Duration, ProfilerError> {
        Ok(self.require_shared()?.collect_interval())
    }

    /// Consistent snapshot of the shared line statistics.
    pub fn shared_line_rows(
        &self,
        namespace: Option<NamespaceId>,
    ) -> Result<Vec<LineStatsRow>, ProfilerError> {
        Ok(self.require_shared()?.line_rows(namespace))
    }

    /// Snapshot of the shared call-graph statistics.
    pub fn shared_callgraph_rows(
        &self,
        namespace: Option<NamespaceId>,
    ) -> Result<Vec<CallGraphRow>, ProfilerError> {
        Ok(self.require_shared()?.callgraph_rows(namespace))
    }

    /// Functions with shared line statistics.
    pub fn functions_shared(
        &self,
        namespace: Option<NamespaceId>,
    ) -> Result<Vec<FunctionKey>, ProfilerError> {
        Ok(self.require_shared()?.functions(namespace))
    }

    /// Drop all shared data and clear the overflow flags.
    pub fn reset_shared(&self) -> Result<(), ProfilerError> {
        self.require_shared()?.reset();
        Ok(())
    }

    pub fn callgraph_overflowed(&self) -> Result<bool, ProfilerError> {
        Ok(self.require_shared()?.callgraph_overflowed())
    }

    pub fn functions_overflowed(&self) -> Result<bool, ProfilerError> {
        Ok(self.require_shared()?.functions_overflowed())
    }

    pub fn lines_overflowed(&self) -> Result<bool, ProfilerError> {
        Ok(self.require_shared()?.lines_overflowed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::source::SourceCatalog;

    fn catalog() -> Arc<dyn SourceProvider> {
        Arc::new(SourceCatalog::new())
    }

    #[test]
    fn test_runtime_applies_config_to_shared_state() {
        let config = Config {
            enabled_global: true,
            collect_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let runtime = ProfilerRuntime::new(&config, catalog());

        assert!(runtime.enabled_global().expect("shared enabled"));
        assert_eq!(
            runtime.collect_interval().expect("shared enabled"),
            Duration::from_secs(5)
        );
        assert_eq!(runtime.enabled_session().expect("shared enabled"), None);
    }

    #[test]
    fn test_local_only_runtime_rejects_shared_operations() {
        let config = Config {
            shared: SharedConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let runtime = ProfilerRuntime::new(&config, catalog());

        assert!(matches!(
            runtime.enabled_global(),
            Err(ProfilerError::SharedAggregationDisabled)
        ));
        assert!(matches!(
            runtime.shared_line_rows(None),
            Err(ProfilerError::SharedAggregationDisabled)
        ));
        assert!(matches!(
            runtime.reset_shared(),
            Err(ProfilerError::SharedAggregationDisabled)
        ));
    }

    #[test]
    fn test_sessions_inherit_the_local_default() {
        let config = Config {
            enabled_local: true,
            ..Default::default()
        };
        let runtime = ProfilerRuntime::new(&config, catalog());
        let session = runtime.session(NamespaceId(1), 1);
        assert!(session.enabled_local());
    }
}
