//! # Agent
//!
//! [`Agent`] assembles the pipeline: a [`ContextEngine`] sealing segments
//! into a [`SegmentBuffer`], drained by a [`SegmentDispatcher`] into a
//! [`SegmentReporter`]. It also owns the [`DynamicConfigRegistry`] through
//! which the live settings of all three are changed.
//!
//! There is no global agent. Build one at startup and hand out its engine:
//!
//! ```
//! use sniffer_sdk::agent::Agent;
//! use sniffer_sdk::export::{ReportResult, SegmentReporter};
//! use sniffer_sdk::trace::{ContextKey, Segment};
//! use futures_util::future::BoxFuture;
//!
//! #[derive(Debug)]
//! struct StdoutReporter;
//!
//! impl SegmentReporter for StdoutReporter {
//!     fn send(&self, batch: &[Segment]) -> BoxFuture<'static, ReportResult> {
//!         for segment in batch {
//!             println!("{} {}", segment.trace_id, segment.segment_id);
//!         }
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! let agent = Agent::builder(StdoutReporter).build().unwrap();
//! let engine = agent.engine().clone();
//!
//! let key = ContextKey::current_thread();
//! engine.create_entry_span(key, "GET /health", None);
//! engine.stop_span(key);
//!
//! agent.shutdown().unwrap();
//! ```
//!
//! Cloning an `Agent` shares the same pipeline. The pipeline shuts down when
//! [`Agent::shutdown`] is called or the last clone is dropped.
use crate::buffer::{BufferConfig, SegmentBuffer};
use crate::config::{AgentConfig, DynamicConfigRegistry};
use crate::dispatch::{DispatcherConfig, DispatcherStats, SegmentDispatcher};
use crate::error::{SdkError, SdkResult};
use crate::export::SegmentReporter;
use crate::trace::{ContextEngine, IdGenerator};
use sniffer::{sniffer_debug, sniffer_info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct AgentInner {
    engine: Arc<ContextEngine>,
    buffer: Arc<SegmentBuffer>,
    dispatcher: SegmentDispatcher,
    registry: DynamicConfigRegistry,
    is_shutdown: AtomicBool,
}

impl AgentInner {
    fn shutdown(&self) -> SdkResult {
        // New contexts are ignored from here on; contexts still open seal
        // into a closed buffer and are counted as dropped.
        self.engine.config().enabled().update(false);
        let result = self.dispatcher.shutdown();
        if let Err(err) = &result {
            sniffer_debug!(name: "Agent.ShutdownError", error = format!("{err}"));
        }
        result
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if !self.is_shutdown.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown();
        } else {
            sniffer_debug!(
                name: "Agent.Drop.AlreadyShutdown",
                message = "Agent was already shut down; drop will not attempt shutdown again."
            );
        }
    }
}

/// A running tracing pipeline.
#[derive(Clone, Debug)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Create a builder reporting to `reporter`.
    pub fn builder<R: SegmentReporter + 'static>(reporter: R) -> AgentBuilder {
        AgentBuilder {
            reporter: Arc::new(reporter),
            agent_config: None,
            buffer_config: None,
            dispatcher_config: None,
            id_generator: None,
        }
    }

    /// The context engine instrumentation calls into.
    pub fn engine(&self) -> &Arc<ContextEngine> {
        &self.inner.engine
    }

    /// The buffer between engine and dispatcher.
    pub fn buffer(&self) -> &Arc<SegmentBuffer> {
        &self.inner.buffer
    }

    /// Counters of the dispatcher.
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.inner.dispatcher.stats()
    }

    /// Registry of the settings that can change at runtime.
    pub fn dynamic_config(&self) -> &DynamicConfigRegistry {
        &self.inner.registry
    }

    /// Applies a remote configuration value. `None` restores the default.
    pub fn apply_config(&self, key: &str, value: Option<&str>) -> SdkResult {
        self.inner.registry.apply(key, value).map_err(SdkError::from)
    }

    /// Delivers every buffered segment before returning.
    pub fn force_flush(&self) -> SdkResult {
        if self.inner.is_shutdown.load(Ordering::Relaxed) {
            return Err(SdkError::AlreadyShutdown);
        }
        self.inner.dispatcher.force_flush()
    }

    /// Stops tracing, drains the buffer within the shutdown timeout and
    /// shuts the reporter down.
    pub fn shutdown(&self) -> SdkResult {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.shutdown()
        } else {
            Err(SdkError::AlreadyShutdown)
        }
    }
}

/// Builder for [`Agent`].
#[derive(Debug)]
pub struct AgentBuilder {
    reporter: Arc<dyn SegmentReporter>,
    agent_config: Option<AgentConfig>,
    buffer_config: Option<BufferConfig>,
    dispatcher_config: Option<DispatcherConfig>,
    id_generator: Option<Box<dyn IdGenerator>>,
}

impl AgentBuilder {
    /// Use `config` for the context engine.
    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = Some(config);
        self
    }

    /// Use `config` for the segment buffer.
    pub fn with_buffer_config(mut self, config: BufferConfig) -> Self {
        self.buffer_config = Some(config);
        self
    }

    /// Use `config` for the dispatcher.
    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = Some(config);
        self
    }

    /// Use `id_generator` for trace and segment ids.
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Starts the pipeline. Settings not given to the builder come from
    /// environment variables, then defaults.
    pub fn build(self) -> SdkResult<Agent> {
        let agent_config = self.agent_config.unwrap_or_default();
        let buffer = Arc::new(SegmentBuffer::new(self.buffer_config.unwrap_or_default()));
        let dispatcher = SegmentDispatcher::start(
            buffer.clone(),
            self.reporter,
            self.dispatcher_config.unwrap_or_default(),
        )?;

        let registry = DynamicConfigRegistry::new();
        agent_config.register_watchers(&registry);
        buffer.register_watchers(&registry);

        sniffer_info!(
            name: "Agent.Started",
            service = agent_config.service_name().to_string(),
            instance = agent_config.service_instance().to_string(),
            partitions = buffer.partitions().len(),
            workers = dispatcher.workers()
        );

        let mut engine = ContextEngine::builder(buffer.clone()).with_config(agent_config);
        if let Some(id_generator) = self.id_generator {
            engine = engine.with_boxed_id_generator(id_generator);
        }

        Ok(Agent {
            inner: Arc::new(AgentInner {
                engine: Arc::new(engine.build()),
                buffer,
                dispatcher,
                registry,
                is_shutdown: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfigBuilder, OVERFLOW_POLICY_KEY};
    use crate::config::{ConfigError, SAMPLE_RATE_KEY};
    use crate::dispatch::DispatcherConfigBuilder;
    use crate::testing::trace::InMemoryReporter;
    use crate::trace::{ContextKey, IncrementIdGenerator};
    use std::time::Duration;

    fn agent(reporter: &InMemoryReporter) -> Agent {
        Agent::builder(reporter.clone())
            .with_agent_config(
                AgentConfig::builder()
                    .with_service_name("checkout")
                    .with_service_instance("checkout-1")
                    .with_sample_n_per_3_secs(-1)
                    .build(),
            )
            .with_buffer_config(
                BufferConfigBuilder::default()
                    .with_partitions(2)
                    .with_partition_capacity(64)
                    .build(),
            )
            .with_dispatcher_config(
                DispatcherConfigBuilder::default()
                    .with_consumers(2)
                    .with_scheduled_delay(Duration::from_millis(5))
                    .with_shutdown_timeout(Duration::from_secs(5))
                    .build(),
            )
            .with_id_generator(IncrementIdGenerator::default())
            .build()
            .unwrap()
    }

    #[test]
    fn segments_reach_the_reporter() {
        let reporter = InMemoryReporter::default();
        let agent = agent(&reporter);
        let engine = agent.engine();

        let key = ContextKey::new(1);
        engine.create_entry_span(key, "GET /cart", None);
        engine.create_exit_span(key, "SELECT cart", "db:5432", None);
        engine.stop_span(key);
        engine.stop_span(key);

        agent.force_flush().unwrap();
        let segments = reporter.get_reported_segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(&*segments[0].service, "checkout");
        assert_eq!(segments[0].trace_id.as_str(), "trace-1");
        assert_eq!(segments[0].spans.len(), 2);
        agent.shutdown().unwrap();
    }

    #[test]
    fn shutdown_stops_tracing() {
        let reporter = InMemoryReporter::default();
        let agent = agent(&reporter);
        agent.shutdown().unwrap();
        assert!(reporter.is_shutdown());

        let key = ContextKey::new(2);
        agent.engine().create_entry_span(key, "GET /late", None);
        assert!(!agent.engine().is_recording(key));
        agent.engine().stop_span(key);

        assert!(matches!(agent.shutdown(), Err(SdkError::AlreadyShutdown)));
        assert!(matches!(agent.force_flush(), Err(SdkError::AlreadyShutdown)));
    }

    #[test]
    fn dropping_the_last_clone_shuts_down() {
        let reporter = InMemoryReporter::default();
        let agent = agent(&reporter);
        let clone = agent.clone();
        drop(agent);
        assert!(!reporter.is_shutdown());
        drop(clone);
        assert!(reporter.is_shutdown());
    }

    #[test]
    fn dynamic_config_reaches_every_component() {
        let reporter = InMemoryReporter::default();
        let agent = agent(&reporter);

        agent.apply_config(SAMPLE_RATE_KEY, Some("10")).unwrap();
        agent
            .apply_config(OVERFLOW_POLICY_KEY, Some("discard_oldest"))
            .unwrap();
        assert_eq!(agent.engine().config().sample_rate().current_value(), 10);
        assert_eq!(
            agent.dynamic_config().value(OVERFLOW_POLICY_KEY).as_deref(),
            Some("discard_oldest")
        );
        assert!(matches!(
            agent.apply_config("agent.unknown", Some("1")),
            Err(SdkError::Config(ConfigError::UnknownKey(_)))
        ));
        agent.shutdown().unwrap();
    }
}
