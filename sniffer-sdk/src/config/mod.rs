//! Agent configuration.
//!
//! [`AgentConfig`] holds the settings of the context engine: service
//! identity, span limit, sampling, ignored operation suffixes and ignored
//! error types. Values are
//! taken from the builder, then from environment variables, then from
//! defaults.
//!
//! Sampling, ignore suffixes, ignored errors and the enabled switch live in
//! [`ConfigCell`]s, so they can be changed while the agent runs through the
//! [`DynamicConfigRegistry`].
mod dynamic;

pub use dynamic::{CellWatcher, ConfigCell, ConfigError, ConfigWatcher, DynamicConfigRegistry};

use crate::trace::{ErrorStatusChecker, StatusCheck};
use std::env;
use std::str::FromStr;
use std::sync::Arc;

/// Service name reported with every segment.
pub(crate) const SW_AGENT_NAME: &str = "SW_AGENT_NAME";
/// Default service name.
pub(crate) const SW_AGENT_NAME_DEFAULT: &str = "unknown-service";
/// Instance name reported with every segment.
pub(crate) const SW_AGENT_INSTANCE_NAME: &str = "SW_AGENT_INSTANCE_NAME";
/// Maximum number of spans recorded in one segment.
pub(crate) const SW_AGENT_SPAN_LIMIT: &str = "SW_AGENT_SPAN_LIMIT";
/// Default span limit.
pub(crate) const SW_AGENT_SPAN_LIMIT_DEFAULT: usize = 300;
/// New traces sampled per 3 second window. Zero or negative samples all.
pub(crate) const SW_AGENT_SAMPLE: &str = "SW_AGENT_SAMPLE";
/// Default sampling rate.
pub(crate) const SW_AGENT_SAMPLE_DEFAULT: i32 = -1;
/// Comma separated operation name suffixes that are never traced.
pub(crate) const SW_AGENT_IGNORE_SUFFIX: &str = "SW_AGENT_IGNORE_SUFFIX";
/// Default ignored suffixes.
pub(crate) const SW_AGENT_IGNORE_SUFFIX_DEFAULT: &str =
    ".jpg,.jpeg,.js,.css,.png,.bmp,.gif,.ico,.mp3,.mp4,.html,.svg";
/// Comma separated error type names, or enclosing modules, that do not mark
/// a span as failed when logged. Empty by default.
pub(crate) const SW_AGENT_IGNORED_ERRORS: &str = "SW_AGENT_IGNORED_ERRORS";

/// Dynamic key of the sampling rate.
pub const SAMPLE_RATE_KEY: &str = "agent.sample_n_per_3_secs";
/// Dynamic key of the ignored suffixes.
pub const IGNORE_SUFFIX_KEY: &str = "agent.ignore_suffix";
/// Dynamic key of the ignored error types.
pub const IGNORED_ERRORS_KEY: &str = "agent.ignored_errors";
/// Dynamic key of the tracing switch.
pub const ENABLED_KEY: &str = "agent.enabled";

/// Ignored suffixes as held by their [`ConfigCell`].
pub type SuffixList = Arc<[String]>;
/// Ignored error type names as held by their [`ConfigCell`].
pub type IgnoredErrors = Arc<[String]>;

/// Settings of the context engine.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub(crate) service_name: Arc<str>,
    pub(crate) service_instance: Arc<str>,
    pub(crate) span_limit: usize,
    pub(crate) sample_n_per_3_secs: Arc<ConfigCell<i32>>,
    pub(crate) ignore_suffix: Arc<ConfigCell<SuffixList>>,
    pub(crate) ignored_errors: Arc<ConfigCell<IgnoredErrors>>,
    pub(crate) enabled: Arc<ConfigCell<bool>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfigBuilder::default().build()
    }
}

impl AgentConfig {
    /// Create a builder initialized from environment variables.
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Service name reported with every segment.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Instance name reported with every segment.
    pub fn service_instance(&self) -> &str {
        &self.service_instance
    }

    /// Maximum number of spans recorded in one segment.
    pub fn span_limit(&self) -> usize {
        self.span_limit
    }

    /// Live sampling rate.
    pub fn sample_rate(&self) -> &Arc<ConfigCell<i32>> {
        &self.sample_n_per_3_secs
    }

    /// Live ignored suffixes.
    pub fn ignore_suffix(&self) -> &Arc<ConfigCell<SuffixList>> {
        &self.ignore_suffix
    }

    /// Live ignored error types.
    pub fn ignored_errors(&self) -> &Arc<ConfigCell<IgnoredErrors>> {
        &self.ignored_errors
    }

    /// How logged errors currently affect span status.
    pub fn status_check(&self) -> StatusCheck {
        self.status_checker().mode()
    }

    pub(crate) fn status_checker(&self) -> ErrorStatusChecker {
        ErrorStatusChecker::new(self.ignored_errors.clone())
    }

    /// Live tracing switch. A disabled engine treats every new context as
    /// ignored.
    pub fn enabled(&self) -> &Arc<ConfigCell<bool>> {
        &self.enabled
    }

    /// Registers the dynamic settings of this config on `registry`.
    pub fn register_watchers(&self, registry: &DynamicConfigRegistry) {
        registry.register(Arc::new(CellWatcher::new(
            SAMPLE_RATE_KEY,
            self.sample_n_per_3_secs.clone(),
            SW_AGENT_SAMPLE_DEFAULT,
        )));
        registry.register(Arc::new(CellWatcher::with_parser(
            IGNORE_SUFFIX_KEY,
            self.ignore_suffix.clone(),
            parse_list(SW_AGENT_IGNORE_SUFFIX_DEFAULT),
            |raw| Some(parse_list(raw)),
            |suffixes| suffixes.join(","),
        )));
        registry.register(Arc::new(CellWatcher::with_parser(
            IGNORED_ERRORS_KEY,
            self.ignored_errors.clone(),
            Arc::from(Vec::new()),
            |raw| Some(parse_list(raw)),
            |names| names.join(","),
        )));
        registry.register(Arc::new(CellWatcher::new(
            ENABLED_KEY,
            self.enabled.clone(),
            true,
        )));
    }
}

/// A builder for [`AgentConfig`].
#[derive(Debug)]
pub struct AgentConfigBuilder {
    service_name: String,
    service_instance: Option<String>,
    span_limit: usize,
    sample_n_per_3_secs: i32,
    ignore_suffix: SuffixList,
    ignored_errors: IgnoredErrors,
}

impl Default for AgentConfigBuilder {
    /// Create a new [`AgentConfigBuilder`] with default values, overridden
    /// by environment variables when set:
    /// * `SW_AGENT_NAME`
    /// * `SW_AGENT_INSTANCE_NAME`
    /// * `SW_AGENT_SPAN_LIMIT`
    /// * `SW_AGENT_SAMPLE`
    /// * `SW_AGENT_IGNORE_SUFFIX`
    /// * `SW_AGENT_IGNORED_ERRORS`
    fn default() -> Self {
        AgentConfigBuilder {
            service_name: SW_AGENT_NAME_DEFAULT.to_string(),
            service_instance: None,
            span_limit: SW_AGENT_SPAN_LIMIT_DEFAULT,
            sample_n_per_3_secs: SW_AGENT_SAMPLE_DEFAULT,
            ignore_suffix: parse_list(SW_AGENT_IGNORE_SUFFIX_DEFAULT),
            ignored_errors: Arc::from(Vec::new()),
        }
        .init_from_env_vars()
    }
}

impl AgentConfigBuilder {
    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the service instance name. A random one is generated otherwise.
    pub fn with_service_instance(mut self, instance: impl Into<String>) -> Self {
        self.service_instance = Some(instance.into());
        self
    }

    /// Set the maximum number of spans in one segment. The default is 300.
    pub fn with_span_limit(mut self, span_limit: usize) -> Self {
        self.span_limit = span_limit;
        self
    }

    /// Set how many new traces are sampled every 3 seconds. Zero or a
    /// negative value samples everything, which is the default.
    pub fn with_sample_n_per_3_secs(mut self, samples: i32) -> Self {
        self.sample_n_per_3_secs = samples;
        self
    }

    /// Set the operation name suffixes that are never traced.
    pub fn with_ignore_suffix<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_suffix = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the error types that are logged on a span without marking it as
    /// failed. A name matches a type by its full path, its bare name or any
    /// enclosing module.
    pub fn with_ignored_errors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_errors = names.into_iter().map(Into::into).collect();
        self
    }

    /// Builds an [`AgentConfig`]. A span limit of zero is raised to one.
    pub fn build(self) -> AgentConfig {
        let service_instance = self
            .service_instance
            .unwrap_or_else(|| format!("{}@sniffer", uuid::Uuid::new_v4().simple()));
        AgentConfig {
            service_name: Arc::from(self.service_name),
            service_instance: Arc::from(service_instance),
            span_limit: self.span_limit.max(1),
            sample_n_per_3_secs: Arc::new(ConfigCell::new(self.sample_n_per_3_secs)),
            ignore_suffix: Arc::new(ConfigCell::new(self.ignore_suffix)),
            ignored_errors: Arc::new(ConfigCell::new(self.ignored_errors)),
            enabled: Arc::new(ConfigCell::new(true)),
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(name) = env::var(SW_AGENT_NAME).ok().filter(|name| !name.is_empty()) {
            self.service_name = name;
        }

        if let Some(instance) = env::var(SW_AGENT_INSTANCE_NAME)
            .ok()
            .filter(|instance| !instance.is_empty())
        {
            self.service_instance = Some(instance);
        }

        if let Some(span_limit) = env::var(SW_AGENT_SPAN_LIMIT)
            .ok()
            .and_then(|limit| usize::from_str(&limit).ok())
        {
            self.span_limit = span_limit;
        }

        if let Some(samples) = env::var(SW_AGENT_SAMPLE)
            .ok()
            .and_then(|samples| i32::from_str(&samples).ok())
        {
            self.sample_n_per_3_secs = samples;
        }

        if let Ok(suffixes) = env::var(SW_AGENT_IGNORE_SUFFIX) {
            self.ignore_suffix = parse_list(&suffixes);
        }

        if let Ok(names) = env::var(SW_AGENT_IGNORED_ERRORS) {
            self.ignored_errors = parse_list(&names);
        }

        self
    }
}

fn parse_list(raw: &str) -> Arc<[String]> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        temp_env::with_vars_unset(
            [
                SW_AGENT_NAME,
                SW_AGENT_INSTANCE_NAME,
                SW_AGENT_SPAN_LIMIT,
                SW_AGENT_SAMPLE,
                SW_AGENT_IGNORE_SUFFIX,
                SW_AGENT_IGNORED_ERRORS,
            ],
            || {
                let config = AgentConfig::default();
                assert_eq!(config.service_name(), "unknown-service");
                assert!(config.service_instance().ends_with("@sniffer"));
                assert_eq!(config.span_limit(), 300);
                assert_eq!(config.sample_rate().current_value(), -1);
                assert_eq!(config.ignore_suffix().current_value().len(), 12);
                assert!(config.ignored_errors().current_value().is_empty());
                assert_eq!(config.status_check(), StatusCheck::Off);
                assert!(config.enabled().current_value());
            },
        );
    }

    #[test]
    fn env_vars_override_defaults() {
        temp_env::with_vars(
            [
                (SW_AGENT_NAME, Some("checkout")),
                (SW_AGENT_INSTANCE_NAME, Some("checkout-1")),
                (SW_AGENT_SPAN_LIMIT, Some("50")),
                (SW_AGENT_SAMPLE, Some("20")),
                (SW_AGENT_IGNORE_SUFFIX, Some(".txt, .png")),
                (SW_AGENT_IGNORED_ERRORS, Some("app::db, NotFound")),
            ],
            || {
                let config = AgentConfig::default();
                assert_eq!(config.service_name(), "checkout");
                assert_eq!(config.service_instance(), "checkout-1");
                assert_eq!(config.span_limit(), 50);
                assert_eq!(config.sample_rate().current_value(), 20);
                assert_eq!(
                    &*config.ignore_suffix().current_value(),
                    &[".txt".to_string(), ".png".to_string()]
                );
                assert_eq!(
                    &*config.ignored_errors().current_value(),
                    &["app::db".to_string(), "NotFound".to_string()]
                );
                assert_eq!(config.status_check(), StatusCheck::HierarchyMatch);
            },
        );
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        temp_env::with_vars(
            [
                (SW_AGENT_SPAN_LIMIT, Some("lots")),
                (SW_AGENT_SAMPLE, Some("1.5")),
            ],
            || {
                let config = AgentConfig::default();
                assert_eq!(config.span_limit(), SW_AGENT_SPAN_LIMIT_DEFAULT);
                assert_eq!(config.sample_rate().current_value(), SW_AGENT_SAMPLE_DEFAULT);
            },
        );
    }

    #[test]
    fn builder_values_win_over_env() {
        temp_env::with_var(SW_AGENT_NAME, Some("from-env"), || {
            let config = AgentConfig::builder()
                .with_service_name("from-code")
                .with_span_limit(0)
                .build();
            assert_eq!(config.service_name(), "from-code");
            assert_eq!(config.span_limit(), 1);
        });
    }

    #[test]
    fn watchers_drive_the_cells() {
        let config = AgentConfig::builder().build();
        let registry = DynamicConfigRegistry::new();
        config.register_watchers(&registry);

        registry.apply(SAMPLE_RATE_KEY, Some("3")).unwrap();
        registry.apply(IGNORE_SUFFIX_KEY, Some(".a,.b")).unwrap();
        registry.apply(ENABLED_KEY, Some("false")).unwrap();

        assert_eq!(config.sample_rate().current_value(), 3);
        assert_eq!(registry.value(IGNORE_SUFFIX_KEY).as_deref(), Some(".a,.b"));
        assert!(!config.enabled().current_value());

        registry.apply(IGNORE_SUFFIX_KEY, None).unwrap();
        assert_eq!(config.ignore_suffix().current_value().len(), 12);

        assert_eq!(config.status_check(), StatusCheck::Off);
        registry.apply(IGNORED_ERRORS_KEY, Some("Timeout")).unwrap();
        assert_eq!(config.status_check(), StatusCheck::HierarchyMatch);
        registry.apply(IGNORED_ERRORS_KEY, None).unwrap();
        assert_eq!(config.status_check(), StatusCheck::Off);
    }
}
