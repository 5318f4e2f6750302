//! Settings that can change while the agent runs.
//!
//! A [`ConfigCell`] holds the live value read by hot paths. A
//! [`DynamicConfigRegistry`] maps remote configuration keys to the watchers
//! that parse new values into their cells.
use sniffer::sniffer_info;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// Errors raised while applying configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// No watcher is registered under the key.
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),

    /// The value could not be parsed for the key.
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// The rejected value.
        value: String,
    },
}

type Subscriber<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A shared, atomically replaceable setting.
///
/// Readers always see either the old or the new value, never a mix.
pub struct ConfigCell<T> {
    value: RwLock<T>,
    subscribers: RwLock<Vec<Subscriber<T>>>,
}

impl<T: Clone> ConfigCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        ConfigCell {
            value: RwLock::new(value),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The value currently in effect.
    pub fn current_value(&self) -> T {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the value, then calls every subscriber with it.
    pub fn update(&self, value: T) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value.clone();
        for subscriber in self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            subscriber(&value);
        }
    }

    /// Registers `f` to be called after each update.
    ///
    /// Subscribers run on the updating thread and must not update the same
    /// cell.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for ConfigCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConfigCell")
            .field(&self.current_value())
            .finish()
    }
}

/// Receives raw values for one configuration key.
pub trait ConfigWatcher: Send + Sync + fmt::Debug {
    /// Key this watcher answers to.
    fn key(&self) -> &str;

    /// Applies a new raw value; `None` restores the default.
    fn notify(&self, value: Option<&str>) -> Result<(), ConfigError>;

    /// The value in effect, rendered as text.
    fn value(&self) -> String;
}

/// A [`ConfigWatcher`] feeding a [`ConfigCell`] through a parser.
pub struct CellWatcher<T> {
    key: String,
    cell: Arc<ConfigCell<T>>,
    default: T,
    parse: fn(&str) -> Option<T>,
    render: fn(&T) -> String,
}

impl<T> CellWatcher<T>
where
    T: Clone + FromStr + fmt::Display,
{
    /// Watches `cell` with `FromStr` parsing. `default` is restored when the
    /// remote value is deleted.
    pub fn new(key: impl Into<String>, cell: Arc<ConfigCell<T>>, default: T) -> Self {
        CellWatcher {
            key: key.into(),
            cell,
            default,
            parse: |raw| raw.trim().parse().ok(),
            render: |value| value.to_string(),
        }
    }
}

impl<T: Clone> CellWatcher<T> {
    /// Watches `cell` with custom parsing and rendering.
    pub fn with_parser(
        key: impl Into<String>,
        cell: Arc<ConfigCell<T>>,
        default: T,
        parse: fn(&str) -> Option<T>,
        render: fn(&T) -> String,
    ) -> Self {
        CellWatcher {
            key: key.into(),
            cell,
            default,
            parse,
            render,
        }
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for CellWatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellWatcher")
            .field("key", &self.key)
            .field("cell", &self.cell)
            .finish()
    }
}

impl<T> ConfigWatcher for CellWatcher<T>
where
    T: Clone + fmt::Debug + Send + Sync,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn notify(&self, value: Option<&str>) -> Result<(), ConfigError> {
        let next = match value {
            Some(raw) => (self.parse)(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: self.key.clone(),
                value: raw.to_string(),
            })?,
            None => self.default.clone(),
        };
        self.cell.update(next);
        Ok(())
    }

    fn value(&self) -> String {
        (self.render)(&self.cell.current_value())
    }
}

/// Routes remote configuration updates to registered watchers.
#[derive(Debug, Default)]
pub struct DynamicConfigRegistry {
    watchers: RwLock<HashMap<String, Arc<dyn ConfigWatcher>>>,
}

impl DynamicConfigRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        DynamicConfigRegistry::default()
    }

    /// Registers `watcher`, replacing any watcher with the same key.
    pub fn register(&self, watcher: Arc<dyn ConfigWatcher>) {
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(watcher.key().to_string(), watcher);
    }

    /// Applies a raw value to the watcher of `key`. `None` deletes the remote
    /// value and restores the default.
    pub fn apply(&self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let watcher = self
            .watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        watcher.notify(value)?;
        sniffer_info!(name: "DynamicConfig.Applied", key = key, value = watcher.value());
        Ok(())
    }

    /// Current value of `key`, rendered as text.
    pub fn value(&self, key: &str) -> Option<String> {
        self.watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|watcher| watcher.value())
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_rate() -> (DynamicConfigRegistry, Arc<ConfigCell<i32>>) {
        let cell = Arc::new(ConfigCell::new(-1));
        let registry = DynamicConfigRegistry::new();
        registry.register(Arc::new(CellWatcher::new(
            "agent.sample_n_per_3_secs",
            cell.clone(),
            -1,
        )));
        (registry, cell)
    }

    #[test]
    fn apply_updates_the_cell() {
        let (registry, cell) = registry_with_rate();
        registry.apply("agent.sample_n_per_3_secs", Some("10")).unwrap();
        assert_eq!(cell.current_value(), 10);
        assert_eq!(
            registry.value("agent.sample_n_per_3_secs").as_deref(),
            Some("10")
        );
    }

    #[test]
    fn delete_restores_default() {
        let (registry, cell) = registry_with_rate();
        registry.apply("agent.sample_n_per_3_secs", Some("5")).unwrap();
        registry.apply("agent.sample_n_per_3_secs", None).unwrap();
        assert_eq!(cell.current_value(), -1);
    }

    #[test]
    fn invalid_values_leave_the_cell_untouched() {
        let (registry, cell) = registry_with_rate();
        let err = registry
            .apply("agent.sample_n_per_3_secs", Some("many"))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "agent.sample_n_per_3_secs".into(),
                value: "many".into()
            }
        );
        assert_eq!(cell.current_value(), -1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (registry, _) = registry_with_rate();
        assert_eq!(
            registry.apply("agent.nope", Some("1")),
            Err(ConfigError::UnknownKey("agent.nope".into()))
        );
        assert_eq!(registry.keys(), vec!["agent.sample_n_per_3_secs"]);
    }

    #[test]
    fn subscribers_see_each_update() {
        use std::sync::atomic::{AtomicI32, Ordering};

        let cell = ConfigCell::new(1);
        let seen = Arc::new(AtomicI32::new(0));
        let observer = seen.clone();
        cell.subscribe(move |value| observer.store(*value, Ordering::SeqCst));

        cell.update(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn readers_observe_updates_across_threads() {
        let cell = Arc::new(ConfigCell::new(0_u64));
        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for i in 1..=1000 {
                    cell.update(i);
                }
            })
        };
        let mut last = 0;
        for _ in 0..1000 {
            let now = cell.current_value();
            assert!(now >= last);
            last = now;
        }
        writer.join().unwrap();
        assert_eq!(cell.current_value(), 1000);
    }
}
