use crate::config::{ConfigCell, IgnoredErrors};
use std::sync::Arc;

/// How errors logged on a span affect its status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCheck {
    /// Every logged error marks the span as failed.
    Off,
    /// Errors whose type matches an ignored name are logged without marking
    /// the span.
    HierarchyMatch,
}

/// Decides whether a logged error marks its span as failed, reading the
/// ignored error names from a live [`ConfigCell`].
///
/// An ignored name matches a type by its full path (`app::db::Timeout`), by
/// its bare name (`Timeout`), or by any enclosing module (`app::db` ignores
/// every error type declared under it). Generic arguments are not compared.
#[derive(Clone, Debug)]
pub(crate) struct ErrorStatusChecker {
    ignored: Arc<ConfigCell<IgnoredErrors>>,
}

impl Default for ErrorStatusChecker {
    fn default() -> Self {
        ErrorStatusChecker::new(Arc::new(ConfigCell::new(Arc::from(Vec::new()))))
    }
}

impl ErrorStatusChecker {
    pub(crate) fn new(ignored: Arc<ConfigCell<IgnoredErrors>>) -> Self {
        ErrorStatusChecker { ignored }
    }

    pub(crate) fn mode(&self) -> StatusCheck {
        if self.ignored.current_value().is_empty() {
            StatusCheck::Off
        } else {
            StatusCheck::HierarchyMatch
        }
    }

    /// Whether an error of type `type_path` marks its span as failed.
    pub(crate) fn marks_error(&self, type_path: &str) -> bool {
        let ignored = self.ignored.current_value();
        !ignored.iter().any(|name| matches_hierarchy(type_path, name))
    }
}

fn matches_hierarchy(type_path: &str, ignored: &str) -> bool {
    let path = type_path.split('<').next().unwrap_or(type_path);
    path == ignored
        || path.rsplit("::").next() == Some(ignored)
        || path
            .strip_prefix(ignored)
            .is_some_and(|rest| rest.starts_with("::"))
}
