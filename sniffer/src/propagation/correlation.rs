//! User defined key/values that follow a trace across threads and processes.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Maximum number of entries a correlation context holds.
pub const MAX_CORRELATION_ELEMENTS: usize = 3;
/// Maximum length, in bytes, of a correlation value.
pub const MAX_CORRELATION_VALUE_LENGTH: usize = 128;

/// Bounded, ordered set of key/values propagated under `sw8-correlation`.
///
/// Entries over the element or value length limit are rejected rather than
/// truncated, so a peer never sees a partial value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    entries: Vec<(String, String)>,
}

impl CorrelationContext {
    /// Create an empty correlation context.
    pub fn new() -> Self {
        CorrelationContext::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Returns `false` when the entry was rejected: empty key, value longer
    /// than [`MAX_CORRELATION_VALUE_LENGTH`], or a new key while the context
    /// already holds [`MAX_CORRELATION_ELEMENTS`] entries.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || value.len() > MAX_CORRELATION_VALUE_LENGTH {
            return false;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return true;
        }
        if self.entries.len() >= MAX_CORRELATION_ELEMENTS {
            return false;
        }
        self.entries.push((key, value));
        true
    }

    /// Value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encodes the entries as `b64(key):b64(value)` pairs joined by `,`.
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}:{}", STANDARD.encode(k), STANDARD.encode(v)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decodes a `sw8-correlation` value. Malformed pairs are skipped and the
    /// element limit still applies.
    pub fn deserialize(value: &str) -> Self {
        let mut context = CorrelationContext::new();
        for pair in value.split(',') {
            let Some((key, value)) = pair.trim().split_once(':') else {
                continue;
            };
            if let (Some(key), Some(value)) = (decode(key), decode(value)) {
                context.put(key, value);
            }
        }
        context
    }

    /// Merges entries from `other`, keeping the local value on conflicts.
    pub fn extend_from(&mut self, other: &CorrelationContext) {
        for (key, value) in other.iter() {
            if self.get(key).is_none() {
                self.put(key, value);
            }
        }
    }
}

fn decode(part: &str) -> Option<String> {
    STANDARD
        .decode(part)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_respects_limits() {
        let mut cx = CorrelationContext::new();
        assert!(cx.put("a", "1"));
        assert!(cx.put("b", "2"));
        assert!(cx.put("c", "3"));
        assert!(!cx.put("d", "4"), "element limit");
        assert!(cx.put("a", "11"), "replacing does not count against the limit");
        assert!(!cx.put("b", "x".repeat(MAX_CORRELATION_VALUE_LENGTH + 1)));
        assert!(!cx.put("", "empty key"));
        assert_eq!(cx.get("a"), Some("11"));
        assert_eq!(cx.len(), 3);
    }

    #[test]
    fn serialized_form_decodes_to_the_same_entries() {
        let mut cx = CorrelationContext::new();
        cx.put("user", "alice");
        cx.put("region", "eu-west");

        let header = cx.serialize();
        assert_eq!(header, "dXNlcg==:YWxpY2U=,cmVnaW9u:ZXUtd2VzdA==");
        assert_eq!(CorrelationContext::deserialize(&header), cx);
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let cx = CorrelationContext::deserialize("garbage,dXNlcg==:YWxpY2U=,%%%:%%%");
        assert_eq!(cx.len(), 1);
        assert_eq!(cx.get("user"), Some("alice"));
    }

    #[test]
    fn extend_keeps_local_values() {
        let mut local = CorrelationContext::new();
        local.put("a", "local");
        let mut remote = CorrelationContext::new();
        remote.put("a", "remote");
        remote.put("b", "remote");

        local.extend_from(&remote);
        assert_eq!(local.get("a"), Some("local"));
        assert_eq!(local.get("b"), Some("remote"));
        assert_eq!(local.remove("b"), Some("remote".to_string()));
        assert!(local.get("b").is_none());
    }
}
