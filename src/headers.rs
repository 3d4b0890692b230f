//! Header accumulation shared by both capture backends.
//!
//! Header names are kept exactly as the host reported them. Two names that
//! differ only in case are distinct keys: downstream consumers match on the
//! literal on-wire spelling, so no case folding happens here. When the same
//! exact name is merged twice the later value wins, which approximates
//! "last observed value is authoritative" without reconstructing wire order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Accumulated headers, insertion ordered and case-preserving.
pub type HeaderMap = IndexMap<String, String>;

/// One `{name, value}` pair as delivered by list-style hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPair {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<Vec<u8>>,
}

impl HeaderPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(Value::String(value.into())),
            binary_value: None,
        }
    }

    fn value_string(&self) -> String {
        match (&self.value, &self.binary_value) {
            (Some(value), _) => value_to_string(value),
            (None, Some(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            (None, None) => String::new(),
        }
    }
}

/// A batch of incoming headers in either of the two host shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderBatch {
    Pairs(Vec<HeaderPair>),
    Map(IndexMap<String, Value>),
}

impl HeaderBatch {
    /// Interpret an arbitrary JSON payload as a header batch.
    /// Anything that is neither an object nor a list of pairs yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) | Value::Array(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            HeaderBatch::Pairs(pairs) => pairs.is_empty(),
            HeaderBatch::Map(map) => map.is_empty(),
        }
    }

    /// Case-insensitive lookup, used for content-type sniffing only.
    pub fn find(&self, name: &str) -> Option<String> {
        match self {
            HeaderBatch::Pairs(pairs) => pairs
                .iter()
                .find(|pair| pair.name.eq_ignore_ascii_case(name))
                .map(HeaderPair::value_string),
            HeaderBatch::Map(map) => map
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value_to_string(value)),
        }
    }
}

impl From<Vec<HeaderPair>> for HeaderBatch {
    fn from(pairs: Vec<HeaderPair>) -> Self {
        HeaderBatch::Pairs(pairs)
    }
}

/// Merge `incoming` into `existing` and return the result.
pub fn merge(mut existing: HeaderMap, incoming: Option<&HeaderBatch>) -> HeaderMap {
    merge_into(&mut existing, incoming);
    existing
}

/// In-place form of [`merge`].
pub fn merge_into(existing: &mut HeaderMap, incoming: Option<&HeaderBatch>) {
    let Some(incoming) = incoming else {
        return;
    };

    match incoming {
        HeaderBatch::Pairs(pairs) => {
            for pair in pairs {
                existing.insert(pair.name.clone(), pair.value_string());
            }
        }
        HeaderBatch::Map(map) => {
            for (name, value) in map {
                existing.insert(name.clone(), value_to_string(value));
            }
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_to_string).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(value: Value) -> HeaderBatch {
        HeaderBatch::from_value(&value).unwrap()
    }

    #[test]
    fn test_last_write_wins() {
        let merged = merge(HeaderMap::new(), Some(&batch(json!({"a": "1"}))));
        let merged = merge(merged, Some(&batch(json!({"a": "2", "b": "3"}))));

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["a"], "2");
        assert_eq!(merged["b"], "3");
    }

    #[test]
    fn test_pair_form_keeps_second_value() {
        let first = batch(json!([{"name": "X-Test", "value": "v"}]));
        let second = batch(json!([{"name": "X-Test", "value": "w"}]));

        let merged = merge(merge(HeaderMap::new(), Some(&first)), Some(&second));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["X-Test"], "w");
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let merged = merge(HeaderMap::new(), Some(&batch(json!({"content-type": "a"}))));
        let merged = merge(merged, Some(&batch(json!({"Content-Type": "b"}))));

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["content-type"], "a");
        assert_eq!(merged["Content-Type"], "b");
    }

    #[test]
    fn test_missing_values_become_empty() {
        let merged = merge(
            HeaderMap::new(),
            Some(&batch(json!([{"name": "X-Empty"}, {"name": "X-Null", "value": null}]))),
        );
        assert_eq!(merged["X-Empty"], "");
        assert_eq!(merged["X-Null"], "");
    }

    #[test]
    fn test_non_string_values_are_stringified() {
        let merged = merge(HeaderMap::new(), Some(&batch(json!({"Content-Length": 42}))));
        assert_eq!(merged["Content-Length"], "42");
    }

    #[test]
    fn test_binary_value_fallback() {
        let merged = merge(
            HeaderMap::new(),
            Some(&batch(json!([{"name": "X-Bin", "binaryValue": [104, 105]}]))),
        );
        assert_eq!(merged["X-Bin"], "hi");
    }

    #[test]
    fn test_invalid_input_leaves_map_unchanged() {
        let mut existing = HeaderMap::new();
        existing.insert("Keep".to_string(), "me".to_string());

        assert!(HeaderBatch::from_value(&json!("nonsense")).is_none());
        assert!(HeaderBatch::from_value(&json!([1, 2, 3])).is_none());

        let merged = merge(existing.clone(), None);
        assert_eq!(merged, existing);
    }

    #[test]
    fn test_find_ignores_case() {
        let headers = batch(json!([{"name": "Content-Type", "value": "text/html"}]));
        assert_eq!(headers.find("content-type").as_deref(), Some("text/html"));
        assert_eq!(headers.find("x-missing"), None);
    }
}
