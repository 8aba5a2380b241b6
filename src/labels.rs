use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::engine::EngineError;

/// Class index to display label. Sparse; missing indices render as `class_<i>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    labels: BTreeMap<usize, String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts either a JSON array of labels or an object keyed by decimal index.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let value: Value = serde_json::from_str(json)?;
        let mut labels = BTreeMap::new();
        match value {
            Value::Array(items) => {
                for (i, item) in items.into_iter().enumerate() {
                    labels.insert(i, value_to_label(item));
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    match key.trim().parse::<usize>() {
                        Ok(i) => {
                            labels.insert(i, value_to_label(item));
                        }
                        Err(_) => tracing::warn!(%key, "ignoring non-numeric class key"),
                    }
                }
            }
            _ => {
                return Err(EngineError::Config(
                    "class mapping must be a JSON array or object".to_string(),
                ))
            }
        }
        Ok(Self { labels })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let map = Self::from_json_str(&json)?;
        tracing::info!(
            path = %path.as_ref().display(),
            classes = map.len(),
            "loaded class mapping"
        );
        Ok(map)
    }

    pub fn label(&self, index: usize) -> Cow<'_, str> {
        match self.labels.get(&index) {
            Some(l) => Cow::Borrowed(l.as_str()),
            None => Cow::Owned(format!("class_{index}")),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl FromIterator<(usize, String)> for LabelMap {
    fn from_iter<I: IntoIterator<Item = (usize, String)>>(iter: I) -> Self {
        Self {
            labels: iter.into_iter().collect(),
        }
    }
}

fn value_to_label(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
