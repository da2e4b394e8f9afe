//! Series label sets

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single label pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// A sorted, de-duplicated set of labels identifying one series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from name/value pairs. Later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<Label> = Vec::new();
        for (name, value) in pairs {
            let name = name.into();
            let value = value.into();
            match labels.iter_mut().find(|l| l.name == name) {
                Some(existing) => existing.value = value,
                None => labels.push(Label { name, value }),
            }
        }
        labels.sort();
        Self(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Extract the metric name, failing if it is absent or empty.
    pub fn metric_name(&self) -> Result<&str> {
        match self.get(METRIC_NAME_LABEL) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(Error::MissingMetricName),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_sorted_and_deduplicated() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("job", "db")]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("job"), Some("db"));
        assert_eq!(labels.iter().next().unwrap().name, "__name__");
    }

    #[test]
    fn test_metric_name_extraction() {
        let labels = Labels::from_pairs([("__name__", "http_requests_total")]);
        assert_eq!(labels.metric_name().unwrap(), "http_requests_total");

        let unnamed = Labels::from_pairs([("job", "api")]);
        assert!(matches!(unnamed.metric_name(), Err(Error::MissingMetricName)));

        let empty = Labels::from_pairs([("__name__", "")]);
        assert!(empty.metric_name().is_err());
    }

    #[test]
    fn test_display() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "api")]);
        assert_eq!(labels.to_string(), r#"{__name__="up", job="api"}"#);
    }
}
