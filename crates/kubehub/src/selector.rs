//! Equality-based label selectors for workload -> pod lookups.

use std::collections::BTreeMap;

use serde_json::Value as Json;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    labels: BTreeMap<String, String>,
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

impl LabelSelector {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { labels: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    /// Selector of a workload: `spec.selector.matchLabels`, else the workload's own labels.
    pub fn from_workload(obj: &Json) -> Self {
        let declared = string_map(obj.pointer("/spec/selector/matchLabels"));
        if !declared.is_empty() {
            return Self { labels: declared };
        }
        Self { labels: string_map(obj.pointer("/metadata/labels")) }
    }

    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    /// `k=v,k2=v2` form accepted by list calls.
    pub fn to_query(&self) -> String {
        self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }

    /// Does an object's `metadata.labels` satisfy every term?
    pub fn matches(&self, obj: &Json) -> bool {
        let have = string_map(obj.pointer("/metadata/labels"));
        self.labels.iter().all(|(k, v)| have.get(k) == Some(v))
    }
}
