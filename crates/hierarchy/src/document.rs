//! Merged configuration documents and the builders that assemble them.

use std::collections::BTreeMap;

use kanav_core::ConfigMapId;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};

pub const URL_ACTIONS: &str = "url-actions";
pub const CMD_ACTIONS: &str = "cmd-actions";
pub const FUNCTION_ACTIONS: &str = "function-actions";
pub const INPUTS: &str = "inputs";
pub const SNIPPETS: &str = "snippets";
pub const VARIABLES: &str = "variables";

pub const EXISTS: &str = "exists";
pub const JSONPATH: &str = "jsonpath";
pub const ALGORITHM: &str = "algorithm";

/// Categories holding arrays of actions, merged per action `name`.
pub const ACTION_CATEGORIES: [&str; 3] = [URL_ACTIONS, CMD_ACTIONS, FUNCTION_ACTIONS];
/// Categories holding maps, merged per key.
pub const KEYED_CATEGORIES: [&str; 3] = [INPUTS, SNIPPETS, VARIABLES];
/// Status categories, taken whole from the first map that has them.
pub const STATUS_CATEGORIES: [&str; 3] = [EXISTS, JSONPATH, ALGORITHM];

/// Logical union of the config maps merged for one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedDocument {
    /// Maps that contributed, in merge order.
    pub sources: Vec<ConfigMapId>,
    pub body: Map<String, Json>,
}

impl MergedDocument {
    pub fn is_empty(&self) -> bool { self.body.is_empty() }

    pub fn category(&self, name: &str) -> Option<&Json> { self.body.get(name) }

    fn keyed(&self, category: &str, key: &str) -> Option<&Json> {
        self.body.get(category).and_then(|c| c.get(key))
    }

    /// Source text of a snippet.
    pub fn snippet(&self, name: &str) -> Option<&str> { self.keyed(SNIPPETS, name).and_then(|v| v.as_str()) }

    /// Pattern defining a variable.
    pub fn variable(&self, name: &str) -> Option<&str> { self.keyed(VARIABLES, name).and_then(|v| v.as_str()) }

    /// Schema of a named input.
    pub fn input(&self, name: &str) -> Option<&Json> { self.keyed(INPUTS, name) }

    /// Find an action by name in one of the action categories.
    pub fn action(&self, category: &str, name: &str) -> Option<&Json> {
        self.body
            .get(category)?
            .as_array()?
            .iter()
            .find(|a| a.get("name").and_then(|n| n.as_str()) == Some(name))
    }
}

/// Parse one category value. Config-map data holds JSON or YAML text.
fn parse_category(source: &ConfigMapId, key: &str, raw: &str) -> Option<Json> {
    match serde_yaml::from_str::<Json>(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(map = %source, category = key, error = %e, "skipping unparseable category");
            None
        }
    }
}

/// Folds config-map bodies, most specific first, into one document.
pub trait MergeBuilder {
    fn merge(&mut self, source: &ConfigMapId, data: &BTreeMap<String, String>);
    fn finish(self) -> MergedDocument;
}

/// Action documents: actions dedupe on `name`, keyed categories on key. First writer wins.
#[derive(Debug, Default)]
pub struct ActionsBuilder {
    doc: MergedDocument,
    seen: FxHashMap<&'static str, FxHashSet<String>>,
}

impl ActionsBuilder {
    pub fn new() -> Self { Self::default() }

    fn merge_actions(&mut self, source: &ConfigMapId, category: &'static str, value: Json) {
        let Json::Array(items) = value else {
            warn!(map = %source, category, "action category is not an array");
            return;
        };
        let seen = self.seen.entry(category).or_default();
        let target = self.doc.body.entry(category).or_insert_with(|| Json::Array(Vec::new()));
        let Some(target) = target.as_array_mut() else { return };
        for item in items {
            let Some(name) = item.get("name").and_then(|n| n.as_str()).map(str::to_string) else {
                warn!(map = %source, category, "skipping action without name");
                continue;
            };
            if seen.insert(name.clone()) {
                target.push(item);
            } else {
                debug!(map = %source, category, action = %name, "action already defined by a more specific map");
            }
        }
    }

    fn merge_keyed(&mut self, source: &ConfigMapId, category: &'static str, value: Json) {
        let Json::Object(entries) = value else {
            warn!(map = %source, category, "keyed category is not a map");
            return;
        };
        let target = self.doc.body.entry(category).or_insert_with(|| Json::Object(Map::new()));
        let Some(target) = target.as_object_mut() else { return };
        for (k, v) in entries {
            target.entry(k).or_insert(v);
        }
    }
}

impl MergeBuilder for ActionsBuilder {
    fn merge(&mut self, source: &ConfigMapId, data: &BTreeMap<String, String>) {
        for category in ACTION_CATEGORIES {
            if let Some(v) = data.get(category).and_then(|raw| parse_category(source, category, raw)) {
                self.merge_actions(source, category, v);
            }
        }
        for category in KEYED_CATEGORIES {
            if let Some(v) = data.get(category).and_then(|raw| parse_category(source, category, raw)) {
                self.merge_keyed(source, category, v);
            }
        }
        self.doc.sources.push(source.clone());
    }

    fn finish(self) -> MergedDocument { self.doc }
}

/// Status documents: each category comes whole from the first map defining it.
#[derive(Debug, Default)]
pub struct StatusBuilder {
    doc: MergedDocument,
}

impl StatusBuilder {
    pub fn new() -> Self { Self::default() }
}

impl MergeBuilder for StatusBuilder {
    fn merge(&mut self, source: &ConfigMapId, data: &BTreeMap<String, String>) {
        for category in STATUS_CATEGORIES {
            if self.doc.body.contains_key(category) { continue; }
            if let Some(v) = data.get(category).and_then(|raw| parse_category(source, category, raw)) {
                self.doc.body.insert(category.to_string(), v);
            }
        }
        self.doc.sources.push(source.clone());
    }

    fn finish(self) -> MergedDocument { self.doc }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn actions_first_writer_wins() {
        let a = ConfigMapId::new("ns", "a");
        let b = ConfigMapId::new("ns", "b");
        let mut builder = ActionsBuilder::new();
        builder.merge(&a, &data(&[
            (URL_ACTIONS, r#"[{"name":"foo","url-pattern":"first"}]"#),
            (VARIABLES, r#"{"x":"1"}"#),
        ]));
        builder.merge(&b, &data(&[
            (URL_ACTIONS, r#"[{"name":"foo","url-pattern":"second"},{"name":"bar","url-pattern":"b"}]"#),
            (VARIABLES, "x: '2'\ny: '3'\n"),
        ]));
        let doc = builder.finish();
        assert_eq!(doc.sources, vec![a, b]);
        assert_eq!(doc.action(URL_ACTIONS, "foo").and_then(|a| a.get("url-pattern")), Some(&Json::from("first")));
        assert!(doc.action(URL_ACTIONS, "bar").is_some());
        assert_eq!(doc.variable("x"), Some("1"));
        assert_eq!(doc.variable("y"), Some("3"));
    }

    #[test]
    fn status_categories_are_taken_whole() {
        let mut builder = StatusBuilder::new();
        builder.merge(&ConfigMapId::new("ns", "a"), &data(&[(EXISTS, r#"{"a":1}"#)]));
        builder.merge(&ConfigMapId::new("ns", "b"), &data(&[(EXISTS, r#"{"b":2}"#), (ALGORITHM, r#""OR""#)]));
        let doc = builder.finish();
        assert_eq!(doc.category(EXISTS), Some(&serde_json::json!({"a": 1})));
        assert_eq!(doc.category(ALGORITHM), Some(&Json::from("OR")));
    }

    #[test]
    fn unparseable_categories_are_skipped() {
        let mut builder = ActionsBuilder::new();
        builder.merge(&ConfigMapId::new("ns", "a"), &data(&[(CMD_ACTIONS, "[{"), (SNIPPETS, r#"{"s":"fn s() {}"}"#)]));
        let doc = builder.finish();
        assert!(doc.category(CMD_ACTIONS).is_none());
        assert_eq!(doc.snippet("s"), Some("fn s() {}"));
    }
}
