//! Restricted JSON paths: child axis only, dot and bracket notation.
//!
//! Accepted: `$.metadata.name`, `metadata.labels['app.kubernetes.io/name']`, `spec.containers[0].image`.
//! Rejected: wildcards, filters, recursive descent, slices.

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath(Vec<Step>);

fn plain_key(key: &str) -> Result<Step, String> {
    if key.is_empty() { return Err("empty key".into()); }
    if key.contains(['*', '?', '@', '(', ')', ']', '\'', '"']) {
        return Err(format!("unsupported characters in key {:?}", key));
    }
    Ok(Step::Key(key.to_string()))
}

impl JsonPath {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let s = raw.trim();
        let s = s.strip_prefix('$').unwrap_or(s);
        let mut steps = Vec::new();
        let mut rest = s;
        // A bare first key is allowed: `metadata.name`.
        if !rest.is_empty() && !rest.starts_with(['.', '[']) {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            steps.push(plain_key(&rest[..end])?);
            rest = &rest[end..];
        }
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                if after.starts_with('.') { return Err("recursive descent is not supported".into()); }
                let end = after.find(['.', '[']).unwrap_or(after.len());
                steps.push(plain_key(&after[..end])?);
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after.find(']').ok_or_else(|| "unterminated '['".to_string())?;
                let inner = after[..close].trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|k| k.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|k| k.strip_suffix('"')));
                match quoted {
                    Some(key) if !key.is_empty() => steps.push(Step::Key(key.to_string())),
                    Some(_) => return Err("empty key".into()),
                    None => {
                        let idx = inner.parse::<usize>().map_err(|_| format!("unsupported subscript [{}]", inner))?;
                        steps.push(Step::Index(idx));
                    }
                }
                rest = &after[close + 1..];
            } else {
                return Err(format!("unexpected text {:?}", rest));
            }
        }
        Ok(Self(steps))
    }

    pub fn steps(&self) -> &[Step] { &self.0 }

    pub fn select<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        self.0.iter().try_fold(root, |cur, step| match step {
            Step::Key(k) => cur.get(k.as_str()),
            Step::Index(i) => cur.get(*i),
        })
    }
}

/// Text form of a selected value: strings bare, everything else as compact JSON.
pub fn value_text(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dot_and_bracket_forms() {
        let p = JsonPath::parse("$.spec.containers[0]['image']").expect("path");
        assert_eq!(p.steps(), &[
            Step::Key("spec".into()),
            Step::Key("containers".into()),
            Step::Index(0),
            Step::Key("image".into()),
        ]);
        assert_eq!(JsonPath::parse("metadata.name").expect("bare").steps().len(), 2);
        assert_eq!(JsonPath::parse("$").expect("root").steps().len(), 0);
    }

    #[test]
    fn rejects_non_child_axes() {
        assert!(JsonPath::parse("$..name").is_err());
        assert!(JsonPath::parse("$.items[*]").is_err());
        assert!(JsonPath::parse("$.items[?(@.x)]").is_err());
        assert!(JsonPath::parse("$.a[1").is_err());
        assert!(JsonPath::parse("$.a[1:2]").is_err());
    }

    #[test]
    fn selects_values() {
        let doc = serde_json::json!({"metadata": {"labels": {"app.kubernetes.io/name": "x"}}, "spec": {"replicas": 3}});
        let p = JsonPath::parse("metadata.labels['app.kubernetes.io/name']").expect("path");
        assert_eq!(p.select(&doc).map(value_text).as_deref(), Some("x"));
        let p = JsonPath::parse("$.spec.replicas").expect("path");
        assert_eq!(p.select(&doc).map(value_text).as_deref(), Some("3"));
        assert!(JsonPath::parse("$.spec.missing").expect("path").select(&doc).is_none());
    }
}
