use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::ConfigMap;
use kanav_core::{ConfigMapId, ResolveError, ValidationError};
use kanav_hierarchy::MergedDocument;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, trace};

use crate::{
    tokenize::{tokenize_pattern, Token},
    ResolveEnv, ResolvedValue,
};

/// State for one top-level resolution request: the target resource, the merged document,
/// validated user input, resolved variables and the variables currently being resolved.
pub struct ResolutionContext<'a> {
    env: &'a ResolveEnv,
    resource: &'a Json,
    kind: String,
    document: &'a MergedDocument,
    input: FxHashMap<String, Json>,
    memo: FxHashMap<String, String>,
    visiting: Vec<String>,
    globals: FxHashMap<String, Option<Arc<ConfigMap>>>,
}

impl<'a> ResolutionContext<'a> {
    pub fn new(env: &'a ResolveEnv, resource: &'a Json, document: &'a MergedDocument) -> Self {
        let kind = resource.get("kind").and_then(|k| k.as_str()).unwrap_or("").to_string();
        Self {
            env,
            resource,
            kind,
            document,
            input: FxHashMap::default(),
            memo: FxHashMap::default(),
            visiting: Vec::new(),
            globals: FxHashMap::default(),
        }
    }

    pub fn env(&self) -> &'a ResolveEnv { self.env }
    pub fn resource(&self) -> &'a Json { self.resource }
    pub fn document(&self) -> &'a MergedDocument { self.document }
    pub fn kind(&self) -> &str { &self.kind }

    /// Resolve every `${...}` in `pattern`. Unresolvable expressions are echoed verbatim and
    /// clear `fully_resolved`; malformed ones are errors.
    pub fn resolve<'s>(&'s mut self, pattern: &'s str) -> BoxFuture<'s, Result<ResolvedValue, ResolveError>> {
        Box::pin(async move {
            let mut text = String::new();
            let mut fully_resolved = true;
            for token in tokenize_pattern(pattern) {
                let body = match token {
                    Token::Pattern(body) => body,
                    literal => {
                        text.push_str(&literal.decoded());
                        continue;
                    }
                };
                let value = match body.split_once('.') {
                    Some((prefix, suffix)) => match self.env.registry.resolver(prefix) {
                        Some(resolver) => resolver.resolve(self, suffix).await?,
                        None => {
                            debug!(prefix, "no resolver for prefix");
                            None
                        }
                    },
                    None => None,
                };
                match value {
                    Some(v) => text.push_str(&v),
                    None => {
                        fully_resolved = false;
                        text.push_str("${");
                        text.push_str(&body);
                        text.push('}');
                    }
                }
            }
            if !fully_resolved {
                counter!("patterns_unresolved_total", 1u64);
            }
            trace!(pattern, result = %text, fully_resolved, "pattern resolved");
            Ok(ResolvedValue { text, fully_resolved })
        })
    }

    pub(crate) fn memoized(&self, name: &str) -> Option<&str> {
        self.memo.get(name).map(String::as_str)
    }

    pub(crate) fn memoize(&mut self, name: &str, value: &str) {
        self.memo.insert(name.to_string(), value.to_string());
    }

    /// Push onto the visitation stack; `false` when `name` is already being resolved.
    pub(crate) fn enter_variable(&mut self, name: &str) -> bool {
        if self.visiting.iter().any(|v| v == name) { return false; }
        self.visiting.push(name.to_string());
        true
    }

    pub(crate) fn leave_variable(&mut self, name: &str) {
        if let Some(pos) = self.visiting.iter().rposition(|v| v == name) {
            self.visiting.remove(pos);
        }
    }

    /// A global config map from the settings namespace, fetched once per context.
    pub(crate) async fn global_map(&mut self, name: &str) -> Option<Arc<ConfigMap>> {
        if let Some(cached) = self.globals.get(name) {
            return cached.clone();
        }
        let id = ConfigMapId::new(&self.env.settings.namespace, name);
        let cm = self.env.config_maps.get(&id).await;
        self.globals.insert(name.to_string(), cm.clone());
        cm
    }

    /// Validated value of a user-input field.
    pub fn input_value(&self, field: &str) -> Option<&Json> { self.input.get(field) }

    /// Validate user input against the named input schema of the document and keep it for
    /// `${input.<field>}`. Declared fields left out get their default; required ones fail.
    pub fn set_user_input(&mut self, input_name: &str, values: &Map<String, Json>) -> Result<(), ValidationError> {
        let schema = self.document.input(input_name).ok_or_else(|| ValidationError::UnknownInput(input_name.to_string()))?;
        let empty = Map::new();
        let fields = schema.get("fields").and_then(|f| f.as_object()).unwrap_or(&empty);

        let mut accepted = FxHashMap::default();
        for (field, value) in values {
            let field_schema = fields.get(field).ok_or_else(|| ValidationError::UnexpectedField { field: field.clone() })?;
            if !matches!(value, Json::String(_) | Json::Number(_) | Json::Bool(_)) {
                return Err(ValidationError::NotPrimitive { field: field.clone() });
            }
            if let Some(validator) = field_schema.get("validator").and_then(|v| v.as_str()) {
                self.run_validator(field, validator, value)?;
            }
            accepted.insert(field.clone(), value.clone());
        }
        for (field, field_schema) in fields {
            if accepted.contains_key(field) { continue; }
            let optional = field_schema.get("optional").and_then(|o| o.as_bool()).unwrap_or(false);
            match field_schema.get("default") {
                Some(default) => {
                    accepted.insert(field.clone(), default.clone());
                }
                None if optional => {}
                None => return Err(ValidationError::MissingField { field: field.clone() }),
            }
        }
        debug!(input = input_name, fields = accepted.len(), "user input accepted");
        self.input = accepted;
        Ok(())
    }

    fn run_validator(&self, field: &str, validator: &str, value: &Json) -> Result<(), ValidationError> {
        let failed = |reason: String| ValidationError::ValidatorFailed { field: field.to_string(), reason };
        let source = self.document.snippet(validator).ok_or_else(|| failed(format!("unknown snippet {}", validator)))?;
        let result = self.env.snippets.call(source, &[json!({ "value": value })]).map_err(|e| failed(e.to_string()))?;
        let malformed = || ValidationError::MalformedValidatorResult { field: field.to_string() };
        let valid = result.get("valid").and_then(|v| v.as_bool()).ok_or_else(malformed)?;
        if valid {
            return Ok(());
        }
        let message = match result.get("message") {
            None | Some(Json::Null) => "invalid value".to_string(),
            Some(Json::String(m)) => m.clone(),
            Some(_) => return Err(malformed()),
        };
        Err(ValidationError::Invalid { field: field.to_string(), message })
    }
}
