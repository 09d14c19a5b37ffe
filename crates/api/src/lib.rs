//! kanav public API façade (in-process).
//!
//! [`Navigator`] owns everything that lives for the whole process: settings, the cluster
//! reader, both caches and the resolver/function registries. Each call builds its own
//! resolution context, so a `Navigator` can be shared freely between requests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use kanav_core::{ConfigMapId, ResolveError, ResourceIdentity, Settings, ValidationError};
use kanav_hierarchy::{DocumentKind, MergedDocument, ACTION_CATEGORIES, CMD_ACTIONS};
use kanav_kubehub::{ClusterReader, KubeReader};
use kanav_resolve::{tokenize::split_command_line, ResolveEnv, ResolvedValue};
use kanav_store::{ConfigMapCache, KamCache};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};

/// Action fields that name things rather than carry patterns.
const IDENTITY_FIELDS: [&str; 2] = ["name", "input"];
/// Field of a `cmd-actions` entry holding the command line.
pub const CMD_PATTERN: &str = "cmd-pattern";

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum NavError {
    #[error("pattern: {0}")]
    Pattern(String),
    #[error("validation: {message}")]
    Validation { field: Option<String>, message: String },
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl NavError {
    /// Errors the caller caused and should be shown to the end user (HTTP 4xx).
    pub fn is_client_error(&self) -> bool { !matches!(self, NavError::Internal(_)) }
}

impl From<ResolveError> for NavError {
    fn from(e: ResolveError) -> Self { NavError::Pattern(e.to_string()) }
}

impl From<ValidationError> for NavError {
    fn from(e: ValidationError) -> Self {
        NavError::Validation { field: e.field().map(str::to_string), message: e.to_string() }
    }
}

impl From<anyhow::Error> for NavError {
    fn from(e: anyhow::Error) -> Self { NavError::Internal(format!("{:#}", e)) }
}

pub type NavResult<T> = Result<T, NavError>;

/// A named action with its pattern fields resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub category: String,
    pub name: String,
    /// Every top-level string field of the action, resolved.
    pub fields: BTreeMap<String, String>,
    /// Fields that still contain `${...}` expressions.
    pub unresolved: Vec<String>,
    /// Argument vector of a fully resolved `cmd-pattern`.
    pub argv: Option<Vec<String>>,
}

impl ResolvedAction {
    pub fn fully_resolved(&self) -> bool { self.unresolved.is_empty() }
    pub fn field(&self, key: &str) -> Option<&str> { self.fields.get(key).map(String::as_str) }
}

pub struct Navigator {
    env: ResolveEnv,
    kams: KamCache,
}

impl Navigator {
    /// Navigator whose caches read straight through to `reader`. No runtime needed.
    pub fn new(settings: Settings, reader: Arc<dyn ClusterReader>) -> Self {
        let config_maps = Arc::new(ConfigMapCache::uncached(Arc::clone(&reader)));
        let kams = KamCache::uncached(Arc::clone(&reader));
        Self { env: ResolveEnv::new(settings, reader, config_maps), kams }
    }

    /// Navigator with watch-backed caches. Must be called inside a tokio runtime.
    pub fn watching(settings: Settings, reader: Arc<dyn ClusterReader>) -> Self {
        let backoff = settings.watch_backoff;
        let config_maps = Arc::new(ConfigMapCache::spawn(Arc::clone(&reader), backoff));
        let kams = KamCache::spawn(Arc::clone(&reader), backoff);
        info!(namespace = %settings.namespace, backoff_secs = backoff.as_secs(), "caches watching");
        Self { env: ResolveEnv::new(settings, reader, config_maps), kams }
    }

    /// Connect to the cluster from the ambient kubeconfig and start the cache watches.
    pub async fn connect(settings: Settings) -> anyhow::Result<Self> {
        let reader = KubeReader::try_default().await?;
        Ok(Self::watching(settings, Arc::new(reader)))
    }

    pub fn settings(&self) -> &Settings { &self.env.settings }

    pub fn env(&self) -> &ResolveEnv { &self.env }

    fn identity(resource: &Json) -> NavResult<ResourceIdentity> {
        ResourceIdentity::from_object(resource)
            .ok_or_else(|| NavError::Validation { field: Some("kind".into()), message: "resource has no kind".into() })
    }

    /// Config-map identities selected by the KindActionMapping rules, most important first.
    pub async fn config_maps_for(&self, resource: &Json) -> NavResult<Vec<ConfigMapId>> {
        let identity = Self::identity(resource)?;
        Ok(kanav_rules::config_maps_for(&self.kams, &identity, &self.env.settings.namespace).await?)
    }

    /// Merged action document. Rule-selected maps are used when any rule matched; otherwise the
    /// fixed instance/subkind/kind hierarchy.
    pub async fn action_document(&self, resource: &Json) -> NavResult<MergedDocument> {
        let identity = Self::identity(resource)?;
        let config_maps = &self.env.config_maps;
        let ids = match kanav_rules::config_maps_for(&self.kams, &identity, &self.env.settings.namespace).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(kind = %identity.kind, error = %format!("{:#}", e), "rule matching failed; using the fixed hierarchy");
                Vec::new()
            }
        };
        let doc = if ids.is_empty() {
            kanav_hierarchy::action_document(config_maps, &identity, &self.env.settings).await
        } else {
            kanav_hierarchy::merge_identities(config_maps, &ids, DocumentKind::Actions).await
        };
        debug!(kind = %identity.kind, name = ?identity.name, sources = doc.sources.len(), "action document merged");
        Ok(doc)
    }

    /// Merged status document, falling back to the unregistered status map.
    pub async fn status_document(&self, resource: &Json) -> NavResult<MergedDocument> {
        let identity = Self::identity(resource)?;
        Ok(kanav_hierarchy::status_document(&self.env.config_maps, &identity, &self.env.settings).await)
    }

    /// Resolve one pattern in a fresh context.
    pub async fn resolve(&self, resource: &Json, document: &MergedDocument, pattern: &str) -> NavResult<ResolvedValue> {
        let mut ctx = self.env.context(resource, document);
        Ok(ctx.resolve(pattern).await?)
    }

    /// Look up an action in the resource's action document, validate `inputs` against the
    /// action's input schema and resolve its fields.
    pub async fn resolve_action(
        &self,
        resource: &Json,
        category: &str,
        name: &str,
        inputs: &Map<String, Json>,
    ) -> NavResult<ResolvedAction> {
        if !ACTION_CATEGORIES.contains(&category) {
            return Err(NavError::NotFound(format!("action category {}", category)));
        }
        let started = Instant::now();
        let document = self.action_document(resource).await?;
        let action = document
            .action(category, name)
            .and_then(|a| a.as_object())
            .ok_or_else(|| NavError::NotFound(format!("{} {}", category, name)))?;

        let mut ctx = self.env.context(resource, &document);
        match action.get("input").and_then(|i| i.as_str()) {
            Some(input) => ctx.set_user_input(input, inputs)?,
            None => {
                if let Some(field) = inputs.keys().next() {
                    return Err(ValidationError::UnexpectedField { field: field.clone() }.into());
                }
            }
        }

        let mut fields = BTreeMap::new();
        let mut unresolved = Vec::new();
        for (key, value) in action {
            let Some(pattern) = value.as_str() else { continue };
            if IDENTITY_FIELDS.contains(&key.as_str()) {
                fields.insert(key.clone(), pattern.to_string());
                continue;
            }
            let rv = ctx.resolve(pattern).await?;
            if !rv.fully_resolved {
                unresolved.push(key.clone());
            }
            fields.insert(key.clone(), rv.text);
        }
        let argv = (category == CMD_ACTIONS && !unresolved.iter().any(|k| k == CMD_PATTERN))
            .then(|| fields.get(CMD_PATTERN).map(|c| Self::command_argv(c)))
            .flatten();

        histogram!("action_resolve_seconds", started.elapsed().as_secs_f64());
        counter!("actions_resolved_total", 1u64, "category" => category.to_string());
        info!(category, action = name, unresolved = unresolved.len(), "action resolved");
        Ok(ResolvedAction { category: category.to_string(), name: name.to_string(), fields, unresolved, argv })
    }

    /// Split a resolved command line into an argument vector.
    pub fn command_argv(resolved: &str) -> Vec<String> { split_command_line(resolved) }
}
