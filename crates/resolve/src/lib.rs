//! kanav resolve: evaluate `${prefix.suffix}` patterns against a resource and its merged
//! configuration document.
//!
//! [`ResolveEnv`] is built once per process and owns the resolver and function registries,
//! the snippet runtime and the command runner. A [`ResolutionContext`] is created from it for
//! each request and dropped afterwards.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kanav_core::Settings;
use kanav_hierarchy::MergedDocument;
use kanav_kubehub::ClusterReader;
use kanav_ops::CommandRunner;
use kanav_store::ConfigMapCache;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod context;
mod functions;
pub mod jsonpath;
mod resolvers;
mod snippet;
pub mod tokenize;

pub use context::ResolutionContext;
pub use functions::Function;
pub use resolvers::Resolver;
pub use snippet::{snippet_name, SnippetError, SnippetRuntime};

/// Result of resolving a pattern. When `fully_resolved` is false, `text` still carries the
/// unresolved `${...}` expressions as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub text: String,
    pub fully_resolved: bool,
}

/// Resolver and function lookup tables. Immutable once built.
#[derive(Debug, Clone)]
pub struct Registry {
    resolvers: FxHashMap<&'static str, Resolver>,
    functions: FxHashMap<&'static str, Function>,
}

impl Default for Registry {
    fn default() -> Self { Self::builtin() }
}

impl Registry {
    /// Every resolver and function.
    pub fn builtin() -> Self {
        Self::with(Resolver::ALL, Function::ALL)
    }

    pub fn with(resolvers: impl IntoIterator<Item = Resolver>, functions: impl IntoIterator<Item = Function>) -> Self {
        Self {
            resolvers: resolvers.into_iter().map(|r| (r.prefix(), r)).collect(),
            functions: functions.into_iter().map(|f| (f.name(), f)).collect(),
        }
    }

    pub fn resolver(&self, prefix: &str) -> Option<Resolver> { self.resolvers.get(prefix).copied() }

    pub fn function(&self, name: &str) -> Option<Function> { self.functions.get(name).copied() }
}

/// Process-scoped resolution services.
pub struct ResolveEnv {
    pub settings: Settings,
    pub reader: Arc<dyn ClusterReader>,
    pub config_maps: Arc<ConfigMapCache>,
    pub registry: Registry,
    pub snippets: SnippetRuntime,
    pub commands: CommandRunner,
}

impl ResolveEnv {
    pub fn new(settings: Settings, reader: Arc<dyn ClusterReader>, config_maps: Arc<ConfigMapCache>) -> Self {
        Self {
            snippets: SnippetRuntime::new(settings.snippet_max_ops),
            commands: CommandRunner::new(settings.command_timeout),
            registry: Registry::builtin(),
            settings,
            reader,
            config_maps,
        }
    }

    pub fn context<'a>(&'a self, resource: &'a Json, document: &'a MergedDocument) -> ResolutionContext<'a> {
        ResolutionContext::new(self, resource, document)
    }
}
