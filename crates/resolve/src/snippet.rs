//! Snippet execution on Rhai.
//!
//! Each call compiles the source into a fresh engine and scope, so nothing survives between
//! calls. Values cross the boundary as JSON.
//!
//! Snippet bodies are Rhai. Only a `function name(` header is rewritten to `fn name(`; object
//! literals must be written `#{ key: value }`. A JavaScript-style `return { valid: true };`
//! does not compile.

use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value as Json;
use tracing::debug;

static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:function|fn)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("snippet header regex"));
static FUNCTION_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bfunction(\s+[A-Za-z_][A-Za-z0-9_]*\s*\()").expect("function keyword regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnippetError {
    #[error("no function definition found")]
    NoFunction,
    #[error("compile error: {0}")]
    Compile(String),
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("value conversion failed: {0}")]
    Convert(String),
}

/// Name of the first function a snippet defines.
pub fn snippet_name(source: &str) -> Option<&str> {
    HEADER.captures(source).and_then(|c| c.get(1)).map(|m| m.as_str())
}

#[derive(Debug, Clone)]
pub struct SnippetRuntime {
    max_operations: u64,
}

impl SnippetRuntime {
    pub fn new(max_operations: u64) -> Self { Self { max_operations } }

    fn engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        engine.set_max_call_levels(32);
        engine.set_max_expr_depths(64, 32);
        engine
    }

    /// Define the snippet's function and call it with `args`.
    pub fn call(&self, source: &str, args: &[Json]) -> Result<Json, SnippetError> {
        let name = snippet_name(source).ok_or(SnippetError::NoFunction)?.to_string();
        let script = FUNCTION_KEYWORD.replace_all(source, "fn$1");
        let engine = self.engine();
        let ast = engine.compile(script.as_ref()).map_err(|e| SnippetError::Compile(e.to_string()))?;
        let mut dyn_args = Vec::with_capacity(args.len());
        for a in args {
            dyn_args.push(rhai::serde::to_dynamic(a).map_err(|e| SnippetError::Convert(e.to_string()))?);
        }
        debug!(snippet = %name, args = args.len(), "calling snippet");
        let out: Dynamic = engine
            .call_fn(&mut Scope::new(), &ast, &name, dyn_args)
            .map_err(|e| SnippetError::Eval(e.to_string()))?;
        rhai::serde::from_dynamic::<Json>(&out).map_err(|e| SnippetError::Convert(e.to_string()))
    }
}
