//! The resolver chain: one strategy per `${prefix.suffix}` prefix.
//!
//! Every resolver returns `Ok(Some(text))` when it produced a value, `Ok(None)` when the
//! expression cannot be resolved (yet) and `Err` for malformed expressions.

use kanav_core::ResolveError;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::{
    context::ResolutionContext,
    snippet::SnippetError,
    jsonpath::{value_text, JsonPath},
    tokenize::{parse_call, Call},
};

const DEFAULT_MARKER: &str = ",default.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolver {
    Resource,
    Builtin,
    Global,
    Func,
    Input,
    Snippet,
    Var,
}

impl Resolver {
    pub const ALL: [Resolver; 7] = [
        Resolver::Resource,
        Resolver::Builtin,
        Resolver::Global,
        Resolver::Func,
        Resolver::Input,
        Resolver::Snippet,
        Resolver::Var,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Resolver::Resource => "resource",
            Resolver::Builtin => "builtin",
            Resolver::Global => "global",
            Resolver::Func => "func",
            Resolver::Input => "input",
            Resolver::Snippet => "snippet",
            Resolver::Var => "var",
        }
    }

    pub async fn resolve(self, ctx: &mut ResolutionContext<'_>, suffix: &str) -> Result<Option<String>, ResolveError> {
        match self {
            Resolver::Resource => resource(ctx, suffix),
            Resolver::Builtin => Ok(ctx.env().settings.builtins().into_iter().find(|(k, _)| *k == suffix).map(|(_, v)| v)),
            Resolver::Global => global(ctx, suffix).await,
            Resolver::Func => func(ctx, suffix).await,
            Resolver::Input => Ok(ctx.input_value(suffix).and_then(present)),
            Resolver::Snippet => snippet(ctx, suffix).await,
            Resolver::Var => var(ctx, suffix).await,
        }
    }
}

fn resource(ctx: &ResolutionContext<'_>, suffix: &str) -> Result<Option<String>, ResolveError> {
    let path = JsonPath::parse(suffix).map_err(|reason| ResolveError::InvalidPath { path: suffix.to_string(), reason })?;
    Ok(path.select(ctx.resource()).and_then(present))
}

/// Text of a selected value. JSON `null` counts as absent.
fn present(value: &Json) -> Option<String> {
    (!value.is_null()).then(|| value_text(value))
}

async fn global(ctx: &mut ResolutionContext<'_>, suffix: &str) -> Result<Option<String>, ResolveError> {
    let (map, field) = suffix.split_once('#').ok_or_else(|| ResolveError::MalformedGlobal(suffix.to_string()))?;
    let cm = ctx.global_map(map).await;
    Ok(cm.and_then(|cm| cm.data.as_ref().and_then(|d| d.get(field)).cloned()))
}

fn call_of(prefix: &str, suffix: &str) -> Result<Call, ResolveError> {
    parse_call(suffix).ok_or_else(|| ResolveError::MalformedCall(format!("{}.{}", prefix, suffix)))
}

/// Resolve every argument. `None` when any of them stays unresolved.
async fn resolve_args(ctx: &mut ResolutionContext<'_>, args: &[String]) -> Result<Option<Vec<String>>, ResolveError> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        let rv = ctx.resolve(arg).await?;
        if !rv.fully_resolved {
            debug!(arg = %arg, "argument not fully resolved; skipping call");
            return Ok(None);
        }
        out.push(rv.text);
    }
    Ok(Some(out))
}

async fn func(ctx: &mut ResolutionContext<'_>, suffix: &str) -> Result<Option<String>, ResolveError> {
    let call = call_of("func", suffix)?;
    let function = ctx.env().registry.function(&call.name).ok_or_else(|| ResolveError::UnknownFunction(call.name.clone()))?;
    if !function.allowed_parameter_count(call.args.len()) {
        return Err(ResolveError::ArgumentCount { name: call.name, count: call.args.len() });
    }
    let Some(args) = resolve_args(ctx, &call.args).await? else { return Ok(None) };
    function.invoke(ctx, &args).await
}

async fn snippet(ctx: &mut ResolutionContext<'_>, suffix: &str) -> Result<Option<String>, ResolveError> {
    let call = call_of("snippet", suffix)?;
    let source = ctx.document().snippet(&call.name).ok_or_else(|| ResolveError::UnknownSnippet(call.name.clone()))?;
    let Some(args) = resolve_args(ctx, &call.args).await? else { return Ok(None) };
    let args: Vec<Json> = args.into_iter().map(Json::String).collect();
    let runtime = ctx.env().snippets.clone();
    let script = source.to_string();
    // Script evaluation is CPU-bound; keep it off the async workers.
    let result = tokio::task::spawn_blocking(move || runtime.call(&script, &args))
        .await
        .unwrap_or_else(|e| Err(SnippetError::Eval(format!("snippet task failed: {}", e))));
    match result {
        Ok(Json::Null) => Ok(None),
        Ok(v) => Ok(Some(value_text(&v))),
        Err(e) => {
            warn!(snippet = %call.name, error = %e, "snippet failed; leaving pattern unresolved");
            Ok(None)
        }
    }
}

async fn var(ctx: &mut ResolutionContext<'_>, suffix: &str) -> Result<Option<String>, ResolveError> {
    let (name, default) = match suffix.split_once(DEFAULT_MARKER) {
        Some((name, default)) => (name, Some(default)),
        None => (suffix, None),
    };
    if let Some(v) = ctx.memoized(name) {
        return Ok(Some(v.to_string()));
    }
    if !ctx.enter_variable(name) {
        return Err(ResolveError::CyclicVariable(name.to_string()));
    }
    let result = match ctx.document().variable(name) {
        Some(definition) => ctx.resolve(definition).await,
        None => Err(ResolveError::UnknownVariable(name.to_string())),
    };
    ctx.leave_variable(name);
    match (result, default) {
        (Ok(rv), _) if rv.fully_resolved => {
            ctx.memoize(name, &rv.text);
            Ok(Some(rv.text))
        }
        (Ok(_), Some(d)) => Ok(Some(d.to_string())),
        (Ok(_), None) => Ok(None),
        (Err(ResolveError::CyclicVariable(c)), _) => Err(ResolveError::CyclicVariable(c)),
        (Err(e), Some(d)) => {
            debug!(var = name, error = %e, "using default");
            Ok(Some(d.to_string()))
        }
        (Err(e), None) => Err(e),
    }
}
