//! Functions callable as `${func.<name>(...)}`.

use kanav_core::ResolveError;
use kanav_kubehub::LabelSelector;
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

use crate::{context::ResolutionContext, tokenize::split_command_line};

const WORKLOAD_API_VERSION: &str = "apps/v1";
const WORKLOAD_KINDS: [&str; 3] = ["Deployment", "StatefulSet", "DaemonSet"];
const APPLICATION_API_VERSION: &str = "app.k8s.io/v1beta1";
const APPLICATION_KIND: &str = "Application";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    KubectlGet,
    PodList,
    AppPodList,
    ReplicaSet,
}

impl Function {
    pub const ALL: [Function; 4] = [Function::KubectlGet, Function::PodList, Function::AppPodList, Function::ReplicaSet];

    pub fn name(self) -> &'static str {
        match self {
            Function::KubectlGet => "kubectlGet",
            Function::PodList => "podlist",
            Function::AppPodList => "apppodlist",
            Function::ReplicaSet => "replicaset",
        }
    }

    pub fn allowed_parameter_count(self, n: usize) -> bool {
        match self {
            Function::KubectlGet => n >= 1,
            Function::PodList | Function::AppPodList | Function::ReplicaSet => n == 0 || n == 2,
        }
    }

    /// Run with fully resolved arguments. `Ok(None)` is the "no result" case.
    pub async fn invoke(self, ctx: &ResolutionContext<'_>, args: &[String]) -> Result<Option<String>, ResolveError> {
        counter!("function_calls_total", 1u64, "function" => self.name());
        match self {
            Function::KubectlGet => kubectl_get(ctx, args).await.map(Some),
            Function::PodList => {
                let Some(workload) = workload(ctx, args, WORKLOAD_API_VERSION, &WORKLOAD_KINDS).await else { return Ok(None) };
                let pods = pods_of(ctx, &workload).await;
                Ok(Some(json!({ "pods": pods }).to_string()))
            }
            Function::AppPodList => {
                let Some(app) = workload(ctx, args, APPLICATION_API_VERSION, &[APPLICATION_KIND]).await else { return Ok(None) };
                let pods = application_pods(ctx, &app).await;
                Ok(Some(json!({ "pods": pods }).to_string()))
            }
            Function::ReplicaSet => {
                let Some(deployment) = workload(ctx, args, WORKLOAD_API_VERSION, &["Deployment"]).await else { return Ok(None) };
                Ok(replica_set_of(ctx, &deployment).await)
            }
        }
    }
}

async fn kubectl_get(ctx: &ResolutionContext<'_>, args: &[String]) -> Result<String, ResolveError> {
    let env = ctx.env();
    let mut argv = vec![env.settings.kubectl.clone(), "get".to_string()];
    argv.extend(args.iter().flat_map(|a| split_command_line(a)));
    env.commands.run(&argv).await.into_result().map_err(|e| ResolveError::FunctionFailed {
        name: Function::KubectlGet.name().to_string(),
        reason: e.to_string(),
    })
}

fn str_at<'a>(obj: &'a Json, pointer: &str) -> &'a str {
    obj.pointer(pointer).and_then(|v| v.as_str()).unwrap_or("")
}

/// The object a function works on: the context resource (no arguments, kind must be one of
/// `kinds`) or the object named by `(namespace, name)`.
async fn workload(ctx: &ResolutionContext<'_>, args: &[String], api_version: &str, kinds: &[&str]) -> Option<Json> {
    match args {
        [] => {
            if kinds.contains(&ctx.kind()) {
                Some(ctx.resource().clone())
            } else {
                debug!(kind = ctx.kind(), expected = ?kinds, "context resource is not a matching kind");
                None
            }
        }
        [namespace, name] => {
            let reader = &ctx.env().reader;
            // Prefer the context resource's kind when it qualifies.
            let mut order: Vec<&str> = kinds.iter().copied().filter(|k| *k == ctx.kind()).collect();
            order.extend(kinds.iter().copied().filter(|k| *k != ctx.kind()));
            for kind in order {
                match reader.get_object(api_version, kind, namespace, name).await {
                    Ok(Some(obj)) => return Some(obj),
                    Ok(None) => continue,
                    Err(e) => warn!(kind, ns = %namespace, name = %name, error = %e, "workload lookup failed"),
                }
            }
            None
        }
        _ => None,
    }
}

/// Pods selected by a workload, cluster-wide list filtered to the workload's namespace.
async fn pods_of(ctx: &ResolutionContext<'_>, workload: &Json) -> Vec<String> {
    let selector = LabelSelector::from_workload(workload);
    if selector.is_empty() {
        debug!(name = str_at(workload, "/metadata/name"), "workload has no selector");
        return Vec::new();
    }
    let namespace = str_at(workload, "/metadata/namespace");
    match ctx.env().reader.list_objects("v1", "Pod", None, &selector).await {
        Ok(pods) => pods
            .iter()
            .filter(|p| str_at(p, "/metadata/namespace") == namespace)
            .map(|p| str_at(p, "/metadata/name").to_string())
            .collect(),
        Err(e) => {
            warn!(selector = %selector.to_query(), error = %e, "pod list failed");
            Vec::new()
        }
    }
}

/// Pods of every workload component of an application, deduplicated by name.
async fn application_pods(ctx: &ResolutionContext<'_>, app: &Json) -> Vec<String> {
    let selector = LabelSelector::from_workload(app);
    if selector.is_empty() { return Vec::new(); }
    let namespace = str_at(app, "/metadata/namespace");
    let components = app.pointer("/spec/componentKinds").and_then(|c| c.as_array()).cloned().unwrap_or_default();
    let mut out: Vec<String> = Vec::new();
    for component in components {
        let kind = str_at(&component, "/kind");
        if !WORKLOAD_KINDS.contains(&kind) { continue; }
        let group = str_at(&component, "/group");
        let api_version = if group.is_empty() || group == "apps" { WORKLOAD_API_VERSION.to_string() } else { format!("{}/v1", group) };
        let workloads = match ctx.env().reader.list_objects(&api_version, kind, Some(namespace), &selector).await {
            Ok(w) => w,
            Err(e) => {
                warn!(kind, error = %e, "application component list failed");
                continue;
            }
        };
        for w in workloads.iter().filter(|w| str_at(w, "/metadata/namespace") == namespace) {
            for pod in pods_of(ctx, w).await {
                if !out.contains(&pod) { out.push(pod); }
            }
        }
    }
    out
}

async fn replica_set_of(ctx: &ResolutionContext<'_>, deployment: &Json) -> Option<String> {
    let selector = LabelSelector::from_workload(deployment);
    if selector.is_empty() { return None; }
    let namespace = str_at(deployment, "/metadata/namespace");
    match ctx.env().reader.list_objects(WORKLOAD_API_VERSION, "ReplicaSet", Some(namespace), &selector).await {
        Ok(sets) => sets.first().map(|rs| str_at(rs, "/metadata/name").to_string()).filter(|n| !n.is_empty()),
        Err(e) => {
            warn!(error = %e, "replica set list failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_counts() {
        assert!(!Function::KubectlGet.allowed_parameter_count(0));
        assert!(Function::KubectlGet.allowed_parameter_count(3));
        for f in [Function::PodList, Function::AppPodList, Function::ReplicaSet] {
            assert!(f.allowed_parameter_count(0));
            assert!(!f.allowed_parameter_count(1));
            assert!(f.allowed_parameter_count(2));
        }
    }
}
