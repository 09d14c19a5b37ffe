use std::sync::Arc;

use kanav_core::{ResolveError, Settings, ValidationError};
use kanav_hierarchy::MergedDocument;
use kanav_kubehub::MemoryCluster;
use kanav_resolve::ResolveEnv;
use kanav_store::ConfigMapCache;
use serde_json::{json, Map, Value as Json};

fn env_with(mc: Arc<MemoryCluster>) -> ResolveEnv {
    let settings = Settings { nav_url: "https://nav.example".into(), ..Settings::default() };
    let cache = Arc::new(ConfigMapCache::uncached(mc.clone()));
    ResolveEnv::new(settings, mc, cache)
}

fn document(body: Json) -> MergedDocument {
    MergedDocument { sources: Vec::new(), body: body.as_object().cloned().unwrap_or_default() }
}

fn deployment() -> Json {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "foo", "namespace": "ns", "labels": { "app": "foo" } },
        "spec": { "replicas": 2, "template": { "spec": { "containers": [{ "name": "c", "image": "img:1" }] } } }
    })
}

fn input(pairs: Json) -> Map<String, Json> {
    pairs.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn text_without_patterns_is_returned_unchanged() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = MergedDocument::default();
    let mut ctx = env.context(&res, &doc);
    for text in ["", "plain text", "braces } and $ alone", "a~41b"] {
        let rv = ctx.resolve(text).await.expect("resolve");
        assert!(rv.fully_resolved, "{}", text);
        if text == "a~41b" {
            assert_eq!(rv.text, "aAb");
        } else {
            assert_eq!(rv.text, text);
        }
    }
    assert_eq!(ctx.resolve("a~4").await.expect("resolve").text, "a~4");

    let rv = ctx.resolve("x~41${var.a~41").await.expect("unterminated");
    assert_eq!(rv.text, "xA${var.a~41");
    assert!(rv.fully_resolved);
}

#[tokio::test]
async fn null_values_are_not_resolved() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "svc" }, "spec": { "clusterIP": null } });
    let doc = MergedDocument::default();
    let mut ctx = env.context(&res, &doc);
    let rv = ctx.resolve("ip=${resource.spec.clusterIP}").await.expect("resolve");
    assert_eq!(rv.text, "ip=${resource.spec.clusterIP}");
    assert!(!rv.fully_resolved);
}

#[tokio::test]
async fn resource_builtin_and_unknown_prefixes() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = MergedDocument::default();
    let mut ctx = env.context(&res, &doc);

    let rv = ctx.resolve("${builtin.nav-url}/ns/${resource.metadata.namespace}/${resource.$.spec.template.spec.containers[0].image}").await.expect("resolve");
    assert_eq!(rv.text, "https://nav.example/ns/ns/img:1");
    assert!(rv.fully_resolved);

    let rv = ctx.resolve("x ${nope.a} ${resource.spec.missing} ${plain}").await.expect("resolve");
    assert_eq!(rv.text, "x ${nope.a} ${resource.spec.missing} ${plain}");
    assert!(!rv.fully_resolved);

    let err = ctx.resolve("${resource.spec..replicas}").await.unwrap_err();
    assert!(matches!(err, ResolveError::InvalidPath { .. }), "{:?}", err);
}

#[tokio::test]
async fn global_maps_are_read_once_per_context() {
    let mc = Arc::new(MemoryCluster::from_documents(vec![json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": "kanav.globals", "namespace": "kanav" },
        "data": { "host": "grafana.example", "port": "3000" }
    })]));
    let env = env_with(mc.clone());
    let res = deployment();
    let doc = MergedDocument::default();
    let mut ctx = env.context(&res, &doc);

    let before = mc.config_map_reads();
    let rv = ctx.resolve("${global.kanav.globals#host}:${global.kanav.globals#port}").await.expect("resolve");
    assert_eq!(rv.text, "grafana.example:3000");
    assert_eq!(mc.config_map_reads(), before + 1);

    let rv = ctx.resolve("${global.kanav.globals#nothing}").await.expect("resolve");
    assert!(!rv.fully_resolved);
    assert_eq!(ctx.resolve("${global.kanav.globals}").await, Err(ResolveError::MalformedGlobal("kanav.globals".into())));
}

#[tokio::test]
async fn variables_are_evaluated_once_per_context() {
    let mc = Arc::new(MemoryCluster::from_documents(vec![json!({
        "apiVersion": "apps/v1", "kind": "ReplicaSet",
        "metadata": { "name": "foo-6d4b", "namespace": "ns", "labels": { "app": "foo" } }
    })]));
    let env = env_with(mc.clone());
    let res = deployment();
    let doc = document(json!({ "variables": { "rs": "${func.replicaset()}", "path": "/rs/${var.rs}" } }));
    let mut ctx = env.context(&res, &doc);

    let before = mc.object_reads();
    let rv = ctx.resolve("${var.path} ${var.rs} ${var.rs}").await.expect("resolve");
    assert_eq!(rv.text, "/rs/foo-6d4b foo-6d4b foo-6d4b");
    assert_eq!(mc.object_reads(), before + 1, "replicaset() ran more than once");

    // A fresh context evaluates again.
    let mut other = env.context(&res, &doc);
    other.resolve("${var.rs}").await.expect("resolve");
    assert_eq!(mc.object_reads(), before + 2);
}

#[tokio::test]
async fn cyclic_variables_fail() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = document(json!({ "variables": { "x": "${var.y}", "y": "a${var.x}", "self": "${var.self}" } }));
    let mut ctx = env.context(&res, &doc);
    assert!(matches!(ctx.resolve("${var.x}").await, Err(ResolveError::CyclicVariable(_))));
    let mut ctx = env.context(&res, &doc);
    assert!(matches!(ctx.resolve("${var.y}").await, Err(ResolveError::CyclicVariable(_))));
    let mut ctx = env.context(&res, &doc);
    assert_eq!(ctx.resolve("${var.self}").await, Err(ResolveError::CyclicVariable("self".into())));
}

#[tokio::test]
async fn variable_defaults_cover_missing_and_failing_definitions() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = document(json!({ "variables": {
        "broken": "${resource.a..b}",
        "partial": "${nope.x}",
        "ok": "${resource.metadata.name}"
    } }));
    let mut ctx = env.context(&res, &doc);
    for pattern in ["${var.missing,default.fallback}", "${var.broken,default.fallback}", "${var.partial,default.fallback}"] {
        let rv = ctx.resolve(pattern).await.expect(pattern);
        assert_eq!(rv.text, "fallback", "{}", pattern);
        assert!(rv.fully_resolved);
    }
    assert_eq!(ctx.resolve("${var.ok,default.fallback}").await.expect("ok").text, "foo");
    assert_eq!(ctx.resolve("${var.missing}").await, Err(ResolveError::UnknownVariable("missing".into())));
    assert!(matches!(ctx.resolve("${var.broken}").await, Err(ResolveError::InvalidPath { .. })));
    assert!(!ctx.resolve("${var.partial}").await.expect("partial").fully_resolved);
}

#[tokio::test]
async fn function_calls_are_checked_before_running() {
    let mc = Arc::new(MemoryCluster::new());
    let env = env_with(mc.clone());
    let res = deployment();
    let doc = MergedDocument::default();
    let mut ctx = env.context(&res, &doc);

    assert_eq!(ctx.resolve("${func.nothing()}").await, Err(ResolveError::UnknownFunction("nothing".into())));
    assert_eq!(ctx.resolve("${func.podlist(a)}").await, Err(ResolveError::ArgumentCount { name: "podlist".into(), count: 1 }));
    assert!(matches!(ctx.resolve("${func.podlist}").await, Err(ResolveError::MalformedCall(_))));
    assert!(matches!(ctx.resolve("${func.kubectlGet()}").await, Err(ResolveError::ArgumentCount { .. })));

    let before = mc.object_reads();
    let rv = ctx.resolve("${func.podlist(${nope.ns},foo)}").await.expect("resolve");
    assert!(!rv.fully_resolved);
    assert_eq!(rv.text, "${func.podlist(${nope.ns},foo)}");
    assert_eq!(mc.object_reads(), before, "function ran with an unresolved argument");
}

#[tokio::test]
async fn snippets_compute_values() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = document(json!({ "snippets": {
        "join": "function join(a, b) { a + \"-\" + b }",
        "boom": "fn boom() { throw \"no\"; }",
        "nothing": "fn nothing() { () }"
    } }));
    let mut ctx = env.context(&res, &doc);
    let rv = ctx.resolve("${snippet.join(x,${resource.metadata.name})}").await.expect("resolve");
    assert_eq!(rv.text, "x-foo");
    assert!(!ctx.resolve("${snippet.boom()}").await.expect("boom").fully_resolved);
    assert!(!ctx.resolve("${snippet.nothing()}").await.expect("nothing").fully_resolved);
    assert_eq!(ctx.resolve("${snippet.absent()}").await, Err(ResolveError::UnknownSnippet("absent".into())));
}

fn input_document() -> MergedDocument {
    document(json!({
        "inputs": {
            "scale": { "fields": {
                "replicas": { "validator": "atLeastOne" },
                "reason": { "optional": true },
                "mode": { "optional": true, "default": "rolling" }
            } },
            "checked": { "fields": {
                "broken": { "validator": "broken" },
                "odd": { "validator": "odd" },
                "lost": { "validator": "missingSnippet" }
            } }
        },
        "snippets": {
            "atLeastOne": "function atLeastOne(input) { if input.value >= 1 { #{ valid: true } } else { #{ valid: false, message: \"must be at least 1\" } } }",
            "broken": "fn broken(input) { throw \"bad\"; }",
            "odd": "fn odd(input) { 42 }"
        }
    }))
}

#[tokio::test]
async fn user_input_is_validated_and_defaulted() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = input_document();
    let mut ctx = env.context(&res, &doc);

    ctx.set_user_input("scale", &input(json!({ "replicas": 3 }))).expect("valid input");
    let rv = ctx.resolve("${input.replicas}/${input.mode}/${input.reason}").await.expect("resolve");
    assert_eq!(rv.text, "3/rolling/${input.reason}");
    assert!(!rv.fully_resolved);
}

#[tokio::test]
async fn user_input_errors_name_the_field() {
    let env = env_with(Arc::new(MemoryCluster::new()));
    let res = deployment();
    let doc = input_document();
    let mut ctx = env.context(&res, &doc);

    let cases: Vec<(&str, Json, ValidationError)> = vec![
        ("nope", json!({}), ValidationError::UnknownInput("nope".into())),
        ("scale", json!({ "replicas": 1, "extra": "x" }), ValidationError::UnexpectedField { field: "extra".into() }),
        ("scale", json!({ "replicas": { "n": 1 } }), ValidationError::NotPrimitive { field: "replicas".into() }),
        ("scale", json!({ "replicas": 0 }), ValidationError::Invalid { field: "replicas".into(), message: "must be at least 1".into() }),
        ("scale", json!({ "reason": "x" }), ValidationError::MissingField { field: "replicas".into() }),
        ("checked", json!({ "odd": "1" }), ValidationError::MalformedValidatorResult { field: "odd".into() }),
    ];
    for (name, values, expected) in cases {
        assert_eq!(ctx.set_user_input(name, &input(values.clone())), Err(expected), "{} {}", name, values);
    }
    let err = ctx.set_user_input("checked", &input(json!({ "broken": "1" }))).unwrap_err();
    assert!(matches!(err, ValidationError::ValidatorFailed { .. }), "{:?}", err);
    assert_eq!(err.field(), Some("broken"));
    let err = ctx.set_user_input("checked", &input(json!({ "lost": "1" }))).unwrap_err();
    assert!(matches!(err, ValidationError::ValidatorFailed { .. }), "{:?}", err);
}
