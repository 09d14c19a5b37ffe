use std::sync::Arc;

use kanav_core::{ConfigMapId, ResourceIdentity, Settings};
use kanav_hierarchy::{action_document, merge_identities, status_document, DocumentKind, URL_ACTIONS, VARIABLES};
use kanav_kubehub::MemoryCluster;
use kanav_store::ConfigMapCache;
use serde_json::{json, Value as Json};

fn cm(ns: &str, name: &str, replace: bool, data: Json) -> Json {
    let mut obj = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns },
        "data": data,
    });
    if replace {
        obj["metadata"]["annotations"] = json!({ "kanav.actions.on.conflict": "replace" });
    }
    obj
}

fn deployment() -> ResourceIdentity {
    ResourceIdentity {
        namespace: Some("ns".into()),
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        subkind: Some("liberty".into()),
        name: Some("foo".into()),
        ..Default::default()
    }
}

fn cache(docs: Vec<Json>) -> ConfigMapCache {
    ConfigMapCache::uncached(Arc::new(MemoryCluster::from_documents(docs)))
}

fn url_of(doc: &kanav_hierarchy::MergedDocument, name: &str) -> Option<String> {
    doc.action(URL_ACTIONS, name).and_then(|a| a["url-pattern"].as_str()).map(str::to_string)
}

#[tokio::test]
async fn more_specific_map_wins_and_others_fill_in() {
    let cache = cache(vec![
        cm("ns", "kanav.actions.deployment-liberty.foo", false, json!({
            "url-actions": r#"[{"name":"foo","url-pattern":"instance"}]"#,
        })),
        cm("kanav", "kanav.actions.deployment-liberty", false, json!({
            "url-actions": r#"[{"name":"foo","url-pattern":"subkind"},{"name":"bar","url-pattern":"subkind"}]"#,
            "variables": r#"{"v":"sub"}"#,
        })),
        cm("kanav", "kanav.actions.deployment", false, json!({
            "variables": r#"{"v":"kind","w":"kind"}"#,
        })),
    ]);
    let doc = action_document(&cache, &deployment(), &Settings::default()).await;
    assert_eq!(doc.sources.len(), 3);
    assert_eq!(url_of(&doc, "foo").as_deref(), Some("instance"));
    assert_eq!(url_of(&doc, "bar").as_deref(), Some("subkind"));
    assert_eq!(doc.variable("v"), Some("sub"));
    assert_eq!(doc.variable("w"), Some("kind"));
    assert_eq!(doc.category(URL_ACTIONS).and_then(|a| a.as_array()).map(|a| a.len()), Some(2));
}

#[tokio::test]
async fn replace_annotation_stops_the_merge() {
    let cache = cache(vec![
        cm("kanav", "kanav.actions.deployment-liberty", true, json!({
            "url-actions": r#"[{"name":"foo","url-pattern":"subkind"}]"#,
        })),
        cm("kanav", "kanav.actions.deployment", false, json!({
            "url-actions": r#"[{"name":"foo","url-pattern":"kind"},{"name":"other","url-pattern":"kind"}]"#,
            "variables": r#"{"v":"kind"}"#,
        })),
    ]);
    let doc = action_document(&cache, &deployment(), &Settings::default()).await;
    assert_eq!(doc.sources, vec![ConfigMapId::new("kanav", "kanav.actions.deployment-liberty")]);
    assert_eq!(url_of(&doc, "foo").as_deref(), Some("subkind"));
    assert!(url_of(&doc, "other").is_none());
    assert!(doc.category(VARIABLES).is_none());
}

#[tokio::test]
async fn explicit_identities_merge_in_the_given_order() {
    let cache = cache(vec![
        cm("kanav", "a", false, json!({ "url-actions": r#"[{"name":"foo","url-pattern":"a"}]"# })),
        cm("kanav", "b", false, json!({ "url-actions": r#"[{"name":"foo","url-pattern":"b"}]"# })),
    ]);
    let ids = [ConfigMapId::new("kanav", "b"), ConfigMapId::new("kanav", "missing"), ConfigMapId::new("kanav", "a")];
    let doc = merge_identities(&cache, &ids, DocumentKind::Actions).await;
    assert_eq!(url_of(&doc, "foo").as_deref(), Some("b"));
    assert_eq!(doc.sources.len(), 2);
}

#[tokio::test]
async fn status_falls_back_to_unregistered_only_when_nothing_matched() {
    let unregistered = cm("kanav", "kanav.status-mapping.unregistered", false, json!({ "algorithm": r#""unregistered""# }));
    let kind_level = cm("kanav", "kanav.status-mapping.deployment", false, json!({ "algorithm": r#""OR""# }));

    let doc = status_document(&cache(vec![unregistered.clone()]), &deployment(), &Settings::default()).await;
    assert_eq!(doc.category("algorithm"), Some(&json!("unregistered")));

    let doc = status_document(&cache(vec![unregistered, kind_level]), &deployment(), &Settings::default()).await;
    assert_eq!(doc.category("algorithm"), Some(&json!("OR")));
    assert_eq!(doc.sources, vec![ConfigMapId::new("kanav", "kanav.status-mapping.deployment")]);
}
