//! `KindActionMapping` custom resource: cluster-scoped rules mapping resources to config maps.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lowest and highest precedence a mapping resource may declare.
pub const MIN_PRECEDENCE: i64 = 1;
pub const MAX_PRECEDENCE: i64 = 9;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "actions.kanav.io", version = "v1", kind = "KindActionMapping", plural = "kindactionmappings")]
#[serde(rename_all = "camelCase")]
pub struct KindActionMappingSpec {
    /// 1..9, higher wins. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precedence: Option<i64>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl KindActionMappingSpec {
    pub fn precedence(&self) -> i64 { self.precedence.unwrap_or(MIN_PRECEDENCE) }
}

/// One rule inside a `KindActionMapping`. Every field may be `*` or absent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subkind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Config-map name template, e.g. `kanav.actions.${kind}-${subkind}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapname: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_mapping_resource() {
        let raw = serde_json::json!({
            "apiVersion": "actions.kanav.io/v1",
            "kind": "KindActionMapping",
            "metadata": { "name": "default" },
            "spec": {
                "precedence": 3,
                "mappings": [
                    { "apiVersion": "apps/v1", "kind": "Deployment", "subkind": "*", "mapname": "kanav.actions.${kind}-${subkind}" },
                    { "kind": "Pod", "owner": { "kind": "ReplicaSet", "apiVersion": "apps/v1" }, "mapname": "x" }
                ]
            }
        });
        let kam: KindActionMapping = serde_json::from_value(raw).expect("kam");
        assert_eq!(kam.spec.precedence(), 3);
        assert_eq!(kam.spec.mappings.len(), 2);
        assert_eq!(kam.spec.mappings[1].owner.as_ref().and_then(|o| o.kind.as_deref()), Some("ReplicaSet"));
    }

    #[test]
    fn precedence_defaults_to_one() {
        let spec: KindActionMappingSpec = serde_json::from_value(serde_json::json!({ "mappings": [] })).expect("spec");
        assert_eq!(spec.precedence(), MIN_PRECEDENCE);
    }
}
