//! `${...}` substitution in KindActionMapping `mapname` templates.

use kanav_core::{ConfigMapId, OwnerRef, ResourceIdentity};
use tracing::debug;

/// Stands in for the `.` inside `${owner.x}` while the name is split on `.`.
/// Config-map names cannot contain `:`, so it never collides with real text.
const PROTECT: char = ':';

fn substitute_segment(segment: &str, resource: &ResourceIdentity, owner: Option<&OwnerRef>) -> String {
    let kind = resource.kind.to_ascii_lowercase();
    let mut out = segment.to_string();
    if out.contains("${kind}-${subkind}") {
        if let Some(sub) = &resource.subkind {
            out = out.replace("${kind}-${subkind}", &format!("{}-{}", kind, sub.to_ascii_lowercase()));
        }
    }
    out = out.replace("${kind}", &kind);
    if let Some(ns) = &resource.namespace { out = out.replace("${namespace}", ns); }
    if let Some(name) = &resource.name { out = out.replace("${name}", name); }
    if let Some(o) = owner {
        out = out
            .replace(&format!("${{owner{}kind}}", PROTECT), &o.kind.to_ascii_lowercase())
            .replace(&format!("${{owner{}apiVersion}}", PROTECT), &o.api_version)
            .replace(&format!("${{owner{}uid}}", PROTECT), &o.uid);
    }
    out
}

fn substitute_name(template: &str, resource: &ResourceIdentity, owner: Option<&OwnerRef>) -> String {
    let protected = template.replace("${owner.", &format!("${{owner{}", PROTECT));
    let joined = protected
        .split('.')
        .map(|seg| substitute_segment(seg, resource, owner))
        .collect::<Vec<_>>()
        .join(".");
    if joined.contains("${") {
        debug!(template, result = %joined, "mapname placeholders left unresolved");
        return joined.replace(PROTECT, ".");
    }
    joined
}

/// Turn a `mapname` into a config-map identity. `ns/name` names the namespace explicitly;
/// a bare name lives in `default_namespace`.
pub fn config_map_id(mapname: &str, resource: &ResourceIdentity, owner: Option<&OwnerRef>, default_namespace: &str) -> ConfigMapId {
    match mapname.split_once('/') {
        Some((ns, name)) => ConfigMapId::new(substitute_name(ns, resource, owner), substitute_name(name, resource, owner)),
        None => ConfigMapId::new(default_namespace, substitute_name(mapname, resource, owner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> ResourceIdentity {
        ResourceIdentity {
            namespace: Some("ns".into()),
            api_version: "apps/v1".into(),
            name: Some("foo".into()),
            subkind: Some("Liberty".into()),
            kind: "Deployment".into(),
            ..Default::default()
        }
    }

    #[test]
    fn substitutes_identity_placeholders() {
        let id = config_map_id("kanav.actions.${kind}-${subkind}.${name}", &deployment(), None, "kanav");
        assert_eq!(id, ConfigMapId::new("kanav", "kanav.actions.deployment-liberty.foo"));
        let id = config_map_id("${namespace}/kanav.actions.${kind}", &deployment(), None, "kanav");
        assert_eq!(id, ConfigMapId::new("ns", "kanav.actions.deployment"));
    }

    #[test]
    fn owner_tokens_survive_segment_split() {
        let owner = OwnerRef { api_version: "app.k8s.io/v1beta1".into(), kind: "Application".into(), uid: "u1".into() };
        let id = config_map_id("kanav.actions.${owner.kind}.${kind}", &deployment(), Some(&owner), "kanav");
        assert_eq!(id.name, "kanav.actions.application.deployment");
        let id = config_map_id("m.${owner.uid}", &deployment(), Some(&owner), "kanav");
        assert_eq!(id.name, "m.u1");
    }

    #[test]
    fn unresolved_owner_tokens_are_reverted() {
        let id = config_map_id("kanav.actions.${owner.kind}", &deployment(), None, "kanav");
        assert_eq!(id.name, "kanav.actions.${owner.kind}");
        let mut plain = deployment();
        plain.subkind = None;
        let id = config_map_id("kanav.actions.${kind}-${subkind}", &plain, None, "kanav");
        assert_eq!(id.name, "kanav.actions.deployment-${subkind}");
    }
}
