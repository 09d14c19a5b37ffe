//! kanav hierarchy: candidate config maps for a resource and their merge.
//!
//! Candidates run from most to least specific: instance (`<prefix>.<kind>[-<subkind>].<name>`,
//! read from the resource's namespace), subkind (`<prefix>.<kind>-<subkind>`) and kind
//! (`<prefix>.<kind>`). Status documents fall back to `<status-prefix>.unregistered` when none
//! of those exist. A map annotated `kanav.actions.on.conflict: replace` ends the merge.

#![forbid(unsafe_code)]

use kanav_core::{ConfigMapId, ResourceIdentity, Settings, CONFLICT_REPLACE, ON_CONFLICT_ANNOTATION};
use kanav_store::ConfigMapCache;
use k8s_openapi::api::core::v1::ConfigMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod document;

pub use document::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Actions,
    Status,
}

impl DocumentKind {
    pub fn prefix(self, settings: &Settings) -> &str {
        match self {
            DocumentKind::Actions => &settings.actions_prefix,
            DocumentKind::Status => &settings.status_prefix,
        }
    }
}

/// Fixed fallback chain for a resource, most specific first. Does not include the
/// unregistered status map.
pub fn candidates(resource: &ResourceIdentity, settings: &Settings, kind: DocumentKind) -> Vec<ConfigMapId> {
    let prefix = kind.prefix(settings);
    let kind_name = resource.kind.to_ascii_lowercase();
    let mut out = Vec::with_capacity(3);
    if let Some(name) = &resource.name {
        let ns = resource.namespace.as_deref().unwrap_or(&settings.namespace);
        out.push(ConfigMapId::new(ns, format!("{}.{}.{}", prefix, resource.kind_key(), name)));
    }
    if resource.subkind.is_some() {
        out.push(ConfigMapId::new(&settings.namespace, format!("{}.{}", prefix, resource.kind_key())));
    }
    out.push(ConfigMapId::new(&settings.namespace, format!("{}.{}", prefix, kind_name)));
    out
}

fn replaces(cm: &ConfigMap) -> bool {
    cm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ON_CONFLICT_ANNOTATION))
        .map(|v| v.trim().eq_ignore_ascii_case(CONFLICT_REPLACE))
        .unwrap_or(false)
}

/// Fetch each identity in order and fold it into `builder`. Missing maps are skipped.
pub async fn merge_with<B: MergeBuilder>(cache: &ConfigMapCache, ids: &[ConfigMapId], mut builder: B) -> MergedDocument {
    for id in ids {
        let Some(cm) = cache.get(id).await else {
            debug!(map = %id, "config map not found");
            continue;
        };
        let empty = Default::default();
        builder.merge(id, cm.data.as_ref().unwrap_or(&empty));
        counter!("hierarchy_maps_merged_total", 1u64);
        if replaces(&cm) {
            info!(map = %id, "replace annotation; stopping merge");
            break;
        }
    }
    builder.finish()
}

/// Merge an explicit identity list (for example one produced by the rule engine).
pub async fn merge_identities(cache: &ConfigMapCache, ids: &[ConfigMapId], kind: DocumentKind) -> MergedDocument {
    match kind {
        DocumentKind::Actions => merge_with(cache, ids, ActionsBuilder::new()).await,
        DocumentKind::Status => merge_with(cache, ids, StatusBuilder::new()).await,
    }
}

/// Action document from the fixed hierarchy.
pub async fn action_document(cache: &ConfigMapCache, resource: &ResourceIdentity, settings: &Settings) -> MergedDocument {
    let ids = candidates(resource, settings, DocumentKind::Actions);
    merge_identities(cache, &ids, DocumentKind::Actions).await
}

/// Status document from the fixed hierarchy, or the unregistered map when nothing matched.
pub async fn status_document(cache: &ConfigMapCache, resource: &ResourceIdentity, settings: &Settings) -> MergedDocument {
    let ids = candidates(resource, settings, DocumentKind::Status);
    let doc = merge_identities(cache, &ids, DocumentKind::Status).await;
    if !doc.sources.is_empty() {
        return doc;
    }
    let fallback = ConfigMapId::new(&settings.namespace, settings.unregistered_status_map());
    debug!(kind = %resource.kind, map = %fallback, "no status mapping; using unregistered");
    merge_identities(cache, &[fallback], DocumentKind::Status).await
}
