//! kanav rules: select config maps for a resource from KindActionMapping rules.
//!
//! Every mapping entry of every mapping resource is tested against the resource. Matches are
//! bucketed by `(precedence, slot, specificity)` and emitted most specific class first, then
//! highest precedence, then slot order.

#![forbid(unsafe_code)]

use anyhow::Result;
use kanav_core::{normalize_api_version, ApiVersion, ConfigMapId, OwnerRef, ResourceIdentity, Specificity, WILDCARD};
use kanav_kubehub::{
    kam::{MAX_PRECEDENCE, MIN_PRECEDENCE},
    KindActionMapping, Mapping,
};
use kanav_store::KamCache;
use tracing::{debug, warn};

mod placeholders;

pub use placeholders::config_map_id;

/// Same-precedence mapping resources that can contribute matches; the rest are dropped.
pub const SLOTS_PER_PRECEDENCE: usize = 10;
const LEVELS: usize = MAX_PRECEDENCE as usize;

#[derive(Debug, Clone)]
struct Candidate {
    mapname: String,
    owner: Option<OwnerRef>,
}

type Cell = [Vec<Candidate>; 4];

/// `cells[precedence - 1][slot][specificity]`.
struct Buckets {
    cells: Vec<Vec<Cell>>,
    used: [usize; LEVELS],
}

impl Buckets {
    fn new() -> Self {
        Self { cells: vec![vec![Cell::default(); SLOTS_PER_PRECEDENCE]; LEVELS], used: [0; LEVELS] }
    }

    /// Claim the next slot at a precedence, or `None` when the level is full.
    fn claim(&mut self, precedence: usize) -> Option<usize> {
        let level = precedence - 1;
        if self.used[level] >= SLOTS_PER_PRECEDENCE { return None; }
        self.used[level] += 1;
        Some(self.used[level] - 1)
    }

    fn put(&mut self, precedence: usize, slot: usize, class: Specificity, c: Candidate) {
        self.cells[precedence - 1][slot][class.index()].push(c);
    }

    fn drain_ordered(self) -> impl Iterator<Item = Candidate> {
        let mut out = Vec::new();
        let mut cells = self.cells;
        for class in Specificity::ORDER {
            for level in (0..LEVELS).rev() {
                for slot in cells[level].iter_mut() {
                    out.append(&mut slot[class.index()]);
                }
            }
        }
        out.into_iter()
    }
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn field_matches(rule: &str, actual: Option<&str>) -> bool {
    rule == WILDCARD || Some(rule) == actual
}

fn api_version_matches(rule: &str, resource: &str) -> Option<bool> {
    if normalize_api_version(rule) == normalize_api_version(resource) {
        return Some(true);
    }
    let rule_av = ApiVersion::parse(rule)?;
    let res_av = ApiVersion::parse(resource).unwrap_or(ApiVersion { group: String::new(), version: String::new() });
    Some(rule_av.matches(&res_av))
}

/// `Some(None)`: matched without an owner constraint. `Some(Some(o))`: matched through owner `o`.
fn owner_matches(entry: &Mapping, resource: &ResourceIdentity) -> Option<Option<OwnerRef>> {
    let Some(sel) = entry.owner.as_ref() else { return Some(None) };
    let kind = match present(&sel.kind) {
        None | Some(WILDCARD) => return Some(None),
        Some(k) => k,
    };
    resource
        .owners
        .iter()
        .find(|o| {
            o.kind == kind
                && present(&sel.api_version)
                    .map(|av| av == WILDCARD || normalize_api_version(av) == normalize_api_version(&o.api_version))
                    .unwrap_or(true)
                && present(&sel.uid).map(|uid| uid == WILDCARD || uid == o.uid).unwrap_or(true)
        })
        .map(|o| Some(o.clone()))
}

/// Test one mapping entry. Malformed entries are reported and never match.
fn evaluate(entry: &Mapping, resource: &ResourceIdentity) -> Option<(Specificity, Candidate)> {
    let Some(kind) = present(&entry.kind) else {
        warn!(?entry, "skipping mapping entry without kind");
        return None;
    };
    let Some(mapname) = present(&entry.mapname) else {
        warn!(?entry, "skipping mapping entry without mapname");
        return None;
    };
    if let Some(av) = present(&entry.api_version) {
        match api_version_matches(av, &resource.api_version) {
            Some(true) => {}
            Some(false) => return None,
            None => {
                warn!(api_version = av, "skipping mapping entry with unparseable apiVersion");
                return None;
            }
        }
    }
    let owner = owner_matches(entry, resource)?;

    let subkind = present(&entry.subkind);
    let name = present(&entry.name);
    let class = Specificity::classify(subkind.is_some(), name.is_some());
    let kind_ok = field_matches(kind, Some(&resource.kind));
    let subkind_ok = || subkind.map(|s| field_matches(s, resource.subkind.as_deref())).unwrap_or(true);
    let name_ok = || name.map(|n| field_matches(n, resource.name.as_deref())).unwrap_or(true);

    let matched = match (resource.specificity(), class) {
        (_, Specificity::K) => kind_ok,
        (res, rule) if res == rule => kind_ok && subkind_ok() && name_ok(),
        (Specificity::Ksn, Specificity::Ks) => kind_ok && subkind_ok(),
        _ => false,
    };
    matched.then(|| (class, Candidate { mapname: mapname.to_string(), owner }))
}

/// Match `resource` against the given mapping resources and return config-map identities in
/// precedence order. Duplicate identities keep their first position.
pub fn match_mappings(resource: &ResourceIdentity, kams: &[KindActionMapping], default_namespace: &str) -> Vec<ConfigMapId> {
    let mut buckets = Buckets::new();
    for kam in kams {
        let kam_name = kam.metadata.name.as_deref().unwrap_or("");
        let precedence = kam.spec.precedence();
        if !(MIN_PRECEDENCE..=MAX_PRECEDENCE).contains(&precedence) {
            warn!(kam = kam_name, precedence, "skipping KindActionMapping with out-of-range precedence");
            continue;
        }
        let precedence = precedence as usize;
        let hits: Vec<_> = kam.spec.mappings.iter().filter_map(|m| evaluate(m, resource)).collect();
        if hits.is_empty() { continue; }
        let Some(slot) = buckets.claim(precedence) else {
            warn!(kam = kam_name, precedence, "too many KindActionMappings at one precedence; dropping");
            metrics::counter!("kam_overflow_dropped_total", 1u64);
            continue;
        };
        debug!(kam = kam_name, precedence, slot, matches = hits.len(), "KindActionMapping matched");
        for (class, c) in hits {
            buckets.put(precedence, slot, class, c);
        }
    }

    let mut out: Vec<ConfigMapId> = Vec::new();
    for c in buckets.drain_ordered() {
        let id = config_map_id(&c.mapname, resource, c.owner.as_ref(), default_namespace);
        if !out.contains(&id) { out.push(id); }
    }
    metrics::counter!("kam_matches_total", out.len() as u64);
    out
}

/// Pull the mapping resources from the cache and match them. A list failure aborts this call.
pub async fn config_maps_for(cache: &KamCache, resource: &ResourceIdentity, default_namespace: &str) -> Result<Vec<ConfigMapId>> {
    let kams = cache.list().await?;
    let ids = match_mappings(resource, &kams, default_namespace);
    debug!(kind = %resource.kind, name = ?resource.name, count = ids.len(), "config maps selected");
    Ok(ids)
}
