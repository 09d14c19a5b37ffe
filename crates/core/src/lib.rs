//! kanav core types: resource identities, config-map identities and specificity classes.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;
mod settings;

pub use error::{ResolveError, ValidationError};
pub use settings::Settings;

/// Annotation carrying the subkind refinement of a resource's kind.
pub const SUBKIND_ANNOTATION: &str = "kanav.subkind";
/// Annotation on a config map that controls how it merges with less specific maps.
pub const ON_CONFLICT_ANNOTATION: &str = "kanav.actions.on.conflict";
/// Value of [`ON_CONFLICT_ANNOTATION`] that stops the merge after the annotated map.
pub const CONFLICT_REPLACE: &str = "replace";
/// Literal wildcard accepted in mapping rules.
pub const WILDCARD: &str = "*";

pub mod prelude {
    pub use super::{ApiVersion, ConfigMapId, OwnerRef, ResourceIdentity, ResolveError, Settings, Specificity, ValidationError};
}

/// Owner reference of a resource, as far as rule matching is concerned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub uid: String,
}

/// Which of kind, subkind and name are known. Ordered from most to least specific.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Specificity {
    /// kind + subkind + name
    Ksn,
    /// kind + subkind
    Ks,
    /// kind + name
    Kn,
    /// kind only
    K,
}

impl Specificity {
    /// Emission order of matched rules: most specific first.
    pub const ORDER: [Specificity; 4] = [Specificity::Ksn, Specificity::Ks, Specificity::Kn, Specificity::K];

    pub fn classify(subkind: bool, name: bool) -> Self {
        match (subkind, name) {
            (true, true) => Specificity::Ksn,
            (true, false) => Specificity::Ks,
            (false, true) => Specificity::Kn,
            (false, false) => Specificity::K,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Specificity::Ksn => 0,
            Specificity::Ks => 1,
            Specificity::Kn => 2,
            Specificity::K => 3,
        }
    }

    pub fn has_subkind(self) -> bool { matches!(self, Specificity::Ksn | Specificity::Ks) }
    pub fn has_name(self) -> bool { matches!(self, Specificity::Ksn | Specificity::Kn) }
}

/// Strip the leading `/` that group-less versions sometimes carry (`/v1` -> `v1`).
pub fn normalize_api_version(raw: &str) -> &str {
    raw.strip_prefix('/').unwrap_or(raw)
}

/// Parsed `group/version` pair. Core-group versions have an empty group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub group: String,
    pub version: String,
}

impl ApiVersion {
    /// Parse a (normalized) apiVersion. A lone `*` means any group and any version.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = normalize_api_version(raw.trim());
        if s == WILDCARD {
            return Some(Self { group: WILDCARD.to_string(), version: WILDCARD.to_string() });
        }
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [version] if !version.is_empty() => Some(Self { group: String::new(), version: (*version).to_string() }),
            [group, version] if !group.is_empty() && !version.is_empty() => {
                Some(Self { group: (*group).to_string(), version: (*version).to_string() })
            }
            _ => None,
        }
    }

    /// Exact match, or per-part match where either side's part is `*`.
    pub fn matches(&self, other: &ApiVersion) -> bool {
        fn part(a: &str, b: &str) -> bool { a == b || a == WILDCARD || b == WILDCARD }
        part(&self.group, &other.group) && part(&self.version, &other.version)
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.version) } else { write!(f, "{}/{}", self.group, self.version) }
    }
}

/// The identity of a resource as seen by the rule engine and hierarchy processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceIdentity {
    pub namespace: Option<String>,
    pub owners: SmallVec<[OwnerRef; 2]>,
    pub api_version: String,
    pub name: Option<String>,
    pub subkind: Option<String>,
    pub kind: String,
}

impl ResourceIdentity {
    /// Derive an identity from a resource document. Returns `None` when `kind` is missing.
    pub fn from_object(obj: &serde_json::Value) -> Option<Self> {
        let kind = obj.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?.to_string();
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let meta = obj.get("metadata");
        let str_at = |key: &str| {
            meta.and_then(|m| m.get(key)).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string())
        };
        let subkind = meta
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(SUBKIND_ANNOTATION))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let mut owners = SmallVec::new();
        if let Some(refs) = meta.and_then(|m| m.get("ownerReferences")).and_then(|v| v.as_array()) {
            for r in refs {
                let field = |key: &str| r.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
                owners.push(OwnerRef { api_version: field("apiVersion"), kind: field("kind"), uid: field("uid") });
            }
        }
        Some(Self { namespace: str_at("namespace"), owners, api_version, name: str_at("name"), subkind, kind })
    }

    pub fn specificity(&self) -> Specificity {
        Specificity::classify(self.subkind.is_some(), self.name.is_some())
    }

    /// `kind` or `kind-subkind`, lower-cased, as used in config-map names.
    pub fn kind_key(&self) -> String {
        match &self.subkind {
            Some(sub) => format!("{}-{}", self.kind.to_ascii_lowercase(), sub.to_ascii_lowercase()),
            None => self.kind.to_ascii_lowercase(),
        }
    }
}

/// A config map addressed by namespace and name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigMapId {
    pub namespace: String,
    pub name: String,
}

impl ConfigMapId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ConfigMapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
