use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Process-wide settings, read once at start from `KANAV_*` variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Namespace holding kind-level config maps, global maps and the unregistered status map.
    pub namespace: String,
    pub actions_prefix: String,
    pub status_prefix: String,
    /// Navigation base URL, exposed as `${builtin.nav-url}`.
    pub nav_url: String,
    pub command_timeout: Duration,
    pub kubectl: String,
    pub snippet_max_ops: u64,
    pub watch_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "kanav".to_string(),
            actions_prefix: "kanav.actions".to_string(),
            status_prefix: "kanav.status-mapping".to_string(),
            nav_url: String::new(),
            command_timeout: Duration::from_secs(30),
            kubectl: "kubectl".to_string(),
            snippet_max_ops: 100_000,
            watch_backoff: Duration::from_secs(5),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Rhai reads a zero operation limit as "unlimited", so zero falls back to `default`.
fn operation_budget(raw: Option<u64>, default: u64) -> u64 {
    match raw {
        Some(0) => {
            warn!(key = "KANAV_SNIPPET_MAX_OPS", default, "zero snippet budget would be unlimited; using the default");
            default
        }
        Some(n) => n,
        None => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            namespace: std::env::var("KANAV_NAMESPACE").unwrap_or(d.namespace),
            actions_prefix: std::env::var("KANAV_ACTIONS_PREFIX").unwrap_or(d.actions_prefix),
            status_prefix: std::env::var("KANAV_STATUS_PREFIX").unwrap_or(d.status_prefix),
            nav_url: std::env::var("KANAV_NAV_URL").unwrap_or(d.nav_url),
            command_timeout: env_parsed::<u64>("KANAV_CMD_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.command_timeout),
            kubectl: std::env::var("KANAV_KUBECTL").unwrap_or(d.kubectl),
            snippet_max_ops: operation_budget(env_parsed("KANAV_SNIPPET_MAX_OPS"), d.snippet_max_ops),
            watch_backoff: env_parsed::<u64>("KANAV_WATCH_BACKOFF_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff),
        }
    }

    /// Name of the status map consulted when nothing more specific exists.
    pub fn unregistered_status_map(&self) -> String {
        format!("{}.unregistered", self.status_prefix)
    }

    /// Static values served by the `builtin` resolver.
    pub fn builtins(&self) -> Vec<(&'static str, String)> {
        vec![
            ("nav-url", self.nav_url.clone()),
            ("namespace", self.namespace.clone()),
        ]
    }
}
