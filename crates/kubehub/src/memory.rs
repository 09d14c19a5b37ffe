//! In-memory cluster: serves reads from a set of documents and emits watch signals on change.
//! Backs the CLI's offline mode and the test suites.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{ClusterReader, KindActionMapping, LabelSelector, WatchSignal};

const CONFIG_MAP: &str = "ConfigMap";
const KIND_ACTION_MAPPING: &str = "KindActionMapping";

#[derive(Debug, Clone)]
enum MemoryEvent {
    Signal(String, WatchSignal),
    Fail,
}

pub struct MemoryCluster {
    objects: RwLock<Vec<Json>>,
    events: broadcast::Sender<MemoryEvent>,
    config_map_reads: AtomicUsize,
    kam_lists: AtomicUsize,
    object_reads: AtomicUsize,
}

fn str_at<'a>(obj: &'a Json, pointer: &str) -> &'a str {
    obj.pointer(pointer).and_then(|v| v.as_str()).unwrap_or("")
}

fn same_object(a: &Json, b: &Json) -> bool {
    kanav_core::normalize_api_version(str_at(a, "/apiVersion")) == kanav_core::normalize_api_version(str_at(b, "/apiVersion"))
        && str_at(a, "/kind") == str_at(b, "/kind")
        && str_at(a, "/metadata/namespace") == str_at(b, "/metadata/namespace")
        && str_at(a, "/metadata/name") == str_at(b, "/metadata/name")
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: RwLock::new(Vec::new()),
            events,
            config_map_reads: AtomicUsize::new(0),
            kam_lists: AtomicUsize::new(0),
            object_reads: AtomicUsize::new(0),
        }
    }

    pub fn from_documents(docs: impl IntoIterator<Item = Json>) -> Self {
        let me = Self::new();
        for d in docs { me.apply(d); }
        me
    }

    /// Parse multi-document YAML (or JSON). `List` documents are expanded into their items.
    pub fn parse_documents(text: &str) -> Result<Vec<Json>> {
        let mut out = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let v = Json::deserialize(doc).context("parsing YAML document")?;
            match v {
                Json::Null => {}
                Json::Object(ref m) if m.get("kind").and_then(|k| k.as_str()) == Some("List") => {
                    if let Some(items) = m.get("items").and_then(|i| i.as_array()) {
                        out.extend(items.iter().cloned());
                    }
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    /// Load every `.yaml`, `.yml` and `.json` file in a directory.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let me = Self::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")))
            .collect();
        paths.sort();
        for p in paths {
            let text = std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
            for doc in Self::parse_documents(&text).with_context(|| format!("parsing {}", p.display()))? {
                me.apply(doc);
            }
        }
        Ok(me)
    }

    /// Create or replace an object and notify watchers of its kind.
    pub fn apply(&self, obj: Json) {
        let kind = str_at(&obj, "/kind").to_string();
        {
            let mut objects = match self.objects.write() { Ok(g) => g, Err(p) => p.into_inner() };
            match objects.iter().position(|o| same_object(o, &obj)) {
                Some(idx) => objects[idx] = obj,
                None => objects.push(obj),
            }
        }
        debug!(kind = %kind, "memory cluster: applied");
        let _ = self.events.send(MemoryEvent::Signal(kind, WatchSignal::Changed));
    }

    pub fn delete(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        let probe = serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "namespace": namespace.unwrap_or(""), "name": name },
        });
        let removed = {
            let mut objects = match self.objects.write() { Ok(g) => g, Err(p) => p.into_inner() };
            let before = objects.len();
            objects.retain(|o| !same_object(o, &probe));
            objects.len() != before
        };
        if removed {
            let _ = self.events.send(MemoryEvent::Signal(kind.to_string(), WatchSignal::Changed));
        }
        removed
    }

    /// Make every open watch stream yield an error, as a dropped connection would.
    pub fn interrupt_watches(&self) {
        let _ = self.events.send(MemoryEvent::Fail);
    }

    pub fn config_map_reads(&self) -> usize { self.config_map_reads.load(Ordering::SeqCst) }
    pub fn kam_lists(&self) -> usize { self.kam_lists.load(Ordering::SeqCst) }
    pub fn object_reads(&self) -> usize { self.object_reads.load(Ordering::SeqCst) }

    fn snapshot(&self) -> Vec<Json> {
        match self.objects.read() { Ok(g) => g.clone(), Err(p) => p.into_inner().clone() }
    }

    fn find(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<Json> {
        let probe = serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "namespace": namespace, "name": name },
        });
        self.snapshot().into_iter().find(|o| same_object(o, &probe))
    }

    fn signals(&self, kind: &'static str) -> BoxStream<'static, Result<WatchSignal>> {
        let rx = self.events.subscribe();
        let first = futures::stream::once(async { Ok(WatchSignal::Restarted) });
        let rest = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(MemoryEvent::Signal(k, sig)) if k == kind => return Some((Ok(sig), rx)),
                    Ok(MemoryEvent::Signal(..)) => continue,
                    Ok(MemoryEvent::Fail) => return Some((Err(anyhow!("watch interrupted")), rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "memory watch lagged");
                        return Some((Ok(WatchSignal::Restarted), rx));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        first.chain(rest).boxed()
    }
}

#[async_trait::async_trait]
impl ClusterReader for MemoryCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.config_map_reads.fetch_add(1, Ordering::SeqCst);
        match self.find("v1", CONFIG_MAP, namespace, name) {
            Some(v) => Ok(Some(serde_json::from_value(v).context("decoding ConfigMap")?)),
            None => Ok(None),
        }
    }

    async fn list_kind_action_mappings(&self) -> Result<Vec<KindActionMapping>> {
        self.kam_lists.fetch_add(1, Ordering::SeqCst);
        let mut out = Vec::new();
        for v in self.snapshot().into_iter().filter(|o| str_at(o, "/kind") == KIND_ACTION_MAPPING) {
            match serde_json::from_value::<KindActionMapping>(v) {
                Ok(kam) => out.push(kam),
                Err(e) => warn!(error = %e, "skipping undecodable KindActionMapping"),
            }
        }
        Ok(out)
    }

    async fn get_object(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Result<Option<Json>> {
        self.object_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.find(api_version, kind, namespace, name))
    }

    async fn list_objects(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Json>> {
        self.object_reads.fetch_add(1, Ordering::SeqCst);
        let av = kanav_core::normalize_api_version(api_version);
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|o| kanav_core::normalize_api_version(str_at(o, "/apiVersion")) == av && str_at(o, "/kind") == kind)
            .filter(|o| namespace.map(|ns| str_at(o, "/metadata/namespace") == ns).unwrap_or(true))
            .filter(|o| selector.matches(o))
            .collect())
    }

    fn watch_config_maps(&self) -> BoxStream<'static, Result<WatchSignal>> {
        self.signals(CONFIG_MAP)
    }

    fn watch_kind_action_mappings(&self) -> BoxStream<'static, Result<WatchSignal>> {
        self.signals(KIND_ACTION_MAPPING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ns: &str, name: &str, app: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "namespace": ns, "name": name, "labels": { "app": app } }
        })
    }

    #[tokio::test]
    async fn lists_by_selector_and_namespace() {
        let mc = MemoryCluster::from_documents(vec![pod("ns", "p1", "foo"), pod("other", "p2", "foo"), pod("ns", "p3", "bar")]);
        let sel = LabelSelector::from_pairs([("app", "foo")]);
        assert_eq!(mc.list_objects("v1", "Pod", None, &sel).await.unwrap().len(), 2);
        assert_eq!(mc.list_objects("/v1", "Pod", Some("ns"), &sel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_replaces_and_delete_removes() {
        let mc = MemoryCluster::new();
        mc.apply(pod("ns", "p1", "foo"));
        mc.apply(pod("ns", "p1", "bar"));
        let got = mc.get_object("v1", "Pod", "ns", "p1").await.unwrap().expect("pod");
        assert_eq!(got.pointer("/metadata/labels/app").and_then(|v| v.as_str()), Some("bar"));
        assert!(mc.delete("v1", "Pod", Some("ns"), "p1"));
        assert!(mc.get_object("v1", "Pod", "ns", "p1").await.unwrap().is_none());
    }

    #[test]
    fn parses_multi_document_yaml_and_lists() {
        let text = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\nkind: List\nitems:\n- kind: Pod\n  metadata: {name: b}\n- kind: Pod\n  metadata: {name: c}\n";
        let docs = MemoryCluster::parse_documents(text).expect("docs");
        assert_eq!(docs.len(), 3);
    }

    #[tokio::test]
    async fn watch_starts_with_restart_then_reports_changes() {
        let mc = MemoryCluster::new();
        let mut s = mc.watch_config_maps();
        assert_eq!(s.next().await.unwrap().unwrap(), WatchSignal::Restarted);
        mc.apply(pod("ns", "p1", "foo"));
        mc.apply(serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "namespace": "ns", "name": "cm" } }));
        assert_eq!(s.next().await.unwrap().unwrap(), WatchSignal::Changed);
        mc.interrupt_watches();
        assert!(s.next().await.unwrap().is_err());
    }
}
