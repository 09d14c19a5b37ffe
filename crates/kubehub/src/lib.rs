//! kanav kubehub: cluster access seam, kube-rs wiring and watch streams.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client, Resource,
};
use kanav_core::ApiVersion;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod kam;
mod memory;
mod selector;

pub use kam::{KindActionMapping, KindActionMappingSpec, Mapping, OwnerSelector};
pub use memory::MemoryCluster;
pub use selector::LabelSelector;

/// What a watch stream reports. Caches only care that something changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSignal {
    /// The watch (re)listed its objects; any cached view is now suspect.
    Restarted,
    /// An object was added, modified or deleted.
    Changed,
}

/// Reads the engine needs from a cluster. Implemented by [`KubeReader`] and [`MemoryCluster`].
#[async_trait::async_trait]
pub trait ClusterReader: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn list_kind_action_mappings(&self) -> Result<Vec<KindActionMapping>>;

    async fn get_object(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Result<Option<Json>>;

    /// List objects of a kind matching `selector`, in one namespace or cluster-wide.
    async fn list_objects(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Json>>;

    fn watch_config_maps(&self) -> BoxStream<'static, Result<WatchSignal>>;

    fn watch_kind_action_mappings(&self) -> BoxStream<'static, Result<WatchSignal>>;
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client, created on first use from the ambient kubeconfig / service account.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await })
        .await
        .context("creating kube client")?;
    Ok(client.clone())
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn signal_stream<K>(api: Api<K>) -> BoxStream<'static, Result<WatchSignal>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default())
        .map_ok(|ev| match ev {
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                WatchSignal::Restarted
            }
            Event::Applied(_) | Event::Deleted(_) => WatchSignal::Changed,
        })
        .map_err(anyhow::Error::from)
        .boxed()
}

/// [`ClusterReader`] over a live API server.
pub struct KubeReader {
    client: Client,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeReader {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    async fn find_api_resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool)> {
        let key = format!("{}/{}", kanav_core::normalize_api_version(api_version), kind);
        let cached = self.resources.lock().map_err(|_| anyhow!("resource cache poisoned"))?.get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let av = ApiVersion::parse(api_version).ok_or_else(|| anyhow!("invalid apiVersion: {}", api_version))?;
        let gvk = GroupVersionKind::gvk(&av.group, &av.version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("discovering {}", key))?;
        let found = (ar, matches!(caps.scope, Scope::Namespaced));
        self.resources.lock().map_err(|_| anyhow!("resource cache poisoned"))?.insert(key, found.clone());
        Ok(found)
    }

    async fn dynamic_api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(api_version, kind).await?;
        Ok(match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait::async_trait]
impl ClusterReader for KubeReader {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        metrics::counter!("cluster_reads_total", 1u64, "kind" => "configmap");
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("reading config map {}/{}", namespace, name))
    }

    async fn list_kind_action_mappings(&self) -> Result<Vec<KindActionMapping>> {
        metrics::counter!("cluster_reads_total", 1u64, "kind" => "kindactionmapping");
        let api: Api<KindActionMapping> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing KindActionMappings")?;
        info!(count = list.items.len(), "listed KindActionMappings");
        Ok(list.items)
    }

    async fn get_object(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Result<Option<Json>> {
        metrics::counter!("cluster_reads_total", 1u64, "kind" => "object");
        let api = self.dynamic_api(api_version, kind, Some(namespace)).await?;
        match api.get_opt(name).await.with_context(|| format!("reading {} {}/{}", kind, namespace, name))? {
            Some(obj) => {
                let mut v = serde_json::to_value(&obj).context("serializing DynamicObject")?;
                strip_managed_fields(&mut v);
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn list_objects(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Json>> {
        metrics::counter!("cluster_reads_total", 1u64, "kind" => "list");
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_query());
        }
        let list = api.list(&lp).await.with_context(|| format!("listing {} ({})", kind, selector.to_query()))?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let mut v = serde_json::to_value(&obj).context("serializing DynamicObject")?;
            strip_managed_fields(&mut v);
            out.push(v);
        }
        Ok(out)
    }

    fn watch_config_maps(&self) -> BoxStream<'static, Result<WatchSignal>> {
        signal_stream(Api::<ConfigMap>::all(self.client.clone()))
    }

    fn watch_kind_action_mappings(&self) -> BoxStream<'static, Result<WatchSignal>> {
        signal_stream(Api::<KindActionMapping>::all(self.client.clone()))
    }
}
