//! kanav store: watch-backed caches for config maps and KindActionMappings.
//!
//! Both caches are replaced wholesale on change (an `ArcSwap` store) instead of being edited in
//! place, so readers never take a lock. A change event throws the config-map cache away and
//! bumps the KAM generation counter; the next read refills from the cluster.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kanav_core::ConfigMapId;
use kanav_kubehub::{ClusterReader, WatchSignal};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

mod kam;

pub use kam::KamCache;

/// Cached lookup result. `Absent` records that the map was looked up and does not exist.
#[derive(Debug, Clone)]
enum Slot {
    Present(Arc<ConfigMap>),
    Absent,
}

type CmMap = FxHashMap<ConfigMapId, Slot>;

/// Config maps by `(namespace, name)`.
///
/// `None` in the swap cell means no cache is established (first use or the watch is down);
/// lookups then go straight to the cluster and wake the watch task.
pub struct ConfigMapCache {
    reader: Arc<dyn ClusterReader>,
    map: Arc<ArcSwapOption<CmMap>>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl ConfigMapCache {
    /// Cache without a watch: every lookup reads through. Useful for one-shot tools.
    pub fn uncached(reader: Arc<dyn ClusterReader>) -> Self {
        Self { reader, map: Arc::new(ArcSwapOption::empty()), wake: Arc::new(Notify::new()), task: None }
    }

    /// Start the background watch that establishes and invalidates the cache.
    pub fn spawn(reader: Arc<dyn ClusterReader>, backoff: Duration) -> Self {
        let map = Arc::new(ArcSwapOption::empty());
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(watch_loop(Arc::clone(&reader), Arc::clone(&map), Arc::clone(&wake), backoff));
        Self { reader, map, wake, task: Some(task) }
    }

    pub fn is_established(&self) -> bool { self.map.load().is_some() }

    /// Fetch a config map. Cluster errors degrade to `None`.
    pub async fn get(&self, id: &ConfigMapId) -> Option<Arc<ConfigMap>> {
        let Some(current) = self.map.load_full() else {
            counter!("cm_cache_bypass_total", 1u64);
            self.wake.notify_one();
            return self.read(id).await.and_then(|slot| match slot {
                Slot::Present(cm) => Some(cm),
                Slot::Absent => None,
            });
        };
        if let Some(slot) = current.get(id) {
            counter!("cm_cache_hits_total", 1u64);
            return match slot {
                Slot::Present(cm) => Some(Arc::clone(cm)),
                Slot::Absent => None,
            };
        }
        counter!("cm_cache_misses_total", 1u64);
        let slot = self.read(id).await?;
        // Only fill the generation we looked at; an invalidation in between wins.
        self.map.rcu(|cur| match cur {
            Some(m) if Arc::ptr_eq(m, &current) => {
                let mut next = (**m).clone();
                next.insert(id.clone(), slot.clone());
                Some(Arc::new(next))
            }
            other => other.clone(),
        });
        match slot {
            Slot::Present(cm) => Some(cm),
            Slot::Absent => None,
        }
    }

    /// `None` when the read failed; failures are not cached.
    async fn read(&self, id: &ConfigMapId) -> Option<Slot> {
        match self.reader.get_config_map(&id.namespace, &id.name).await {
            Ok(Some(cm)) => Some(Slot::Present(Arc::new(cm))),
            Ok(None) => Some(Slot::Absent),
            Err(e) => {
                warn!(map = %id, error = %e, "config map read failed");
                None
            }
        }
    }
}

impl Drop for ConfigMapCache {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() { task.abort(); }
    }
}

async fn watch_loop(reader: Arc<dyn ClusterReader>, map: Arc<ArcSwapOption<CmMap>>, wake: Arc<Notify>, backoff: Duration) {
    loop {
        let mut stream = reader.watch_config_maps();
        info!("config map watch started");
        loop {
            match stream.next().await {
                Some(Ok(WatchSignal::Restarted)) => {
                    map.store(Some(Arc::new(CmMap::default())));
                    debug!("config map cache established");
                }
                Some(Ok(WatchSignal::Changed)) => {
                    map.store(Some(Arc::new(CmMap::default())));
                    counter!("cm_cache_invalidations_total", 1u64);
                    debug!("config map cache invalidated");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "config map watch failed");
                    break;
                }
                None => {
                    warn!("config map watch stream ended");
                    break;
                }
            }
        }
        map.store(None);
        tokio::select! {
            _ = wake.notified() => debug!("config map watch woken by a reader"),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
