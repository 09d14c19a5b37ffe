use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use futures::StreamExt;
use kanav_kubehub::{ClusterReader, KindActionMapping};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct KamSnapshot {
    generation: u64,
    items: Arc<Vec<KindActionMapping>>,
}

/// Full list of KindActionMappings, valid while the modification counter is unchanged.
pub struct KamCache {
    reader: Arc<dyn ClusterReader>,
    generation: Arc<AtomicU64>,
    live: Arc<AtomicBool>,
    snap: ArcSwapOption<KamSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl KamCache {
    /// No watch: every lookup lists from the cluster.
    pub fn uncached(reader: Arc<dyn ClusterReader>) -> Self {
        Self {
            reader,
            generation: Arc::new(AtomicU64::new(0)),
            live: Arc::new(AtomicBool::new(false)),
            snap: ArcSwapOption::empty(),
            task: None,
        }
    }

    pub fn spawn(reader: Arc<dyn ClusterReader>, backoff: Duration) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let live = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(watch_loop(Arc::clone(&reader), Arc::clone(&generation), Arc::clone(&live), backoff));
        Self { reader, generation, live, snap: ArcSwapOption::empty(), task: Some(task) }
    }

    pub fn generation(&self) -> u64 { self.generation.load(Ordering::SeqCst) }

    pub fn is_live(&self) -> bool { self.live.load(Ordering::SeqCst) }

    /// Current mapping resources. A list-call failure is returned to the caller.
    pub async fn list(&self) -> Result<Arc<Vec<KindActionMapping>>> {
        // Captured before the read so a change racing the list invalidates what we store.
        let generation = self.generation();
        if self.is_live() {
            if let Some(snap) = self.snap.load_full() {
                if snap.generation == generation {
                    counter!("kam_cache_hits_total", 1u64);
                    return Ok(Arc::clone(&snap.items));
                }
            }
        }
        counter!("kam_cache_misses_total", 1u64);
        let items = Arc::new(self.reader.list_kind_action_mappings().await?);
        self.snap.store(Some(Arc::new(KamSnapshot { generation, items: Arc::clone(&items) })));
        Ok(items)
    }
}

impl Drop for KamCache {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() { task.abort(); }
    }
}

async fn watch_loop(reader: Arc<dyn ClusterReader>, generation: Arc<AtomicU64>, live: Arc<AtomicBool>, backoff: Duration) {
    loop {
        let mut stream = reader.watch_kind_action_mappings();
        info!("KindActionMapping watch started");
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(signal) => {
                    let g = generation.fetch_add(1, Ordering::SeqCst) + 1;
                    live.store(true, Ordering::SeqCst);
                    debug!(?signal, generation = g, "KindActionMapping generation bumped");
                }
                Err(e) => {
                    warn!(error = %e, "KindActionMapping watch failed");
                    break;
                }
            }
        }
        live.store(false, Ordering::SeqCst);
        generation.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(backoff).await;
    }
}
