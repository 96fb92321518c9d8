//! Write-behind cache for rendered diagrams.
//!
//! The renderer looks diagrams up by the hash of their source many times per
//! build and only ever wants a string back. [`DiagramCacheAdapter`] answers
//! from memory whenever it can and pushes new renders to the durable stores
//! on a small pool of background workers.

use crate::CacheManager;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use kosh_config::AdapterSettings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::instrument;

/// SSR kind the adapter stores under.
pub const DIAGRAM_KIND: &str = "d2";

type Job = (String, String);
type Queue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

#[derive(Debug)]
pub struct DiagramCacheAdapter {
    manager: Arc<CacheManager>,
    overlay: RwLock<HashMap<String, String>>,
    /// `None` once closed.
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    failed_writes: Arc<AtomicUsize>,
}

impl DiagramCacheAdapter {
    /// Start an adapter with the manager's configured worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(manager: Arc<CacheManager>) -> Self {
        let settings = manager.config().adapter.clone();
        Self::with_settings(manager, &settings)
    }

    pub fn with_settings(manager: Arc<CacheManager>, settings: &AdapterSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity());
        let queue: Queue = Arc::new(tokio::sync::Mutex::new(receiver));
        let failed_writes = Arc::new(AtomicUsize::new(0));
        let workers = (0..settings.worker_count())
            .map(|_| tokio::spawn(Self::worker(manager.clone(), queue.clone(), failed_writes.clone())))
            .collect();
        tracing::debug!(workers = settings.worker_count(), capacity = settings.queue_capacity(), "diagram cache started");
        Self {
            manager,
            overlay: RwLock::default(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            failed_writes,
        }
    }

    async fn worker(manager: Arc<CacheManager>, queue: Queue, failed_writes: Arc<AtomicUsize>) {
        loop {
            // Only one worker waits on the channel at a time; the rest wait on the lock.
            let job = queue.lock().await.recv().await;
            let Some((key, value)) = job else {
                break;
            };
            if let Err(err) = manager.store_ssr(DIAGRAM_KIND, &key, value.as_bytes()).await {
                tracing::warn!(%key, error = %err, "background diagram write failed");
                failed_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Rendered diagram for `key`, from memory or the durable stores.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.overlay.read().unwrap_or_else(|p| p.into_inner()).get(key) {
            return Ok(Some(value.clone()));
        }
        let Some(artifact) = self.manager.ssr_artifact(DIAGRAM_KIND, key).await? else {
            return Ok(None);
        };
        let Some(bytes) = self.manager.ssr_content(&artifact).await? else {
            return Ok(None);
        };
        let value = String::from_utf8(bytes).or_raise(|| ErrorKind::InvalidData("diagram"))?;
        self.overlay.write().unwrap_or_else(|p| p.into_inner()).insert(key.to_string(), value.clone());
        Ok(Some(value))
    }

    /// Remember a rendered diagram and queue it for durable storage.
    ///
    /// When the queue is full the write happens inline instead, so a slow
    /// disk slows the renderer down rather than losing diagrams.
    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        let Some(sender) = self.sender.lock().unwrap_or_else(|p| p.into_inner()).clone() else {
            exn::bail!(ErrorKind::Closed);
        };
        self.overlay.write().unwrap_or_else(|p| p.into_inner()).insert(key.to_string(), value.clone());
        match sender.try_send((key.to_string(), value)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full((key, value))) => {
                tracing::debug!(%key, "diagram queue full, writing inline");
                self.manager.store_ssr(DIAGRAM_KIND, &key, value.as_bytes()).await?;
                Ok(())
            },
            Err(TrySendError::Closed(_)) => exn::bail!(ErrorKind::Closed),
        }
    }

    /// Stop accepting writes, drain the queue, then write out everything in
    /// memory once more.
    ///
    /// Closing twice is a no-op.
    #[instrument(skip(self), fields(entries = self.len()))]
    pub async fn close(&self) -> Result<()> {
        let Some(sender) = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return Ok(());
        };
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        let mut first_error = None;
        for worker in workers {
            if let Err(err) = worker.await.or_raise(|| ErrorKind::Task) {
                first_error.get_or_insert(err);
            }
        }

        for (key, value) in self.snapshot() {
            if let Err(err) = self.manager.store_ssr(DIAGRAM_KIND, &key, value.as_bytes()).await {
                tracing::warn!(%key, error = %err, "diagram flush failed");
                first_error.get_or_insert(err);
            }
        }
        let failed = self.failed_writes.load(Ordering::Relaxed);
        if failed > 0 {
            tracing::info!(failed, "background writes failed before the final flush");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copy of everything currently held in memory.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.overlay.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.overlay.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }
}
