//! # Object Store
//!
//! A generic CRUD abstraction over the remote backend (spec.md §4.1),
//! grounded in the same `RemoteStorage` shape used by `pageserver`'s
//! remote storage layer. `LocalFsStore` is the sole concrete backend
//! shipped here: a directory on disk, standing in for whatever bucket or
//! bulk-storage endpoint a deployment actually points at.
//!
//! On top of the trait sits [`VolumeQueue`]: a single-consumer FIFO that
//! serializes every upload and delete so remote operations observe the
//! catalog's intended ordering (spec.md §4.1, §5), retrying transient
//! failures with the same exponential backoff policy `icp-cli`'s snapshot
//! transfer path uses.

mod local_fs;

pub use local_fs::LocalFsStore;

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// A single remote object's metadata as seen by a `list` call.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
}

/// The CRUD surface a backend must provide. Implementations are expected to
/// be cheaply cloneable handles (an `Arc` around a client, a base path, etc).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<ObjectMeta>>;
}

/// A hook invoked synchronously, on the queue's worker, just before an
/// upload begins. This is how the catalog marks a volume `Uploading` at the
/// same logical moment the bytes start moving (spec.md §4.1), without the
/// catalog ever being touched from a second thread.
pub type FlushHook = Arc<dyn Fn(&QueueOp) + Send + Sync>;

/// One operation the queue will perform, in submission order.
#[derive(Debug, Clone)]
pub enum QueueOp {
    Upload { name: String },
    Delete { name: String },
}

enum Job {
    Upload { name: String, data: Vec<u8>, done: oneshot::Sender<Result<()>> },
    Delete { name: String, done: oneshot::Sender<Result<()>> },
    Barrier { done: oneshot::Sender<()> },
}

/// Serializes uploads and deletes against one backend, retrying transient
/// failures and invoking an optional flush hook right before each attempt.
pub struct VolumeQueue {
    tx: mpsc::UnboundedSender<Job>,
    store: Arc<dyn ObjectStore>,
    _worker: tokio::task::JoinHandle<()>,
}

impl VolumeQueue {
    pub fn spawn(store: Arc<dyn ObjectStore>, flush_hook: Option<FlushHook>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_store = store.clone();

        let worker = tokio::spawn(async move {
            let store = worker_store;
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Upload { name, data, done } => {
                        if let Some(hook) = &flush_hook {
                            hook(&QueueOp::Upload { name: name.clone() });
                        }
                        let result = upload_with_retry(store.as_ref(), &name, data).await;
                        if let Err(e) = &result {
                            warn!(volume = %name, error = %e, "upload failed permanently");
                        } else {
                            info!(volume = %name, "upload complete");
                        }
                        let _ = done.send(result);
                    }
                    Job::Delete { name, done } => {
                        if let Some(hook) = &flush_hook {
                            hook(&QueueOp::Delete { name: name.clone() });
                        }
                        let result = delete_with_retry(store.as_ref(), &name).await;
                        let _ = done.send(result);
                    }
                    Job::Barrier { done } => {
                        let _ = done.send(());
                    }
                }
            }
        });

        VolumeQueue { tx, store, _worker: worker }
    }

    /// Direct read access to the backing store, for operations (like compact)
    /// that need to fetch existing volume bytes rather than enqueue a write.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Enqueues an upload, returning once it (or its final retry failure) completes.
    pub async fn upload(&self, name: String, data: Vec<u8>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Job::Upload { name, data, done: done_tx })
            .map_err(|_| anyhow::anyhow!("volume queue worker has shut down"))?;
        done_rx.await.map_err(|_| anyhow::anyhow!("volume queue worker dropped the job"))?
    }

    pub async fn delete(&self, name: String) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Job::Delete { name, done: done_tx })
            .map_err(|_| anyhow::anyhow!("volume queue worker has shut down"))?;
        done_rx.await.map_err(|_| anyhow::anyhow!("volume queue worker dropped the job"))?
    }

    /// Blocks until every job submitted before this call has finished,
    /// by enqueuing a barrier behind them on the same FIFO (spec.md §5).
    pub async fn wait_for_empty(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Job::Barrier { done: done_tx })
            .map_err(|_| anyhow::anyhow!("volume queue worker has shut down"))?;
        done_rx.await.map_err(|_| anyhow::anyhow!("volume queue worker dropped the barrier").into())
    }
}

fn backoff_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: Some(Duration::from_secs(10 * 60)),
        ..ExponentialBackoff::default()
    }
}

async fn upload_with_retry(store: &dyn ObjectStore, name: &str, data: Vec<u8>) -> Result<()> {
    retry(backoff_policy(), || async {
        store.put(name, data.clone()).await.map_err(classify)
    })
    .await
}

async fn delete_with_retry(store: &dyn ObjectStore, name: &str) -> Result<()> {
    retry(backoff_policy(), || async { store.delete(name).await.map_err(classify) }).await
}

/// Maps a [`CoreError`] to a `backoff` transient/permanent classification:
/// only `BackendTransient` is retried.
fn classify(err: CoreError) -> backoff::Error<CoreError> {
    match err {
        CoreError::BackendTransient(_) => backoff::Error::transient(err),
        other => backoff::Error::permanent(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyStore {
        attempts: AtomicUsize,
        fail_until: usize,
        data: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_until {
                return Err(CoreError::BackendTransient("simulated hiccup".into()));
            }
            self.data.lock().unwrap().insert(name.to_string(), data);
            Ok(())
        }
        async fn get(&self, name: &str) -> Result<Vec<u8>> {
            self.data
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("not found").into())
        }
        async fn delete(&self, name: &str) -> Result<()> {
            self.data.lock().unwrap().remove(name);
            Ok(())
        }
        async fn list(&self) -> Result<Vec<ObjectMeta>> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| ObjectMeta { name: k.clone(), size: v.len() as u64 })
                .collect())
        }
    }

    #[tokio::test]
    async fn upload_retries_transient_failures() {
        let store = Arc::new(FlakyStore {
            attempts: AtomicUsize::new(0),
            fail_until: 2,
            data: Mutex::new(std::collections::HashMap::new()),
        });
        let queue = VolumeQueue::spawn(store.clone(), None);
        queue.upload("v1".into(), b"payload".to_vec()).await.unwrap();
        assert_eq!(store.get("v1").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn flush_hook_runs_before_upload() {
        let store = Arc::new(FlakyStore {
            attempts: AtomicUsize::new(0),
            fail_until: 0,
            data: Mutex::new(std::collections::HashMap::new()),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let hook: FlushHook = Arc::new(move |op| {
            if let QueueOp::Upload { name } = op {
                seen2.lock().unwrap().push(name.clone());
            }
        });
        let queue = VolumeQueue::spawn(store, Some(hook));
        queue.upload("v1".into(), b"x".to_vec()).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &["v1".to_string()]);
    }

    #[tokio::test]
    async fn wait_for_empty_respects_fifo_order() {
        let store = Arc::new(FlakyStore {
            attempts: AtomicUsize::new(0),
            fail_until: 0,
            data: Mutex::new(std::collections::HashMap::new()),
        });
        let queue = VolumeQueue::spawn(store.clone(), None);
        queue.upload("a".into(), b"1".to_vec()).await.unwrap();
        queue.upload("b".into(), b"2".to_vec()).await.unwrap();
        queue.wait_for_empty().await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
