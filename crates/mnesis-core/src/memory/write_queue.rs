//! Write Queue
//!
//! Single-writer serialization for every store mutation. Operations are
//! submitted as closures and executed by one dedicated worker task, strictly
//! one at a time, in FIFO order. A failing operation propagates its error to
//! its own caller only; the worker survives.
//!
//! The queue is bounded (capacity 500); enqueueing past capacity awaits a
//! free slot instead of failing. Started once at process init and shared by
//! every writer (memory core, candidate store, job queue, graph layer).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::storage::{Store, StoreError};

/// Bounded queue capacity.
const QUEUE_CAPACITY: usize = 500;

type WriteJob = Box<dyn FnOnce(&Store) + Send + 'static>;

/// Handle to the single write worker. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteJob>,
}

impl WriteQueue {
    /// Spawn the worker task and return the submission handle.
    pub fn start(store: Arc<Store>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            tracing::debug!("Write worker started");
            while let Some(job) = rx.recv().await {
                job(&store);
            }
            tracing::debug!("Write worker stopped");
        });
        Self { tx }
    }

    /// Submit a write operation and await its result.
    ///
    /// The closure runs on the worker with exclusive access to the write
    /// path. Errors (and panics, surfaced as a closed reply channel) reach
    /// only this caller.
    pub async fn enqueue<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |store| {
            let _ = reply_tx.send(op(store));
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| StoreError::Init("Write worker is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::Init("Write operation dropped without a result".into()))?
    }
}

// ============================================================================
// TESTS
// ============================================================================
