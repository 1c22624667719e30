#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::EmbeddingProvider;
use crate::{RagError, Result};

const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct EmbeddingJob {
    text: String,
    model: String,
    reply: oneshot::Sender<Result<Option<Vec<f32>>>>,
}

struct Worker {
    sender: mpsc::Sender<EmbeddingJob>,
    handle: JoinHandle<()>,
}

struct Inner {
    provider: Arc<dyn EmbeddingProvider>,
    queue_capacity: usize,
    worker: Mutex<Option<Worker>>,
}

/// Shared background embedding worker.
///
/// Every clone talks to the same worker task, which forwards requests to the
/// wrapped provider one at a time. The worker must be started from inside a
/// tokio runtime.
#[derive(Clone)]
pub struct EmbeddingManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmbeddingManager {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingManager")
            .field("queue_capacity", &self.inner.queue_capacity)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EmbeddingManager {
    #[inline]
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_queue_capacity(provider, DEFAULT_QUEUE_CAPACITY)
    }

    #[inline]
    pub fn with_queue_capacity(provider: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                queue_capacity: capacity.max(1),
                worker: Mutex::new(None),
            }),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker task. Calling this while a worker is running is a no-op.
    #[inline]
    pub fn start(&self) {
        let mut worker = self.worker();

        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            debug!("Embedding worker already running");
            return;
        }

        let (sender, mut receiver) = mpsc::channel::<EmbeddingJob>(self.inner.queue_capacity);
        let provider = Arc::clone(&self.inner.provider);

        let handle = tokio::spawn(async move {
            debug!("Embedding worker started");
            while let Some(job) = receiver.recv().await {
                let result = provider.generate_embedding(&job.text, &job.model).await;
                if job.reply.send(result).is_err() {
                    debug!("Embedding requester went away before the reply");
                }
            }
            debug!("Embedding worker stopped");
        });

        *worker = Some(Worker { sender, handle });
        info!("Embedding worker started");
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished() && !w.sender.is_closed())
    }

    /// Close the queue and wait for in-flight jobs to drain
    #[inline]
    pub async fn shutdown(&self) {
        let Some(Worker { sender, handle }) = self.worker().take() else {
            return;
        };

        drop(sender);
        if let Err(e) = handle.await {
            warn!("Embedding worker ended abnormally: {}", e);
        }
        info!("Embedding worker shut down");
    }

    fn sender(&self) -> Result<mpsc::Sender<EmbeddingJob>> {
        self.worker()
            .as_ref()
            .map(|w| w.sender.clone())
            .ok_or(RagError::EmbeddingWorkerStopped)
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingManager {
    #[inline]
    async fn generate_embedding(&self, text: &str, model: &str) -> Result<Option<Vec<f32>>> {
        let sender = self.sender()?;
        let (reply, response) = oneshot::channel();

        sender
            .send(EmbeddingJob {
                text: text.to_string(),
                model: model.to_string(),
                reply,
            })
            .await
            .map_err(|_| RagError::EmbeddingWorkerStopped)?;

        response
            .await
            .map_err(|_| RagError::EmbeddingWorkerStopped)?
    }
}
