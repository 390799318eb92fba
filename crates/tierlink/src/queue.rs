//! Single-worker ordered task queue.
//!
//! When a server runs with `process_inline = false`, a connection does not
//! await its handlers inside the read loop. It pushes them here instead,
//! and one worker task runs them strictly in arrival order. Handlers that
//! must be observed in order (a removal before a transfer directive for
//! the same identity) rely on that FIFO contract.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Queue depth before `push` starts waiting on the worker.
const QUEUE_DEPTH: usize = 64;

/// A handle to a running queue worker.
///
/// Dropping the handle lets the worker finish what is already queued and
/// exit; [`shutdown`](Self::shutdown) does the same and waits for it.
pub(crate) struct OrderedQueue {
    owner: String,
    sender: mpsc::Sender<Job>,
    worker: JoinHandle<()>,
}

impl OrderedQueue {
    /// Spawns the worker. `owner` only labels log lines.
    pub(crate) fn spawn(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let worker = tokio::spawn(run_worker(owner.clone(), receiver));
        Self {
            owner,
            sender,
            worker,
        }
    }

    /// Enqueues a job behind everything pushed before it.
    ///
    /// Returns `false` if the worker is gone.
    pub(crate) async fn push<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.send(Box::pin(job)).await.is_err() {
            tracing::warn!(owner = %self.owner, "task queue closed, job dropped");
            return false;
        }
        true
    }

    /// Closes the queue and waits until every queued job has run.
    pub(crate) async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            tracing::error!(owner = %self.owner, error = %e, "task queue worker panicked");
        }
    }
}

async fn run_worker(owner: String, mut receiver: mpsc::Receiver<Job>) {
    tracing::debug!(%owner, "task queue started");
    let mut ran: u64 = 0;
    while let Some(job) = receiver.recv().await {
        job.await;
        ran += 1;
    }
    tracing::debug!(%owner, ran, "task queue stopped");
}
