/**
 * Reconcile queues
 *
 * A queue runs callbacks for the objects handed to it strictly in the order
 * they were enqueued, one at a time. Each enqueue returns a [`Completion`]
 * that settles once that particular item has been processed.
 */
pub mod strategy;

pub use strategy::{QueueRegistry, ReconcileStrategy};

use crate::k8s::watch::ChangeKind;
use crate::k8s::watch::cache::describe;
use async_trait::async_trait;
use futures::FutureExt;
use kube::{Resource, ResourceExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// User callback invoked for every change
#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    /// Handle one change
    ///
    /// # Errors
    ///
    /// Any error is reported to whoever awaits the item; it never stops the queue
    async fn reconcile(&self, object: K, change: ChangeKind) -> anyhow::Result<()>;
}

#[async_trait]
impl<K, F, Fut> Reconciler<K> for F
where
    K: Send + 'static,
    F: Fn(K, ChangeKind) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn reconcile(&self, object: K, change: ChangeKind) -> anyhow::Result<()> {
        (self)(object, change).await
    }
}

/// Why a queued item did not reconcile
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconcile failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("reconcile panicked: {0}")]
    Panicked(String),

    #[error("reconcile queue {0} is closed")]
    QueueClosed(String),
}

/// Identity of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLabel {
    pub name: String,
    pub uid: String,
}

impl QueueLabel {
    fn new(name: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(4).collect();
        Self {
            name: name.to_string(),
            uid: format!("{millis}-{suffix}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: QueueLabel,
    /// Items waiting, not counting the one being reconciled
    pub length: usize,
}

struct QueueItem<K> {
    object: K,
    change: ChangeKind,
    reconciler: Arc<dyn Reconciler<K>>,
    completion: oneshot::Sender<Result<(), ReconcileError>>,
}

/// Settles when the matching item was reconciled
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<Result<(), ReconcileError>>,
    queue: String,
}

impl Future for Completion {
    type Output = Result<(), ReconcileError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let queue = self.queue.clone();
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ReconcileError::QueueClosed(queue))))
    }
}

/// FIFO reconcile queue. Cloning yields another handle to the same queue.
pub struct ReconcileQueue<K> {
    label: Arc<QueueLabel>,
    sender: mpsc::UnboundedSender<QueueItem<K>>,
    waiting: Arc<AtomicUsize>,
    /// Items enqueued and not finished yet, including the one in flight
    unfinished: Arc<AtomicUsize>,
}

impl<K> Clone for ReconcileQueue<K> {
    fn clone(&self) -> Self {
        Self {
            label: Arc::clone(&self.label),
            sender: self.sender.clone(),
            waiting: Arc::clone(&self.waiting),
            unfinished: Arc::clone(&self.unfinished),
        }
    }
}

impl<K> std::fmt::Debug for ReconcileQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileQueue")
            .field("label", &self.label)
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K> ReconcileQueue<K>
where
    K: Resource + Send + 'static,
{
    /// Create a queue and spawn its worker on the current tokio runtime
    #[must_use]
    pub fn new(name: &str) -> Self {
        let label = Arc::new(QueueLabel::new(name));
        let (sender, receiver) = mpsc::unbounded_channel();
        let waiting = Arc::new(AtomicUsize::new(0));
        let unfinished = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::run(
            Arc::clone(&label),
            receiver,
            Arc::clone(&waiting),
            Arc::clone(&unfinished),
        ));

        Self {
            label,
            sender,
            waiting,
            unfinished,
        }
    }

    #[must_use]
    pub fn label(&self) -> &QueueLabel {
        &self.label
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue: (*self.label).clone(),
            length: self.waiting.load(Ordering::SeqCst),
        }
    }

    /// `true` when nothing is waiting or being reconciled
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.unfinished.load(Ordering::SeqCst) == 0
    }

    /// Number of handles to this queue, the caller's included
    pub(crate) fn handles(&self) -> usize {
        // The worker holds one reference to the label
        Arc::strong_count(&self.label).saturating_sub(1)
    }

    /// Append an item. The returned future settles when the item is done.
    pub fn enqueue(
        &self,
        object: K,
        change: ChangeKind,
        reconciler: Arc<dyn Reconciler<K>>,
    ) -> Completion {
        debug!(
            "📥 Enqueueing {} {} (rv {}) on {}",
            change,
            describe(&object),
            object.resource_version().unwrap_or_default(),
            self.label.name
        );

        let (completion, receiver) = oneshot::channel();
        self.unfinished.fetch_add(1, Ordering::SeqCst);
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem {
            object,
            change,
            reconciler,
            completion,
        };
        if let Err(mpsc::error::SendError(item)) = self.sender.send(item) {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.unfinished.fetch_sub(1, Ordering::SeqCst);
            let _ = item
                .completion
                .send(Err(ReconcileError::QueueClosed(self.label.name.clone())));
        }

        Completion {
            receiver,
            queue: self.label.name.clone(),
        }
    }

    /// Worker loop: one item at a time, in arrival order
    async fn run(
        label: Arc<QueueLabel>,
        mut receiver: mpsc::UnboundedReceiver<QueueItem<K>>,
        waiting: Arc<AtomicUsize>,
        unfinished: Arc<AtomicUsize>,
    ) {
        while let Some(item) = receiver.recv().await {
            waiting.fetch_sub(1, Ordering::SeqCst);
            let name = describe(&item.object);
            debug!("⚙️ Reconciling {} {} on {}", item.change, name, label.name);

            let outcome = AssertUnwindSafe(item.reconciler.reconcile(item.object, item.change))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(Ok(())) => {
                    debug!("✅ Reconciled {} on {}", name, label.name);
                    Ok(())
                }
                Ok(Err(e)) => {
                    debug!("Error reconciling {}: {:#}", name, e);
                    Err(ReconcileError::Failed(e))
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    debug!("Reconciler panicked for {}: {}", name, message);
                    Err(ReconcileError::Panicked(message))
                }
            };

            unfinished.fetch_sub(1, Ordering::SeqCst);
            // The enqueuer may have stopped caring about the outcome
            let _ = item.completion.send(result);
            debug!(
                "Queue {} stats - shift: {} waiting",
                label.name,
                waiting.load(Ordering::SeqCst)
            );
        }
        debug!("Queue {} drained and closed", label.name);
    }
}
