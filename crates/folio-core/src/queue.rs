//! First-in first-out job queue in front of the renderer.
//!
//! A single dispatcher task owns the [`Supervisor`] and the [`Correlator`]
//! and handles one job at a time, so the renderer never sees a second job
//! before the first has settled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::ipc::{Artifact, JobId};
use crate::job::RenderJob;
use crate::supervise::{Correlator, Supervisor};

struct Queued {
    job: RenderJob,
    reply: oneshot::Sender<Result<Artifact>>,
}

/// Serializes render jobs onto one renderer.
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Queued>,
    depth: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Start the dispatcher task. Must be called within a Tokio runtime.
    pub fn start(supervisor: Supervisor, correlator: Correlator) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(dispatch_loop(rx, depth.clone(), supervisor, correlator));
        Self { tx, depth }
    }

    /// Enqueue a job.
    ///
    /// The job takes its place in the queue immediately, before the returned
    /// future is first polled.
    pub fn submit(&self, job: RenderJob) -> Submission {
        let id = job.id().clone();
        let (reply, rx) = oneshot::channel();

        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Queued { job, reply }).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Submission::closed(id);
        }
        Submission {
            id,
            reply: Some(rx),
        }
    }

    /// Jobs waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    depth: Arc<AtomicUsize>,
    mut supervisor: Supervisor,
    mut correlator: Correlator,
) {
    while let Some(Queued { job, reply }) = rx.recv().await {
        depth.fetch_sub(1, Ordering::SeqCst);

        if reply.is_closed() {
            tracing::debug!(id = %job.id(), "skipping abandoned render job");
            continue;
        }

        let result = match supervisor.ensure_ready().await {
            Ok(()) => correlator.dispatch(&mut supervisor, job).await,
            Err(e) => Err(e),
        };
        // The caller may have stopped waiting.
        let _ = reply.send(result);
    }

    tracing::debug!("render queue closed");
    supervisor.shutdown();
}

/// Future resolving to the outcome of a submitted job.
#[must_use = "a submitted job is rendered even if its result is ignored; await it to observe the outcome"]
pub struct Submission {
    id: JobId,
    reply: Option<oneshot::Receiver<Result<Artifact>>>,
}

impl Submission {
    /// A submission that resolves to [`Error::ShutDown`].
    pub(crate) fn closed(id: JobId) -> Self {
        Self { id, reply: None }
    }

    /// Correlation id of the submitted job.
    pub fn id(&self) -> &JobId {
        &self.id
    }
}

impl Future for Submission {
    type Output = Result<Artifact>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.reply.as_mut() {
            None => Poll::Ready(Err(Error::ShutDown)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(Error::ShutDown))),
        }
    }
}
