//! Public entry point.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::RendererConfig;
use crate::ipc::{JobId, Launcher, ProcessLauncher};
use crate::job::RenderJob;
use crate::queue::{RequestQueue, Submission};
use crate::supervise::{Correlator, StatusBoard, Supervisor, SupervisorStatus};

/// A supervised renderer process with a job queue in front of it.
///
/// Jobs run one at a time in submission order. The renderer is started on
/// the first job and restarted whenever it dies. It is killed on
/// [`shutdown`](Self::shutdown) or when the `Renderer` is dropped.
///
/// ```no_run
/// # async fn demo() -> folio_core::Result<()> {
/// use folio_core::{Renderer, RendererConfig};
///
/// let renderer = Renderer::new(RendererConfig::from_env()?);
/// let artifact = renderer.render_to_artifact("<h1>Invoice</h1>", None).await?;
/// println!("{}", artifact.filename);
/// # Ok(())
/// # }
/// ```
pub struct Renderer {
    queue: RequestQueue,
    board: StatusBoard,
    job_timeout: Option<Duration>,
    default_options: Map<String, Value>,
}

impl Renderer {
    /// Create a renderer running `config.program` as a child process.
    ///
    /// Must be called within a Tokio runtime. No process is started until
    /// the first job.
    pub fn new(config: RendererConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::from_config(&config));
        Self::with_launcher(config, launcher)
    }

    /// Create a renderer that starts its process through `launcher`.
    pub fn with_launcher(config: RendererConfig, launcher: Arc<dyn Launcher>) -> Self {
        tracing::debug!("creating renderer for {}", launcher.describe());
        let supervisor = Supervisor::new(launcher, &config);
        let board = supervisor.status_board();
        let correlator = Correlator::new(config.max_protocol_violations);

        Self {
            queue: RequestQueue::start(supervisor, correlator),
            board,
            job_timeout: config.job_timeout,
            default_options: config.default_options,
        }
    }

    /// Render `content` and resolve to the renderer's artifact.
    ///
    /// `id` defaults to a freshly generated token.
    pub fn render_to_artifact(&self, content: impl Into<String>, id: Option<JobId>) -> Submission {
        let job = RenderJob::new(content);
        let job = match id {
            Some(id) => job.with_id(id),
            None => job,
        };
        self.submit(job)
    }

    /// Queue a job. Configured defaults fill in its timeout and options.
    pub fn submit(&self, job: RenderJob) -> Submission {
        if self.board.is_shut_down() {
            return Submission::closed(job.id().clone());
        }
        self.queue
            .submit(job.with_defaults(self.job_timeout, &self.default_options))
    }

    pub fn status(&self) -> SupervisorStatus {
        self.board.snapshot()
    }

    /// Jobs waiting for the renderer, not counting the one in flight.
    pub fn queued(&self) -> usize {
        self.queue.queued()
    }

    /// Kill the renderer. The job in flight and every queued or later job
    /// fail with [`Error::ShutDown`](crate::Error::ShutDown).
    pub fn shutdown(&self) {
        self.board.shut_down();
    }

    pub fn is_shut_down(&self) -> bool {
        self.board.is_shut_down()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
