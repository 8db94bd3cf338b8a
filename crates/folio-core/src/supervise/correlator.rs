//! Matching renderer responses to the job in flight.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, ProtocolError, Result};
use crate::ipc::{Artifact, JobId, WorkerEvent, encode_job};
use crate::job::RenderJob;

use super::supervisor::Supervisor;

/// How long a crashed renderer's remaining stderr is awaited.
const DIAGNOSTIC_GRACE: Duration = Duration::from_millis(200);

/// The single job awaiting a response.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    id: JobId,
    timeout: Option<Duration>,
    dispatched_at: Instant,
}

impl PendingRequest {
    fn new(job: &RenderJob) -> Self {
        Self {
            id: job.id().clone(),
            timeout: job.timeout(),
            dispatched_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.dispatched_at + timeout)
    }

    pub fn elapsed(&self) -> Duration {
        self.dispatched_at.elapsed()
    }
}

enum Verdict {
    Completed(Artifact),
    Mismatch(JobId),
    Malformed { reason: String, line: String },
    Crashed {
        reason: String,
        diagnostic: Option<String>,
    },
    TimedOut,
    WriteFailed(Error),
}

/// Sends one job at a time and settles it from the renderer's events.
#[derive(Debug)]
pub struct Correlator {
    pending: Option<PendingRequest>,
    violations: u32,
    max_violations: u32,
}

impl Correlator {
    /// `max_violations` consecutive protocol violations force a renderer
    /// restart. Zero disables that.
    pub fn new(max_violations: u32) -> Self {
        Self {
            pending: None,
            violations: 0,
            max_violations,
        }
    }

    /// The job currently awaiting a response.
    pub fn in_flight(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// Protocol violations since the last successful job.
    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Send `job` to the supervisor's renderer and wait for its outcome.
    ///
    /// The renderer must already be ready. Exactly one outcome is returned:
    /// the artifact, a crash, a timeout or a protocol violation.
    pub async fn dispatch(&mut self, supervisor: &mut Supervisor, job: RenderJob) -> Result<Artifact> {
        let frame = encode_job(&job)?;
        let pending = PendingRequest::new(&job);
        tracing::debug!(id = %pending.id, bytes = frame.len(), "dispatching render job");
        self.pending = Some(pending.clone());

        let verdict = match supervisor.write(&frame).await {
            Ok(()) => await_verdict(supervisor, &pending).await,
            Err(e) => Verdict::WriteFailed(e),
        };

        self.pending = None;
        self.settle(supervisor, pending, verdict)
    }

    fn settle(
        &mut self,
        supervisor: &mut Supervisor,
        pending: PendingRequest,
        verdict: Verdict,
    ) -> Result<Artifact> {
        match verdict {
            Verdict::Completed(artifact) => {
                self.violations = 0;
                tracing::debug!(
                    id = %pending.id,
                    elapsed = ?pending.elapsed(),
                    "rendered {}",
                    artifact.filename
                );
                Ok(artifact)
            }
            Verdict::Mismatch(received) => {
                tracing::warn!(
                    expected = %pending.id,
                    received = %received,
                    "renderer answered for the wrong job"
                );
                self.record_violation(supervisor);
                Err(ProtocolError::CorrelationMismatch {
                    expected: pending.id,
                    received,
                }
                .into())
            }
            Verdict::Malformed { reason, line } => {
                tracing::warn!(id = %pending.id, "malformed renderer response: {}", reason);
                self.record_violation(supervisor);
                Err(ProtocolError::MalformedEnvelope { reason, line }.into())
            }
            Verdict::TimedOut => {
                let after = pending.timeout.unwrap_or_default();
                tracing::warn!(id = %pending.id, "render job timed out after {:?}, killing renderer", after);
                supervisor.kill();
                Err(Error::Timeout {
                    id: pending.id,
                    after,
                })
            }
            Verdict::Crashed { reason, diagnostic } => {
                supervisor.kill();
                self.violations = 0;
                if supervisor.is_shut_down() {
                    return Err(Error::ShutDown);
                }
                tracing::warn!(id = %pending.id, "renderer failed: {}", reason);
                Err(Error::WorkerCrash { reason, diagnostic })
            }
            Verdict::WriteFailed(err) => {
                supervisor.kill();
                self.violations = 0;
                if supervisor.is_shut_down() {
                    return Err(Error::ShutDown);
                }
                Err(err)
            }
        }
    }

    fn record_violation(&mut self, supervisor: &mut Supervisor) {
        self.violations += 1;
        if self.max_violations > 0 && self.violations >= self.max_violations {
            tracing::warn!(
                "restarting renderer after {} consecutive protocol violations",
                self.violations
            );
            supervisor.kill();
            self.violations = 0;
        }
    }
}

async fn await_verdict(supervisor: &mut Supervisor, pending: &PendingRequest) -> Verdict {
    let deadline = pending.deadline();

    let event = match deadline {
        Some(deadline) => tokio::select! {
            event = supervisor.next_event() => event,
            _ = tokio::time::sleep_until(deadline) => return Verdict::TimedOut,
        },
        None => supervisor.next_event().await,
    };

    match event {
        Some(WorkerEvent::Completed(artifact)) if artifact.id == pending.id => {
            Verdict::Completed(artifact)
        }
        Some(WorkerEvent::Completed(artifact)) => Verdict::Mismatch(artifact.id),
        Some(WorkerEvent::Malformed { reason, line }) => Verdict::Malformed { reason, line },
        Some(WorkerEvent::Stderr(text)) => Verdict::Crashed {
            reason: "renderer wrote to its error stream".to_string(),
            diagnostic: Some(collect_diagnostic(supervisor, text)),
        },
        Some(WorkerEvent::Exited(exit)) => {
            crashed(supervisor, format!("renderer exited ({exit})")).await
        }
        Some(WorkerEvent::OutputClosed) => {
            crashed(supervisor, "renderer closed its output".to_string()).await
        }
        Some(WorkerEvent::PipeClosed(e)) => {
            crashed(supervisor, format!("renderer stdin closed: {e}")).await
        }
        None => Verdict::Crashed {
            reason: "renderer is not running".to_string(),
            diagnostic: None,
        },
    }
}

/// Collect what the dying renderer still writes to stderr.
async fn crashed(supervisor: &mut Supervisor, reason: String) -> Verdict {
    let mut diagnostic = String::new();
    // Event sources finish once the process is gone; stop early if they hang.
    let _ = tokio::time::timeout(DIAGNOSTIC_GRACE, async {
        while let Some(event) = supervisor.next_event().await {
            if let WorkerEvent::Stderr(text) = event {
                diagnostic.push_str(&text);
            }
        }
    })
    .await;

    Verdict::Crashed {
        reason,
        diagnostic: (!diagnostic.is_empty()).then_some(diagnostic),
    }
}

/// Append error-stream text that has already been delivered.
fn collect_diagnostic(supervisor: &mut Supervisor, mut text: String) -> String {
    while let Some(event) = supervisor.try_next_event() {
        if let WorkerEvent::Stderr(more) = event {
            text.push_str(&more);
        }
    }
    text
}
