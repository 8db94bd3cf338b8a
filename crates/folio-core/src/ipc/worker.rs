//! Handle to a running renderer process.
//!
//! A `WorkerHandle` owns the process's streams. Background tasks turn stdout,
//! stderr and process exit into [`WorkerEvent`]s on a single channel, which
//! the correlator consumes while a job is in flight. A keepalive task probes
//! stdin with blank lines so a severed pipe is noticed before a job is lost
//! in it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};

use super::launcher::{BoxedReader, BoxedWriter, WorkerExit, WorkerProcess};
use super::protocol::{Artifact, EnvelopeDecoder, Inbound, KEEPALIVE_FRAME};

const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet confirmed alive.
    Starting,
    /// Accepting jobs.
    Ready,
    /// Exited, killed, or unusable. Never written to again.
    Dead,
}

/// Something the worker did that the supervisor must react to.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A completion envelope was decoded from stdout.
    Completed(Artifact),
    /// A completion envelope could not be decoded.
    Malformed { reason: String, line: String },
    /// The worker wrote to stderr.
    Stderr(String),
    /// stdout reached end of file.
    OutputClosed,
    /// A keepalive write failed.
    PipeClosed(String),
    /// The process exited.
    Exited(WorkerExit),
}

impl WorkerEvent {
    /// Whether this event means the worker can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Completed(_) | Self::Malformed { .. })
    }
}

/// Thread-safe handle for killing a worker from anywhere.
///
/// The kill request is delivered at most once, no matter how many clones
/// call [`kill`](Self::kill).
#[derive(Clone)]
pub struct WorkerKillHandle {
    /// Process ID of the worker.
    pid: Option<u32>,
    /// Pending kill request; taken when the kill is sent.
    switch: Arc<StdMutex<Option<oneshot::Sender<()>>>>,
}

impl WorkerKillHandle {
    fn new(pid: Option<u32>, kill: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            switch: Arc::new(StdMutex::new(Some(kill))),
        }
    }

    /// Kill the worker process.
    ///
    /// Returns `true` if this call delivered the request.
    pub fn kill(&self) -> bool {
        let sender = self
            .switch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => {
                tracing::debug!(pid = ?self.pid, "sending kill request to renderer");
                // The receiver is gone only if the process already exited.
                let _ = sender.send(());
                true
            }
            None => false,
        }
    }

    /// Check if kill has been requested.
    pub fn is_killed(&self) -> bool {
        self.switch
            .lock()
            .map(|switch| switch.is_none())
            .unwrap_or(true)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Handle to a worker process.
pub struct WorkerHandle {
    pid: Option<u32>,
    /// Shared with the keepalive task; every write is a whole frame.
    stdin: Arc<Mutex<BoxedWriter>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    state: Arc<watch::Sender<WorkerState>>,
    kill: WorkerKillHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Take ownership of a launched process and start its background tasks.
    ///
    /// The handle starts in [`WorkerState::Starting`].
    pub fn attach(process: WorkerProcess, keepalive_interval: Duration) -> Self {
        let WorkerProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
            kill,
        } = process;

        let (state, _) = watch::channel(WorkerState::Starting);
        let state = Arc::new(state);
        let (events_tx, events) = mpsc::unbounded_channel();
        let stdin = Arc::new(Mutex::new(stdin));

        let tasks = vec![
            tokio::spawn(read_stdout(stdout, events_tx.clone(), state.clone(), pid)),
            tokio::spawn(read_stderr(stderr, events_tx.clone(), pid)),
            tokio::spawn(keepalive(
                stdin.clone(),
                keepalive_interval,
                state.clone(),
                events_tx.clone(),
            )),
        ];
        // Not tracked: it must outlive the handle to reap the process.
        tokio::spawn(watch_exit(exit, events_tx, state.clone(), pid));

        Self {
            pid,
            stdin,
            events,
            state,
            kill: WorkerKillHandle::new(pid, kill),
            tasks,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Handle that can kill this worker from another task or thread.
    pub fn kill_handle(&self) -> WorkerKillHandle {
        self.kill.clone()
    }

    /// Promote a starting worker to ready. Dead workers stay dead.
    pub fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Starting {
                *state = WorkerState::Ready;
                true
            } else {
                false
            }
        })
    }

    pub fn mark_dead(&self) {
        self.state.send_replace(WorkerState::Dead);
    }

    /// Kill the process and mark the handle dead.
    pub fn kill(&self) {
        self.mark_dead();
        self.kill.kill();
    }

    /// Write one complete frame to the worker's stdin.
    ///
    /// Fails without writing if the worker is dead. A failed write marks it
    /// dead.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.state() == WorkerState::Dead {
            return Err(Error::WorkerCrash {
                reason: "renderer is not running".to_string(),
                diagnostic: None,
            });
        }

        let mut stdin = self.stdin.lock().await;
        let written = match stdin.write_all(frame).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            self.mark_dead();
            Error::WorkerCrash {
                reason: format!("failed to write to renderer stdin: {e}"),
                diagnostic: None,
            }
        })
    }

    /// Wait for the next event. `None` once every event source has finished.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Take an event that has already arrived, without waiting.
    pub fn try_next_event(&mut self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Ensure worker is killed when handle is dropped
        self.kill();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_stdout(
    mut stdout: BoxedReader,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: Arc<watch::Sender<WorkerState>>,
    pid: Option<u32>,
) {
    let mut decoder = EnvelopeDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                forward(decoder.finish(), &events, pid);
                break;
            }
            Ok(n) => forward(decoder.feed(&buf[..n]), &events, pid),
            Err(e) => {
                tracing::warn!(?pid, "failed to read renderer stdout: {}", e);
                break;
            }
        }
    }

    state.send_replace(WorkerState::Dead);
    let _ = events.send(WorkerEvent::OutputClosed);
}

fn forward(inbound: Vec<Inbound>, events: &mpsc::UnboundedSender<WorkerEvent>, pid: Option<u32>) {
    for item in inbound {
        match item {
            Inbound::Completed(artifact) => {
                let _ = events.send(WorkerEvent::Completed(artifact));
            }
            Inbound::Malformed { reason, line } => {
                let _ = events.send(WorkerEvent::Malformed { reason, line });
            }
            Inbound::Advisory(value) => tracing::debug!(?pid, "renderer: {}", value),
            Inbound::Noise(text) => tracing::debug!(?pid, "renderer output: {}", text),
        }
    }
}

async fn read_stderr(
    mut stderr: BoxedReader,
    events: mpsc::UnboundedSender<WorkerEvent>,
    pid: Option<u32>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                tracing::warn!(?pid, "renderer stderr: {}", text.trim_end());
                if events.send(WorkerEvent::Stderr(text)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?pid, "failed to read renderer stderr: {}", e);
                break;
            }
        }
    }
}

async fn keepalive(
    stdin: Arc<Mutex<BoxedWriter>>,
    interval: Duration,
    state: Arc<watch::Sender<WorkerState>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut state_changes = state.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state_changes.changed() => {
                if changed.is_err() || *state_changes.borrow() == WorkerState::Dead {
                    break;
                }
                continue;
            }
        }

        if *state.borrow() == WorkerState::Dead {
            break;
        }

        let written = {
            let mut stdin = stdin.lock().await;
            match stdin.write_all(KEEPALIVE_FRAME).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            tracing::warn!("renderer stdin closed: {}", e);
            state.send_replace(WorkerState::Dead);
            let _ = events.send(WorkerEvent::PipeClosed(e.to_string()));
            break;
        }
    }
}

async fn watch_exit(
    exit: BoxFuture<'static, WorkerExit>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: Arc<watch::Sender<WorkerState>>,
    pid: Option<u32>,
) {
    let status = exit.await;
    state.send_replace(WorkerState::Dead);
    tracing::debug!(?pid, "renderer process ended: {}", status);
    let _ = events.send(WorkerEvent::Exited(status));
}
