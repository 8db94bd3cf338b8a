//! Renderer process lifecycle.
//!
//! The supervisor owns at most one [`WorkerHandle`] and is the only component
//! that spawns or kills renderer processes. Its state is mirrored onto a
//! [`StatusBoard`] that other tasks can read and use to shut the renderer
//! down.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::RendererConfig;
use crate::error::{Error, Result};
use crate::ipc::{Launcher, WorkerEvent, WorkerHandle, WorkerKillHandle, WorkerState};

use super::orphans;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No renderer has been started, or the last start failed.
    NoWorker,
    Starting,
    Ready,
    /// The renderer is gone; the next job starts a new one.
    Dead,
}

impl From<WorkerState> for SupervisorState {
    fn from(state: WorkerState) -> Self {
        match state {
            WorkerState::Starting => Self::Starting,
            WorkerState::Ready => Self::Ready,
            WorkerState::Dead => Self::Dead,
        }
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Process id of the current renderer.
    pub pid: Option<u32>,
    /// Number of renderer processes started successfully.
    pub spawn_count: u64,
}

#[derive(Default)]
struct Board {
    spawn_count: u64,
    pid: Option<u32>,
    worker_state: Option<watch::Receiver<WorkerState>>,
    kill: Option<WorkerKillHandle>,
    shut_down: bool,
}

/// Shared, thread-safe view of a supervisor.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<StdMutex<Board>>,
}

impl StatusBoard {
    fn lock(&self) -> MutexGuard<'_, Board> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> SupervisorStatus {
        let board = self.lock();
        let state = board
            .worker_state
            .as_ref()
            .map(|state| SupervisorState::from(*state.borrow()))
            .unwrap_or(SupervisorState::NoWorker);
        SupervisorStatus {
            state,
            pid: board.pid,
            spawn_count: board.spawn_count,
        }
    }

    /// Stop the supervisor: kill the live renderer and refuse further jobs.
    ///
    /// The renderer is signalled at most once however often this is called.
    pub fn shut_down(&self) {
        let mut board = self.lock();
        if !board.shut_down {
            tracing::debug!(pid = ?board.pid, "shutting down renderer");
        }
        board.shut_down = true;
        if let Some(kill) = &board.kill {
            kill.kill();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Publish a newly attached worker. Returns `false` if the board was
    /// already shut down, in which case the worker is killed.
    fn attach(&self, worker: &WorkerHandle) -> bool {
        let mut board = self.lock();
        board.pid = worker.pid();
        board.worker_state = Some(worker.subscribe());
        board.kill = Some(worker.kill_handle());
        if board.shut_down {
            worker.kill();
            return false;
        }
        true
    }

    fn detach(&self) {
        let mut board = self.lock();
        board.pid = None;
        board.worker_state = None;
        board.kill = None;
    }

    fn record_spawn(&self) -> u64 {
        let mut board = self.lock();
        board.spawn_count += 1;
        board.spawn_count
    }
}

/// Owns the renderer process and keeps exactly one usable instance around.
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    keepalive_interval: Duration,
    reap_orphans: bool,
    reaped: bool,
    worker: Option<WorkerHandle>,
    board: StatusBoard,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn Launcher>, config: &RendererConfig) -> Self {
        Self {
            launcher,
            keepalive_interval: config.keepalive_interval,
            reap_orphans: config.reap_orphans,
            reaped: false,
            worker: None,
            board: StatusBoard::default(),
        }
    }

    /// Board mirroring this supervisor's state.
    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.board.snapshot()
    }

    pub fn state(&self) -> SupervisorState {
        match &self.worker {
            Some(worker) => worker.state().into(),
            None => SupervisorState::NoWorker,
        }
    }

    pub fn spawn_count(&self) -> u64 {
        self.board.snapshot().spawn_count
    }

    pub fn is_shut_down(&self) -> bool {
        self.board.is_shut_down()
    }

    /// Make sure a ready renderer is available, starting one if needed.
    ///
    /// A ready renderer is reused after discarding whatever it reported
    /// while idle. If that shows it died, a new one is started.
    pub async fn ensure_ready(&mut self) -> Result<()> {
        if self.board.is_shut_down() {
            self.worker = None;
            return Err(Error::ShutDown);
        }

        if let Some(worker) = self.worker.as_mut() {
            if worker.state() == WorkerState::Ready {
                drain_stale(worker);
                if worker.state() == WorkerState::Ready {
                    return Ok(());
                }
            }
            tracing::info!(pid = ?worker.pid(), "renderer is dead, restarting");
        }

        self.spawn().await
    }

    async fn spawn(&mut self) -> Result<()> {
        // Dropping the old handle kills its process if still running.
        self.worker = None;
        self.board.detach();

        if self.reap_orphans && !self.reaped {
            self.reaped = true;
            if let Some((program, args)) = self.launcher.command_line() {
                // Walks /proc, so keep it off the runtime threads.
                let reaped =
                    tokio::task::spawn_blocking(move || orphans::reap_orphans(&program, &args))
                        .await;
                match reaped {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("failed to reap orphaned renderers: {}", e),
                    Err(e) => tracing::warn!("orphan reaping task failed: {}", e),
                }
            }
        }

        let process = self.launcher.launch().inspect_err(|e| {
            tracing::warn!("{}", e);
        })?;
        let worker = WorkerHandle::attach(process, self.keepalive_interval);
        if !self.board.attach(&worker) {
            self.board.detach();
            return Err(Error::ShutDown);
        }

        // Give an immediately failing process a chance to report its exit.
        tokio::task::yield_now().await;

        if !worker.mark_ready() {
            self.board.detach();
            return Err(Error::SpawnFailure {
                program: self.launcher.describe(),
                message: "renderer exited during startup".to_string(),
            });
        }

        let spawn_count = self.board.record_spawn();
        tracing::info!(
            pid = ?worker.pid(),
            spawn_count,
            "started renderer {}",
            self.launcher.describe()
        );
        self.worker = Some(worker);
        Ok(())
    }

    /// Mark the current renderer unusable without signalling it.
    pub fn mark_dead(&mut self) {
        if let Some(worker) = &self.worker {
            worker.mark_dead();
        }
    }

    /// Kill the current renderer. The next job starts a new one.
    pub fn kill(&mut self) {
        if let Some(worker) = &self.worker {
            tracing::debug!(pid = ?worker.pid(), "killing renderer");
            worker.kill();
        }
    }

    /// Write one frame to the renderer's stdin.
    pub async fn write(&mut self, frame: &[u8]) -> Result<()> {
        match &self.worker {
            Some(worker) => worker.write_frame(frame).await,
            None => Err(Error::WorkerCrash {
                reason: "renderer is not running".to_string(),
                diagnostic: None,
            }),
        }
    }

    /// Wait for the next event from the current renderer.
    ///
    /// Returns `None` if there is no renderer or its event sources have all
    /// finished.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        match self.worker.as_mut() {
            Some(worker) => worker.next_event().await,
            None => None,
        }
    }

    /// Take an already delivered event without waiting.
    pub fn try_next_event(&mut self) -> Option<WorkerEvent> {
        self.worker.as_mut().and_then(WorkerHandle::try_next_event)
    }

    /// Kill the renderer and refuse further jobs.
    pub fn shutdown(&mut self) {
        self.board.shut_down();
        self.worker = None;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Discard events a ready renderer produced between jobs.
fn drain_stale(worker: &mut WorkerHandle) {
    while let Some(event) = worker.try_next_event() {
        match event {
            WorkerEvent::Completed(artifact) => {
                tracing::warn!(
                    id = %artifact.id,
                    "discarding unsolicited response for {}",
                    artifact.filename
                );
            }
            WorkerEvent::Malformed { reason, line } => {
                tracing::warn!("discarding malformed response ({}): {}", reason, line);
            }
            fatal => {
                tracing::warn!(pid = ?worker.pid(), "renderer failed while idle: {:?}", fatal);
                worker.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::scripted::{Reply, ScriptedLauncher};

    fn supervisor(launcher: &ScriptedLauncher) -> Supervisor {
        let config = RendererConfig::default().with_keepalive_interval(Duration::from_secs(60));
        Supervisor::new(Arc::new(launcher.clone()), &config)
    }

    #[tokio::test]
    async fn test_ensure_ready_reuses_worker() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Artifact);
        let mut supervisor = supervisor(&launcher);
        assert_eq!(supervisor.state(), SupervisorState::NoWorker);

        for _ in 0..3 {
            supervisor.ensure_ready().await.unwrap();
        }

        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(supervisor.spawn_count(), 1);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_worker() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Artifact);
        launcher.fail_next_launches(1);
        let mut supervisor = supervisor(&launcher);

        let err = supervisor.ensure_ready().await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailure { .. }));
        assert_eq!(supervisor.status().state, SupervisorState::NoWorker);
        assert_eq!(supervisor.spawn_count(), 0);

        supervisor.ensure_ready().await.unwrap();
        assert_eq!(supervisor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_respawns_after_kill() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Artifact);
        let mut supervisor = supervisor(&launcher);
        supervisor.ensure_ready().await.unwrap();

        supervisor.kill();
        assert_eq!(supervisor.state(), SupervisorState::Dead);
        assert_eq!(supervisor.status().state, SupervisorState::Dead);

        supervisor.ensure_ready().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(supervisor.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_mark_dead_forces_respawn() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Artifact);
        let mut supervisor = supervisor(&launcher);
        supervisor.ensure_ready().await.unwrap();

        supervisor.mark_dead();
        assert_eq!(supervisor.state(), SupervisorState::Dead);
        assert_eq!(supervisor.status().state, SupervisorState::Dead);

        supervisor.ensure_ready().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(supervisor.spawn_count(), 2);
        assert_eq!(launcher.launches(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reaping_on_first_spawn_keeps_new_worker() {
        use std::ffi::OsString;

        use crate::ipc::ProcessLauncher;

        let launcher = ProcessLauncher::new("sleep", vec![OsString::from("30.5151")]);
        let config = RendererConfig::new("sleep")
            .with_keepalive_interval(Duration::from_secs(60))
            .with_reap_orphans(true);
        let mut supervisor = Supervisor::new(Arc::new(launcher), &config);

        supervisor.ensure_ready().await.unwrap();
        supervisor.ensure_ready().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(supervisor.spawn_count(), 1);
        assert!(supervisor.status().pid.is_some());
    }

    #[tokio::test]
    async fn test_idle_exit_is_noticed_before_next_job() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Exit(1));
        let mut supervisor = supervisor(&launcher);
        supervisor.ensure_ready().await.unwrap();

        supervisor
            .write(b"{\"html\":\"x\",\"options\":{\"id\":1}}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.ensure_ready().await.unwrap();
        assert_eq!(supervisor.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_completion_is_discarded() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Artifact);
        let mut supervisor = supervisor(&launcher);
        supervisor.ensure_ready().await.unwrap();

        supervisor
            .write(b"{\"html\":\"x\",\"options\":{\"id\":9}}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.ensure_ready().await.unwrap();
        assert_eq!(supervisor.spawn_count(), 1);
        assert!(supervisor.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_jobs() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Artifact);
        let mut supervisor = supervisor(&launcher);
        supervisor.ensure_ready().await.unwrap();
        let board = supervisor.status_board();

        board.shut_down();
        board.shut_down();
        assert!(supervisor.is_shut_down());

        let err = supervisor.ensure_ready().await.unwrap_err();
        assert!(matches!(err, Error::ShutDown));
        assert_eq!(launcher.launches(), 1);
    }
}
