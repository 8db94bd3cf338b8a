//! In-memory renderer for unit tests.
//!
//! Speaks the line protocol over `tokio::io::duplex` pipes and answers each
//! request according to a script, recording what it saw.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

use super::launcher::{Launcher, WorkerExit, WorkerProcess};
use super::protocol::{Artifact, JobId, WireRequest, encode_artifact};

const PIPE_CAPACITY: usize = 1024 * 1024;

/// How the scripted renderer answers one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Answer with the request's id.
    Artifact,
    /// Answer after a pause.
    Delayed(Duration),
    /// Print text to stdout first, then answer.
    Noisy(String),
    /// Answer with some other id.
    WrongId(JobId),
    /// Write a raw line to stdout and nothing else.
    Raw(String),
    /// Never answer.
    Silent,
    /// Write to stderr instead of answering.
    Stderr(String),
    /// Exit with a status code.
    Exit(i32),
}

/// Protocol traffic observed by the scripted renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Received(JobId),
    Answered(JobId),
}

type Script = dyn Fn(&WireRequest, usize) -> Reply + Send + Sync;

/// Launcher producing scripted in-memory renderers.
///
/// The script receives each request and the 1-based launch number of the
/// renderer that read it.
#[derive(Clone)]
pub(crate) struct ScriptedLauncher {
    script: Arc<Script>,
    launches: Arc<AtomicUsize>,
    failing_launches: Arc<AtomicUsize>,
    keepalives: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl ScriptedLauncher {
    pub(crate) fn new(script: impl Fn(&WireRequest, usize) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            launches: Arc::new(AtomicUsize::new(0)),
            failing_launches: Arc::new(AtomicUsize::new(0)),
            keepalives: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the next `count` launches fail.
    pub(crate) fn fail_next_launches(&self, count: usize) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self) -> Result<WorkerProcess> {
        let failing = self.failing_launches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_launches.store(failing - 1, Ordering::SeqCst);
            return Err(Error::SpawnFailure {
                program: self.describe(),
                message: "scripted launch failure".to_string(),
            });
        }

        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let (stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stderr, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (kill, kill_requested) = oneshot::channel::<()>();

        let renderer = Renderer {
            script: self.script.clone(),
            keepalives: self.keepalives.clone(),
            seen: self.seen.clone(),
            launch,
        };
        let task = tokio::spawn(async move {
            tokio::select! {
                exit = renderer.serve(worker_stdin, worker_stdout, worker_stderr) => exit,
                _ = kill_requested => WorkerExit { code: None, killed: true },
            }
        });

        Ok(WorkerProcess {
            pid: None,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: task
                .map(|joined| {
                    joined.unwrap_or(WorkerExit {
                        code: None,
                        killed: true,
                    })
                })
                .boxed(),
            kill,
        })
    }

    fn describe(&self) -> String {
        "scripted renderer".to_string()
    }
}

struct Renderer {
    script: Arc<Script>,
    keepalives: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
    launch: usize,
}

impl Renderer {
    /// Requests are read and recorded as soon as they arrive, independently
    /// of the answers in progress.
    async fn serve(
        self,
        stdin: DuplexStream,
        mut stdout: DuplexStream,
        mut stderr: DuplexStream,
    ) -> WorkerExit {
        let (requests_tx, mut requests) = mpsc::unbounded_channel();

        let reader = async {
            self.read_requests(stdin, requests_tx).await;
            // End of input only closes the channel; pending answers still go out.
            std::future::pending::<WorkerExit>().await
        };
        let responder = async {
            while let Some((id, request)) = requests.recv().await {
                if let Some(exit) = self.respond(&request, id, &mut stdout, &mut stderr).await {
                    return exit;
                }
            }
            WorkerExit {
                code: Some(0),
                killed: false,
            }
        };

        tokio::select! {
            exit = reader => exit,
            exit = responder => exit,
        }
    }

    async fn read_requests(
        &self,
        stdin: DuplexStream,
        requests: mpsc::UnboundedSender<(JobId, WireRequest)>,
    ) {
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                self.keepalives.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            let Ok(request) = serde_json::from_str::<WireRequest>(&line) else {
                continue;
            };
            let id = request.options.id.clone().unwrap_or(JobId::Number(0));
            self.record(Seen::Received(id.clone()));
            if requests.send((id, request)).is_err() {
                return;
            }
        }
    }

    async fn respond(
        &self,
        request: &WireRequest,
        id: JobId,
        stdout: &mut DuplexStream,
        stderr: &mut DuplexStream,
    ) -> Option<WorkerExit> {
        match (self.script)(request, self.launch) {
            Reply::Artifact => self.answer(stdout, id).await,
            Reply::Delayed(pause) => {
                tokio::time::sleep(pause).await;
                self.answer(stdout, id).await;
            }
            Reply::Noisy(noise) => {
                let _ = stdout.write_all(noise.as_bytes()).await;
                self.answer(stdout, id).await;
            }
            Reply::WrongId(other) => self.answer(stdout, other).await,
            Reply::Raw(text) => {
                let _ = stdout.write_all(format!("{text}\n").as_bytes()).await;
            }
            Reply::Silent => {}
            Reply::Stderr(text) => {
                let _ = stderr.write_all(text.as_bytes()).await;
            }
            Reply::Exit(code) => {
                return Some(WorkerExit {
                    code: Some(code),
                    killed: false,
                });
            }
        }
        None
    }

    async fn answer(&self, stdout: &mut DuplexStream, id: JobId) {
        let artifact = Artifact {
            filename: format!("/tmp/folio-{id}-{}.pdf", self.launch),
            id: id.clone(),
        };
        let line = encode_artifact(&artifact).unwrap();
        let _ = stdout.write_all(&line).await;
        self.record(Seen::Answered(id));
    }

    fn record(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }
}
