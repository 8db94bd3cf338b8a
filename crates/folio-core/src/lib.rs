//! Supervised HTML rendering through a long-lived worker process.
//!
//! This crate provides:
//! - A line-delimited JSON protocol with a renderer on stdin/stdout
//! - A supervisor that starts, probes, kills and restarts the renderer
//! - A FIFO queue keeping at most one job in flight
//! - Correlation of responses to jobs, with timeouts and crash detection

pub mod config;
pub mod error;
pub mod ipc;
pub mod job;
pub mod queue;
pub mod renderer;
pub mod supervise;

pub use config::RendererConfig;
pub use error::{Error, ErrorKind, ProtocolError, Result};
pub use ipc::{Artifact, JobId, Launcher, ProcessLauncher};
pub use job::RenderJob;
pub use queue::Submission;
pub use renderer::Renderer;
pub use supervise::{SupervisorState, SupervisorStatus, reap_orphans};
