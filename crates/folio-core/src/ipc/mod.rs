//! Inter-process communication with the renderer process.
//!
//! This module provides the line protocol, the launcher seam and the
//! handle that owns a running renderer's streams.

mod launcher;
pub mod protocol;
#[cfg(test)]
pub(crate) mod scripted;
mod worker;

pub use launcher::{
    BoxedReader, BoxedWriter, Launcher, ProcessLauncher, WorkerExit, WorkerProcess,
};
pub use protocol::{
    Artifact, EnvelopeDecoder, Inbound, JobId, WireOptions, WireRequest, decode_request,
    encode_artifact, encode_job,
};
pub use worker::{WorkerEvent, WorkerHandle, WorkerKillHandle, WorkerState};
