//! Folio Worker - reference renderer process.
//!
//! Reads one JSON request per line from stdin, writes the document to disk
//! and answers with `{"filename": ..., "id": ...}` on stdout.
//!
//! Anything written to stderr fails the job in flight, so logging goes to
//! stdout where the supervisor treats it as noise. Blank lines are keepalive
//! probes and are ignored, as are unreadable requests and empty documents.

mod output;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use anyhow::Context;
use folio_core::ipc::{Artifact, WireRequest, decode_request, encode_artifact};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stdout)
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_target(false)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let _ = writeln!(io::stderr(), "folio-worker: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let pid = std::process::id();
    tracing::info!(pid, "folio-worker ready");

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let request = match decode_request(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::info!("ignoring unreadable request: {}", e);
                continue;
            }
        };
        if request.html.trim().is_empty() {
            tracing::info!("ignoring request without a document");
            continue;
        }

        let Some(artifact) = render(&request, pid)? else {
            continue;
        };
        respond(&artifact)?;
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

fn render(request: &WireRequest, pid: u32) -> anyhow::Result<Option<Artifact>> {
    let Some(id) = request.options.id.clone() else {
        tracing::info!("ignoring request without an id");
        return Ok(None);
    };

    let path = output::output_path(&request.options, &id, pid);
    output::write_document(&path, &request.html)?;
    tracing::info!(%id, "rendered {}", path.display());

    Ok(Some(Artifact {
        filename: path.to_string_lossy().into_owned(),
        id,
    }))
}

fn respond(artifact: &Artifact) -> anyhow::Result<()> {
    let line = encode_artifact(artifact)?;
    // Shares stdout with the log writer; one locked write keeps the line whole.
    let mut stdout = io::stdout().lock();
    stdout.write_all(&line)?;
    stdout.flush()?;
    Ok(())
}
