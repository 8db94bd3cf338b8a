//! Render command implementation for Folio CLI.
//!
//! Renders every file through one renderer process. Jobs are queued
//! together and settle one at a time; results are printed in input order.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use folio_core::{Renderer, RendererConfig};
use serde_json::{Value, json};

/// Arguments of `folio render`.
pub struct RenderRequest {
    pub files: Vec<PathBuf>,
    pub renderer: Option<PathBuf>,
    pub args: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub options: Vec<String>,
    pub reap: bool,
}

/// Render the requested files.
pub async fn execute(request: RenderRequest) -> anyhow::Result<()> {
    let config = build_config(&request)?;

    // Read everything up front so a typo fails before a renderer starts.
    let mut documents = Vec::with_capacity(request.files.len());
    for path in &request.files {
        let html = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        documents.push((path, html));
    }

    let renderer = Renderer::new(config);
    let submissions: Vec<_> = documents
        .into_iter()
        .map(|(path, html)| {
            let submission = renderer.render_to_artifact(html, None);
            tracing::debug!(id = %submission.id(), "queued {}", path.display());
            submission
        })
        .collect();

    let all = futures::future::join_all(submissions);
    tokio::pin!(all);
    let results = tokio::select! {
        results = &mut all => results,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, shutting down renderer");
            renderer.shutdown();
            all.await
        }
    };
    renderer.shutdown();

    let mut failed = 0;
    for (path, result) in request.files.iter().zip(results) {
        match result {
            Ok(artifact) => {
                let line = json!({
                    "file": path.display().to_string(),
                    "filename": artifact.filename,
                    "id": artifact.id,
                });
                println!("{line}");
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", path.display(), e.with_hint());
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} documents failed to render", failed, request.files.len());
    }
    Ok(())
}

fn build_config(request: &RenderRequest) -> anyhow::Result<RendererConfig> {
    let program = RendererConfig::resolve_program(request.renderer.as_deref())?;
    let mut config = RendererConfig::new(program)
        .with_args(&request.args)
        .with_reap_orphans(request.reap);

    if let Some(ms) = request.timeout_ms {
        let timeout = (ms > 0).then(|| Duration::from_millis(ms));
        config = config.with_job_timeout(timeout);
    }

    for option in &request.options {
        let (key, value) = parse_option(option)?;
        config = config.with_default_option(key, value);
    }

    Ok(config)
}

/// Parse `KEY=VALUE`. The value is taken as JSON when it parses, else as a
/// string.
fn parse_option(option: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = option
        .split_once('=')
        .with_context(|| format!("invalid option '{option}', expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("invalid option '{option}', key is empty");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}
