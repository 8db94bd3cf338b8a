//! End-to-end tests driving the real `folio-worker` binary through a
//! `Renderer`.

use std::path::Path;
use std::time::Duration;

use folio_core::{Error, ErrorKind, JobId, RenderJob, Renderer, RendererConfig, SupervisorState};

fn config(dir: &Path) -> RendererConfig {
    RendererConfig::new(env!("CARGO_BIN_EXE_folio-worker"))
        .with_reap_orphans(false)
        .with_default_option("directory", dir.to_string_lossy().into_owned())
}

#[tokio::test]
async fn renders_document_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Renderer::new(config(dir.path()));

    let artifact = renderer
        .render_to_artifact("<h1>Invoice 42</h1>", Some(JobId::from("inv-42")))
        .await
        .unwrap();

    assert_eq!(artifact.id, JobId::from("inv-42"));
    let path = Path::new(&artifact.filename);
    assert_eq!(path.parent(), Some(dir.path()));
    let name = path.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("folio-inv-42-"), "{name}");
    assert!(name.ends_with(".html"), "{name}");
    assert_eq!(std::fs::read_to_string(path).unwrap(), "<h1>Invoice 42</h1>");

    let status = renderer.status();
    assert_eq!(status.state, SupervisorState::Ready);
    assert!(status.pid.is_some());
}

#[tokio::test]
async fn concurrent_jobs_share_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Renderer::new(config(dir.path()).with_default_option("type", "pdf"));

    let submissions: Vec<_> = (0..10u64)
        .map(|n| renderer.render_to_artifact(format!("<p>page {n}</p>"), Some(JobId::Number(n))))
        .collect();
    let results = futures::future::join_all(submissions).await;

    for (n, result) in results.into_iter().enumerate() {
        let artifact = result.unwrap();
        assert_eq!(artifact.id, JobId::Number(n as u64));
        assert!(artifact.filename.ends_with(".pdf"));
        assert_eq!(
            std::fs::read_to_string(&artifact.filename).unwrap(),
            format!("<p>page {n}</p>")
        );
    }
    assert_eq!(renderer.status().spawn_count, 1);
}

#[tokio::test]
async fn blank_document_times_out_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Renderer::new(config(dir.path()));

    // The worker ignores empty documents, so this job never completes.
    let err = renderer
        .submit(RenderJob::new("   ").with_timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let artifact = renderer.render_to_artifact("<p>after</p>", None).await.unwrap();
    assert!(Path::new(&artifact.filename).exists());
    assert_eq!(renderer.status().spawn_count, 2);
}

#[tokio::test]
async fn write_failure_reports_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Renderer::new(config(dir.path()));

    let missing = dir.path().join("missing");
    let job = RenderJob::new("<p/>").with_option("directory", missing.to_string_lossy().into_owned());
    let err = renderer.submit(job).await.unwrap_err();

    match err {
        Error::WorkerCrash { diagnostic, .. } => {
            let diagnostic = diagnostic.unwrap();
            assert!(diagnostic.contains("folio-worker: failed to write"), "{diagnostic}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    renderer.render_to_artifact("<p/>", None).await.unwrap();
    assert_eq!(renderer.status().spawn_count, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn respawns_after_external_kill() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Renderer::new(config(dir.path()));

    renderer.render_to_artifact("<p>one</p>", None).await.unwrap();
    let pid = renderer.status().pid.unwrap();

    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(renderer.status().state, SupervisorState::Dead);

    renderer.render_to_artifact("<p>two</p>", None).await.unwrap();
    let status = renderer.status();
    assert_eq!(status.spawn_count, 2);
    assert_ne!(status.pid, Some(pid));
}

#[tokio::test]
async fn shutdown_kills_worker() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Renderer::new(config(dir.path()));

    renderer.render_to_artifact("<p/>", None).await.unwrap();
    renderer.shutdown();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(renderer.status().state, SupervisorState::Dead);
    let err = renderer.render_to_artifact("<p/>", None).await.unwrap_err();
    assert!(matches!(err, Error::ShutDown));
}
