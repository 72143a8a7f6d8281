//! Transfer engine tests against a local HTTP server

mod common;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::*;
use parking_lot::Mutex;
use podcatch_core::engine::{RetryPolicy, TransferEngine, TransferEvent};
use podcatch_core::{paths, DownloadError, ErrorKind};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn engine(settings: &podcatch_types::Settings) -> TransferEngine {
    TransferEngine::new(settings).unwrap()
}

#[tokio::test]
async fn test_inconsistent_length_is_a_size_mismatch() {
    let dir = TempDir::new().unwrap();
    let router = Router::new().route(
        "/ep.mp3",
        get(|| async {
            (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, "bytes 100-199/50000")],
                payload(100),
            )
        }),
    );
    let base = serve(router).await;

    let settings = podcatch_types::Settings {
        max_retries: 0,
        ..test_settings(dir.path())
    };
    let engine = engine(&settings);
    let job = engine
        .prepare(dir.path(), &episode("ep1", &format!("{base}/ep.mp3"), "Show", "Ep"))
        .unwrap();
    std::fs::create_dir_all(job.destination.parent().unwrap()).unwrap();
    std::fs::write(job.part_path(), payload(100)).unwrap();

    let result = engine
        .download(
            &job,
            &RetryPolicy::from_settings(&settings),
            &CancellationToken::new(),
            &|_| {},
        )
        .await;

    match result {
        Err(DownloadError::RetriesExhausted { attempts, kind, .. }) => {
            assert_eq!(attempts, 1);
            assert_eq!(kind, ErrorKind::SizeMismatch);
        }
        other => panic!("expected size mismatch, got {other:?}"),
    }
    assert!(!job.destination.exists());
    assert_eq!(std::fs::metadata(job.part_path()).unwrap().len(), 200);
}

#[tokio::test]
async fn test_content_disposition_names_the_extension() {
    let dir = TempDir::new().unwrap();
    let router = Router::new().route(
        "/stream",
        get(|| async {
            (
                [(header::CONTENT_DISPOSITION, "attachment; filename=\"episode.m4a\"")],
                payload(300),
            )
        }),
    );
    let base = serve(router).await;

    let settings = test_settings(dir.path());
    let engine = engine(&settings);
    let job = engine
        .prepare(dir.path(), &episode("ep1", &format!("{base}/stream"), "Show", "Ep"))
        .unwrap();
    assert_eq!(job.destination, dir.path().join("Show").join("Ep.mp3"));
    assert!(!job.extension_from_url);

    let outcome = engine
        .download(
            &job,
            &RetryPolicy::from_settings(&settings),
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .unwrap();
    assert_eq!(outcome.path, dir.path().join("Show").join("Ep.m4a"));
    assert_eq!(outcome.bytes, 300);
    assert!(outcome.path.is_file());
    assert!(!job.part_path().exists());
}

#[tokio::test]
async fn test_existing_file_gets_unique_name() {
    let dir = TempDir::new().unwrap();
    let router = Router::new().route("/ep.mp3", get(|| async { payload(64).into_response() }));
    let base = serve(router).await;

    let taken = dir.path().join("Show").join("Ep.mp3");
    std::fs::create_dir_all(taken.parent().unwrap()).unwrap();
    std::fs::write(&taken, b"someone else's file").unwrap();

    let settings = test_settings(dir.path());
    let engine = engine(&settings);
    let job = engine
        .prepare(dir.path(), &episode("ep1", &format!("{base}/ep.mp3"), "Show", "Ep"))
        .unwrap();
    assert_eq!(job.destination, dir.path().join("Show").join("Ep (1).mp3"));

    engine
        .download(
            &job,
            &RetryPolicy::from_settings(&settings),
            &CancellationToken::new(),
            &|_| {},
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&taken).unwrap(), b"someone else's file");
    assert_eq!(std::fs::read(&job.destination).unwrap(), payload(64));
}

#[tokio::test]
async fn test_progress_is_reported_per_attempt() {
    let dir = TempDir::new().unwrap();
    let content = payload(200_000);
    let recorder = std::sync::Arc::new(Recorder::default());
    let base = serve(ranged_route("/big.mp3", content.clone(), recorder)).await;

    let settings = test_settings(dir.path());
    let engine = engine(&settings);
    let job = engine
        .prepare(dir.path(), &episode("ep1", &format!("{base}/big.mp3"), "Show", "Big"))
        .unwrap();

    let events = Mutex::new(Vec::new());
    let observer = |event: TransferEvent| events.lock().push(event);
    engine
        .download(
            &job,
            &RetryPolicy::from_settings(&settings),
            &CancellationToken::new(),
            &observer,
        )
        .await
        .unwrap();

    let events = events.into_inner();
    assert_eq!(
        events.first(),
        Some(&TransferEvent::AttemptStarted {
            offset: 0,
            total: Some(200_000)
        })
    );
    assert_eq!(events.last(), Some(&TransferEvent::Verifying));

    let mut last = 0;
    for event in &events {
        if let TransferEvent::Progress { received, .. } = event {
            assert!(*received >= last);
            last = *received;
        }
    }
    assert_eq!(last, 200_000);
}

#[tokio::test]
async fn test_cancel_before_response_stops_transfer() {
    let dir = TempDir::new().unwrap();
    let router = Router::new().route(
        "/never",
        get(|| async {
            std::future::pending::<()>().await;
            StatusCode::OK
        }),
    );
    let base = serve(router).await;

    let settings = test_settings(dir.path());
    let engine = engine(&settings);
    let job = engine
        .prepare(dir.path(), &episode("ep1", &format!("{base}/never"), "Show", "Ep"))
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = engine
        .download(&job, &RetryPolicy::from_settings(&settings), &cancel, &|_| {})
        .await;
    assert!(matches!(result, Err(DownloadError::Canceled)));
}

#[test]
fn test_rejects_unsupported_scheme() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&test_settings(dir.path()));
    let result = engine.prepare(
        dir.path(),
        &episode("ep1", "ftp://example.com/ep.mp3", "Show", "Ep"),
    );
    assert!(matches!(result, Err(DownloadError::UnsupportedScheme(s)) if s == "ftp"));
    assert!(!paths::part_path(&dir.path().join("Show").join("Ep.mp3")).exists());
}

#[tokio::test]
async fn test_progress_is_throttled_by_interval() {
    let dir = TempDir::new().unwrap();
    let router = Router::new().route(
        "/slow.mp3",
        get(|| async { trickle_response(20, 1000, std::time::Duration::from_millis(20)) }),
    );
    let base = serve(router).await;

    let settings = podcatch_types::Settings {
        progress_interval_ms: 250,
        ..test_settings(dir.path())
    };
    let engine = engine(&settings);
    let job = engine
        .prepare(dir.path(), &episode("ep1", &format!("{base}/slow.mp3"), "Show", "Slow"))
        .unwrap();

    let events = Mutex::new(Vec::new());
    let observer = |event: TransferEvent| events.lock().push(event);
    let started = std::time::Instant::now();
    engine
        .download(
            &job,
            &RetryPolicy::from_settings(&settings),
            &CancellationToken::new(),
            &observer,
        )
        .await
        .unwrap();
    let elapsed = started.elapsed().as_millis() as usize;

    let received: Vec<u64> = events
        .into_inner()
        .into_iter()
        .filter_map(|event| match event {
            TransferEvent::Progress { received, .. } => Some(received),
            _ => None,
        })
        .collect();
    // One per elapsed interval plus the final report
    assert!(received.len() <= elapsed / 250 + 2, "{received:?} in {elapsed}ms");
    assert!(received.len() < 20, "{received:?}");
    assert_eq!(received.last(), Some(&20_000));
}
