//! Shared fixtures: an in-process HTTP server and manager helpers

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use podcatch_core::{DownloadManager, EpisodeCatalog};
use podcatch_types::{DownloadState, DownloadStatus, EpisodeId, EpisodeInfo, Settings};
use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a fixture route saw
#[derive(Default)]
pub struct Recorder {
    pub hits: AtomicUsize,
    pub ranges: Mutex<Vec<Option<String>>>,
    pub times: Mutex<Vec<Instant>>,
}

impl Recorder {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().clone()
    }

    /// Record a request and return its 1-based number
    pub fn record(&self, headers: &HeaderMap) -> usize {
        self.ranges.lock().push(
            headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        self.times.lock().push(Instant::now());
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Bind `router` on an ephemeral port and return its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serve `content` at `path`, honoring `Range: bytes=N-`
pub fn ranged_route(path: &str, content: Vec<u8>, recorder: Arc<Recorder>) -> Router {
    let content = Arc::new(content);
    Router::new().route(
        path,
        get(move |headers: HeaderMap| {
            let content = content.clone();
            let recorder = recorder.clone();
            async move {
                recorder.record(&headers);
                ranged_response(&headers, &content)
            }
        }),
    )
}

pub fn ranged_response(headers: &HeaderMap, content: &[u8]) -> Response {
    let start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

    match start {
        None => Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(content.to_vec()))
            .unwrap(),
        Some(start) if start >= content.len() => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", content.len()))
            .body(Body::empty())
            .unwrap(),
        Some(start) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, content.len() - 1, content.len()),
            )
            .body(Body::from(content[start..].to_vec()))
            .unwrap(),
    }
}

/// A body that sends `first` and then never finishes
pub fn stalled_response(first: Vec<u8>, declared_len: usize) -> Response {
    let chunk = futures::stream::once(async move { Ok::<_, Infallible>(Bytes::from(first)) });
    let stream = futures::StreamExt::chain(chunk, futures::stream::pending());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, declared_len)
        .body(Body::from_stream(stream))
        .unwrap()
}

/// A body of `chunks` pieces of `chunk_len` bytes, each sent after `gap`
pub fn trickle_response(chunks: usize, chunk_len: usize, gap: Duration) -> Response {
    let stream = futures::stream::unfold(0usize, move |sent| async move {
        if sent == chunks {
            return None;
        }
        tokio::time::sleep(gap).await;
        let chunk = Bytes::from(vec![(sent % 251) as u8; chunk_len]);
        Some((Ok::<_, Infallible>(chunk), sent + 1))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, chunks * chunk_len)
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Fast settings rooted at `root`

pub fn test_settings(root: &Path) -> Settings {
    Settings {
        download_dir: Some(root.to_path_buf()),
        max_retries: 2,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        retry_jitter: 0.0,
        header_timeout_secs: 5,
        read_timeout_secs: 5,
        index_debounce_ms: 20,
        progress_interval_ms: 0,
        ..Settings::default()
    }
}

pub fn episode(id: &str, url: &str, feed: &str, title: &str) -> EpisodeInfo {
    EpisodeInfo {
        id: id.into(),
        url: url.to_string(),
        feed_title: feed.to_string(),
        episode_title: title.to_string(),
    }
}

pub async fn manager(
    settings: &Settings,
    index_path: &Path,
    episodes: Vec<EpisodeInfo>,
) -> DownloadManager {
    let catalog: EpisodeCatalog = episodes.into_iter().collect();
    DownloadManager::new(settings, index_path.to_path_buf(), Arc::new(catalog))
        .await
        .unwrap()
}

/// Poll until `id` reaches `state` or ten seconds pass
pub async fn wait_for_state(
    manager: &DownloadManager,
    id: &EpisodeId,
    state: DownloadState,
) -> DownloadStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = manager.status(id) {
            if status.state == state {
                return status;
            }
        }
        assert!(
            Instant::now() < deadline,
            "episode {id} never reached {state}: {:?}",
            manager.status(id)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
