use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use reelstream::asset::AssetStatus;
use reelstream::config::Config;
use reelstream::http::{router, AppState};
use reelstream::library::MovieLibrary;
use reelstream::pipeline::WorkerLauncher;
use reelstream::store::SegmentStore;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const MAGNET: &str = "magnet:?xt=urn:btih:AAAA";

#[derive(Default)]
struct RecordingLauncher {
    launches: AtomicUsize,
}

impl WorkerLauncher for RecordingLauncher {
    fn launch(&self, _movie_id: String) {
        self.launches.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    _tmp: TempDir,
    state: AppState,
    launcher: Arc<RecordingLauncher>,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.download_root = tmp.path().to_path_buf();
    let store = SegmentStore::new(cfg.movies_dir());
    let library = Arc::new(
        MovieLibrary::new(
            cfg.movies_dir().join("library.json"),
            store.clone(),
            cfg.evict_after_days,
        )
        .unwrap(),
    );
    let launcher = Arc::new(RecordingLauncher::default());
    let state = AppState {
        cfg,
        library,
        store,
        launcher: launcher.clone(),
    };
    Fixture {
        _tmp: tmp,
        state,
        launcher,
    }
}

/// Deterministic segment content so range responses can be compared
/// byte-for-byte.
fn segment_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|b| (b % 251) as u8).collect()
}

/// Put an asset into PLAYABLE with `sizes.len()` segments on disk.
async fn seed_playable(fx: &Fixture, movie_id: &str, sizes: &[usize]) {
    let rel = Path::new("film.mkv");
    fx.state.library.upsert_for_start(movie_id, MAGNET).await;
    fx.state.store.reserve(movie_id).unwrap();
    for (i, len) in sizes.iter().enumerate() {
        let path = fx.state.store.segment_path(movie_id, rel, i as u32);
        std::fs::write(path, segment_bytes(*len)).unwrap();
    }
    fx.state
        .library
        .update(movie_id, |a| {
            a.status = AssetStatus::Playable;
            a.progress = 42.0;
            a.original_rel_path = Some(rel.to_path_buf());
            a.streamable_rel_path = Some(SegmentStore::segment_rel_path(rel, 0));
            a.duration_secs = Some(1800.0);
        })
        .await
        .unwrap();
}

async fn send(fx: &Fixture, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router(fx.state.clone()).oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, body)
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

fn post_start(movie_id: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/video/{movie_id}/start"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn start_without_magnet_is_rejected() {
    let fx = fixture();
    let (status, _, body) = send(&fx, post_start("99", "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "Magnet link is required");
    assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_without_body_is_rejected() {
    let fx = fixture();
    let req = Request::builder()
        .method("POST")
        .uri("/video/99/start")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "Magnet link is required");
}

#[tokio::test]
async fn start_rejects_non_magnet_uris() {
    let fx = fixture();
    let (status, _, body) =
        send(&fx, post_start("42", r#"{"magnet_link":"http://not.a.magnet"}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"], "Invalid magnet link format");
}

#[tokio::test]
async fn start_spawns_a_worker_and_reports_pending() {
    let fx = fixture();
    let (status, _, body) = send(
        &fx,
        post_start("42", &format!(r#"{{"magnet_link":"{MAGNET}"}}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["progress"], 0.0);
    assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_is_idempotent_while_a_worker_owns_the_asset() {
    let fx = fixture();
    send(
        &fx,
        post_start("42", &format!(r#"{{"magnet_link":"{MAGNET}"}}"#)),
    )
    .await;
    // the (stubbed) worker has picked the asset up
    fx.state
        .library
        .transition("42", AssetStatus::Downloading)
        .await
        .unwrap();

    let (status, _, body) = send(
        &fx,
        post_start("42", &format!(r#"{{"magnet_link":"{MAGNET}"}}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["status"], "DOWNLOADING");
    assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn status_of_unknown_movie_is_404() {
    let fx = fixture();
    let (status, _, body) = send(&fx, get("/video/404/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"], "Movie not found");
}

#[tokio::test]
async fn status_reports_playable_asset() {
    let fx = fixture();
    seed_playable(&fx, "42", &[100, 100]).await;

    let (status, _, body) = send(&fx, get("/video/42/status")).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "PLAYABLE");
    assert_eq!(body["ready"], true);
    assert_eq!(body["downloading"], false);
    assert_eq!(body["available_segments"], 2);
    assert_eq!(body["total_duration"], 1800.0);
    assert_eq!(body["segment_duration"], 600);
    assert_eq!(body["file_path"], "film_segment_000.mp4");
}

#[tokio::test]
async fn segments_listing_has_sizes_and_totals() {
    let fx = fixture();
    seed_playable(&fx, "42", &[10, 20]).await;

    let (status, _, body) = send(&fx, get("/video/42/segments")).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    let segments = body["available_segments"].as_array().unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0]["segment"], 0);
    assert_eq!(segments[0]["filename"], "film_segment_000.mp4");
    assert_eq!(segments[0]["size"], 10);
    assert_eq!(segments[1]["size"], 20);
    // 1800 s at 600 s per segment
    assert_eq!(body["total_segments"], 3);
    assert_eq!(body["total_duration"], 1800.0);
}

#[tokio::test]
async fn stream_refuses_before_playable() {
    let fx = fixture();
    fx.state.library.upsert_for_start("42", MAGNET).await;

    let (status, _, body) = send(&fx, get("/video/42/stream?segment=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["error"]
        .as_str()
        .unwrap()
        .contains("not ready"));
}

#[tokio::test]
async fn stream_refuses_segments_past_high_water_mark() {
    let fx = fixture();
    seed_playable(&fx, "42", &[100]).await;

    let (status, _, body) = send(&fx, get("/video/42/stream?segment=5")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"], "Segment 5 not available");
}

#[tokio::test]
async fn stream_rejects_garbage_segment_numbers() {
    let fx = fixture();
    seed_playable(&fx, "42", &[100]).await;

    let (status, _, _) = send(&fx, get("/video/42/stream?segment=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_serves_full_segment_without_range() {
    let fx = fixture();
    seed_playable(&fx, "42", &[1000]).await;

    let (status, headers, body) = send(&fx, get("/video/42/stream?segment=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE.as_str()], "video/mp4");
    assert_eq!(headers[header::ACCEPT_RANGES.as_str()], "bytes");
    assert_eq!(headers[header::CONTENT_LENGTH.as_str()], "1000");
    assert_eq!(body, segment_bytes(1000));
}

#[tokio::test]
async fn stream_defaults_to_segment_zero() {
    let fx = fixture();
    seed_playable(&fx, "42", &[64]).await;

    let (status, _, body) = send(&fx, get("/video/42/stream")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, segment_bytes(64));
}

#[tokio::test]
async fn stream_honors_byte_ranges() {
    let fx = fixture();
    seed_playable(&fx, "42", &[100, 1000]).await;

    let req = Request::builder()
        .uri("/video/42/stream?segment=1")
        .header(header::RANGE, "bytes=0-499")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_LENGTH.as_str()], "500");
    assert_eq!(headers[header::CONTENT_RANGE.as_str()], "bytes 0-499/1000");
    assert_eq!(body, segment_bytes(1000)[..500].to_vec());
}

#[tokio::test]
async fn stream_serves_mid_file_ranges() {
    let fx = fixture();
    seed_playable(&fx, "42", &[1000]).await;

    let req = Request::builder()
        .uri("/video/42/stream?segment=0")
        .header(header::RANGE, "bytes=900-")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_RANGE.as_str()], "bytes 900-999/1000");
    assert_eq!(body, segment_bytes(1000)[900..].to_vec());
}

#[tokio::test]
async fn stream_returns_416_for_out_of_bounds_ranges() {
    let fx = fixture();
    seed_playable(&fx, "42", &[1000]).await;

    let req = Request::builder()
        .uri("/video/42/stream?segment=0")
        .header(header::RANGE, "bytes=1000-")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&fx, req).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn stream_records_watch_time() {
    let fx = fixture();
    seed_playable(&fx, "42", &[100]).await;
    assert!(fx
        .state
        .library
        .get("42")
        .await
        .unwrap()
        .last_watched_at
        .is_none());

    send(&fx, get("/video/42/stream?segment=0")).await;

    assert!(fx
        .state
        .library
        .get("42")
        .await
        .unwrap()
        .last_watched_at
        .is_some());
}

#[tokio::test]
async fn cors_allows_any_origin() {
    let fx = fixture();
    seed_playable(&fx, "42", &[100]).await;

    let req = Request::builder()
        .uri("/video/42/status")
        .header(header::ORIGIN, "http://player.example")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&fx, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["access-control-allow-origin"], "*");
}
