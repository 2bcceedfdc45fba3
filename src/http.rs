use crate::asset::AssetStatus;
use crate::config::Config;
use crate::errors::ApiError;
use crate::library::MovieLibrary;
use crate::pipeline::WorkerLauncher;
use crate::store::SegmentStore;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};

/// Read size for streamed bodies; keeps back-pressure tight and never
/// buffers a whole segment.
const STREAM_CHUNK_SIZE: usize = 8192;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub library: Arc<MovieLibrary>,
    pub store: SegmentStore,
    pub launcher: Arc<dyn WorkerLauncher>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::RANGE]);

    Router::new()
        .route("/video/{id}/start", post(start_stream))
        .route("/video/{id}/status", get(stream_status))
        .route("/video/{id}/segments", get(list_segments))
        .route("/video/{id}/stream", get(stream_segment))
        .layer(cors)
        .with_state(state)
}

#[derive(Deserialize)]
struct StartRequest {
    magnet_link: Option<String>,
}

#[derive(Serialize)]
struct StartResponse {
    status: AssetStatus,
    progress: f64,
}

async fn start_stream(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<StartResponse>, ApiError> {
    let magnet = body
        .and_then(|Json(req)| req.magnet_link)
        .filter(|m| !m.trim().is_empty());
    let Some(magnet) = magnet else {
        return Err(ApiError::InvalidInput("Magnet link is required".into()));
    };
    if !magnet.starts_with("magnet:") {
        return Err(ApiError::InvalidInput("Invalid magnet link format".into()));
    }

    let (asset, spawn) = state.library.upsert_for_start(&movie_id, &magnet).await;
    if spawn {
        state.launcher.launch(movie_id);
    }

    Ok(Json(StartResponse {
        status: asset.status,
        progress: asset.progress,
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    status: AssetStatus,
    progress: f64,
    file_path: Option<String>,
    ready: bool,
    downloading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_segments: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_duration: Option<f64>,
    segment_duration: u64,
}

async fn stream_status(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let asset = state
        .library
        .get(&movie_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Movie not found".into()))?;

    let available_segments = asset
        .original_rel_path
        .as_ref()
        .map(|rel| state.store.list_segments(&movie_id, rel));

    Ok(Json(StatusResponse {
        status: asset.status,
        progress: asset.progress,
        file_path: asset
            .streamable_rel_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        ready: asset.status.is_streamable(),
        downloading: asset.status.is_downloading(),
        available_segments,
        total_duration: asset.duration_secs,
        segment_duration: state.cfg.segment_duration_sec,
    }))
}

#[derive(Serialize)]
struct SegmentEntry {
    segment: u32,
    filename: String,
    size: u64,
}

#[derive(Serialize)]
struct SegmentsResponse {
    available_segments: Vec<SegmentEntry>,
    segment_duration: u64,
    total_segments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_duration: Option<f64>,
}

async fn list_segments(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
) -> Result<Json<SegmentsResponse>, ApiError> {
    let asset = state
        .library
        .get(&movie_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Movie not found".into()))?;

    let available_segments: Vec<SegmentEntry> = asset
        .original_rel_path
        .as_ref()
        .map(|rel| state.store.segment_sizes(&movie_id, rel))
        .unwrap_or_default()
        .into_iter()
        .map(|(segment, filename, size)| SegmentEntry {
            segment,
            filename,
            size,
        })
        .collect();

    let total_segments = asset
        .total_segments(state.cfg.segment_duration_sec)
        .unwrap_or(available_segments.len() as u32);

    Ok(Json(SegmentsResponse {
        available_segments,
        segment_duration: state.cfg.segment_duration_sec,
        total_segments,
        total_duration: asset.duration_secs,
    }))
}

async fn stream_segment(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let asset = state
        .library
        .get(&movie_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Movie not found".into()))?;

    if !asset.status.is_streamable() {
        return Err(ApiError::NotReady(format!(
            "Movie is not ready for streaming (status: {})",
            asset.status
        )));
    }

    // no segment param means initial playback: segment 0
    let index = match params.get("segment") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::InvalidInput("Invalid segment number".into()))?,
        None => 0,
    };

    let original_rel = asset
        .original_rel_path
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("Video file not found".into()))?;

    // never serve past the contiguous high-water mark
    let high_water = state.store.list_segments(&movie_id, original_rel);
    if index >= high_water {
        return Err(ApiError::NotFound(format!("Segment {index} not available")));
    }

    let path = state.store.segment_path(&movie_id, original_rel, index);
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::NotFound("Segment file not found".into()))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
        .len();

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = parse_range(range_header, size)?;

    let (status, start, end) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
        None => (StatusCode::OK, 0, size.saturating_sub(1)),
    };

    if start > 0 {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
    }
    let content_length = if size == 0 { 0 } else { end - start + 1 };
    let body = Body::from_stream(ReaderStream::with_capacity(
        file.take(content_length),
        STREAM_CHUNK_SIZE,
    ));

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, content_length.to_string())
        .header(header::ACCEPT_RANGES, "bytes");
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
    }
    let response = builder
        .body(body)
        .map_err(|e| ApiError::Internal(e.into()))?;

    if let Err(e) = state.library.touch_watched(&movie_id).await {
        tracing::warn!(%movie_id, "failed to record watch time: {e:#}");
    }

    Ok(response)
}

/// Parse a `Range: bytes=A-B` header against a body of `size` bytes.
/// `Ok(None)` means serve the whole body with 200: no header, or a form we
/// do not support (suffix ranges, multiple ranges). A first byte past the
/// end is unsatisfiable.
fn parse_range(header: Option<&str>, size: u64) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = header else {
        return Ok(None);
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Ok(None);
    };
    let Some((first, last)) = spec.split_once('-') else {
        return Ok(None);
    };
    let Ok(start) = first.trim().parse::<u64>() else {
        return Ok(None);
    };

    if start >= size {
        return Err(ApiError::RangeNotSatisfiable);
    }

    let end = match last.trim() {
        "" => size - 1,
        s => match s.parse::<u64>() {
            Ok(e) => e.min(size - 1),
            Err(_) => return Ok(None),
        },
    };
    if end < start {
        return Err(ApiError::RangeNotSatisfiable);
    }

    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_header_serves_full_body() {
        assert_eq!(parse_range(None, 1000).unwrap(), None);
    }

    #[test]
    fn open_ended_range_runs_to_eof() {
        assert_eq!(
            parse_range(Some("bytes=500-"), 1000).unwrap(),
            Some((500, 999))
        );
    }

    #[test]
    fn bounded_range() {
        assert_eq!(
            parse_range(Some("bytes=0-499999"), 1_000_000).unwrap(),
            Some((0, 499_999))
        );
    }

    #[test]
    fn end_clamps_to_size() {
        assert_eq!(
            parse_range(Some("bytes=900-2000"), 1000).unwrap(),
            Some((900, 999))
        );
    }

    #[test]
    fn start_past_eof_is_unsatisfiable() {
        assert!(matches!(
            parse_range(Some("bytes=1000-"), 1000),
            Err(ApiError::RangeNotSatisfiable)
        ));
        assert!(matches!(
            parse_range(Some("bytes=500-100"), 1000),
            Err(ApiError::RangeNotSatisfiable)
        ));
    }

    #[test]
    fn unsupported_forms_fall_back_to_full_body() {
        assert_eq!(parse_range(Some("bytes=-500"), 1000).unwrap(), None);
        assert_eq!(parse_range(Some("items=0-10"), 1000).unwrap(), None);
        assert_eq!(parse_range(Some("bytes=abc-def"), 1000).unwrap(), None);
    }
}
