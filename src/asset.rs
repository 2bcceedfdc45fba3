use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a movie asset. Serialized with the wire spelling
/// (`DL_AND_CONVERT` etc.) used by the HTTP API and the registry file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Pending,
    Downloading,
    DlAndConvert,
    Playable,
    Ready,
    Error,
}

impl AssetStatus {
    /// All legal transitions, in one place. `Pending` is also a legal
    /// target from any state because eviction resets assets.
    pub fn can_transition_to(self, next: AssetStatus) -> bool {
        use AssetStatus::*;
        if next == Pending || next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, DlAndConvert)
                | (DlAndConvert, Playable)
                | (Playable, Ready)
                // a fully-compatible tiny file can finish before segment 0
                | (DlAndConvert, Ready)
                | (Playable, Playable)
        )
    }

    /// Streamable right now.
    pub fn is_streamable(self) -> bool {
        matches!(self, AssetStatus::Playable | AssetStatus::Ready)
    }

    /// A worker currently owns this asset (or it has finished); a second
    /// `/start` must not respawn.
    pub fn is_in_flight_or_done(self) -> bool {
        matches!(
            self,
            AssetStatus::Downloading
                | AssetStatus::DlAndConvert
                | AssetStatus::Playable
                | AssetStatus::Ready
        )
    }

    pub fn is_downloading(self) -> bool {
        matches!(self, AssetStatus::Downloading | AssetStatus::DlAndConvert)
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            AssetStatus::Pending => "PENDING",
            AssetStatus::Downloading => "DOWNLOADING",
            AssetStatus::DlAndConvert => "DL_AND_CONVERT",
            AssetStatus::Playable => "PLAYABLE",
            AssetStatus::Ready => "READY",
            AssetStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One movie known to the service. Created on the first `/start`,
/// never deleted; eviction removes files and resets the record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovieAsset {
    pub movie_id: String,
    pub magnet_uri: String,
    pub status: AssetStatus,
    /// Download progress in percent, monotonic within one download phase.
    pub progress: f64,
    /// Path of the torrent's selected file, relative to the movie directory.
    pub original_rel_path: Option<PathBuf>,
    /// Path of segment 0, relative to the movie directory. Non-null iff
    /// status is PLAYABLE or READY.
    pub streamable_rel_path: Option<PathBuf>,
    /// Source duration in seconds, recorded once probing succeeds.
    pub duration_secs: Option<f64>,
    /// Segment indexes whose extraction exhausted all retries.
    #[serde(default)]
    pub failed_segments: Vec<u32>,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MovieAsset {
    pub fn new(movie_id: String, magnet_uri: String) -> Self {
        Self {
            movie_id,
            magnet_uri,
            status: AssetStatus::Pending,
            progress: 0.0,
            original_rel_path: None,
            streamable_rel_path: None,
            duration_secs: None,
            failed_segments: Vec::new(),
            last_watched_at: None,
            created_at: Utc::now(),
        }
    }

    /// Total number of segments once the duration is known.
    pub fn total_segments(&self, segment_duration_sec: u64) -> Option<u32> {
        let duration = self.duration_secs?;
        Some((duration / segment_duration_sec as f64).ceil() as u32)
    }

    /// Reset to the pristine PENDING state, keeping identity and history.
    pub fn reset(&mut self) {
        self.status = AssetStatus::Pending;
        self.progress = 0.0;
        self.original_rel_path = None;
        self.streamable_rel_path = None;
        self.duration_secs = None;
        self.failed_segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_wire_spelling() {
        let s = serde_json::to_string(&AssetStatus::DlAndConvert).unwrap();
        assert_eq!(s, "\"DL_AND_CONVERT\"");
        let back: AssetStatus = serde_json::from_str("\"PLAYABLE\"").unwrap();
        assert_eq!(back, AssetStatus::Playable);
    }

    #[test]
    fn transition_table() {
        use AssetStatus::*;
        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(DlAndConvert));
        assert!(DlAndConvert.can_transition_to(Playable));
        assert!(Playable.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Pending)); // eviction
        assert!(Downloading.can_transition_to(Error));
        assert!(!Pending.can_transition_to(Playable));
        assert!(!Downloading.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Downloading));
    }

    #[test]
    fn segment_count_rounds_up() {
        let mut asset = MovieAsset::new("42".into(), "magnet:?xt=urn:btih:AAAA".into());
        assert_eq!(asset.total_segments(600), None);
        asset.duration_secs = Some(1800.0);
        assert_eq!(asset.total_segments(600), Some(3));
        asset.duration_secs = Some(1801.0);
        assert_eq!(asset.total_segments(600), Some(4));
        asset.duration_secs = Some(1.0);
        assert_eq!(asset.total_segments(600), Some(1));
    }

    #[test]
    fn reset_clears_download_state() {
        let mut asset = MovieAsset::new("42".into(), "magnet:?xt=urn:btih:AAAA".into());
        asset.status = AssetStatus::Ready;
        asset.progress = 100.0;
        asset.original_rel_path = Some("movie.mkv".into());
        asset.streamable_rel_path = Some("movie_segment_000.mp4".into());
        asset.duration_secs = Some(5400.0);
        asset.failed_segments = vec![3];
        let created = asset.created_at;

        asset.reset();

        assert_eq!(asset.status, AssetStatus::Pending);
        assert_eq!(asset.progress, 0.0);
        assert!(asset.original_rel_path.is_none());
        assert!(asset.streamable_rel_path.is_none());
        assert!(asset.duration_secs.is_none());
        assert!(asset.failed_segments.is_empty());
        assert_eq!(asset.created_at, created);
    }
}
