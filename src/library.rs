use crate::asset::{AssetStatus, MovieAsset};
use crate::store::SegmentStore;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of every movie the service has ever been asked to stream,
/// persisted as JSON next to the movie directories. The pipeline worker is
/// the only writer for an asset between PENDING and READY; the HTTP layer
/// writes `last_watched_at` only. Readers always get cloned snapshots.
pub struct MovieLibrary {
    file_path: PathBuf,
    store: SegmentStore,
    evict_after_days: i64,
    assets: Arc<RwLock<HashMap<String, MovieAsset>>>,
}

impl MovieLibrary {
    pub fn new(file_path: PathBuf, store: SegmentStore, evict_after_days: i64) -> Result<Self> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let assets = if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .with_context(|| format!("failed to read {}", file_path.display()))?;
            match serde_json::from_str(&content) {
                Ok(assets) => assets,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {e}, starting empty", file_path.display());
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            file_path,
            store,
            evict_after_days,
            assets: Arc::new(RwLock::new(assets)),
        })
    }

    /// Demote assets a dead worker left mid-flight back to PENDING. Called
    /// once at startup, before any worker spawns.
    pub async fn recover_interrupted(&self) {
        let mut assets = self.assets.write().await;
        let mut changed = false;
        for asset in assets.values_mut() {
            if asset.status.is_downloading() {
                tracing::info!(movie_id = %asset.movie_id, "recovering interrupted download");
                asset.reset();
                changed = true;
            }
        }
        if changed {
            self.persist(&assets);
        }
    }

    pub async fn get(&self, movie_id: &str) -> Option<MovieAsset> {
        self.assets.read().await.get(movie_id).cloned()
    }

    /// Upsert for `POST /video/{id}/start`. Returns the asset snapshot and
    /// whether a new worker should be spawned. An asset already owned by a
    /// worker (or finished) is returned as-is.
    pub async fn upsert_for_start(&self, movie_id: &str, magnet_uri: &str) -> (MovieAsset, bool) {
        let mut assets = self.assets.write().await;
        let asset = assets
            .entry(movie_id.to_string())
            .or_insert_with(|| MovieAsset::new(movie_id.to_string(), magnet_uri.to_string()));

        self.maybe_evict(asset);

        if asset.status.is_in_flight_or_done() {
            let snapshot = asset.clone();
            self.persist(&assets);
            return (snapshot, false);
        }

        asset.magnet_uri = magnet_uri.to_string();
        asset.reset();
        let snapshot = asset.clone();
        self.persist(&assets);
        (snapshot, true)
    }

    /// Apply `f` to the asset and persist. Runs the staleness check first:
    /// any mutation of an asset unwatched for longer than the eviction
    /// threshold drops its files and resets the record (the closure then
    /// operates on the reset asset).
    pub async fn update<F>(&self, movie_id: &str, f: F) -> Result<MovieAsset>
    where
        F: FnOnce(&mut MovieAsset),
    {
        let mut assets = self.assets.write().await;
        let asset = assets
            .get_mut(movie_id)
            .with_context(|| format!("unknown movie {movie_id}"))?;
        self.maybe_evict(asset);
        f(asset);
        let snapshot = asset.clone();
        self.persist(&assets);
        Ok(snapshot)
    }

    /// Status transition with the legality table enforced in one place.
    pub async fn transition(&self, movie_id: &str, next: AssetStatus) -> Result<MovieAsset> {
        self.update(movie_id, |asset| {
            if asset.status.can_transition_to(next) {
                tracing::info!(movie_id = %asset.movie_id, from = ?asset.status, to = ?next, "status transition");
                asset.status = next;
            } else {
                tracing::warn!(movie_id = %asset.movie_id, from = ?asset.status, to = ?next, "illegal status transition ignored");
            }
        })
        .await
    }

    /// Progress is monotonic within a download phase; stale samples are
    /// dropped.
    pub async fn set_progress(&self, movie_id: &str, progress: f64) -> Result<()> {
        self.update(movie_id, |asset| {
            if progress > asset.progress {
                asset.progress = progress.min(100.0);
            }
        })
        .await?;
        Ok(())
    }

    /// The one field the HTTP layer owns. Sets the timestamp directly, so a
    /// long-unwatched movie being watched right now is not evicted from
    /// under the reader.
    pub async fn touch_watched(&self, movie_id: &str) -> Result<()> {
        let mut assets = self.assets.write().await;
        let asset = assets
            .get_mut(movie_id)
            .with_context(|| format!("unknown movie {movie_id}"))?;
        asset.last_watched_at = Some(Utc::now());
        self.persist(&assets);
        Ok(())
    }

    fn maybe_evict(&self, asset: &mut MovieAsset) {
        let Some(last_watched) = asset.last_watched_at else {
            return;
        };
        let threshold = Utc::now() - ChronoDuration::days(self.evict_after_days);
        if last_watched >= threshold {
            return;
        }
        let has_files = asset.original_rel_path.is_some() || asset.streamable_rel_path.is_some();
        if !has_files {
            return;
        }
        if let Err(e) = self.store.evict(&asset.movie_id) {
            tracing::warn!(movie_id = %asset.movie_id, "eviction failed: {e:#}");
            return;
        }
        asset.reset();
        asset.last_watched_at = None;
    }

    fn persist(&self, assets: &HashMap<String, MovieAsset>) {
        match serde_json::to_string_pretty(assets) {
            Ok(content) => {
                if let Err(e) = fs::write(&self.file_path, content) {
                    tracing::error!("failed to write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::error!("failed to serialize library: {e}"),
        }
    }
}
