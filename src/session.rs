use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use librqbit::{
    api::TorrentIdOrHash, AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent,
    Session,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Stable id for a magnet URI. Re-admitting the same magnet always lands on
/// the same handle.
pub fn fingerprint(magnet_uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(magnet_uri.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

struct ManagedHandle {
    torrent_id: usize,
    lock: Arc<Mutex<()>>,
    added_at: DateTime<Utc>,
    /// First moment we observed the torrent seeding; reset if it stops.
    seeding_since: Option<Instant>,
}

/// Owns the single librqbit session and the magnet -> handle map. A global
/// RwLock guards the map; a per-handle mutex serializes operations against
/// one torrent. The reaper copies the key list before touching any handle
/// so the global lock is never held across per-handle work.
pub struct TorrentSessionManager {
    session: Arc<Session>,
    reap_after: Duration,
    handles: RwLock<HashMap<String, ManagedHandle>>,
}

impl TorrentSessionManager {
    pub fn new(session: Arc<Session>, reap_after: Duration) -> Self {
        Self {
            session,
            reap_after,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Add a magnet to the session, downloading into `save_path`. Idempotent:
    /// the same magnet maps to the same handle id and a single swarm entry.
    pub async fn admit(&self, magnet_uri: &str, save_path: &Path) -> Result<String> {
        let handle_id = fingerprint(magnet_uri);
        if self.handles.read().await.contains_key(&handle_id) {
            return Ok(handle_id);
        }

        let opts = AddTorrentOptions {
            overwrite: true,
            output_folder: Some(save_path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(AddTorrent::from_url(magnet_uri), Some(opts))
            .await
            .context("failed to add torrent to session")?;

        let torrent_id = match response {
            AddTorrentResponse::Added(id, _) => id,
            AddTorrentResponse::AlreadyManaged(id, _) => {
                tracing::info!(%handle_id, "torrent already managed by session");
                id
            }
            AddTorrentResponse::ListOnly(_) => {
                anyhow::bail!("unexpected list-only response for {handle_id}")
            }
        };

        let mut handles = self.handles.write().await;
        handles
            .entry(handle_id.clone())
            .or_insert_with(|| ManagedHandle {
                torrent_id,
                lock: Arc::new(Mutex::new(())),
                added_at: Utc::now(),
                seeding_since: None,
            });
        tracing::info!(%handle_id, torrent_id, "admitted torrent");
        Ok(handle_id)
    }

    pub async fn handle(&self, handle_id: &str) -> Option<Arc<ManagedTorrent>> {
        let torrent_id = self.handles.read().await.get(handle_id)?.torrent_id;
        self.session.get(TorrentIdOrHash::Id(torrent_id))
    }

    pub async fn lock(&self, handle_id: &str) -> Option<Arc<Mutex<()>>> {
        self.handles
            .read()
            .await
            .get(handle_id)
            .map(|h| h.lock.clone())
    }

    /// Gracefully remove a torrent from the session, waiting for whatever
    /// per-handle operation is in flight. Files stay on disk.
    pub async fn remove(&self, handle_id: &str) -> Result<()> {
        let (torrent_id, lock, added_at) = {
            let handles = self.handles.read().await;
            match handles.get(handle_id) {
                Some(h) => (h.torrent_id, h.lock.clone(), h.added_at),
                None => return Ok(()),
            }
        };

        let _guard = lock.lock().await;
        self.session
            .delete(TorrentIdOrHash::Id(torrent_id), false)
            .await
            .context("failed to delete torrent from session")?;
        self.handles.write().await.remove(handle_id);
        tracing::info!(
            handle_id,
            age_secs = (Utc::now() - added_at).num_seconds(),
            "removed torrent"
        );
        Ok(())
    }

    /// Background reaper: every 300 s, retire any torrent that has been
    /// seeding longer than the configured threshold.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                manager.reap_once().await;
            }
        })
    }

    async fn reap_once(&self) {
        let handle_ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        for handle_id in handle_ids {
            let seeding = match self.handle(&handle_id).await {
                Some(handle) => handle.stats().finished,
                None => false,
            };

            let ripe = {
                let mut handles = self.handles.write().await;
                match handles.get_mut(&handle_id) {
                    Some(entry) if seeding => {
                        let since = entry.seeding_since.get_or_insert_with(Instant::now);
                        since.elapsed() >= self.reap_after
                    }
                    Some(entry) => {
                        entry.seeding_since = None;
                        false
                    }
                    None => false,
                }
            };

            if ripe {
                tracing::info!(%handle_id, "reaping torrent seeding past threshold");
                if let Err(e) = self.remove(&handle_id).await {
                    tracing::warn!(%handle_id, "reaper failed to remove torrent: {e:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let magnet = "magnet:?xt=urn:btih:AAAA&dn=movie";
        assert_eq!(fingerprint(magnet), fingerprint(magnet));
        assert_eq!(fingerprint(magnet).len(), 16);
    }

    #[test]
    fn fingerprint_distinguishes_magnets() {
        assert_ne!(
            fingerprint("magnet:?xt=urn:btih:AAAA"),
            fingerprint("magnet:?xt=urn:btih:BBBB")
        );
    }
}
