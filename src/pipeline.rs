use crate::asset::AssetStatus;
use crate::config::Config;
use crate::library::MovieLibrary;
use crate::media;
use crate::session::TorrentSessionManager;
use crate::store::SegmentStore;
use anyhow::{Context, Result};
use librqbit::ManagedTorrent;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

/// Extra progress demanded on top of a segment's byte share, because
/// progress percent does not map exactly to byte offset across pieces.
const SAFETY_MARGIN_PCT: f64 = 5.0;

/// Seam between the HTTP layer and the worker pool, so handlers do not need
/// a live swarm session behind them to be exercised.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, movie_id: String);
}

/// Spawns and de-duplicates one background worker per movie. The worker owns
/// every asset mutation from DOWNLOADING to the terminal state.
pub struct Pipeline {
    cfg: Config,
    library: Arc<MovieLibrary>,
    store: SegmentStore,
    sessions: Arc<TorrentSessionManager>,
    workers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        cfg: Config,
        library: Arc<MovieLibrary>,
        store: SegmentStore,
        sessions: Arc<TorrentSessionManager>,
    ) -> Self {
        Self {
            cfg,
            library,
            store,
            sessions,
            workers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn run_worker(self: Arc<Self>, movie_id: String) {
        tracing::info!(%movie_id, "pipeline worker started");
        match self.drive(&movie_id).await {
            Ok(()) => tracing::info!(%movie_id, "pipeline worker finished"),
            Err(e) => {
                tracing::error!(%movie_id, "pipeline worker failed: {e:#}");
                let result = self
                    .library
                    .update(&movie_id, |a| {
                        a.status = AssetStatus::Error;
                        a.streamable_rel_path = None;
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!(%movie_id, "failed to record error status: {e:#}");
                }
            }
        }
    }

    /// The whole download+segment protocol. Every error that escapes this
    /// function resolves into an ERROR status write in `run_worker`; nothing
    /// panics outward.
    async fn drive(&self, movie_id: &str) -> Result<()> {
        let asset = self
            .library
            .get(movie_id)
            .await
            .with_context(|| format!("unknown movie {movie_id}"))?;
        let magnet = asset.magnet_uri.clone();

        self.library
            .transition(movie_id, AssetStatus::Downloading)
            .await?;
        let movie_dir = self.store.reserve(movie_id)?;

        let handle_id = self.sessions.admit(&magnet, &movie_dir).await?;
        let lock = self
            .sessions
            .lock(&handle_id)
            .await
            .context("torrent lock missing after admit")?;
        let _guard = lock.lock_owned().await;
        let handle = self
            .sessions
            .handle(&handle_id)
            .await
            .context("torrent handle missing after admit")?;

        handle
            .wait_until_initialized()
            .await
            .context("waiting for torrent metadata")?;

        // The largest file in the torrent is the movie.
        let (file_idx, original_rel) = handle
            .with_metadata(|meta| {
                meta.file_infos
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, fi)| fi.len)
                    .map(|(idx, fi)| (idx, fi.relative_filename.clone()))
            })?
            .context("torrent has no files")?;
        tracing::info!(movie_id, file = %original_rel.display(), "selected target file");

        self.library
            .update(movie_id, |a| a.original_rel_path = Some(original_rel.clone()))
            .await?;

        // Draining the file stream from offset 0 makes librqbit fetch pieces
        // in file order, so early byte ranges land on disk first.
        let sequencer = spawn_sequential_reader(handle.clone(), file_idx);

        let result = self
            .download_and_segment(movie_id, &handle, &original_rel)
            .await;
        sequencer.abort();
        result
    }

    async fn download_and_segment(
        &self,
        movie_id: &str,
        handle: &Arc<ManagedTorrent>,
        original_rel: &Path,
    ) -> Result<()> {
        let original_abs = self.store.original_path(movie_id, original_rel);
        let mut run = SegmentRun::new(&self.cfg);
        let mut source: Option<SourceInfo> = None;

        loop {
            let stats = handle.stats();
            let progress = if stats.total_bytes > 0 {
                stats.progress_bytes as f64 / stats.total_bytes as f64 * 100.0
            } else {
                0.0
            };
            self.library.set_progress(movie_id, progress).await?;

            if source.is_none() {
                source = self.try_probe(movie_id, &original_abs).await?;
            }

            if let Some(src) = &source {
                self.pump_segments(movie_id, &mut run, &original_abs, original_rel, src, progress)
                    .await?;
            }

            if stats.finished {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        // Fully downloaded; if probing never succeeded the file is beyond
        // repair for streaming purposes.
        let src = match source {
            Some(src) => src,
            None => self
                .try_probe(movie_id, &original_abs)
                .await?
                .context("could not probe completed download")?,
        };

        // Drain: everything is on disk now, only retry cooldowns gate us.
        while !run.done(src.duration_secs) {
            self.pump_segments(movie_id, &mut run, &original_abs, original_rel, &src, 100.0)
                .await?;
            if !run.done(src.duration_secs) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        self.finalize(movie_id, &run).await
    }

    /// Probe the partial file. Failures are expected (and silent) while the
    /// head of the file is still holes; only a duration > 0 counts.
    async fn try_probe(&self, movie_id: &str, original_abs: &Path) -> Result<Option<SourceInfo>> {
        if !original_abs.exists() {
            return Ok(None);
        }
        match media::probe(original_abs).await {
            Ok(info) => {
                let Some(duration) = info.duration_secs.filter(|d| *d > 0.0) else {
                    return Ok(None);
                };
                let copy_streams = info.is_browser_compatible();
                self.library
                    .update(movie_id, |a| a.duration_secs = Some(duration))
                    .await?;
                self.library
                    .transition(movie_id, AssetStatus::DlAndConvert)
                    .await?;
                tracing::info!(movie_id, duration, copy_streams, "probed source");
                Ok(Some(SourceInfo {
                    duration_secs: duration,
                    copy_streams,
                }))
            }
            Err(e) => {
                tracing::debug!(movie_id, "probe not ready yet: {e}");
                Ok(None)
            }
        }
    }

    /// Extract every segment whose byte range should be on disk by now.
    /// Strictly sequential: segment N is only attempted once N-1 succeeded
    /// or permanently failed.
    async fn pump_segments(
        &self,
        movie_id: &str,
        run: &mut SegmentRun,
        original_abs: &Path,
        original_rel: &Path,
        src: &SourceInfo,
        progress: f64,
    ) -> Result<()> {
        while let Some(index) = run.next_extractable(src.duration_secs, progress) {
            let start = index as f64 * run.segment_duration_sec as f64;
            let duration = (src.duration_secs - start).min(run.segment_duration_sec as f64);
            let dst = self.store.segment_path(movie_id, original_rel, index);

            run.note_attempt(index);
            match media::extract_segment(original_abs, &dst, start, duration, src.copy_streams)
                .await
            {
                Ok(()) => {
                    tracing::info!(movie_id, segment = index, "segment extracted");
                    run.note_success(index);
                    if index == 0 {
                        let rel = SegmentStore::segment_rel_path(original_rel, 0);
                        self.library
                            .update(movie_id, |a| a.streamable_rel_path = Some(rel.clone()))
                            .await?;
                        self.library
                            .transition(movie_id, AssetStatus::Playable)
                            .await?;
                    }
                }
                Err(e) => {
                    let attempts = run.note_failure(index);
                    tracing::warn!(
                        movie_id,
                        segment = index,
                        attempts,
                        "segment extraction failed: {e}"
                    );
                    if attempts < run.max_retries {
                        // wait out the cooldown before retrying this index
                        break;
                    }
                    tracing::error!(
                        movie_id,
                        segment = index,
                        "giving up on segment after {} attempts",
                        attempts
                    );
                }
            }
        }
        Ok(())
    }

    async fn finalize(&self, movie_id: &str, run: &SegmentRun) -> Result<()> {
        let failed = run.failed_segments();
        if !failed.is_empty() {
            self.library
                .update(movie_id, |a| a.failed_segments = failed.clone())
                .await?;
        }

        if failed.is_empty() {
            self.library.set_progress(movie_id, 100.0).await?;
            self.library.transition(movie_id, AssetStatus::Ready).await?;
            Ok(())
        } else if run.succeeded(0) {
            // playable head, holes further in; stay PLAYABLE
            tracing::warn!(movie_id, ?failed, "finished with failed segments");
            Ok(())
        } else {
            anyhow::bail!("segment 0 could not be extracted")
        }
    }
}

impl WorkerLauncher for Arc<Pipeline> {
    fn launch(&self, movie_id: String) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(existing) = workers.get(&movie_id) {
            if !existing.is_finished() {
                tracing::debug!(%movie_id, "worker already running, not respawning");
                return;
            }
        }
        let pipeline = Arc::clone(self);
        let id = movie_id.clone();
        let handle = tokio::spawn(pipeline.run_worker(id));
        workers.insert(movie_id, handle);
    }
}

fn spawn_sequential_reader(handle: Arc<ManagedTorrent>, file_idx: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        match handle.stream(file_idx) {
            Ok(mut stream) => {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!("sequential reader stopped: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("sequential reader unavailable: {e:#}"),
        }
    })
}

#[derive(Clone, Copy, Debug)]
struct SourceInfo {
    duration_secs: f64,
    copy_streams: bool,
}

/// Per-worker extraction bookkeeping: the sequential cursor, retry counts,
/// cooldown timestamps and the permanent-failure set.
struct SegmentRun {
    segment_duration_sec: u64,
    max_retries: u32,
    retry_cooldown: Duration,
    next: u32,
    processed: HashSet<u32>,
    failed: Vec<u32>,
    retries: HashMap<u32, u32>,
    last_attempt: HashMap<u32, Instant>,
}

impl SegmentRun {
    fn new(cfg: &Config) -> Self {
        Self {
            segment_duration_sec: cfg.segment_duration_sec,
            max_retries: cfg.max_retries,
            retry_cooldown: cfg.retry_cooldown,
            next: 0,
            processed: HashSet::new(),
            failed: Vec::new(),
            retries: HashMap::new(),
            last_attempt: HashMap::new(),
        }
    }

    fn total_segments(&self, duration_secs: f64) -> u32 {
        (duration_secs / self.segment_duration_sec as f64).ceil() as u32
    }

    /// Progress needed before segment `index` can be cut: its share of the
    /// runtime plus the safety margin, capped at 100.
    fn required_progress(&self, index: u32, duration_secs: f64) -> f64 {
        let d = self.segment_duration_sec as f64;
        let needed = ((index + 1) as f64 * d / duration_secs) * 100.0 + SAFETY_MARGIN_PCT;
        needed.min(100.0)
    }

    /// The index to attempt now, if its bytes should be available and its
    /// cooldown (when retrying) has passed.
    fn next_extractable(&self, duration_secs: f64, progress: f64) -> Option<u32> {
        if self.next >= self.total_segments(duration_secs) {
            return None;
        }
        if progress < self.required_progress(self.next, duration_secs) {
            return None;
        }
        if !self.cooldown_passed(self.next) {
            return None;
        }
        Some(self.next)
    }

    fn cooldown_passed(&self, index: u32) -> bool {
        match self.last_attempt.get(&index) {
            Some(at) => at.elapsed() >= self.retry_cooldown,
            None => true,
        }
    }

    fn note_attempt(&mut self, index: u32) {
        self.last_attempt.insert(index, Instant::now());
    }

    fn note_success(&mut self, index: u32) {
        self.processed.insert(index);
        self.next = index + 1;
    }

    /// Returns the attempt count so far; advances past the segment once
    /// retries are exhausted.
    fn note_failure(&mut self, index: u32) -> u32 {
        let count = self.retries.entry(index).or_insert(0);
        *count += 1;
        let count = *count;
        if count >= self.max_retries {
            self.failed.push(index);
            self.next = index + 1;
        }
        count
    }

    fn done(&self, duration_secs: f64) -> bool {
        self.next >= self.total_segments(duration_secs)
    }

    fn succeeded(&self, index: u32) -> bool {
        self.processed.contains(&index)
    }

    fn failed_segments(&self) -> Vec<u32> {
        self.failed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> SegmentRun {
        SegmentRun::new(&Config::default())
    }

    #[test]
    fn required_progress_includes_safety_margin() {
        let run = run();
        // 600 s segments over a 6000 s movie: each segment is 10%
        assert_eq!(run.required_progress(0, 6000.0), 15.0);
        assert_eq!(run.required_progress(4, 6000.0), 55.0);
        // capped at 100 for the tail
        assert_eq!(run.required_progress(9, 6000.0), 100.0);
    }

    #[test]
    fn segment_zero_waits_for_its_bytes() {
        let run = run();
        assert_eq!(run.next_extractable(6000.0, 10.0), None);
        assert_eq!(run.next_extractable(6000.0, 15.0), Some(0));
    }

    #[test]
    fn sequential_cursor_advances_on_success() {
        let mut run = run();
        assert_eq!(run.next_extractable(6000.0, 100.0), Some(0));
        run.note_success(0);
        assert_eq!(run.next_extractable(6000.0, 100.0), Some(1));
        assert!(run.succeeded(0));
        assert!(!run.done(6000.0));
    }

    #[test]
    fn exhausted_retries_mark_failed_and_advance() {
        let mut run = run();
        assert_eq!(run.note_failure(0), 1);
        assert_eq!(run.note_failure(0), 2);
        assert_eq!(run.note_failure(0), 3);
        assert_eq!(run.failed_segments(), vec![0]);
        // cursor moved past the failed segment
        run.last_attempt.clear();
        assert_eq!(run.next_extractable(6000.0, 100.0), Some(1));
    }

    #[test]
    fn cooldown_gates_retries() {
        let mut run = run();
        run.note_attempt(0);
        run.note_failure(0);
        assert_eq!(run.next_extractable(6000.0, 100.0), None);
        // pretend the cooldown elapsed
        run.last_attempt
            .insert(0, Instant::now() - Duration::from_secs(31));
        assert_eq!(run.next_extractable(6000.0, 100.0), Some(0));
    }

    #[test]
    fn done_when_all_segments_resolved() {
        let mut run = run();
        // a 1500 s movie has 3 segments of 600 s
        assert_eq!(run.total_segments(1500.0), 3);
        run.note_success(0);
        run.note_success(1);
        run.note_success(2);
        assert!(run.done(1500.0));
    }
}
