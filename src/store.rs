use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Content-addressed on-disk layout: `<root>/<movieId>/...` holds the
/// original file (with the torrent's internal directory structure) plus
/// `<baseName>_segment_NNN.mp4` files next to it.
#[derive(Clone, Debug)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(movies_root: PathBuf) -> Self {
        Self { root: movies_root }
    }

    pub fn movie_dir(&self, movie_id: &str) -> PathBuf {
        self.root.join(movie_id)
    }

    /// Create (if needed) and return the movie's directory.
    pub fn reserve(&self, movie_id: &str) -> Result<PathBuf> {
        let dir = self.movie_dir(movie_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create movie dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Segment file name for the original `original_rel`, as a path relative
    /// to the movie directory (segments live next to the original).
    pub fn segment_rel_path(original_rel: &Path, index: u32) -> PathBuf {
        let stem = original_rel
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let name = format!("{}_segment_{:03}.mp4", stem, index);
        match original_rel.parent() {
            Some(parent) if parent != Path::new("") => parent.join(name),
            _ => PathBuf::from(name),
        }
    }

    pub fn segment_path(&self, movie_id: &str, original_rel: &Path, index: u32) -> PathBuf {
        self.movie_dir(movie_id)
            .join(Self::segment_rel_path(original_rel, index))
    }

    pub fn original_path(&self, movie_id: &str, original_rel: &Path) -> PathBuf {
        self.movie_dir(movie_id).join(original_rel)
    }

    /// Count of segments dense from index 0: stops at the first missing
    /// index, so callers never observe a gap (the high-water mark).
    pub fn list_segments(&self, movie_id: &str, original_rel: &Path) -> u32 {
        let mut n = 0;
        while self.segment_path(movie_id, original_rel, n).is_file() {
            n += 1;
        }
        n
    }

    /// `(index, file name, size in bytes)` for every dense segment.
    pub fn segment_sizes(&self, movie_id: &str, original_rel: &Path) -> Vec<(u32, String, u64)> {
        let mut out = Vec::new();
        for index in 0..self.list_segments(movie_id, original_rel) {
            let path = self.segment_path(movie_id, original_rel, index);
            let size = match fs::metadata(&path) {
                Ok(m) => m.len(),
                Err(_) => break,
            };
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push((index, filename, size));
        }
        out
    }

    /// Remove every file belonging to the movie. Metadata is not ours to
    /// touch; the registry keeps the record and resets it.
    pub fn evict(&self, movie_id: &str) -> Result<()> {
        let dir = self.movie_dir(movie_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to evict {}", dir.display()))?;
            tracing::info!(movie_id, "evicted on-disk files");
        }
        Ok(())
    }
}
