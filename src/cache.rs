use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Working-directory manager for transient audio.
///
/// Everything under the root is reproducible from upstream data; nothing here
/// survives a restart on purpose.
#[derive(Debug, Clone)]
pub struct BlobCache {
    root: PathBuf,
}

impl BlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Download target for a full episode: `{root}/episodes/{id}.{ext}`.
    pub fn episode_temp(&self, episode_id: &str, ext: &str) -> PathBuf {
        self.root.join("episodes").join(format!("{episode_id}.{ext}"))
    }

    /// Chunk directory for an episode: `{root}/episodes/{id}_chunks/`.
    ///
    /// Callers create it with [`BlobCache::ensure_dir`] before writing.
    pub fn chunk_dir(&self, episode_id: &str) -> PathBuf {
        self.root.join("episodes").join(format!("{episode_id}_chunks"))
    }

    /// Per-digest work directory holding narrator and clip intermediates.
    pub fn digest_work_dir(&self, digest_id: &str) -> PathBuf {
        self.root.join("episodes").join(format!("{digest_id}_chunks"))
    }

    /// Create a directory (and parents) if missing.
    pub async fn ensure_dir(&self, path: &Path) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    /// Remove a file or directory tree; absent paths are not an error.
    pub async fn cleanup(&self, path: &Path) -> Result<(), PipelineError> {
        let result = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_follow_blob_layout() {
        let cache = BlobCache::new("/tmp/sifter");
        assert_eq!(
            cache.episode_temp("ep1", "mp3"),
            PathBuf::from("/tmp/sifter/episodes/ep1.mp3")
        );
        assert_eq!(
            cache.chunk_dir("ep1"),
            PathBuf::from("/tmp/sifter/episodes/ep1_chunks")
        );
        assert_eq!(
            cache.digest_work_dir("d1"),
            PathBuf::from("/tmp/sifter/episodes/d1_chunks")
        );
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cache = BlobCache::new(temp.path());

        let dir = cache.chunk_dir("ep1");
        cache.ensure_dir(&dir).await.unwrap();
        tokio::fs::write(dir.join("chunk_000.mp3"), b"x").await.unwrap();

        cache.cleanup(&dir).await.unwrap();
        assert!(!dir.exists());
        // Second cleanup of an absent path succeeds
        cache.cleanup(&dir).await.unwrap();

        let file = cache.episode_temp("ep1", "mp3");
        cache.ensure_dir(file.parent().unwrap()).await.unwrap();
        tokio::fs::write(&file, b"y").await.unwrap();
        cache.cleanup(&file).await.unwrap();
        cache.cleanup(&file).await.unwrap();
        assert!(!file.exists());
    }
}
