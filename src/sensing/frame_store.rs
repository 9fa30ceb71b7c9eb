use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Frames on disk, named by detail hash. Byte-identical captures map to the
/// same file, so an exact repeat costs a row but no new content.
#[derive(Debug, Clone)]
pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create frame directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path_for(&self, detail_hash: &str) -> PathBuf {
        self.root.join(format!("{detail_hash}.png"))
    }

    /// Writes the frame unless a file for this hash already exists.
    /// Returns the path and whether anything was written.
    pub async fn persist(&self, detail_hash: &str, bytes: &[u8]) -> Result<(PathBuf, bool)> {
        let path = self.path_for(detail_hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok((path, false));
        }

        // the final name only ever holds a complete frame
        let tmp = self.root.join(format!("{detail_hash}.png.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write frame {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move frame into {}", path.display()))?;
        Ok((path, true))
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read frame {}", path.display()))
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove frame {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_identical_frames_share_one_file() {
        let dir = TempDir::new().unwrap();
        let store = FrameStore::new(dir.path().join("frames")).unwrap();

        let (first, wrote_first) = store.persist("abc", b"frame").await.unwrap();
        let (second, wrote_second) = store.persist("abc", b"frame").await.unwrap();

        assert_eq!(first, second);
        assert!(wrote_first);
        assert!(!wrote_second);
        assert_eq!(store.read(&first).await.unwrap(), b"frame");
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = FrameStore::new(dir.path().to_path_buf()).unwrap();
        store.remove(&store.path_for("nope")).await.unwrap();
    }
}
