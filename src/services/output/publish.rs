//! Atomic replacement of files in the output and data directories

use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Writes a file next to its target and renames it into place on commit.
///
/// Readers never observe a partially written target. A writer dropped
/// without `commit` removes its temp file.
pub struct ArtifactWriter {
    writer: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    committed: bool,
}

impl ArtifactWriter {
    /// Open `<final_path>.tmp` for writing
    pub async fn create(final_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let final_path = final_path.into();
        let tmp_path = tmp_path_for(&final_path);

        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = File::create(&tmp_path).await?;
        let writer = BufWriter::with_capacity(64 * 1024, file); // 64KB buffer

        Ok(Self {
            writer: Some(writer),
            tmp_path,
            final_path,
            bytes_written: 0,
            committed: false,
        })
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(closed)?;
        writer.write_all(bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush and fsync the temp file without touching the target
    pub async fn finish(mut self) -> std::io::Result<StagedArtifact> {
        let mut writer = self.writer.take().ok_or_else(closed)?;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        // Release the handle before renaming
        drop(writer);

        // Temp file ownership moves to the staged artifact
        self.committed = true;
        Ok(StagedArtifact {
            tmp_path: self.tmp_path.clone(),
            final_path: self.final_path.clone(),
            bytes_written: self.bytes_written,
            placed: false,
        })
    }

    /// Flush, fsync and rename over the target
    pub async fn commit(self) -> std::io::Result<u64> {
        self.finish().await?.place().await
    }

    /// Discard the temp file without touching the target
    pub async fn abort(mut self) {
        drop(self.writer.take());
        let _ = fs::remove_file(&self.tmp_path).await;
        self.committed = true;
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.writer.take());
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// A fully written and synced temp file waiting to be renamed into place.
/// Dropped without `place`, it removes the temp file.
pub struct StagedArtifact {
    tmp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    placed: bool,
}

impl StagedArtifact {
    pub async fn place(mut self) -> std::io::Result<u64> {
        fs::rename(&self.tmp_path, &self.final_path).await?;
        self.placed = true;
        Ok(self.bytes_written)
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.placed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

fn closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "artifact writer already closed")
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    sibling_path(path, TMP_SUFFIX)
}

pub const TMP_SUFFIX: &str = ".tmp";
pub const BACKUP_SUFFIX: &str = ".prev";

/// Replace `path` with `bytes` atomically
pub async fn write_atomic(path: impl Into<PathBuf>, bytes: &[u8]) -> std::io::Result<u64> {
    let mut writer = ArtifactWriter::create(path).await?;
    writer.write_all(bytes).await?;
    writer.commit().await
}

/// Publish a set of already rendered artifacts into `out_dir`.
///
/// All-or-nothing: every artifact is written and synced to a temp file
/// first, then the renames run back to back. If any step fails, targets
/// already replaced are restored from their `.prev` copies, so readers see
/// either the whole previous set or the whole new one.
pub async fn publish_all(
    out_dir: &Path,
    artifacts: &[(String, Vec<u8>)],
) -> std::io::Result<Vec<String>> {
    fs::create_dir_all(out_dir).await?;

    let mut staged = Vec::with_capacity(artifacts.len());
    for (name, bytes) in artifacts {
        let mut writer = ArtifactWriter::create(out_dir.join(name)).await?;
        writer.write_all(bytes).await?;
        staged.push((name.clone(), writer.finish().await?));
    }

    // The swap runs to completion even if the caller is cancelled
    tokio::spawn(place_all(staged))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// (target, copy of the previous target if there was one)
type Backup = (PathBuf, Option<PathBuf>);

async fn place_all(staged: Vec<(String, StagedArtifact)>) -> std::io::Result<Vec<String>> {
    let mut backups: Vec<Backup> = Vec::with_capacity(staged.len());
    for (_, artifact) in &staged {
        match backup_existing(artifact.final_path()).await {
            Ok(backup) => backups.push(backup),
            Err(e) => {
                discard_backups(&backups).await;
                return Err(e);
            }
        }
    }

    let mut published = Vec::with_capacity(staged.len());
    for (index, (name, artifact)) in staged.into_iter().enumerate() {
        match artifact.place().await {
            Ok(size) => {
                tracing::debug!(artifact = %name, bytes = size, "Artifact published");
                published.push(name);
            }
            Err(e) => {
                tracing::error!(artifact = %name, "Publish failed, restoring previous artifacts: {}", e);
                restore_backups(&backups[..index]).await;
                discard_backups(&backups[index..]).await;
                return Err(e);
            }
        }
    }

    discard_backups(&backups).await;
    Ok(published)
}

async fn backup_existing(target: &Path) -> std::io::Result<Backup> {
    let backup = sibling_path(target, BACKUP_SUFFIX);
    let _ = fs::remove_file(&backup).await;

    match fs::hard_link(target, &backup).await {
        Ok(()) => Ok((target.to_path_buf(), Some(backup))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((target.to_path_buf(), None)),
        // Filesystems without hard links
        Err(_) => {
            fs::copy(target, &backup).await?;
            Ok((target.to_path_buf(), Some(backup)))
        }
    }
}

async fn restore_backups(backups: &[Backup]) {
    for (target, backup) in backups {
        let result = match backup {
            Some(backup) => fs::rename(backup, target).await,
            None => fs::remove_file(target).await,
        };
        if let Err(e) = result {
            tracing::warn!(target = %target.display(), "Failed to restore previous artifact: {}", e);
        }
    }
}

async fn discard_backups(backups: &[Backup]) {
    for backup in backups.iter().filter_map(|(_, b)| b.as_ref()) {
        let _ = fs::remove_file(backup).await;
    }
}
