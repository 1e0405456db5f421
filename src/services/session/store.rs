//! On-disk persistence of the session artifact

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::models::SessionArtifact;
use crate::services::output::publish::write_atomic;

/// JSON file holding the last captured session
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted artifact. A missing or unreadable file is `None`.
    pub async fn load(&self) -> Option<SessionArtifact> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read session file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<SessionArtifact>(&content) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                tracing::warn!("Ignoring corrupt session file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, artifact: &SessionArtifact) -> Result<()> {
        let content = serde_json::to_vec_pretty(artifact)?;
        write_atomic(&self.path, &content)
            .await
            .with_context(|| format!("Failed to persist session to {}", self.path.display()))?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove session file"),
        }
    }
}
