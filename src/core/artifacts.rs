//! Directory-backed artifact store
//!
//! Writes each artifact as pretty JSON under
//! `<root>/<tenant>/<kind>/<key components>.json` with mode `0600`, then
//! prunes the oldest files in the same directory beyond the configured
//! limit. Pruning is best-effort and never fails a write. Keys are `/`-separated; the orchestrator uses
//! `<agent>/<timestamp>_<deployment>` so the limit applies per agent.

use super::error::{Error, Result};
use super::executor::ArtifactStore;
use super::firewall::TenantId;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub struct DirectoryArtifactStore {
    root: PathBuf,
    max_per_dir: usize,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>, max_per_dir: usize) -> Self {
        Self {
            root: root.into(),
            max_per_dir: max_per_dir.max(1),
        }
    }

    /// Store under the XDG state directory (`<state>/artifacts`).
    pub fn in_state_dir(max_per_dir: usize) -> Result<Self> {
        let mut root = crate::utils::get_state_dir()
            .ok_or_else(|| Error::Internal("Failed to get state directory".to_string()))?;
        root.push("artifacts");
        Ok(Self::new(root, max_per_dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, tenant_id: TenantId, key: &str, kind: &str) -> Result<PathBuf> {
        let mut path = self.root.join(tenant_id.to_string());
        path.push(
            sanitize_component(kind)
                .ok_or_else(|| Error::validation("kind", "invalid artifact kind"))?,
        );

        let components: Vec<String> = key
            .split('/')
            .map(sanitize_component)
            .collect::<Option<_>>()
            .ok_or_else(|| Error::validation("key", format!("invalid artifact key '{key}'")))?;
        let Some((file, dirs)) = components.split_last() else {
            return Err(Error::validation("key", "artifact key cannot be empty"));
        };

        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{file}.json"));
        Ok(path)
    }

    /// Removes the oldest artifacts in `dir`, keeping `max_per_dir`.
    async fn prune(&self, dir: &Path) -> Result<()> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
                files.push((modified, path));
            }
        }

        // Newest first
        files.sort_by(|a, b| b.cmp(a));

        for (_, path) in files.into_iter().skip(self.max_per_dir) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove old artifact {:?}: {}", path, e);
            } else {
                info!("Removed old artifact: {:?}", path);
            }
        }
        Ok(())
    }
}

/// Keeps `[A-Za-z0-9._-]`, replaces anything else with `_`; rejects empty
/// and dot-only components.
fn sanitize_component(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        None
    } else {
        Some(cleaned)
    }
}

async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}

#[async_trait]
impl ArtifactStore for DirectoryArtifactStore {
    async fn create_artifact(
        &self,
        tenant_id: TenantId,
        key: &str,
        kind: &str,
        content: Value,
    ) -> Result<String> {
        let path = self.artifact_path(tenant_id, key, kind)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("artifact path has no parent: {path:?}")))?
            .to_path_buf();
        create_private_dir(&dir).await?;

        let json = serde_json::to_string_pretty(&content)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        info!("Artifact saved to {:?}", path);

        // The artifact is already durable; a failed prune only leaves extras
        if let Err(e) = self.prune(&dir).await {
            warn!("Failed to prune old artifacts in {:?}: {}", dir, e);
        }

        Ok(path.display().to_string())
    }
}
