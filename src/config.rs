use crate::core::templates::MaterializeMode;
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for both timeouts (1 hour)
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Deadline for apply deployments (default: 300s)
    ///
    /// Clamped to 1..=3600 seconds on load.
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    /// Deadline for rollback, audit and flush (default: 120s)
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// Write a backup artifact before every apply
    #[serde(default = "default_true")]
    pub backup_enabled: bool,
    #[serde(default = "default_backup_kind")]
    pub backup_artifact_kind: String,
    /// Backups kept per agent by the directory artifact store
    #[serde(default = "default_max_backups")]
    pub max_backups_per_agent: usize,
    /// Capability an agent must advertise before deployments target it
    #[serde(default = "default_capability")]
    pub required_capability: String,
    /// Run at most one deployment per agent at a time
    #[serde(default = "default_true")]
    pub serialize_per_agent: bool,
    #[serde(default)]
    pub materialize_mode: MaterializeMode,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            apply_timeout_secs: default_apply_timeout(),
            action_timeout_secs: default_action_timeout(),
            backup_enabled: true,
            backup_artifact_kind: default_backup_kind(),
            max_backups_per_agent: default_max_backups(),
            required_capability: default_capability(),
            serialize_per_agent: true,
            materialize_mode: MaterializeMode::default(),
        }
    }
}

impl ServiceConfig {
    /// Clamps timeouts into range and repairs empty strings.
    pub fn normalized(mut self) -> Self {
        self.apply_timeout_secs = self.apply_timeout_secs.clamp(1, MAX_TIMEOUT_SECS);
        self.action_timeout_secs = self.action_timeout_secs.clamp(1, MAX_TIMEOUT_SECS);
        self.max_backups_per_agent = self.max_backups_per_agent.max(1);
        if self.backup_artifact_kind.trim().is_empty() {
            self.backup_artifact_kind = default_backup_kind();
        }
        if self.required_capability.trim().is_empty() {
            self.required_capability = default_capability();
        }
        self
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_apply_timeout() -> u64 {
    300
}

fn default_action_timeout() -> u64 {
    120
}

fn default_backup_kind() -> String {
    "firewall-backup".to_string()
}

fn default_max_backups() -> usize {
    10
}

fn default_capability() -> String {
    "nftables".to_string()
}

/// `<config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(config: &ServiceConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    // Create file with restrictive permissions from the start to prevent
    // race condition where file is briefly world-readable
    {
        use tokio::io::AsyncWriteExt;

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?; // Ensure data is flushed to physical media
    }

    // Atomic rename
    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from `path` (or the default location), falling back to
/// defaults when the file is missing or invalid.
pub async fn load_config(path: Option<&Path>) -> ServiceConfig {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return ServiceConfig::default();
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => match serde_json::from_str::<ServiceConfig>(&json) {
            Ok(config) => config.normalized(),
            Err(e) => {
                tracing::warn!("Invalid config {:?}, using defaults: {}", path, e);
                ServiceConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServiceConfig::default(),
        Err(e) => {
            tracing::warn!("Failed to read config {:?}, using defaults: {}", path, e);
            ServiceConfig::default()
        }
    }
}
