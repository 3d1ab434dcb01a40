/// Audit logging for deployment operations
///
/// Every background deployment ends with one audit entry recording who
/// triggered it, what it targeted and whether it succeeded. Sinks are
/// best-effort: the orchestrator logs a failing sink and carries on.
use crate::core::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// A single audit entry as handed to a sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// e.g. `firewall.apply`, `firewall.rollback`
    pub action: String,

    pub resource_type: String,

    pub resource_id: String,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditEntry {
    /// Creates a successful entry
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            success: true,
            details,
            error: None,
        }
    }

    /// Marks the entry as failed with `error`
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// One persisted line of the audit log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub actor: String,

    #[serde(flatten)]
    pub entry: AuditEntry,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_audit_async(&self, actor: &str, entry: AuditEntry) -> Result<()>;
}

/// Append-only JSON-lines audit log
pub struct JsonLinesAuditLog {
    log_path: PathBuf,
}

impl JsonLinesAuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Audit log at `<state dir>/audit.log`
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn in_state_dir() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Appends a record to the audit log
    ///
    /// Records are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let json = serde_json::to_string(record)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.log_path).await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent records, newest first
    ///
    /// Lines that fail to parse are skipped. A missing log reads as empty.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditRecord>> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let records: Vec<AuditRecord> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(records)
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditLog {
    async fn log_audit_async(&self, actor: &str, entry: AuditEntry) -> Result<()> {
        let record = AuditRecord {
            timestamp: chrono::Utc::now(),
            actor: actor.to_string(),
            entry,
        };
        self.append(&record).await?;
        Ok(())
    }
}
