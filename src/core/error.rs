use crate::core::deployment::DeploymentStatus;
use thiserror::Error;

/// Core error types for nftfleet
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Entity does not exist (or is not visible to the tenant)
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Entity exists but is owned by another tenant
    #[error("{kind} {id} belongs to a different tenant")]
    TenantMismatch { kind: &'static str, id: String },

    /// Entity cannot be modified (built-in template, terminal deployment)
    #[error("Immutable resource: {0}")]
    Immutable(String),

    /// Deployment state machine violation
    #[error("Invalid deployment transition: {from} -> {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    /// Agent does not advertise a required capability
    #[error("Agent {agent_id} lacks capability '{capability}': {message}")]
    Capability {
        agent_id: String,
        capability: String,
        message: String,
    },

    /// Remote executor was unreachable or reported a failure
    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        output: Option<String>,
    },

    /// Executor call exceeded its deadline
    #[error("Execution timed out after {0}s")]
    Timeout(u64),

    /// Deployment job was cancelled before it finished
    #[error("Deployment cancelled")]
    Cancelled,

    /// Backup artifact could not be written
    #[error("Backup error: {0}")]
    Backup(String),

    /// nft command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Errors a caller can fix by changing the request (surfaced before any
    /// background work starts).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::NotFound { .. }
                | Self::TenantMismatch { .. }
                | Self::Immutable(_)
                | Self::Capability { .. }
        )
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known failure signatures reported by remote agents running nftables
pub struct RemoteErrorPattern;

impl RemoteErrorPattern {
    /// Matches an executor error message against known patterns and returns a
    /// user-facing translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Agent lacks permission to modify firewall rules")
                .with_suggestion("Ensure the agent runs with CAP_NET_ADMIN")
                .with_suggestion("Check the agent service user and its sudo/polkit rules");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed on the agent")
                .with_suggestion("Install nftables: apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: dnf install nftables  (Fedora/RHEL)");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Generated ruleset was rejected by nft")
                .with_suggestion("Review raw expression overrides in the profile's rules")
                .with_suggestion("Verify addresses, ports and NAT targets are valid");
        }

        if lower.contains("invalid lhs of relational") {
            return ErrorTranslation::new("Protocol mismatch - trying to match incompatible field")
                .with_suggestion("Use TCP or UDP protocol when matching ports");
        }

        if lower.contains("interface")
            && (lower.contains("invalid") || lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Network interface not found on the agent")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy on the agent")
                .with_suggestion("Another deployment may be in flight for this agent")
                .with_suggestion("Check for conflicting managers: systemctl status firewalld ufw");
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Agent did not answer in time")
                .with_suggestion("Check agent connectivity and load")
                .with_suggestion("Raise apply_timeout_secs / action_timeout_secs if needed");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Load nf_tables module on the agent: modprobe nf_tables");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the captured agent output for details")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
