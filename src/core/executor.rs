//! Remote execution collaborators
//!
//! The orchestrator never talks to agents directly. It hands an
//! [`AgentTask`] to an [`AgentExecutor`] and stores backups through an
//! [`ArtifactStore`]. Both are injected as trait objects so deployments
//! can target a real fleet backend, the local host
//! ([`crate::core::nft_exec::NftCommandExecutor`]) or a test double.

use super::error::Result;
use super::firewall::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Task type understood by agents for firewall work
pub const TASK_TYPE: &str = "nftables";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Non-apply operations an agent performs on its own ruleset
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Directive {
    Rollback,
    Audit,
    Flush,
}

/// Task payload
///
/// Serialized untagged: `{"config_content": "..."}` or
/// `{"action": "flush", "confirm_flush": true}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TaskConfig {
    Apply {
        config_content: String,
    },
    Directive {
        action: Directive,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirm_flush: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentTask {
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    pub config: TaskConfig,
}

impl AgentTask {
    pub fn apply(name: impl Into<String>, script: String) -> Self {
        Self {
            task_type: TASK_TYPE.to_string(),
            name: name.into(),
            config: TaskConfig::Apply {
                config_content: script,
            },
        }
    }

    pub fn directive(name: impl Into<String>, action: Directive) -> Self {
        Self {
            task_type: TASK_TYPE.to_string(),
            name: name.into(),
            config: TaskConfig::Directive {
                action,
                confirm_flush: (action == Directive::Flush).then_some(true),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            output: output.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Fails with [`crate::Error::Capability`] when the agent cannot run
    /// `capability` tasks.
    async fn validate_capability(&self, agent_id: &str, capability: &str) -> Result<()>;

    async fn get_agent(&self, agent_id: &str) -> Result<AgentInfo>;

    /// Runs `task` on the agent. With `wait` set the call returns the final
    /// result; implementations should give up after `timeout`.
    async fn execute_task(
        &self,
        agent_id: &str,
        task: &AgentTask,
        wait: bool,
        timeout: Duration,
    ) -> Result<ExecutionResult>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `content` under `key`; returns an opaque artifact reference.
    async fn create_artifact(
        &self,
        tenant_id: TenantId,
        key: &str,
        kind: &str,
        content: serde_json::Value,
    ) -> Result<String>;
}
