//! Deployment lifecycle events
//!
//! The orchestrator publishes one event when a background deployment starts
//! and one when it finishes. Publishing is fire-and-forget: a failing
//! publisher is logged and never changes a deployment's outcome.

use crate::core::deployment::DeploymentAction;
use crate::core::error::Result;
use crate::core::firewall::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr,
)]
pub enum EventType {
    #[serde(rename = "deploy.started")]
    #[strum(serialize = "deploy.started")]
    DeployStarted,
    #[serde(rename = "deploy.completed")]
    #[strum(serialize = "deploy.completed")]
    DeployCompleted,
    #[serde(rename = "deploy.failed")]
    #[strum(serialize = "deploy.failed")]
    DeployFailed,
    #[serde(rename = "rollback.started")]
    #[strum(serialize = "rollback.started")]
    RollbackStarted,
    #[serde(rename = "rollback.completed")]
    #[strum(serialize = "rollback.completed")]
    RollbackCompleted,
    #[serde(rename = "rollback.failed")]
    #[strum(serialize = "rollback.failed")]
    RollbackFailed,
    #[serde(rename = "audit.started")]
    #[strum(serialize = "audit.started")]
    AuditStarted,
    #[serde(rename = "audit.completed")]
    #[strum(serialize = "audit.completed")]
    AuditCompleted,
    #[serde(rename = "audit.failed")]
    #[strum(serialize = "audit.failed")]
    AuditFailed,
    #[serde(rename = "flush.started")]
    #[strum(serialize = "flush.started")]
    FlushStarted,
    #[serde(rename = "flush.completed")]
    #[strum(serialize = "flush.completed")]
    FlushCompleted,
    #[serde(rename = "flush.failed")]
    #[strum(serialize = "flush.failed")]
    FlushFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Completed,
    Failed,
}

impl EventType {
    pub const fn for_action(action: DeploymentAction, phase: Phase) -> Self {
        use DeploymentAction as A;
        match (action, phase) {
            (A::Apply, Phase::Started) => Self::DeployStarted,
            (A::Apply, Phase::Completed) => Self::DeployCompleted,
            (A::Apply, Phase::Failed) => Self::DeployFailed,
            (A::Rollback, Phase::Started) => Self::RollbackStarted,
            (A::Rollback, Phase::Completed) => Self::RollbackCompleted,
            (A::Rollback, Phase::Failed) => Self::RollbackFailed,
            (A::Audit, Phase::Started) => Self::AuditStarted,
            (A::Audit, Phase::Completed) => Self::AuditCompleted,
            (A::Audit, Phase::Failed) => Self::AuditFailed,
            (A::Flush, Phase::Started) => Self::FlushStarted,
            (A::Flush, Phase::Completed) => Self::FlushCompleted,
            (A::Flush, Phase::Failed) => Self::FlushFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tenant_id: TenantId,
    /// Deployment id
    pub resource_id: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentEvent {
    pub fn new(
        event_type: EventType,
        tenant_id: TenantId,
        resource_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            tenant_id,
            resource_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_async(&self, event: DeploymentEvent) -> Result<()>;
}

/// In-process event bus on a tokio broadcast channel
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<DeploymentEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventBus {
    async fn publish_async(&self, event: DeploymentEvent) -> Result<()> {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::debug!("event dropped: no subscribers");
        }
        Ok(())
    }
}
