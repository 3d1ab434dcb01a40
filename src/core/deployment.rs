//! Deployment records and their state machine
//!
//! A [`Deployment`] is the persisted trace of one apply / rollback / audit /
//! flush request against one agent. Records move through
//!
//! ```text
//! PENDING ──► DEPLOYING ──► APPLIED | ROLLED_BACK | ERROR
//!    │                           ▲
//!    ├──► ERROR                  │
//!    └──► APPLIED (dry-run only) ┘
//! ```
//!
//! `ROLLED_BACK` is reserved for rollback deployments, which never end in
//! `APPLIED`. Terminal records are immutable; retrying creates a new record.
//!
//! [`DeploymentRecords`] is the only writer and validates every transition.

use super::error::{Error, Result};
use super::firewall::{Rule, TenantId};
use super::store::DeploymentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeploymentAction {
    Apply,
    Rollback,
    Audit,
    Flush,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Applied,
    Error,
    RolledBack,
}

impl DeploymentStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Error | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// `None` for audit/flush, which are not tied to a profile
    pub profile_id: Option<Uuid>,
    pub agent_id: String,
    /// Agent name cached at creation time
    pub agent_name: String,
    pub action: DeploymentAction,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_message: String,
    /// JSON array of the rules that were compiled
    #[serde(default)]
    pub rules_snapshot: Option<String>,
    /// Remote output (or the compiled script for dry-runs)
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub rollback_of: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl Deployment {
    /// New `PENDING` record.
    pub fn new(
        tenant_id: TenantId,
        action: DeploymentAction,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            profile_id: None,
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            action,
            status: DeploymentStatus::Pending,
            status_message: String::new(),
            rules_snapshot: None,
            output: String::new(),
            dry_run: false,
            rollback_of: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            created_by: created_by.into(),
        }
    }

    pub fn with_profile(mut self, profile_id: Uuid) -> Self {
        self.profile_id = Some(profile_id);
        self
    }

    pub fn with_snapshot(mut self, snapshot: String) -> Self {
        self.rules_snapshot = Some(snapshot);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_rollback_of(mut self, original: Uuid) -> Self {
        self.rollback_of = Some(original);
        self
    }

    /// Deserializes the stored rule snapshot (empty when none was taken).
    pub fn snapshot(&self) -> Result<Vec<Rule>> {
        match &self.rules_snapshot {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Checks whether this record may move to `to`.
    pub fn can_transition(&self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::{Applied, Deploying, Error, Pending, RolledBack};

        let rollback = self.action == DeploymentAction::Rollback;
        match (self.status, to) {
            (Pending, Deploying | Error) => true,
            (Pending, Applied) => self.dry_run,
            (Deploying, Deploying | Error) => true,
            (Deploying, Applied) => !rollback,
            (Deploying, RolledBack) => rollback,
            _ => false,
        }
    }
}

/// Serializes rules for a deployment snapshot.
pub fn snapshot_rules(rules: &[Rule]) -> Result<String> {
    Ok(serde_json::to_string(rules)?)
}

/// Filters for listing deployments
///
/// Every set field must match. `search` is a case-insensitive substring
/// match over agent name and status message.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub profile_id: Option<Uuid>,
    pub agent_id: Option<String>,
    pub action: Option<DeploymentAction>,
    pub status: Option<DeploymentStatus>,
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DeploymentFilter {
    pub fn matches(&self, d: &Deployment) -> bool {
        if self.profile_id.is_some() && self.profile_id != d.profile_id {
            return false;
        }
        if let Some(agent) = &self.agent_id
            && agent != &d.agent_id
        {
            return false;
        }
        if self.action.is_some_and(|a| a != d.action) {
            return false;
        }
        if self.status.is_some_and(|s| s != d.status) {
            return false;
        }
        if let Some(term) = &self.search {
            let term = term.to_lowercase();
            return d.agent_name.to_lowercase().contains(&term)
                || d.status_message.to_lowercase().contains(&term);
        }
        true
    }
}

/// Validated access to deployment records
#[derive(Clone)]
pub struct DeploymentRecords {
    store: Arc<dyn DeploymentStore>,
}

impl DeploymentRecords {
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Persists a new `PENDING` record.
    pub async fn create(&self, deployment: Deployment) -> Result<Deployment> {
        if deployment.status != DeploymentStatus::Pending {
            return Err(Error::Internal(format!(
                "new deployment must be PENDING, got {}",
                deployment.status
            )));
        }
        self.store.insert_deployment(deployment.clone()).await?;
        debug!(deployment_id = %deployment.id, action = %deployment.action, "deployment created");
        Ok(deployment)
    }

    /// Moves a record to `to`, stamping `started_at` on the first
    /// `DEPLOYING` and `completed_at` on any terminal state.
    ///
    /// `output` replaces the stored output when given.
    pub async fn update_status(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        to: DeploymentStatus,
        message: impl Into<String>,
        output: Option<String>,
    ) -> Result<Deployment> {
        let mut deployment = self.get(tenant_id, id).await?;
        if !deployment.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: deployment.status,
                to,
            });
        }

        let now = Utc::now();
        deployment.status = to;
        deployment.status_message = message.into();
        if let Some(output) = output {
            deployment.output = output;
        }
        if to == DeploymentStatus::Deploying && deployment.started_at.is_none() {
            deployment.started_at = Some(now);
        }
        if to.is_terminal() {
            deployment.completed_at = Some(now);
        }

        self.store.update_deployment(deployment.clone()).await?;
        debug!(deployment_id = %id, status = %to, "deployment status updated");
        Ok(deployment)
    }

    /// Completes a dry-run: `PENDING → APPLIED` with both timestamps set to
    /// the validation time.
    pub async fn record_dry_run(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        message: impl Into<String>,
        output: String,
        validated_at: DateTime<Utc>,
    ) -> Result<Deployment> {
        let mut deployment = self.get(tenant_id, id).await?;
        if !deployment.dry_run || !deployment.can_transition(DeploymentStatus::Applied) {
            return Err(Error::InvalidTransition {
                from: deployment.status,
                to: DeploymentStatus::Applied,
            });
        }

        deployment.status = DeploymentStatus::Applied;
        deployment.status_message = message.into();
        deployment.output = output;
        deployment.started_at = Some(validated_at);
        deployment.completed_at = Some(validated_at);

        self.store.update_deployment(deployment.clone()).await?;
        Ok(deployment)
    }

    pub async fn get(&self, tenant_id: TenantId, id: Uuid) -> Result<Deployment> {
        self.store
            .get_deployment(tenant_id, id)
            .await?
            .ok_or_else(|| Error::not_found("Deployment", id))
    }

    /// Newest first, paginated by `filter.limit`/`filter.offset`.
    pub async fn list(
        &self,
        tenant_id: TenantId,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>> {
        self.store.list_deployments(tenant_id, filter).await
    }

    /// Total matching records, ignoring pagination.
    pub async fn count(&self, tenant_id: TenantId, filter: &DeploymentFilter) -> Result<usize> {
        self.store.count_deployments(tenant_id, filter).await
    }

    /// Most recent non-dry-run apply that reached `APPLIED` on `agent_id`.
    pub async fn latest_applied(
        &self,
        tenant_id: TenantId,
        agent_id: &str,
    ) -> Result<Option<Deployment>> {
        let filter = DeploymentFilter {
            agent_id: Some(agent_id.to_string()),
            action: Some(DeploymentAction::Apply),
            status: Some(DeploymentStatus::Applied),
            ..DeploymentFilter::default()
        };
        let applied = self.store.list_deployments(tenant_id, &filter).await?;
        Ok(applied.into_iter().find(|d| !d.dry_run))
    }
}
