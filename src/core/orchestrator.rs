//! Deployment orchestrator
//!
//! Turns apply / rollback / audit / flush requests into deployment records
//! and background jobs:
//!
//! 1. **Synchronous part** (the caller waits): validate input and agent
//!    capability, load the profile and its enabled rules, check they fit the
//!    profile's table family, create the `PENDING` record. Dry-run applies finish here.
//! 2. **Background job** (one tokio task per deployment): take the agent
//!    lock, move to `DEPLOYING`, compile, write a best-effort backup, call
//!    the executor under a timeout, record the terminal state, publish an
//!    event and write an audit entry.
//!
//! Every job owns a child of the orchestrator's root [`CancellationToken`];
//! [`DeploymentHandle::cancel`] stops one job and [`Orchestrator::shutdown`]
//! stops all of them. Cancelled and timed-out jobs end in `ERROR`.
//!
//! Events and audit entries are handed to a per-job delivery task. The job
//! never waits on a publisher or sink, and each delivery is bounded by
//! [`NOTICE_TIMEOUT`], so neither can change or stall a deployment.

use super::compiler::{compile, compile_rules};
use super::deployment::{
    Deployment, DeploymentAction, DeploymentRecords, DeploymentStatus, snapshot_rules,
};
use super::diff::script_diff;
use super::error::{Error, RemoteErrorPattern, Result};
use super::executor::{
    AgentExecutor, AgentTask, ArtifactStore, Directive, ExecutionResult, ExecutionStatus,
};
use super::firewall::{Profile, Rule, TenantId};
use super::policy::PolicyService;
use super::rule_constraints::check_rules_fit_profile;
use super::store::{DeploymentStore, PolicyStore};
use crate::audit::{AuditEntry, AuditSink};
use crate::config::ServiceConfig;
use crate::events::{DeploymentEvent, EventPublisher, EventType, Phase};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Upper bound on a single event publish or audit write
pub const NOTICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the orchestrator talks to
pub struct Collaborators {
    pub policy_store: Arc<dyn PolicyStore>,
    pub deployment_store: Arc<dyn DeploymentStore>,
    pub executor: Arc<dyn AgentExecutor>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub events: Arc<dyn EventPublisher>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub tenant_id: TenantId,
    pub profile_id: Uuid,
    pub agent_id: String,
    pub dry_run: bool,
    pub actor: String,
}

/// Result of a deployment request
///
/// `deployment` is the record as the caller sees it (`PENDING`, or
/// `APPLIED` for dry-runs). `handle` is `None` when no background job was
/// started.
pub struct DeploymentTicket {
    pub deployment: Deployment,
    pub handle: Option<DeploymentHandle>,
}

/// Background deployment job
pub struct DeploymentHandle {
    id: Uuid,
    join: JoinHandle<Result<Deployment>>,
    notices: JoinHandle<()>,
    cancel: CancellationToken,
}

impl DeploymentHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests cancellation; the job records `ERROR` and exits.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the deployment reached its terminal record.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the job and its event/audit deliveries, then returns the
    /// terminal record.
    pub async fn wait(self) -> Result<Deployment> {
        let result = self
            .join
            .await
            .map_err(|e| Error::Internal(format!("deployment task failed: {e}")))?;
        if let Err(e) = self.notices.await {
            warn!(deployment_id = %self.id, "notice delivery task failed: {}", e);
        }
        result
    }
}

/// Compiled profile compared to what was last applied on an agent
#[derive(Debug, Clone)]
pub struct Preview {
    pub script: String,
    /// Deployment the comparison is based on
    pub baseline: Option<Uuid>,
    /// `None` when nothing would change
    pub diff: Option<String>,
}

/// Event or audit entry queued for delivery
enum Notice {
    Event(DeploymentEvent),
    Audit { actor: String, entry: AuditEntry },
}

type Notices = mpsc::UnboundedSender<Notice>;

/// Delivers a job's notices in order, each bounded by [`NOTICE_TIMEOUT`].
async fn deliver_notices(
    events: Arc<dyn EventPublisher>,
    audit: Arc<dyn AuditSink>,
    mut rx: mpsc::UnboundedReceiver<Notice>,
) {
    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Event(event) => {
                let event_type = event.event_type;
                match tokio::time::timeout(NOTICE_TIMEOUT, events.publish_async(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%event_type, "Failed to publish deployment event: {}", e),
                    Err(_) => warn!(%event_type, "Event publish timed out, dropping event"),
                }
            }
            Notice::Audit { actor, entry } => {
                match tokio::time::timeout(NOTICE_TIMEOUT, audit.log_audit_async(&actor, entry))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to write audit entry: {}", e),
                    Err(_) => warn!("Audit write timed out, dropping entry"),
                }
            }
        }
    }
}

enum JobKind {
    Apply { profile: Profile, rules: Vec<Rule> },
    Directive(Directive),
}

struct Job {
    deployment: Deployment,
    kind: JobKind,
    timeout: Duration,
}

/// Agent-keyed async mutexes
#[derive(Default)]
struct AgentLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentLocks {
    async fn acquire(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(agent_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

struct Inner {
    config: ServiceConfig,
    policy: PolicyService,
    records: DeploymentRecords,
    executor: Arc<dyn AgentExecutor>,
    artifacts: Arc<dyn ArtifactStore>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
    agent_locks: AgentLocks,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: ServiceConfig, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.normalized(),
                policy: PolicyService::new(collaborators.policy_store),
                records: DeploymentRecords::new(collaborators.deployment_store),
                executor: collaborators.executor,
                artifacts: collaborators.artifacts,
                events: collaborators.events,
                audit: collaborators.audit,
                shutdown: CancellationToken::new(),
                agent_locks: AgentLocks::default(),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> &PolicyService {
        &self.inner.policy
    }

    pub fn records(&self) -> &DeploymentRecords {
        &self.inner.records
    }

    /// Cancels every in-flight job. New requests are refused afterwards.
    pub fn shutdown(&self) {
        info!("Orchestrator shutting down, cancelling in-flight deployments");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn apply(&self, request: ApplyRequest) -> Result<DeploymentTicket> {
        let inner = &self.inner;
        self.ensure_running()?;
        inner.check_capability(&request.agent_id).await?;

        let profile = inner
            .policy
            .get_profile(request.tenant_id, request.profile_id)
            .await?;
        if !profile.settings.enabled {
            return Err(Error::validation(
                "profile_id",
                format!("profile '{}' is disabled", profile.name()),
            ));
        }
        let rules = inner
            .policy
            .enabled_profile_rules(request.tenant_id, request.profile_id)
            .await?;
        check_rules_fit_profile(&profile, &rules)?;

        let agent_name = inner.agent_name(&request.agent_id).await;
        let deployment = inner
            .records
            .create(
                Deployment::new(
                    request.tenant_id,
                    DeploymentAction::Apply,
                    &request.agent_id,
                    agent_name,
                    &request.actor,
                )
                .with_profile(profile.id)
                .with_snapshot(snapshot_rules(&rules)?)
                .with_dry_run(request.dry_run),
            )
            .await?;

        if request.dry_run {
            let validated_at = Utc::now();
            let script = compile_rules(&rules, validated_at);
            let deployment = inner
                .records
                .record_dry_run(
                    request.tenant_id,
                    deployment.id,
                    format!("Dry run: {} rule(s) validated, nothing deployed", rules.len()),
                    script,
                    validated_at,
                )
                .await?;
            info!(deployment_id = %deployment.id, "dry-run apply recorded");
            return Ok(DeploymentTicket {
                deployment,
                handle: None,
            });
        }

        let timeout = inner.config.apply_timeout();
        Ok(self.launch(Job {
            deployment,
            kind: JobKind::Apply { profile, rules },
            timeout,
        }))
    }

    /// Reverts the agent targeted by an earlier apply.
    pub async fn rollback(
        &self,
        tenant_id: TenantId,
        deployment_id: Uuid,
        actor: &str,
    ) -> Result<DeploymentTicket> {
        let inner = &self.inner;
        self.ensure_running()?;

        let original = inner.records.get(tenant_id, deployment_id).await?;
        if original.action != DeploymentAction::Apply || original.dry_run {
            return Err(Error::validation(
                "deployment_id",
                "only non-dry-run apply deployments can be rolled back",
            ));
        }
        inner.check_capability(&original.agent_id).await?;

        let mut deployment = Deployment::new(
            tenant_id,
            DeploymentAction::Rollback,
            &original.agent_id,
            &original.agent_name,
            actor,
        )
        .with_rollback_of(original.id);
        deployment.profile_id = original.profile_id;
        let deployment = inner.records.create(deployment).await?;

        Ok(self.launch(Job {
            deployment,
            kind: JobKind::Directive(Directive::Rollback),
            timeout: inner.config.action_timeout(),
        }))
    }

    /// Reads the agent's live ruleset into the deployment output.
    pub async fn audit(
        &self,
        tenant_id: TenantId,
        agent_id: &str,
        actor: &str,
    ) -> Result<DeploymentTicket> {
        self.directive(tenant_id, agent_id, actor, Directive::Audit)
            .await
    }

    /// Removes every rule on the agent. Refused unless `confirm` is set.
    pub async fn flush(
        &self,
        tenant_id: TenantId,
        agent_id: &str,
        confirm: bool,
        actor: &str,
    ) -> Result<DeploymentTicket> {
        if !confirm {
            return Err(Error::validation(
                "confirm",
                "flush removes every rule on the agent; pass confirm=true",
            ));
        }
        self.directive(tenant_id, agent_id, actor, Directive::Flush)
            .await
    }

    /// Compiles the profile and diffs it against the last ruleset applied
    /// to the agent.
    pub async fn preview(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        agent_id: &str,
    ) -> Result<Preview> {
        let inner = &self.inner;
        let profile = inner.policy.get_profile(tenant_id, profile_id).await?;
        let rules = inner
            .policy
            .enabled_profile_rules(tenant_id, profile_id)
            .await?;
        check_rules_fit_profile(&profile, &rules)?;
        let now = Utc::now();
        let script = compile(&profile, &rules, now);

        let latest = inner.records.latest_applied(tenant_id, agent_id).await?;
        let baseline_script = match &latest {
            Some(previous) => {
                // Recompile the snapshot with the profile it was applied
                // from (falling back to the previewed profile if deleted)
                let previous_profile = match previous.profile_id {
                    Some(id) if id != profile.id => inner
                        .policy
                        .get_profile(tenant_id, id)
                        .await
                        .unwrap_or_else(|_| profile.clone()),
                    _ => profile.clone(),
                };
                compile(&previous_profile, &previous.snapshot()?, now)
            }
            None => String::new(),
        };

        Ok(Preview {
            diff: script_diff(&baseline_script, &script),
            baseline: latest.map(|d| d.id),
            script,
        })
    }

    async fn directive(
        &self,
        tenant_id: TenantId,
        agent_id: &str,
        actor: &str,
        directive: Directive,
    ) -> Result<DeploymentTicket> {
        let inner = &self.inner;
        self.ensure_running()?;
        inner.check_capability(agent_id).await?;

        let action = match directive {
            Directive::Rollback => DeploymentAction::Rollback,
            Directive::Audit => DeploymentAction::Audit,
            Directive::Flush => DeploymentAction::Flush,
        };
        let agent_name = inner.agent_name(agent_id).await;
        let deployment = inner
            .records
            .create(Deployment::new(tenant_id, action, agent_id, agent_name, actor))
            .await?;

        Ok(self.launch(Job {
            deployment,
            kind: JobKind::Directive(directive),
            timeout: inner.config.action_timeout(),
        }))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn launch(&self, job: Job) -> DeploymentTicket {
        let cancel = self.inner.shutdown.child_token();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let deployment = job.deployment.clone();
        let id = deployment.id;

        let (tx, rx) = mpsc::unbounded_channel();
        let notices = tokio::spawn(deliver_notices(
            Arc::clone(&inner.events),
            Arc::clone(&inner.audit),
            rx,
        ));

        let join = tokio::spawn(async move {
            let result = inner.run(job, token, tx).await;
            if let Err(e) = &result {
                error!(deployment_id = %id, "deployment job aborted: {}", e);
            }
            result
        });

        DeploymentTicket {
            deployment,
            handle: Some(DeploymentHandle {
                id,
                join,
                notices,
                cancel,
            }),
        }
    }
}

impl Inner {
    async fn check_capability(&self, agent_id: &str) -> Result<()> {
        self.executor
            .validate_capability(agent_id, &self.config.required_capability)
            .await
    }

    /// Cached display name; the id stands in when the lookup fails.
    async fn agent_name(&self, agent_id: &str) -> String {
        match self.executor.get_agent(agent_id).await {
            Ok(agent) => agent.name,
            Err(e) => {
                warn!("Failed to look up agent {}: {}", agent_id, e);
                agent_id.to_string()
            }
        }
    }

    async fn run(
        &self,
        job: Job,
        cancel: CancellationToken,
        notices: Notices,
    ) -> Result<Deployment> {
        let deployment = &job.deployment;
        let (tenant_id, id) = (deployment.tenant_id, deployment.id);

        // Queued jobs stay PENDING until the agent is free
        let _agent_guard = if self.config.serialize_per_agent {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return self.finish(&job, Err(Error::Cancelled), Vec::new(), &notices).await;
                }
                guard = self.agent_locks.acquire(&deployment.agent_id) => Some(guard),
            }
        } else {
            None
        };
        if cancel.is_cancelled() {
            return self.finish(&job, Err(Error::Cancelled), Vec::new(), &notices).await;
        }

        self.records
            .update_status(
                tenant_id,
                id,
                DeploymentStatus::Deploying,
                format!("{} in progress", deployment.action),
                None,
            )
            .await?;
        info!(deployment_id = %id, agent = %deployment.agent_id, action = %deployment.action, "deployment started");
        publish(&notices, deployment, Phase::Started, json!({}));

        let mut notes = Vec::new();
        let task = match &job.kind {
            JobKind::Apply { profile, rules } => {
                let script = compile(profile, rules, Utc::now());
                if self.config.backup_enabled
                    && let Err(e) = self.backup(deployment, profile, rules, &script).await
                {
                    warn!(deployment_id = %id, "Backup failed, continuing: {}", e);
                    notes.push(format!("backup failed: {e}"));
                }
                AgentTask::apply(format!("apply profile {}", profile.name()), script)
            }
            JobKind::Directive(directive) => {
                AgentTask::directive(format!("{directive} firewall"), *directive)
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(
                job.timeout,
                self.executor.execute_task(&deployment.agent_id, &task, true, job.timeout),
            ) => match result {
                Ok(result) => result.and_then(interpret),
                Err(_) => Err(Error::Timeout(job.timeout.as_secs())),
            },
        };

        self.finish(&job, outcome, notes, &notices).await
    }

    /// Records the terminal state, then queues the event and audit entry.
    async fn finish(
        &self,
        job: &Job,
        outcome: Result<String>,
        notes: Vec<String>,
        notices: &Notices,
    ) -> Result<Deployment> {
        let deployment = &job.deployment;
        let (tenant_id, id) = (deployment.tenant_id, deployment.id);

        let (status, message, output) = match &outcome {
            Ok(output) => {
                let status = if deployment.action == DeploymentAction::Rollback {
                    DeploymentStatus::RolledBack
                } else {
                    DeploymentStatus::Applied
                };
                let summary = match &job.kind {
                    JobKind::Apply { profile, rules } => format!(
                        "Applied profile '{}' ({} rule(s))",
                        profile.name(),
                        rules.len()
                    ),
                    JobKind::Directive(directive) => format!("{directive} completed"),
                };
                (status, summary, Some(output.clone()))
            }
            Err(e) => {
                error!(deployment_id = %id, "deployment failed: {}", e);
                let output = match e {
                    Error::Execution { output, .. } => output.clone(),
                    _ => None,
                };
                (DeploymentStatus::Error, failure_message(e), output)
            }
        };
        let message = with_notes(message, &notes);

        let recorded = self
            .records
            .update_status(tenant_id, id, status, message.clone(), output)
            .await?;

        let phase = if outcome.is_ok() {
            info!(deployment_id = %id, status = %status, "deployment finished");
            Phase::Completed
        } else {
            Phase::Failed
        };
        publish(
            notices,
            &recorded,
            phase,
            json!({ "status": status, "message": message }),
        );

        let mut entry = AuditEntry::new(
            format!("firewall.{}", deployment.action),
            "deployment",
            id.to_string(),
            json!({
                "agent_id": deployment.agent_id,
                "agent_name": deployment.agent_name,
                "profile_id": deployment.profile_id,
                "rollback_of": deployment.rollback_of,
                "status": status,
            }),
        );
        if outcome.is_err() {
            entry = entry.failed(message);
        }
        let audit = Notice::Audit {
            actor: deployment.created_by.clone(),
            entry,
        };
        if notices.send(audit).is_err() {
            warn!(deployment_id = %id, "Notice delivery closed, audit entry dropped");
        }

        Ok(recorded)
    }

    async fn backup(
        &self,
        deployment: &Deployment,
        profile: &Profile,
        rules: &[Rule],
        script: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let key = format!(
            "{}/{}_{}",
            deployment.agent_id,
            now.format("%Y%m%dT%H%M%S"),
            deployment.id
        );
        let content = json!({
            "deployment_id": deployment.id,
            "agent_id": deployment.agent_id,
            "profile_id": profile.id,
            "profile_name": profile.name(),
            "rules": rules,
            "script": script,
            "checksum": compute_checksum(script),
            "created_at": now,
        });

        self.artifacts
            .create_artifact(
                deployment.tenant_id,
                &key,
                &self.config.backup_artifact_kind,
                content,
            )
            .await
            .map_err(|e| Error::Backup(e.to_string()))
    }
}

/// Queues a lifecycle event for the job's delivery task.
fn publish(notices: &Notices, deployment: &Deployment, phase: Phase, extra: serde_json::Value) {
    let mut payload = json!({
        "agent_id": deployment.agent_id,
        "agent_name": deployment.agent_name,
        "action": deployment.action,
        "profile_id": deployment.profile_id,
    });
    if let (Some(payload), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        payload.extend(extra.clone());
    }

    let event = DeploymentEvent::new(
        EventType::for_action(deployment.action, phase),
        deployment.tenant_id,
        deployment.id,
        payload,
    );
    if notices.send(Notice::Event(event)).is_err() {
        warn!(deployment_id = %deployment.id, "Notice delivery closed, event dropped");
    }
}

/// Maps an executor result to remote output or an error.
fn interpret(result: ExecutionResult) -> Result<String> {
    match result.status {
        ExecutionStatus::Success => Ok(result.output),
        ExecutionStatus::Failure => Err(Error::Execution {
            message: result
                .error
                .unwrap_or_else(|| "remote execution failed".to_string()),
            output: Some(result.output),
        }),
        ExecutionStatus::Timeout => Err(Error::Execution {
            message: result
                .error
                .unwrap_or_else(|| "agent reported a timeout".to_string()),
            output: Some(result.output),
        }),
    }
}

/// Error text plus a user-facing hint for remote failures.
fn failure_message(err: &Error) -> String {
    let raw = err.to_string();
    match err {
        Error::Execution { message, .. } | Error::Nftables { message, .. } => {
            let hint = RemoteErrorPattern::match_error(message);
            if hint.user_message.contains(message.as_str()) {
                raw
            } else {
                format!("{raw} ({})", hint.user_message)
            }
        }
        _ => raw,
    }
}

fn with_notes(message: String, notes: &[String]) -> String {
    if notes.is_empty() {
        message
    } else {
        format!("{message}; {}", notes.join("; "))
    }
}

/// SHA-256 of the script, hex encoded
pub fn compute_checksum(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}
