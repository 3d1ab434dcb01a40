//! Shared test utilities for core module tests
//!
//! Recording doubles for every orchestrator collaborator plus rule/profile
//! builders. This module is only compiled in test mode.

use crate::audit::{AuditEntry, AuditSink};
use crate::config::ServiceConfig;
use crate::core::error::{Error, Result};
use crate::core::executor::{
    AgentExecutor, AgentInfo, AgentTask, ArtifactStore, ExecutionResult, ExecutionStatus,
};
use crate::core::firewall::{
    Action, Chain, Profile, ProfileSettings, Protocol, Rule, RuleDefinition, TenantId,
};
use crate::core::memory::InMemoryStore;
use crate::core::orchestrator::{Collaborators, Orchestrator};
use crate::events::{DeploymentEvent, EventPublisher};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const AGENT: &str = "agent-1";

/// How the mock executor answers `execute_task`
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(String),
    Fail(String),
    /// Sleeps (on the tokio clock) before succeeding
    Delay(Duration),
    /// Returns `Err` instead of an execution result
    Unreachable,
}

pub struct MockExecutor {
    pub agents: Vec<AgentInfo>,
    pub behavior: Mutex<Behavior>,
    pub calls: Mutex<Vec<(String, AgentTask)>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockExecutor {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            agents: vec![
                AgentInfo {
                    id: AGENT.to_string(),
                    name: "edge-01".to_string(),
                    capabilities: vec!["nftables".to_string()],
                },
                AgentInfo {
                    id: "agent-2".to_string(),
                    name: "edge-02".to_string(),
                    capabilities: vec!["nftables".to_string()],
                },
                AgentInfo {
                    id: "docker-host".to_string(),
                    name: "docker-host".to_string(),
                    capabilities: vec!["docker".to_string()],
                },
            ],
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> Vec<(String, AgentTask)> {
        self.calls.lock().unwrap().clone()
    }

    fn agent(&self, agent_id: &str) -> Result<&AgentInfo> {
        self.agents
            .iter()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| Error::not_found("Agent", agent_id))
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn validate_capability(&self, agent_id: &str, capability: &str) -> Result<()> {
        let agent = self.agent(agent_id)?;
        if agent.capabilities.iter().any(|c| c == capability) {
            Ok(())
        } else {
            Err(Error::Capability {
                agent_id: agent_id.to_string(),
                capability: capability.to_string(),
                message: "not advertised".to_string(),
            })
        }
    }

    async fn get_agent(&self, agent_id: &str) -> Result<AgentInfo> {
        self.agent(agent_id).cloned()
    }

    async fn execute_task(
        &self,
        agent_id: &str,
        task: &AgentTask,
        _wait: bool,
        _timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.calls
            .lock()
            .unwrap()
            .push((agent_id.to_string(), task.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let behavior = self.behavior.lock().unwrap().clone();
        let result = match behavior {
            Behavior::Succeed(output) => Ok(ExecutionResult::success(output)),
            Behavior::Fail(error) => Ok(ExecutionResult {
                status: ExecutionStatus::Failure,
                output: "remote stdout".to_string(),
                error: Some(error),
            }),
            Behavior::Delay(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ExecutionResult::success("done"))
            }
            Behavior::Unreachable => Err(Error::Execution {
                message: "agent unreachable".to_string(),
                output: None,
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    pub stored: Mutex<Vec<(TenantId, String, String, serde_json::Value)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn create_artifact(
        &self,
        tenant_id: TenantId,
        key: &str,
        kind: &str,
        content: serde_json::Value,
    ) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.stored
            .lock()
            .unwrap()
            .push((tenant_id, key.to_string(), kind.to_string(), content));
        Ok(format!("mem://{key}"))
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<DeploymentEvent>>,
    pub fail: AtomicBool,
    /// Publishing never resolves
    pub stall: AtomicBool,
}

impl RecordingEvents {
    pub fn types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.to_string())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish_async(&self, event: DeploymentEvent) -> Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Internal("event bus down".to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    pub entries: Mutex<Vec<(String, AuditEntry)>>,
    pub stall: AtomicBool,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<(String, AuditEntry)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn log_audit_async(&self, actor: &str, entry: AuditEntry) -> Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.entries
            .lock()
            .unwrap()
            .push((actor.to_string(), entry));
        Ok(())
    }
}

/// Orchestrator wired to recording doubles
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<InMemoryStore>,
    pub executor: Arc<MockExecutor>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub events: Arc<RecordingEvents>,
    pub audit: Arc<RecordingAudit>,
    pub tenant: TenantId,
}

impl Harness {
    pub fn new(config: ServiceConfig, behavior: Behavior) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let executor = Arc::new(MockExecutor::new(behavior));
        let artifacts = Arc::new(MemoryArtifacts::default());
        let events = Arc::new(RecordingEvents::default());
        let audit = Arc::new(RecordingAudit::default());

        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                policy_store: store.clone(),
                deployment_store: store.clone(),
                executor: executor.clone(),
                artifacts: artifacts.clone(),
                events: events.clone(),
                audit: audit.clone(),
            },
        );

        Self {
            orchestrator,
            store,
            executor,
            artifacts,
            events,
            audit,
            tenant: Uuid::new_v4(),
        }
    }

    /// Profile with the given rule definitions attached in order.
    pub async fn profile_with(&self, settings: ProfileSettings, defs: Vec<RuleDefinition>) -> Profile {
        let policy = self.orchestrator.policy();
        let profile = policy
            .create_profile(self.tenant, settings, "tester")
            .await
            .unwrap();
        let mut ids = Vec::new();
        for def in defs {
            ids.push(policy.create_rule(self.tenant, def, "tester").await.unwrap().id);
        }
        policy.add_rules(self.tenant, profile.id, &ids).await.unwrap();
        profile
    }
}

pub fn tcp_definition(name: &str, port: &str) -> RuleDefinition {
    RuleDefinition {
        protocol: Protocol::Tcp,
        dest_port: Some(port.to_string()),
        action: Some(Action::Accept),
        ..RuleDefinition::new(name, Chain::Input)
    }
}

/// Live rule for compiler tests
pub fn create_test_rule(name: &str, chain: Chain, priority: i32) -> Rule {
    let def = RuleDefinition {
        priority,
        ..RuleDefinition::new(name, chain)
    };
    Rule::from_definition(def, Uuid::nil(), "tester")
}

pub fn create_tcp_rule(name: &str, port: &str) -> Rule {
    Rule::from_definition(tcp_definition(name, port), Uuid::nil(), "tester")
}

pub fn create_test_profile(settings: ProfileSettings) -> Profile {
    Profile::new(settings, Uuid::nil(), "tester")
}
