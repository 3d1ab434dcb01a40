//! Local nft executor
//!
//! Lets the orchestrator treat the host it runs on as an agent. Every task
//! is carried out by spawning `nft`:
//!
//! | Task      | Commands                                              |
//! |-----------|-------------------------------------------------------|
//! | apply     | `nft list ruleset` (kept as last-known-good), `nft -f -` |
//! | rollback  | `nft -f -` with `flush ruleset` + last-known-good      |
//! | audit     | `nft list ruleset`                                     |
//! | flush     | `nft flush ruleset` (requires `confirm_flush`)         |
//!
//! # Environment Variables
//!
//! - `NFTFLEET_NFT_COMMAND`: replaces the `nft` invocation. Split on
//!   whitespace, so `sudo -n nft` works. Defaults to the build-time
//!   `NFTFLEET_SYSTEM_NFT_PATH`, else `nft` from `PATH`.
//!
//! Children are spawned with `kill_on_drop`, so a timed-out or cancelled
//! call does not leave `nft` running.

use super::error::{Error, Result};
use super::executor::{
    AgentExecutor, AgentInfo, AgentTask, Directive, ExecutionResult, ExecutionStatus, TASK_TYPE,
    TaskConfig,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const NFT_COMMAND_ENV: &str = "NFTFLEET_NFT_COMMAND";

const DEFAULT_NFT: &str = match option_env!("NFTFLEET_SYSTEM_NFT_PATH") {
    Some(path) => path,
    None => "nft",
};

/// Splits a command override into program and leading arguments.
pub fn parse_command(spec: &str) -> Option<(String, Vec<String>)> {
    let mut parts = spec.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

pub struct NftCommandExecutor {
    agent_id: String,
    agent_name: String,
    program: String,
    prefix_args: Vec<String>,
    last_known_good: Mutex<Option<String>>,
}

impl NftCommandExecutor {
    /// Executor using `NFTFLEET_NFT_COMMAND` when set, else the default
    /// `nft` binary.
    pub fn from_env(agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        let (program, prefix_args) = std::env::var(NFT_COMMAND_ENV)
            .ok()
            .and_then(|spec| parse_command(&spec))
            .unwrap_or_else(|| (DEFAULT_NFT.to_string(), Vec::new()));
        Self::with_command(agent_id, agent_name, program, prefix_args)
    }

    pub fn with_command(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        program: impl Into<String>,
        prefix_args: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            program: program.into(),
            prefix_args,
            last_known_good: Mutex::new(None),
        }
    }

    fn check_agent(&self, agent_id: &str) -> Result<()> {
        if agent_id == self.agent_id {
            Ok(())
        } else {
            Err(Error::not_found("Agent", agent_id))
        }
    }

    /// Runs nft with `args`, feeding `stdin` when given. Returns stdout.
    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.prefix_args)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Nftables {
                    message: format!("Failed to spawn {}: {e}", self.program),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        // Feed stdin while collecting output; nft may exit before reading it
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                match pipe.write_all(input.as_bytes()).await {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        warn!("nft closed stdin before reading the whole script");
                    }
                    other => other?,
                }
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if output.status.success() {
            fed?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("nft {} failed: {stderr}", args.join(" "));
            Err(Error::Nftables {
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }

    async fn dispatch(&self, task: &AgentTask) -> Result<String> {
        match &task.config {
            TaskConfig::Apply { config_content } => {
                let current = self.run(&["list", "ruleset"], None).await?;
                *self.last_known_good.lock().await = Some(current);
                info!("Applying ruleset ({} bytes)", config_content.len());
                self.run(&["-f", "-"], Some(config_content)).await
            }
            TaskConfig::Directive {
                action: Directive::Rollback,
                ..
            } => {
                let previous = self.last_known_good.lock().await.clone().ok_or_else(|| {
                    Error::Nftables {
                        message: "No previous ruleset recorded on this agent".to_string(),
                        stderr: None,
                        exit_code: None,
                    }
                })?;
                info!("Restoring last-known-good ruleset");
                let script = format!("flush ruleset\n{previous}");
                self.run(&["-f", "-"], Some(&script)).await
            }
            TaskConfig::Directive {
                action: Directive::Audit,
                ..
            } => self.run(&["list", "ruleset"], None).await,
            TaskConfig::Directive {
                action: Directive::Flush,
                confirm_flush,
            } => {
                if *confirm_flush != Some(true) {
                    return Err(Error::validation(
                        "confirm_flush",
                        "Flush requires explicit confirmation",
                    ));
                }
                warn!("Flushing entire ruleset");
                self.run(&["flush", "ruleset"], None).await
            }
        }
    }
}

#[async_trait]
impl AgentExecutor for NftCommandExecutor {
    async fn validate_capability(&self, agent_id: &str, capability: &str) -> Result<()> {
        self.check_agent(agent_id)?;
        if capability == TASK_TYPE {
            Ok(())
        } else {
            Err(Error::Capability {
                agent_id: agent_id.to_string(),
                capability: capability.to_string(),
                message: format!("local executor only provides '{TASK_TYPE}'"),
            })
        }
    }

    async fn get_agent(&self, agent_id: &str) -> Result<AgentInfo> {
        self.check_agent(agent_id)?;
        Ok(AgentInfo {
            id: self.agent_id.clone(),
            name: self.agent_name.clone(),
            capabilities: vec![TASK_TYPE.to_string()],
        })
    }

    /// Local execution always completes before returning, so `wait` has no
    /// effect.
    async fn execute_task(
        &self,
        agent_id: &str,
        task: &AgentTask,
        _wait: bool,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.check_agent(agent_id)?;

        match tokio::time::timeout(timeout, self.dispatch(task)).await {
            Ok(Ok(output)) => Ok(ExecutionResult::success(output)),
            Ok(Err(e)) => Ok(ExecutionResult::failure(String::new(), e.to_string())),
            Err(_) => {
                warn!("Task '{}' timed out after {timeout:?}", task.name);
                Ok(ExecutionResult {
                    status: ExecutionStatus::Timeout,
                    output: String::new(),
                    error: Some(format!("timed out after {}s", timeout.as_secs())),
                })
            }
        }
    }
}
