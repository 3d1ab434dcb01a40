//! nftfleet - nftables policy compiler and deployer
//!
//! Command-line front end over the library. Policies are portable profile
//! documents (JSON, the same format `export_profile` produces); the host the
//! CLI runs on acts as the deployment agent.
//!
//! # Usage
//!
//! ```bash
//! nftfleet templates                          # List built-in templates
//! nftfleet init --template web-server > web.json
//! nftfleet validate web.json                  # Check every rule
//! nftfleet compile web.json                   # Print the nft script
//! nftfleet diff old.json new.json             # Compare two policies
//! nftfleet deploy web.json --dry-run          # Validate without touching nft
//! sudo nftfleet deploy web.json               # Apply to this host
//! nftfleet audit                              # Show the live ruleset
//! sudo nftfleet flush --confirm               # Remove every rule
//! nftfleet log -n 20                          # Recent audit entries
//! ```
//!
//! Set `NFTFLEET_NFT_COMMAND` (e.g. `sudo -n nft`) to change how nft is run.

use clap::{Parser, Subcommand};
use nftfleet::audit::JsonLinesAuditLog;
use nftfleet::config::{self, ServiceConfig};
use nftfleet::core::artifacts::DirectoryArtifactStore;
use nftfleet::core::compiler::compile;
use nftfleet::core::deployment::{Deployment, DeploymentStatus};
use nftfleet::core::diff::{change_counts, script_diff};
use nftfleet::core::firewall::{Profile, ProfileSettings, RuleDefinition, TenantId};
use nftfleet::core::memory::InMemoryStore;
use nftfleet::core::nft_exec::NftCommandExecutor;
use nftfleet::core::orchestrator::{ApplyRequest, Collaborators, DeploymentTicket, Orchestrator};
use nftfleet::core::policy::validate_profile_settings;
use nftfleet::core::rule_constraints::{
    check_rules_fit_profile, definition_uses_ipv6, validate_rule_definition,
};
use nftfleet::core::templates::{EXPORT_FORMAT_VERSION, ProfileExport, TemplateService};
use nftfleet::events::BroadcastEventBus;
use nftfleet::validators;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

shadow_rs::shadow!(build);

const LOCAL_AGENT: &str = "local";

#[derive(Parser)]
#[command(name = "nftfleet")]
#[command(about = "Compile firewall policy into nftables scripts and deploy it", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Config file (default: ~/.config/nftfleet/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available policy templates
    Templates {
        /// Only show templates in this category
        #[arg(short, long)]
        category: Option<String>,
    },
    /// Create a policy document from a template
    Init {
        /// Template name (see `templates`)
        #[arg(short, long)]
        template: String,
        /// Profile name (defaults to the template name)
        #[arg(short, long)]
        name: Option<String>,
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Validate a policy document
    Validate { file: PathBuf },
    /// Print the nft script a policy compiles to
    Compile { file: PathBuf },
    /// Show how the compiled script changes between two policies
    Diff { old: PathBuf, new: PathBuf },
    /// Apply a policy to this host
    Deploy {
        file: PathBuf,
        /// Validate and record only; nft is not invoked
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the live ruleset of this host
    Audit,
    /// Remove every rule on this host
    Flush {
        /// Required: flushing leaves the host unprotected
        #[arg(long)]
        confirm: bool,
    },
    /// Show recent audit log entries
    Log {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = nftfleet::utils::ensure_dirs() {
        tracing::warn!("Failed to create config/state directories: {}", e);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

/// Single-tenant wiring for the local host
struct Local {
    orchestrator: Orchestrator,
    templates: TemplateService,
    tenant: TenantId,
    actor: String,
}

impl Local {
    fn new(config: ServiceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(InMemoryStore::new());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let mode = config.materialize_mode;

        let orchestrator = Orchestrator::new(
            config.clone(),
            Collaborators {
                policy_store: store.clone(),
                deployment_store: store,
                executor: Arc::new(NftCommandExecutor::from_env(LOCAL_AGENT, host)),
                artifacts: Arc::new(DirectoryArtifactStore::in_state_dir(
                    config.max_backups_per_agent,
                )?),
                events: Arc::new(BroadcastEventBus::default()),
                audit: Arc::new(JsonLinesAuditLog::in_state_dir()?),
            },
        );
        let templates = TemplateService::new(orchestrator.policy().clone(), mode);

        Ok(Self {
            orchestrator,
            templates,
            tenant: Uuid::nil(),
            actor: std::env::var("USER").unwrap_or_else(|_| "cli".to_string()),
        })
    }

    /// Loads a policy document into the store.
    async fn import(&self, path: &Path) -> Result<Profile, Box<dyn std::error::Error>> {
        let export = read_policy(path).await?;
        let (profile, report) = self
            .templates
            .import_profile(self.tenant, export, &self.actor)
            .await?;
        for skipped in &report.skipped {
            eprintln!("Skipped rule '{}': {}", skipped.name, skipped.reason);
        }
        Ok(profile)
    }

    async fn compile(&self, path: &Path) -> Result<String, Box<dyn std::error::Error>> {
        let profile = self.import(path).await?;
        let rules = self
            .orchestrator
            .policy()
            .enabled_profile_rules(self.tenant, profile.id)
            .await?;
        check_rules_fit_profile(&profile, &rules)?;
        Ok(compile(&profile, &rules, chrono::Utc::now()))
    }
}

async fn read_policy(path: &Path) -> Result<ProfileExport, Box<dyn std::error::Error>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let export = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid policy document {}: {e}", path.display()))?;
    Ok(export)
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config(cli.config.as_deref()).await;

    match cli.command {
        Commands::Templates { category } => {
            let local = Local::new(config)?;
            local.templates.seed_builtin_templates().await?;
            let templates = local
                .templates
                .list_templates(local.tenant, category.as_deref())
                .await?;
            for t in templates {
                println!(
                    "{:<14} {:<10} {} ({} rule(s))",
                    t.name,
                    t.category,
                    t.description,
                    t.rules.len()
                );
            }
        }
        Commands::Init {
            template,
            name,
            output,
        } => {
            let local = Local::new(config)?;
            local.templates.seed_builtin_templates().await?;
            let found = local.templates.find_template(local.tenant, &template).await?;

            let mut settings = ProfileSettings::new(
                name.unwrap_or_else(|| found.name.clone()),
            );
            settings.description = found.description.clone();
            settings.enable_nat = found.rules.iter().any(|r| r.chain.is_nat());
            settings.enable_ipv6 = found.rules.iter().any(definition_uses_ipv6);

            let export = ProfileExport {
                format_version: EXPORT_FORMAT_VERSION,
                exported_at: chrono::Utc::now(),
                exported_by: local.actor.clone(),
                profile: settings,
                rules: found.rules,
            };
            let json = serde_json::to_string_pretty(&export)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json + "\n").await?;
                    println!("Wrote {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Validate { file } => validate(&file).await?,
        Commands::Compile { file } => {
            let local = Local::new(config)?;
            print!("{}", local.compile(&file).await?);
        }
        Commands::Diff { old, new } => {
            let local = Local::new(config)?;
            let old_script = local.compile(&old).await?;
            let new_script = local.compile(&new).await?;
            match script_diff(&old_script, &new_script) {
                Some(diff) => {
                    print!("{diff}");
                    let (added, removed) = change_counts(&diff);
                    eprintln!("{added} line(s) added, {removed} line(s) removed");
                }
                None => println!("No changes"),
            }
        }
        Commands::Deploy { file, dry_run } => {
            let local = Local::new(config)?;
            let profile = local.import(&file).await?;
            let ticket = local
                .orchestrator
                .apply(ApplyRequest {
                    tenant_id: local.tenant,
                    profile_id: profile.id,
                    agent_id: LOCAL_AGENT.to_string(),
                    dry_run,
                    actor: local.actor.clone(),
                })
                .await?;
            let deployment = finish(&local.orchestrator, ticket).await?;
            if dry_run {
                print!("{}", deployment.output);
            }
        }
        Commands::Audit => {
            let local = Local::new(config)?;
            let ticket = local
                .orchestrator
                .audit(local.tenant, LOCAL_AGENT, &local.actor)
                .await?;
            let deployment = finish(&local.orchestrator, ticket).await?;
            print!("{}", deployment.output);
        }
        Commands::Flush { confirm } => {
            let local = Local::new(config)?;
            let ticket = local
                .orchestrator
                .flush(local.tenant, LOCAL_AGENT, confirm, &local.actor)
                .await?;
            finish(&local.orchestrator, ticket).await?;
        }
        Commands::Log { count } => {
            let log = JsonLinesAuditLog::in_state_dir()?;
            for record in log.read_recent(count).await? {
                let outcome = if record.entry.success { "ok" } else { "FAILED" };
                println!(
                    "{} {:<8} {:<18} {:<6} {}",
                    record
                        .timestamp
                        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    record.actor,
                    record.entry.action,
                    outcome,
                    record.entry.error.as_deref().unwrap_or(&record.entry.resource_id)
                );
            }
        }
    }
    Ok(())
}

/// Waits for the background job and reports the result. Ctrl-C cancels
/// it; the job still records its terminal state.
async fn finish(
    orchestrator: &Orchestrator,
    ticket: DeploymentTicket,
) -> Result<Deployment, Box<dyn std::error::Error>> {
    let deployment = match ticket.handle {
        None => ticket.deployment,
        Some(handle) => {
            let id = handle.id();
            let wait = handle.wait();
            tokio::pin!(wait);
            let finished = tokio::select! {
                result = &mut wait => Some(result),
                Ok(()) = tokio::signal::ctrl_c() => None,
            };
            match finished {
                Some(result) => result?,
                None => {
                    eprintln!("Interrupted, cancelling deployment {id}...");
                    orchestrator.shutdown();
                    wait.await?
                }
            }
        }
    };

    println!(
        "{} {} [{}] {}",
        deployment.action, deployment.id, deployment.status, deployment.status_message
    );
    if deployment.status == DeploymentStatus::Error {
        if !deployment.output.is_empty() {
            eprintln!("{}", deployment.output);
        }
        return Err(format!("{} failed", deployment.action).into());
    }
    Ok(deployment)
}

async fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let export = read_policy(path).await?;
    let mut errors = 0usize;

    if export.format_version > EXPORT_FORMAT_VERSION {
        println!(
            "error: format_version {} is newer than supported ({EXPORT_FORMAT_VERSION})",
            export.format_version
        );
        errors += 1;
    }
    if let Err(e) = validate_profile_settings(&export.profile) {
        println!("error: profile: {e}");
        errors += 1;
    }

    for def in &export.rules {
        if let Err(e) = validate_rule_definition(def) {
            println!("error: rule '{}': {e}", def.name);
            errors += 1;
            continue;
        }
        if def.enabled
            && def.raw_expression.is_none()
            && definition_uses_ipv6(def)
            && !export.profile.enable_ipv6
        {
            println!(
                "error: rule '{}': uses IPv6 addresses but the profile has enable_ipv6 off",
                def.name
            );
            errors += 1;
            continue;
        }
        for warning in rule_warnings(def, &export.profile) {
            println!("warning: rule '{}': {warning}", def.name);
        }
    }

    if errors > 0 {
        return Err(format!("{errors} problem(s) found in {}", path.display()).into());
    }
    println!("{}: {} rule(s) OK", path.display(), export.rules.len());
    Ok(())
}

fn rule_warnings(def: &RuleDefinition, profile: &ProfileSettings) -> Vec<String> {
    let mut warnings = Vec::new();
    for addr in [&def.source_ip, &def.dest_ip].into_iter().flatten() {
        if let Ok(net) = validators::validate_address(addr)
            && let Some(warning) = validators::check_reserved_ip(net)
        {
            warnings.push(warning);
        }
    }
    if let Some(limit) = &def.rate_limit
        && let Ok(Some(warning)) = validators::validate_rate(&limit.rate)
    {
        warnings.push(warning);
    }
    if def.chain.is_nat() && !profile.enable_nat {
        warnings.push(format!(
            "{} rules are only compiled when the profile enables NAT",
            def.chain
        ));
    }
    if def.enabled && def.raw_expression.is_some() {
        warnings.push("raw expression overrides every other match field".to_string());
    }
    warnings
}
