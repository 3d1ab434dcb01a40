//! Templates, profile import and profile export
//!
//! Templates are reusable lists of [`RuleDefinition`]s. Applying one to a
//! profile, or importing an exported profile, *materializes* the
//! definitions: each becomes a tenant-owned [`Rule`] attributed to the
//! caller and attached to the target profile in order.
//!
//! # Failure handling
//!
//! [`MaterializeMode::BestEffort`] (default) creates what it can and lists
//! rejected definitions in the [`MaterializeReport`].
//! [`MaterializeMode::Strict`] validates every definition first and leaves
//! nothing behind when any step fails.
//!
//! Built-in templates are global and immutable; [`TemplateService::seed_builtin_templates`]
//! installs them once at startup.

use super::error::{Error, Result};
use super::firewall::{
    Action, Chain, LogLevel, Profile, ProfileSettings, Protocol, RateLimit, Rule, RuleDefinition,
    Template, TenantId,
};
use super::policy::{PolicyService, validate_profile_settings};
use super::rule_constraints::validate_rule_definition;
use crate::validators;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Current export format; newer exports are rejected on import
pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MaterializeMode {
    #[default]
    BestEffort,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRule {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Created rule ids, in attachment order
    pub created: Vec<Uuid>,
    pub skipped: Vec<SkippedRule>,
}

/// Portable profile document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileExport {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub exported_by: String,
    pub profile: ProfileSettings,
    pub rules: Vec<RuleDefinition>,
}

/// User-editable template fields
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub rules: Vec<RuleDefinition>,
}

#[derive(Clone)]
pub struct TemplateService {
    policy: PolicyService,
    mode: MaterializeMode,
}

impl TemplateService {
    pub fn new(policy: PolicyService, mode: MaterializeMode) -> Self {
        Self { policy, mode }
    }

    pub fn mode(&self) -> MaterializeMode {
        self.mode
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Template CRUD
    // ═══════════════════════════════════════════════════════════════════════

    /// Installs built-in templates missing by name. Returns how many were
    /// added.
    pub async fn seed_builtin_templates(&self) -> Result<usize> {
        let store = self.policy.store();
        // Global templates are visible to every tenant, including nil
        let existing = store.list_templates(Uuid::nil(), None).await?;

        let mut added = 0;
        for template in builtin_templates() {
            if existing
                .iter()
                .any(|t| t.builtin && t.name == template.name)
            {
                continue;
            }
            store.insert_template(template).await?;
            added += 1;
        }
        if added > 0 {
            info!("Seeded {added} built-in template(s)");
        }
        Ok(added)
    }

    pub async fn create_template(&self, tenant_id: TenantId, draft: TemplateDraft) -> Result<Template> {
        validate_draft(&draft)?;
        let now = Utc::now();
        let template = Template {
            id: Uuid::new_v4(),
            tenant_id: Some(tenant_id),
            name: draft.name,
            description: draft.description,
            category: draft.category,
            builtin: false,
            rules: draft.rules,
            created_at: now,
            updated_at: now,
        };
        self.policy.store().insert_template(template.clone()).await?;
        Ok(template)
    }

    pub async fn update_template(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        draft: TemplateDraft,
    ) -> Result<Template> {
        let mut template = self.editable_template(tenant_id, id).await?;
        validate_draft(&draft)?;
        template.name = draft.name;
        template.description = draft.description;
        template.category = draft.category;
        template.rules = draft.rules;
        template.updated_at = Utc::now();
        self.policy.store().update_template(template.clone()).await?;
        Ok(template)
    }

    pub async fn delete_template(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        self.editable_template(tenant_id, id).await?;
        self.policy.store().delete_template(tenant_id, id).await
    }

    pub async fn get_template(&self, tenant_id: TenantId, id: Uuid) -> Result<Template> {
        self.policy
            .store()
            .get_template(tenant_id, id)
            .await?
            .ok_or_else(|| Error::not_found("Template", id))
    }

    /// Finds a visible template by name (tenant templates shadow global ones).
    pub async fn find_template(&self, tenant_id: TenantId, name: &str) -> Result<Template> {
        let mut matches: Vec<Template> = self
            .list_templates(tenant_id, None)
            .await?
            .into_iter()
            .filter(|t| t.name == name)
            .collect();
        matches.sort_by_key(|t| t.tenant_id.is_none());
        matches
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("Template", name))
    }

    pub async fn list_templates(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
    ) -> Result<Vec<Template>> {
        self.policy.store().list_templates(tenant_id, category).await
    }

    async fn editable_template(&self, tenant_id: TenantId, id: Uuid) -> Result<Template> {
        let template = self.get_template(tenant_id, id).await?;
        if template.builtin || template.tenant_id.is_none() {
            return Err(Error::Immutable(format!(
                "template '{}' is built-in",
                template.name
            )));
        }
        Ok(template)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Materialization
    // ═══════════════════════════════════════════════════════════════════════

    /// Creates the template's rules for the tenant and appends them to the
    /// profile.
    pub async fn apply_template(
        &self,
        tenant_id: TenantId,
        template_id: Uuid,
        profile_id: Uuid,
        actor: &str,
    ) -> Result<MaterializeReport> {
        let template = self.get_template(tenant_id, template_id).await?;
        self.policy.get_profile(tenant_id, profile_id).await?;

        let report = self
            .materialize(tenant_id, profile_id, template.rules, actor)
            .await?;
        info!(
            template = %template.name,
            profile_id = %profile_id,
            created = report.created.len(),
            skipped = report.skipped.len(),
            "template applied"
        );
        Ok(report)
    }

    /// Creates a new profile from an export document.
    ///
    /// The imported profile is never marked default.
    pub async fn import_profile(
        &self,
        tenant_id: TenantId,
        export: ProfileExport,
        actor: &str,
    ) -> Result<(Profile, MaterializeReport)> {
        if export.format_version > EXPORT_FORMAT_VERSION {
            return Err(Error::validation(
                "format_version",
                format!(
                    "Unsupported export format {} (max {EXPORT_FORMAT_VERSION})",
                    export.format_version
                ),
            ));
        }

        let mut settings = export.profile;
        settings.is_default = false;
        validate_profile_settings(&settings)?;

        if self.mode == MaterializeMode::Strict {
            validate_all(&export.rules)?;
        }

        let profile = self.policy.create_profile(tenant_id, settings, actor).await?;
        match self
            .materialize(tenant_id, profile.id, export.rules, actor)
            .await
        {
            Ok(report) => Ok((profile, report)),
            Err(e) => {
                if let Err(cleanup) = self.policy.delete_profile(tenant_id, profile.id).await {
                    warn!("Failed to remove partially imported profile: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Portable document with the profile's settings and every attached
    /// rule (disabled ones included) in association order.
    pub async fn export_profile(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        actor: &str,
    ) -> Result<ProfileExport> {
        let profile = self.policy.get_profile(tenant_id, profile_id).await?;
        let rules = self.policy.profile_rules(tenant_id, profile_id).await?;
        Ok(ProfileExport {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            exported_by: actor.to_string(),
            profile: profile.settings,
            rules: rules.iter().map(Rule::to_definition).collect(),
        })
    }

    async fn materialize(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        defs: Vec<RuleDefinition>,
        actor: &str,
    ) -> Result<MaterializeReport> {
        if self.mode == MaterializeMode::Strict {
            validate_all(&defs)?;
        }

        let mut report = MaterializeReport::default();
        for def in defs {
            let name = def.name.clone();
            match self.policy.create_rule(tenant_id, def, actor).await {
                Ok(rule) => report.created.push(rule.id),
                Err(e) if self.mode == MaterializeMode::BestEffort => {
                    warn!("Skipping rule '{}': {}", name, e);
                    report.skipped.push(SkippedRule {
                        name,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.discard(tenant_id, &report.created).await;
                    return Err(e);
                }
            }
        }

        if !report.created.is_empty()
            && let Err(e) = self
                .policy
                .add_rules(tenant_id, profile_id, &report.created)
                .await
        {
            self.discard(tenant_id, &report.created).await;
            return Err(e);
        }

        Ok(report)
    }

    async fn discard(&self, tenant_id: TenantId, rule_ids: &[Uuid]) {
        for id in rule_ids {
            if let Err(e) = self.policy.delete_rule(tenant_id, *id).await {
                warn!("Failed to remove rule {} during cleanup: {}", id, e);
            }
        }
    }
}

fn validate_all(defs: &[RuleDefinition]) -> Result<()> {
    for def in defs {
        validate_rule_definition(def).map_err(|e| match e {
            Error::Validation { field, message } => Error::validation(
                format!("rules[{}].{field}", def.name),
                message,
            ),
            other => other,
        })?;
    }
    Ok(())
}

fn validate_draft(draft: &TemplateDraft) -> Result<()> {
    validators::validate_name(&draft.name).map_err(|e| Error::validation("name", e))?;
    validate_all(&draft.rules)
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in templates
// ═══════════════════════════════════════════════════════════════════════════

fn tcp_accept(name: &str, ports: &str, comment: &str) -> RuleDefinition {
    RuleDefinition {
        protocol: Protocol::Tcp,
        dest_port: Some(ports.to_string()),
        action: Some(Action::Accept),
        comment: comment.to_string(),
        ..RuleDefinition::new(name, Chain::Input)
    }
}

fn builtin(name: &str, category: &str, description: &str, rules: Vec<RuleDefinition>) -> Template {
    let now = Utc::now();
    Template {
        id: Uuid::new_v4(),
        tenant_id: None,
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        builtin: true,
        rules,
        created_at: now,
        updated_at: now,
    }
}

/// The global templates shipped with nftfleet
pub fn builtin_templates() -> Vec<Template> {
    let ssh = tcp_accept("Allow SSH", "22", "remote administration");

    let lockdown_ssh = RuleDefinition {
        source_ip: Some("10.0.0.0/8".to_string()),
        ct_state: Some("new".to_string()),
        rate_limit: Some(RateLimit {
            rate: "10/minute".to_string(),
            burst: Some(5),
            over_limit: Some(Action::Drop),
        }),
        ..tcp_accept("Allow SSH from management", "22", "management network only")
    };

    let log_drops = RuleDefinition {
        action: Some(Action::Log),
        log_prefix: Some("nftfleet-drop: ".to_string()),
        log_level: Some(LogLevel::Warn),
        rate_limit: Some(RateLimit {
            rate: "5/minute".to_string(),
            burst: None,
            over_limit: None,
        }),
        priority: 1000,
        comment: "log packets about to hit the drop policy".to_string(),
        ..RuleDefinition::new("Log dropped", Chain::Input)
    };

    let masquerade = RuleDefinition {
        interface_out: Some("eth0".to_string()),
        action: Some(Action::Masquerade),
        comment: "share uplink address".to_string(),
        ..RuleDefinition::new("Masquerade uplink", Chain::Postrouting)
    };

    let lan_forward = RuleDefinition {
        interface_in: Some("eth1".to_string()),
        interface_out: Some("eth0".to_string()),
        action: Some(Action::Accept),
        comment: "LAN to uplink".to_string(),
        ..RuleDefinition::new("Forward LAN", Chain::Forward)
    };

    vec![
        builtin(
            "ssh-only",
            "access",
            "Accept SSH, drop everything else inbound",
            vec![ssh.clone()],
        ),
        builtin(
            "web-server",
            "server",
            "SSH plus HTTP and HTTPS",
            vec![
                ssh.clone(),
                tcp_accept("Allow HTTP/HTTPS", "80,443", "public web traffic"),
            ],
        ),
        builtin(
            "nat-gateway",
            "network",
            "Masquerade LAN (eth1) behind the uplink (eth0); enable NAT on the profile",
            vec![ssh, lan_forward, masquerade],
        ),
        builtin(
            "lockdown",
            "security",
            "SSH from the management network only, rate limited, drops logged",
            vec![lockdown_ssh, log_drops],
        ),
    ]
}
