//! Storage collaborator traits
//!
//! The orchestrator and the policy service only talk to storage through
//! these traits. Every call is tenant-scoped: an entity owned by another
//! tenant is reported as missing, never returned.
//!
//! [`crate::core::memory::InMemoryStore`] implements both traits.

use super::deployment::{Deployment, DeploymentFilter};
use super::error::Result;
use super::firewall::{Chain, Profile, Rule, Template, TenantId};
use async_trait::async_trait;
use uuid::Uuid;

/// Filters for listing rules
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub chain: Option<Chain>,
    pub enabled: Option<bool>,
    /// Case-insensitive substring over name, description and comment
    pub search: Option<String>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        if self.chain.is_some_and(|c| c != rule.chain) {
            return false;
        }
        if self.enabled.is_some_and(|e| e != rule.enabled) {
            return false;
        }
        if let Some(term) = &self.search {
            let term = term.to_lowercase();
            return [&rule.name, &rule.description, &rule.comment]
                .iter()
                .any(|s| s.to_lowercase().contains(&term));
        }
        true
    }
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    // ─── Rules ───

    async fn insert_rule(&self, rule: Rule) -> Result<()>;

    /// Replaces an existing rule; `NotFound` if it is not visible.
    async fn update_rule(&self, rule: Rule) -> Result<()>;

    async fn get_rule(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Rule>>;

    /// Sorted by chain, priority, then name.
    async fn list_rules(&self, tenant_id: TenantId, filter: &RuleFilter) -> Result<Vec<Rule>>;

    /// Deletes the rule and every association pointing at it.
    async fn delete_rule(&self, tenant_id: TenantId, id: Uuid) -> Result<()>;

    // ─── Profiles ───

    async fn insert_profile(&self, profile: Profile) -> Result<()>;

    async fn update_profile(&self, profile: Profile) -> Result<()>;

    async fn get_profile(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Profile>>;

    /// Sorted by name.
    async fn list_profiles(&self, tenant_id: TenantId) -> Result<Vec<Profile>>;

    /// Deletes the profile and its associations (rules are kept).
    async fn delete_profile(&self, tenant_id: TenantId, id: Uuid) -> Result<()>;

    /// Clears `is_default` on every profile of the tenant except `keep`.
    async fn clear_default_profiles(&self, tenant_id: TenantId, keep: Uuid) -> Result<()>;

    // ─── Profile ↔ rule associations ───

    /// Attaches `rule_ids` to the profile, in order, after any existing
    /// links (or in place of them when `replace` is set).
    ///
    /// The whole batch is checked first: a missing or foreign rule fails
    /// the call with no association written. Rules already linked are
    /// skipped when appending.
    async fn attach_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
        replace: bool,
    ) -> Result<()>;

    async fn detach_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
    ) -> Result<()>;

    /// Rules attached to the profile, ordered by `sort_order`.
    async fn profile_rules(&self, tenant_id: TenantId, profile_id: Uuid) -> Result<Vec<Rule>>;

    // ─── Templates ───

    async fn insert_template(&self, template: Template) -> Result<()>;

    async fn update_template(&self, template: Template) -> Result<()>;

    /// Tenant-owned or global template.
    async fn get_template(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Template>>;

    /// Visible templates (tenant + global), sorted by category then name.
    async fn list_templates(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
    ) -> Result<Vec<Template>>;

    async fn delete_template(&self, tenant_id: TenantId, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_deployment(&self, deployment: Deployment) -> Result<()>;

    async fn update_deployment(&self, deployment: Deployment) -> Result<()>;

    async fn get_deployment(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Deployment>>;

    /// Newest first, paginated.
    async fn list_deployments(
        &self,
        tenant_id: TenantId,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>>;

    /// Ignores pagination.
    async fn count_deployments(
        &self,
        tenant_id: TenantId,
        filter: &DeploymentFilter,
    ) -> Result<usize>;
}
