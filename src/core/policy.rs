//! Tenant-scoped policy operations
//!
//! [`PolicyService`] wraps a [`PolicyStore`] with input validation,
//! creator/timestamp bookkeeping and the profile invariants:
//!
//! - at most one default profile per tenant (marking one clears the rest)
//! - the default profile cannot be deleted
//! - at most [`MAX_RULES`] rules per profile

use super::error::{Error, Result};
use super::firewall::{MAX_RULES, Profile, ProfileSettings, Rule, RuleDefinition, TenantId};
use super::rule_constraints::validate_rule_definition;
use super::store::{PolicyStore, RuleFilter};
use crate::validators;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn PolicyStore>,
}

impl PolicyService {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Rules
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn create_rule(
        &self,
        tenant_id: TenantId,
        def: RuleDefinition,
        actor: &str,
    ) -> Result<Rule> {
        validate_rule_definition(&def)?;
        let rule = Rule::from_definition(def, tenant_id, actor);
        self.store.insert_rule(rule.clone()).await?;
        info!(rule_id = %rule.id, name = %rule.name, "rule created");
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        def: RuleDefinition,
    ) -> Result<Rule> {
        validate_rule_definition(&def)?;
        let mut rule = self.get_rule(tenant_id, id).await?;
        rule.apply_definition(def);
        self.store.update_rule(rule.clone()).await?;
        Ok(rule)
    }

    pub async fn set_rule_enabled(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        enabled: bool,
    ) -> Result<Rule> {
        let mut rule = self.get_rule(tenant_id, id).await?;
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        self.store.update_rule(rule.clone()).await?;
        Ok(rule)
    }

    /// Deletes the rule and detaches it from every profile.
    pub async fn delete_rule(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        self.store.delete_rule(tenant_id, id).await?;
        info!(rule_id = %id, "rule deleted");
        Ok(())
    }

    pub async fn get_rule(&self, tenant_id: TenantId, id: Uuid) -> Result<Rule> {
        self.store
            .get_rule(tenant_id, id)
            .await?
            .ok_or_else(|| Error::not_found("Rule", id))
    }

    pub async fn list_rules(&self, tenant_id: TenantId, filter: &RuleFilter) -> Result<Vec<Rule>> {
        self.store.list_rules(tenant_id, filter).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profiles
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn create_profile(
        &self,
        tenant_id: TenantId,
        settings: ProfileSettings,
        actor: &str,
    ) -> Result<Profile> {
        validate_profile_settings(&settings)?;
        let profile = Profile::new(settings, tenant_id, actor);
        self.store.insert_profile(profile.clone()).await?;
        if profile.settings.is_default {
            self.store
                .clear_default_profiles(tenant_id, profile.id)
                .await?;
        }
        info!(profile_id = %profile.id, name = %profile.name(), "profile created");
        Ok(profile)
    }

    pub async fn update_profile(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        settings: ProfileSettings,
    ) -> Result<Profile> {
        validate_profile_settings(&settings)?;
        let mut profile = self.get_profile(tenant_id, id).await?;
        profile.settings = settings;
        profile.updated_at = Utc::now();
        self.store.update_profile(profile.clone()).await?;
        if profile.settings.is_default {
            self.store.clear_default_profiles(tenant_id, id).await?;
        }
        Ok(profile)
    }

    /// Deletes a profile and its associations; the tenant's default profile
    /// is refused.
    pub async fn delete_profile(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        let profile = self.get_profile(tenant_id, id).await?;
        if profile.settings.is_default {
            return Err(Error::Immutable(format!(
                "profile '{}' is the default profile and cannot be deleted",
                profile.name()
            )));
        }
        self.store.delete_profile(tenant_id, id).await?;
        info!(profile_id = %id, "profile deleted");
        Ok(())
    }

    pub async fn get_profile(&self, tenant_id: TenantId, id: Uuid) -> Result<Profile> {
        self.store
            .get_profile(tenant_id, id)
            .await?
            .ok_or_else(|| Error::not_found("Profile", id))
    }

    pub async fn list_profiles(&self, tenant_id: TenantId) -> Result<Vec<Profile>> {
        self.store.list_profiles(tenant_id).await
    }

    pub async fn default_profile(&self, tenant_id: TenantId) -> Result<Option<Profile>> {
        Ok(self
            .store
            .list_profiles(tenant_id)
            .await?
            .into_iter()
            .find(|p| p.settings.is_default))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Associations
    // ═══════════════════════════════════════════════════════════════════════

    /// Appends rules to the profile in the given order.
    pub async fn add_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
    ) -> Result<()> {
        let current = self.store.profile_rules(tenant_id, profile_id).await?;
        let new = rule_ids
            .iter()
            .filter(|id| !current.iter().any(|r| r.id == **id))
            .count();
        check_rule_cap(current.len() + new)?;
        self.store
            .attach_rules(tenant_id, profile_id, rule_ids, false)
            .await
    }

    /// Replaces the profile's rule set in one step.
    pub async fn replace_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
    ) -> Result<()> {
        check_rule_cap(rule_ids.len())?;
        self.store
            .attach_rules(tenant_id, profile_id, rule_ids, true)
            .await
    }

    pub async fn remove_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
    ) -> Result<()> {
        self.store
            .detach_rules(tenant_id, profile_id, rule_ids)
            .await
    }

    /// Attached rules in association order.
    pub async fn profile_rules(&self, tenant_id: TenantId, profile_id: Uuid) -> Result<Vec<Rule>> {
        self.store.profile_rules(tenant_id, profile_id).await
    }

    /// Attached and enabled rules in association order.
    pub async fn enabled_profile_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
    ) -> Result<Vec<Rule>> {
        let mut rules = self.store.profile_rules(tenant_id, profile_id).await?;
        rules.retain(|r| r.enabled);
        Ok(rules)
    }
}

/// Validates user-editable profile settings.
pub fn validate_profile_settings(settings: &ProfileSettings) -> Result<()> {
    validators::validate_name(&settings.name).map_err(|e| Error::validation("name", e))
}

fn check_rule_cap(count: usize) -> Result<()> {
    if count > MAX_RULES {
        return Err(Error::validation(
            "rules",
            format!("Profile cannot hold more than {MAX_RULES} rules ({count} requested)"),
        ));
    }
    Ok(())
}
