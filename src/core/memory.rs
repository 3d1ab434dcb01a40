//! In-memory store
//!
//! Backs both [`PolicyStore`] and [`DeploymentStore`] with hash maps behind
//! a single `tokio::sync::RwLock`. One lock keeps multi-entity operations
//! (deleting a rule with its links, replacing a profile's rule set) atomic.

use super::deployment::{Deployment, DeploymentFilter};
use super::error::{Error, Result};
use super::firewall::{Profile, ProfileRuleLink, Rule, Template, TenantId};
use super::store::{DeploymentStore, PolicyStore, RuleFilter};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    rules: HashMap<Uuid, Rule>,
    profiles: HashMap<Uuid, Profile>,
    links: Vec<ProfileRuleLink>,
    templates: HashMap<Uuid, Template>,
    deployments: HashMap<Uuid, Deployment>,
}

impl State {
    fn rule(&self, tenant_id: TenantId, id: Uuid) -> Option<&Rule> {
        self.rules.get(&id).filter(|r| r.tenant_id == tenant_id)
    }

    fn profile(&self, tenant_id: TenantId, id: Uuid) -> Option<&Profile> {
        self.profiles.get(&id).filter(|p| p.tenant_id == tenant_id)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryStore {
    async fn insert_rule(&self, rule: Rule) -> Result<()> {
        self.state.write().await.rules.insert(rule.id, rule);
        Ok(())
    }

    async fn update_rule(&self, rule: Rule) -> Result<()> {
        let mut state = self.state.write().await;
        if state.rule(rule.tenant_id, rule.id).is_none() {
            return Err(Error::not_found("Rule", rule.id));
        }
        state.rules.insert(rule.id, rule);
        Ok(())
    }

    async fn get_rule(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Rule>> {
        Ok(self.state.read().await.rule(tenant_id, id).cloned())
    }

    async fn list_rules(&self, tenant_id: TenantId, filter: &RuleFilter) -> Result<Vec<Rule>> {
        let state = self.state.read().await;
        let mut rules: Vec<Rule> = state
            .rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && filter.matches(r))
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            (a.chain as u8, a.priority, &a.name).cmp(&(b.chain as u8, b.priority, &b.name))
        });
        Ok(rules)
    }

    async fn delete_rule(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if state.rule(tenant_id, id).is_none() {
            return Err(Error::not_found("Rule", id));
        }
        state.rules.remove(&id);
        state.links.retain(|l| l.rule_id != id);
        Ok(())
    }

    async fn insert_profile(&self, profile: Profile) -> Result<()> {
        self.state.write().await.profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn update_profile(&self, profile: Profile) -> Result<()> {
        let mut state = self.state.write().await;
        if state.profile(profile.tenant_id, profile.id).is_none() {
            return Err(Error::not_found("Profile", profile.id));
        }
        state.profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn get_profile(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Profile>> {
        Ok(self.state.read().await.profile(tenant_id, id).cloned())
    }

    async fn list_profiles(&self, tenant_id: TenantId) -> Result<Vec<Profile>> {
        let state = self.state.read().await;
        let mut profiles: Vec<Profile> = state
            .profiles
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(profiles)
    }

    async fn delete_profile(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if state.profile(tenant_id, id).is_none() {
            return Err(Error::not_found("Profile", id));
        }
        state.profiles.remove(&id);
        state.links.retain(|l| l.profile_id != id);
        Ok(())
    }

    async fn clear_default_profiles(&self, tenant_id: TenantId, keep: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        for profile in state.profiles.values_mut() {
            if profile.tenant_id == tenant_id && profile.id != keep {
                profile.settings.is_default = false;
            }
        }
        Ok(())
    }

    async fn attach_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
        replace: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.profile(tenant_id, profile_id).is_none() {
            return Err(Error::not_found("Profile", profile_id));
        }

        // Validate the whole batch before touching any link
        for id in rule_ids {
            match state.rules.get(id) {
                None => return Err(Error::not_found("Rule", id)),
                Some(rule) if rule.tenant_id != tenant_id => {
                    return Err(Error::TenantMismatch {
                        kind: "Rule",
                        id: id.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if replace {
            state.links.retain(|l| l.profile_id != profile_id);
        }

        let existing: HashSet<Uuid> = state
            .links
            .iter()
            .filter(|l| l.profile_id == profile_id)
            .map(|l| l.rule_id)
            .collect();
        let mut next = state
            .links
            .iter()
            .filter(|l| l.profile_id == profile_id)
            .map(|l| l.sort_order + 1)
            .max()
            .unwrap_or(0);

        let mut added = HashSet::new();
        for &rule_id in rule_ids {
            if existing.contains(&rule_id) || !added.insert(rule_id) {
                continue;
            }
            state.links.push(ProfileRuleLink {
                profile_id,
                rule_id,
                sort_order: next,
            });
            next += 1;
        }
        Ok(())
    }

    async fn detach_rules(
        &self,
        tenant_id: TenantId,
        profile_id: Uuid,
        rule_ids: &[Uuid],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.profile(tenant_id, profile_id).is_none() {
            return Err(Error::not_found("Profile", profile_id));
        }
        state
            .links
            .retain(|l| l.profile_id != profile_id || !rule_ids.contains(&l.rule_id));
        Ok(())
    }

    async fn profile_rules(&self, tenant_id: TenantId, profile_id: Uuid) -> Result<Vec<Rule>> {
        let state = self.state.read().await;
        if state.profile(tenant_id, profile_id).is_none() {
            return Err(Error::not_found("Profile", profile_id));
        }
        let mut links: Vec<&ProfileRuleLink> = state
            .links
            .iter()
            .filter(|l| l.profile_id == profile_id)
            .collect();
        links.sort_by_key(|l| l.sort_order);
        Ok(links
            .into_iter()
            .filter_map(|l| state.rule(tenant_id, l.rule_id).cloned())
            .collect())
    }

    async fn insert_template(&self, template: Template) -> Result<()> {
        self.state
            .write()
            .await
            .templates
            .insert(template.id, template);
        Ok(())
    }

    async fn update_template(&self, template: Template) -> Result<()> {
        let mut state = self.state.write().await;
        match state.templates.get(&template.id) {
            Some(existing) if existing.tenant_id == template.tenant_id => {}
            _ => return Err(Error::not_found("Template", template.id)),
        }
        state.templates.insert(template.id, template);
        Ok(())
    }

    async fn get_template(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Template>> {
        Ok(self
            .state
            .read()
            .await
            .templates
            .get(&id)
            .filter(|t| t.is_visible_to(tenant_id))
            .cloned())
    }

    async fn list_templates(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
    ) -> Result<Vec<Template>> {
        let state = self.state.read().await;
        let mut templates: Vec<Template> = state
            .templates
            .values()
            .filter(|t| t.is_visible_to(tenant_id))
            .filter(|t| category.is_none_or(|c| t.category == c))
            .cloned()
            .collect();
        templates.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        Ok(templates)
    }

    async fn delete_template(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        match state.templates.get(&id) {
            Some(t) if t.tenant_id == Some(tenant_id) => {
                state.templates.remove(&id);
                Ok(())
            }
            _ => Err(Error::not_found("Template", id)),
        }
    }
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn insert_deployment(&self, deployment: Deployment) -> Result<()> {
        self.state
            .write()
            .await
            .deployments
            .insert(deployment.id, deployment);
        Ok(())
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<()> {
        let mut state = self.state.write().await;
        match state.deployments.get(&deployment.id) {
            Some(existing) if existing.tenant_id == deployment.tenant_id => {}
            _ => return Err(Error::not_found("Deployment", deployment.id)),
        }
        state.deployments.insert(deployment.id, deployment);
        Ok(())
    }

    async fn get_deployment(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<Deployment>> {
        Ok(self
            .state
            .read()
            .await
            .deployments
            .get(&id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_deployments(
        &self,
        tenant_id: TenantId,
        filter: &DeploymentFilter,
    ) -> Result<Vec<Deployment>> {
        let state = self.state.read().await;
        let mut matching: Vec<&Deployment> = state
            .deployments
            .values()
            .filter(|d| d.tenant_id == tenant_id && filter.matches(d))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count_deployments(
        &self,
        tenant_id: TenantId,
        filter: &DeploymentFilter,
    ) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .deployments
            .values()
            .filter(|d| d.tenant_id == tenant_id && filter.matches(d))
            .count())
    }
}
