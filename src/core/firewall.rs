//! Firewall policy data structures
//!
//! This module defines the tenant-scoped entities the compiler and the
//! orchestrator work with:
//!
//! - [`Rule`]: a single match/action rule living in one chain
//! - [`Profile`]: chain policies plus feature flags; rules attach to it via
//!   an ordered association held by the store
//! - [`Template`]: a reusable, non-live list of [`RuleDefinition`]s
//!
//! [`RuleDefinition`] is the portable shape of a rule (no identity, no
//! tenant). Templates embed it, exports emit it and imports consume it.
//!
//! # Limits
//!
//! Profiles are limited to [`MAX_RULES`] attached rules to keep compiled
//! scripts and deployment snapshots bounded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of rules that can be attached to a single profile
pub const MAX_RULES: usize = 1000;

pub type TenantId = Uuid;

/// Chain a rule belongs to
///
/// The first three are filter chains; `Prerouting`/`Postrouting` only
/// compile when the profile enables NAT.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chain {
    /// Traffic addressed to the host
    #[default]
    Input,
    /// Traffic originating from the host
    Output,
    /// Routed traffic
    Forward,
    /// Destination NAT stage
    Prerouting,
    /// Source NAT stage
    Postrouting,
}

impl Chain {
    /// Filter-table chains in the order they are emitted
    pub const FILTER: [Chain; 3] = [Chain::Input, Chain::Output, Chain::Forward];

    pub const fn is_nat(self) -> bool {
        matches!(self, Chain::Prerouting | Chain::Postrouting)
    }
}

/// Network protocol type for firewall rules
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// Match all protocols (no protocol clause)
    #[default]
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// What happens when a packet matches the rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Accept,
    /// Drop the packet silently (no response sent)
    Drop,
    /// Reject the packet and send an ICMP unreachable response
    Reject,
    /// Log the packet and continue evaluation
    Log,
    Masquerade,
    Snat,
    Dnat,
    Redirect,
}

impl Action {
    /// Returns `true` for actions that are only valid inside NAT chains
    pub const fn is_nat(self) -> bool {
        matches!(
            self,
            Action::Masquerade | Action::Snat | Action::Dnat | Action::Redirect
        )
    }
}

/// Default verdict of a filter chain
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainPolicy {
    Accept,
    Drop,
}

/// Syslog level for `log` actions
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Err,
    Warn,
    Notice,
    Info,
    Debug,
}

/// Rate limiting configuration
///
/// `rate` is an nft rate expression such as `10/second` or `100/minute`.
/// `over_limit` records what the operator expects to happen to packets
/// above the rate; the compiled rule only matches packets under the limit,
/// so excess traffic falls through to later rules and the chain policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub rate: String,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub over_limit: Option<Action>,
}

/// Portable rule shape, free of identity and tenant
///
/// Used by templates, exports, imports, and as the input to rule creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chain: Chain,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_expression: Option<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RuleDefinition {
    /// Minimal definition: everything else unset, enabled.
    pub fn new(name: impl Into<String>, chain: Chain) -> Self {
        Self {
            name: name.into(),
            chain,
            enabled: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub chain: Chain,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub source_port: Option<String>,
    #[serde(default)]
    pub dest_ip: Option<String>,
    #[serde(default)]
    pub dest_port: Option<String>,
    /// Unset compiles to `accept`
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub interface_in: Option<String>,
    #[serde(default)]
    pub interface_out: Option<String>,
    #[serde(default)]
    pub ct_state: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub nat_address: Option<String>,
    #[serde(default)]
    pub nat_port: Option<u16>,
    #[serde(default)]
    pub log_prefix: Option<String>,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    /// Verbatim nft expression; replaces every other clause when set
    #[serde(default)]
    pub raw_expression: Option<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Materializes a live rule from a portable definition.
    pub fn from_definition(def: RuleDefinition, tenant_id: TenantId, created_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: def.name,
            description: def.description,
            chain: def.chain,
            priority: def.priority,
            protocol: def.protocol,
            source_ip: def.source_ip,
            source_port: def.source_port,
            dest_ip: def.dest_ip,
            dest_port: def.dest_port,
            action: def.action,
            interface_in: def.interface_in,
            interface_out: def.interface_out,
            ct_state: def.ct_state,
            rate_limit: def.rate_limit,
            nat_address: def.nat_address,
            nat_port: def.nat_port,
            log_prefix: def.log_prefix,
            log_level: def.log_level,
            raw_expression: def.raw_expression,
            comment: def.comment,
            enabled: def.enabled,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrites every user-editable field from `def`, keeping identity,
    /// tenant, creator and creation time.
    pub fn apply_definition(&mut self, def: RuleDefinition) {
        self.name = def.name;
        self.description = def.description;
        self.chain = def.chain;
        self.priority = def.priority;
        self.protocol = def.protocol;
        self.source_ip = def.source_ip;
        self.source_port = def.source_port;
        self.dest_ip = def.dest_ip;
        self.dest_port = def.dest_port;
        self.action = def.action;
        self.interface_in = def.interface_in;
        self.interface_out = def.interface_out;
        self.ct_state = def.ct_state;
        self.rate_limit = def.rate_limit;
        self.nat_address = def.nat_address;
        self.nat_port = def.nat_port;
        self.log_prefix = def.log_prefix;
        self.log_level = def.log_level;
        self.raw_expression = def.raw_expression;
        self.comment = def.comment;
        self.enabled = def.enabled;
        self.updated_at = Utc::now();
    }

    /// Portable form of this rule (drops identity and tenant).
    pub fn to_definition(&self) -> RuleDefinition {
        RuleDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            chain: self.chain,
            priority: self.priority,
            protocol: self.protocol,
            source_ip: self.source_ip.clone(),
            source_port: self.source_port.clone(),
            dest_ip: self.dest_ip.clone(),
            dest_port: self.dest_port.clone(),
            action: self.action,
            interface_in: self.interface_in.clone(),
            interface_out: self.interface_out.clone(),
            ct_state: self.ct_state.clone(),
            rate_limit: self.rate_limit.clone(),
            nat_address: self.nat_address.clone(),
            nat_port: self.nat_port,
            log_prefix: self.log_prefix.clone(),
            log_level: self.log_level,
            raw_expression: self.raw_expression.clone(),
            comment: self.comment.clone(),
            enabled: self.enabled,
        }
    }

    pub fn effective_action(&self) -> Action {
        self.action.unwrap_or(Action::Accept)
    }
}

fn default_true() -> bool {
    true
}

/// User-editable profile settings (everything except identity/tenant)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileSettings {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_policy: Option<ChainPolicy>,
    #[serde(default)]
    pub output_policy: Option<ChainPolicy>,
    #[serde(default)]
    pub forward_policy: Option<ChainPolicy>,
    #[serde(default)]
    pub enable_nat: bool,
    #[serde(default = "default_true")]
    pub enable_conntrack: bool,
    #[serde(default = "default_true")]
    pub allow_loopback: bool,
    #[serde(default = "default_true")]
    pub allow_established: bool,
    #[serde(default = "default_true")]
    pub allow_icmp_ping: bool,
    #[serde(default)]
    pub enable_ipv6: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProfileSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_policy: None,
            output_policy: None,
            forward_policy: None,
            enable_nat: false,
            enable_conntrack: true,
            allow_loopback: true,
            allow_established: true,
            allow_icmp_ping: true,
            enable_ipv6: false,
            is_default: false,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: Uuid,
    pub tenant_id: TenantId,
    #[serde(flatten)]
    pub settings: ProfileSettings,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(settings: ProfileSettings, tenant_id: TenantId, created_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            settings,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Resolved default policy for a filter chain.
    ///
    /// Unset input/forward policies fall back to `drop`, output to `accept`.
    pub fn policy_for(&self, chain: Chain) -> ChainPolicy {
        let configured = match chain {
            Chain::Input => self.settings.input_policy,
            Chain::Output => self.settings.output_policy,
            Chain::Forward => self.settings.forward_policy,
            Chain::Prerouting | Chain::Postrouting => Some(ChainPolicy::Accept),
        };
        configured.unwrap_or(match chain {
            Chain::Output => ChainPolicy::Accept,
            _ => ChainPolicy::Drop,
        })
    }
}

/// Ordered association between a profile and a rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRuleLink {
    pub profile_id: Uuid,
    pub rule_id: Uuid,
    pub sort_order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    pub id: Uuid,
    /// `None` for global templates visible to every tenant
    pub tenant_id: Option<TenantId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    /// Built-in templates cannot be edited or deleted
    #[serde(default)]
    pub builtin: bool,
    pub rules: Vec<RuleDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn is_visible_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id.is_none_or(|owner| owner == tenant_id)
    }
}
