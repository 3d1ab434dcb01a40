//! Rule constraint functions for firewall rules
//!
//! This module centralizes business logic about valid field combinations.
//! Field-level syntax lives in [`crate::validators`]; the functions here
//! decide whether otherwise-valid fields make sense together (ports on a
//! protocol without ports, NAT actions outside NAT chains, and so on).
//!
//! [`validate_rule_definition`] is the single entry point used by the policy
//! service and by template materialization.
//!
//! # Examples
//!
//! ```
//! use nftfleet::core::firewall::{Action, Chain, Protocol};
//! use nftfleet::core::rule_constraints::*;
//!
//! assert!(protocol_supports_ports(Protocol::Tcp));
//! assert!(!protocol_supports_ports(Protocol::Icmp));
//!
//! assert!(action_allowed_in_chain(Action::Dnat, Chain::Prerouting));
//! assert!(!action_allowed_in_chain(Action::Dnat, Chain::Input));
//! ```

use super::error::{Error, Result};
use super::firewall::{Action, Chain, Profile, Protocol, Rule, RuleDefinition};
use crate::validators;
use ipnetwork::IpNetwork;

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol can carry a port match.
///
/// TCP and UDP render protocol-qualified port clauses; `all` falls back to
/// the transport-header form (`th dport`). ICMP has no ports.
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    !matches!(protocol, Protocol::Icmp)
}

/// Returns `true` if the address version is compatible with the protocol.
///
/// `icmp` is the IPv4 protocol; pairing it with an IPv6 address yields a
/// rule that never matches.
#[inline]
pub fn ip_compatible_with_protocol(ip: &IpNetwork, protocol: Protocol) -> bool {
    match protocol {
        Protocol::Icmp => ip.is_ipv4(),
        _ => true,
    }
}

/// Returns `true` if both addresses are of the same IP version.
///
/// An `ip saddr` and an `ip6 daddr` in the same rule can never both match.
#[inline]
pub fn addresses_same_family(source: &IpNetwork, dest: &IpNetwork) -> bool {
    source.is_ipv4() == dest.is_ipv4()
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain / Action Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if `action` may be used in `chain`.
///
/// - `masquerade` and `snat` belong to `postrouting`
/// - `dnat` and `redirect` belong to `prerouting`
/// - `reject` is only valid in filter chains
/// - `accept`, `drop` and `log` are valid everywhere
#[inline]
pub fn action_allowed_in_chain(action: Action, chain: Chain) -> bool {
    match action {
        Action::Masquerade | Action::Snat => chain == Chain::Postrouting,
        Action::Dnat | Action::Redirect => chain == Chain::Prerouting,
        Action::Reject => !chain.is_nat(),
        Action::Accept | Action::Drop | Action::Log => true,
    }
}

/// Returns `true` if the action uses the NAT port.
#[inline]
pub fn action_uses_nat_port(action: Action) -> bool {
    matches!(action, Action::Dnat | Action::Redirect)
}

/// Returns `true` if the action uses the NAT address.
#[inline]
pub fn action_uses_nat_address(action: Action) -> bool {
    matches!(action, Action::Snat | Action::Dnat)
}

/// Returns `true` if any address in the definition is IPv6.
///
/// Such rules only load into profiles compiled with the `inet` family.
pub fn definition_uses_ipv6(def: &RuleDefinition) -> bool {
    any_ipv6([&def.source_ip, &def.dest_ip, &def.nat_address])
}

/// Returns `true` if the rule renders an IPv6 address clause.
///
/// A raw expression replaces the address clauses, so it never counts.
pub fn rule_uses_ipv6(rule: &Rule) -> bool {
    rule.raw_expression.is_none()
        && any_ipv6([&rule.source_ip, &rule.dest_ip, &rule.nat_address])
}

fn any_ipv6(addresses: [&Option<String>; 3]) -> bool {
    addresses.into_iter().flatten().any(|addr| addr.contains(':'))
}

/// Checks that every enabled rule compiles into the profile's table family.
///
/// IPv6 clauses inside a `table ip` are rejected by nft at load time, so a
/// profile with IPv6 off cannot carry them.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first rule that does not fit.
pub fn check_rules_fit_profile(profile: &Profile, rules: &[Rule]) -> Result<()> {
    if profile.settings.enable_ipv6 {
        return Ok(());
    }
    match rules.iter().find(|r| r.enabled && rule_uses_ipv6(r)) {
        Some(rule) => Err(Error::validation(
            "rules",
            format!(
                "rule '{}' uses IPv6 addresses but profile '{}' has IPv6 disabled",
                rule.name,
                profile.name()
            ),
        )),
        None => Ok(()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Whole-definition validation
// ═══════════════════════════════════════════════════════════════════════════

fn field(name: &str) -> impl Fn(String) -> Error + '_ {
    move |message| Error::validation(name, message)
}

/// Validates every field of a rule definition and the combinations between
/// them.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first offending field.
pub fn validate_rule_definition(def: &RuleDefinition) -> Result<()> {
    validators::validate_name(&def.name).map_err(field("name"))?;

    if let Some(raw) = &def.raw_expression {
        validators::validate_raw_expression(raw).map_err(field("raw_expression"))?;
    }

    if let Some(iface) = &def.interface_in {
        validators::validate_interface(iface).map_err(field("interface_in"))?;
    }
    if let Some(iface) = &def.interface_out {
        validators::validate_interface(iface).map_err(field("interface_out"))?;
    }
    if let Some(state) = &def.ct_state {
        validators::validate_ct_state(state).map_err(field("ct_state"))?;
    }

    let source = def
        .source_ip
        .as_deref()
        .map(validators::validate_address)
        .transpose()
        .map_err(field("source_ip"))?;
    let dest = def
        .dest_ip
        .as_deref()
        .map(validators::validate_address)
        .transpose()
        .map_err(field("dest_ip"))?;

    for (name, addr) in [("source_ip", source), ("dest_ip", dest)] {
        if let Some(addr) = addr
            && !ip_compatible_with_protocol(&addr, def.protocol)
        {
            return Err(Error::validation(
                name,
                "IPv6 address cannot be used with protocol icmp",
            ));
        }
    }
    if let (Some(s), Some(d)) = (source, dest)
        && !addresses_same_family(&s, &d)
    {
        return Err(Error::validation(
            "dest_ip",
            "Source and destination must be the same IP version",
        ));
    }

    for (name, ports) in [("source_port", &def.source_port), ("dest_port", &def.dest_port)] {
        if let Some(ports) = ports {
            validators::validate_port_spec(ports).map_err(field(name))?;
            if !protocol_supports_ports(def.protocol) {
                return Err(Error::validation(
                    name,
                    format!("Protocol {} does not support ports", def.protocol),
                ));
            }
        }
    }

    if let Some(limit) = &def.rate_limit {
        validators::validate_rate(&limit.rate).map_err(field("rate_limit"))?;
        if limit.burst == Some(0) {
            return Err(Error::validation("rate_limit", "Burst must be at least 1"));
        }
    }

    let action = def.action.unwrap_or(Action::Accept);
    if !action_allowed_in_chain(action, def.chain) {
        return Err(Error::validation(
            "action",
            format!("Action {action} is not allowed in chain {}", def.chain),
        ));
    }

    if let Some(addr) = &def.nat_address {
        validators::validate_nat_address(addr).map_err(field("nat_address"))?;
        if !action_uses_nat_address(action) {
            return Err(Error::validation(
                "nat_address",
                format!("Action {action} does not take a NAT address"),
            ));
        }
    }
    if let Some(port) = def.nat_port {
        validators::validate_port(port).map_err(field("nat_port"))?;
        if !action_uses_nat_port(action) {
            return Err(Error::validation(
                "nat_port",
                format!("Action {action} does not take a NAT port"),
            ));
        }
    }

    if let Some(prefix) = &def.log_prefix {
        validators::validate_log_prefix(prefix).map_err(field("log_prefix"))?;
    }
    validators::validate_comment(&def.comment).map_err(field("comment"))?;

    Ok(())
}
