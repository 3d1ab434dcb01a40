//! nftables script generation
//!
//! Turns a [`Profile`] and its rules into a complete, self-contained nft
//! script. Every script starts with `flush ruleset`: a deploy replaces the
//! whole ruleset, it never patches it.
//!
//! # Layout
//!
//! ```text
//! flush ruleset
//! table <ip|inet> filter {
//!     chain input   { header; base rules; user rules }
//!     chain output  { ... }
//!     chain forward { ... }
//! }
//! table <ip|inet> nat { prerouting; postrouting }   # only with NAT enabled
//! ```
//!
//! Generation is pure: the timestamp printed in the header is an argument,
//! so the same inputs always produce the same bytes.
//!
//! All user-supplied text reaches the output through [`interpolate`].

use crate::core::firewall::{Action, Chain, Profile, ProfileSettings, Protocol, Rule};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;
use uuid::Uuid;

const INDENT_CHAIN: &str = "    ";
const INDENT_RULE: &str = "        ";

/// Context a piece of user text is interpolated into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    /// Inside a double-quoted nft string (`comment "..."`, `prefix "..."`)
    Quoted,
    /// A bare token such as an address, port spec or rate
    Token,
    /// Free text after a trailing `#`
    LineComment,
}

/// Renders user text for the given output context.
///
/// - `Quoted`: wraps in double quotes, escapes `\` and `"`, drops control
///   characters
/// - `Token`: keeps only characters that can appear in addresses, port
///   specs and rates
/// - `LineComment`: collapses control characters (including newlines) to
///   spaces so the comment cannot spill onto the next line
pub fn interpolate(value: &str, ctx: Interp) -> String {
    match ctx {
        Interp::Quoted => {
            let mut out = String::with_capacity(value.len() + 2);
            out.push('"');
            for c in value.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    c if c.is_control() => {}
                    c => out.push(c),
                }
            }
            out.push('"');
            out
        }
        Interp::Token => value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '-' | '_' | ','))
            .collect(),
        Interp::LineComment => value
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect::<String>()
            .trim()
            .to_string(),
    }
}

/// Address family of the generated tables
pub fn family(profile: &Profile) -> &'static str {
    if profile.settings.enable_ipv6 {
        "inet"
    } else {
        "ip"
    }
}

/// Compiles a profile and its rules into a complete nft script.
///
/// `rules` should be in the profile's association order; within a chain the
/// compiler sorts by ascending priority and keeps that order for ties.
/// Disabled rules are skipped. Rules in `prerouting`/`postrouting` are only
/// emitted when the profile enables NAT.
pub fn compile(profile: &Profile, rules: &[Rule], generated_at: DateTime<Utc>) -> String {
    let family = family(profile);
    let mut out = String::with_capacity(1024 + rules.len() * 64);

    write_header(&mut out, profile.name(), generated_at);

    let _ = writeln!(out, "flush ruleset");
    let _ = writeln!(out);

    let _ = writeln!(out, "table {family} filter {{");
    for (i, chain) in Chain::FILTER.into_iter().enumerate() {
        if i > 0 {
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "{INDENT_CHAIN}chain {chain} {{");
        let _ = writeln!(
            out,
            "{INDENT_RULE}type filter hook {chain} priority filter; policy {};",
            profile.policy_for(chain)
        );
        write_base_rules(&mut out, &profile.settings, chain, family);
        write_user_rules(&mut out, rules, chain);
        let _ = writeln!(out, "{INDENT_CHAIN}}}");
    }
    let _ = writeln!(out, "}}");

    if profile.settings.enable_nat {
        let _ = writeln!(out);
        let _ = writeln!(out, "table {family} nat {{");
        for (chain, priority) in [(Chain::Prerouting, "dstnat"), (Chain::Postrouting, "srcnat")] {
            if chain == Chain::Postrouting {
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "{INDENT_CHAIN}chain {chain} {{");
            let _ = writeln!(
                out,
                "{INDENT_RULE}type nat hook {chain} priority {priority}; policy accept;"
            );
            write_user_rules(&mut out, rules, chain);
            let _ = writeln!(out, "{INDENT_CHAIN}}}");
        }
        let _ = writeln!(out, "}}");
    }

    out
}

/// Legacy rules-only form used for dry-run validation.
///
/// Compiles against default profile settings: IPv4 only, default chain
/// policies, loopback/established/ping base rules, no NAT table.
pub fn compile_rules(rules: &[Rule], generated_at: DateTime<Utc>) -> String {
    let legacy = Profile {
        id: Uuid::nil(),
        tenant_id: Uuid::nil(),
        settings: ProfileSettings::new("rules"),
        created_by: String::new(),
        created_at: generated_at,
        updated_at: generated_at,
    };
    compile(&legacy, rules, generated_at)
}

fn write_header(out: &mut String, profile_name: &str, generated_at: DateTime<Utc>) {
    let _ = writeln!(out, "#!/usr/sbin/nft -f");
    let _ = writeln!(out, "#");
    let _ = writeln!(out, "# Generated by nftfleet");
    let _ = writeln!(
        out,
        "# Profile: {}",
        interpolate(profile_name, Interp::LineComment)
    );
    let _ = writeln!(
        out,
        "# Generated at: {}",
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let _ = writeln!(out, "#");
    let _ = writeln!(out);
}

fn write_base_rules(out: &mut String, settings: &ProfileSettings, chain: Chain, family: &str) {
    // Ordering: loopback → established/related → invalid → ping
    if settings.allow_loopback {
        match chain {
            Chain::Input => {
                let _ = writeln!(out, "{INDENT_RULE}iifname \"lo\" accept # allow loopback");
            }
            Chain::Output => {
                let _ = writeln!(out, "{INDENT_RULE}oifname \"lo\" accept # allow loopback");
            }
            _ => {}
        }
    }

    if settings.allow_established && settings.enable_conntrack {
        let _ = writeln!(
            out,
            "{INDENT_RULE}ct state established,related accept # allow established"
        );
        if chain != Chain::Output {
            let _ = writeln!(out, "{INDENT_RULE}ct state invalid drop # drop invalid");
        }
    }

    if settings.allow_icmp_ping && chain == Chain::Input {
        let _ = writeln!(
            out,
            "{INDENT_RULE}icmp type echo-request accept # allow ping"
        );
        if family == "inet" {
            let _ = writeln!(
                out,
                "{INDENT_RULE}icmpv6 type echo-request accept # allow ping v6"
            );
        }
    }
}

fn write_user_rules(out: &mut String, rules: &[Rule], chain: Chain) {
    for rule in chain_rules(rules, chain) {
        let _ = writeln!(out, "{INDENT_RULE}{}", render_rule(rule));
    }
}

/// Enabled rules of one chain in ascending priority (stable for ties).
pub fn chain_rules(rules: &[Rule], chain: Chain) -> Vec<&Rule> {
    let mut selected: Vec<&Rule> = rules
        .iter()
        .filter(|r| r.enabled && r.chain == chain)
        .collect();
    selected.sort_by_key(|r| r.priority);
    selected
}

/// Renders one rule as a single nft statement line (without indentation).
pub fn render_rule(rule: &Rule) -> String {
    let name = interpolate(&rule.name, Interp::LineComment);

    if let Some(raw) = rule
        .raw_expression
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        return format!("{raw} # {name}");
    }

    let mut clauses: Vec<String> = Vec::with_capacity(12);

    if let Some(iface) = non_empty(rule.interface_in.as_deref()) {
        clauses.push(format!("iifname {}", interpolate(iface, Interp::Quoted)));
    }
    if let Some(iface) = non_empty(rule.interface_out.as_deref()) {
        clauses.push(format!("oifname {}", interpolate(iface, Interp::Quoted)));
    }
    if let Some(state) = non_empty(rule.ct_state.as_deref()) {
        let normalized: String = state
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        clauses.push(format!(
            "ct state {}",
            interpolate(&normalized, Interp::Token)
        ));
    }

    let source_port = non_empty(rule.source_port.as_deref());
    let dest_port = non_empty(rule.dest_port.as_deref());
    let qualified_ports = matches!(rule.protocol, Protocol::Tcp | Protocol::Udp);

    match rule.protocol {
        Protocol::All => {}
        // tcp/udp port clauses (`tcp dport 22`) already imply the protocol
        Protocol::Tcp | Protocol::Udp if source_port.is_some() || dest_port.is_some() => {}
        protocol => clauses.push(format!("meta l4proto {}", protocol.as_str())),
    }

    if let Some(addr) = non_empty(rule.source_ip.as_deref()) {
        clauses.push(format!(
            "{} saddr {}",
            address_family(addr),
            interpolate(addr, Interp::Token)
        ));
    }
    if let Some(addr) = non_empty(rule.dest_ip.as_deref()) {
        clauses.push(format!(
            "{} daddr {}",
            address_family(addr),
            interpolate(addr, Interp::Token)
        ));
    }

    let port_proto = if qualified_ports {
        rule.protocol.as_str()
    } else {
        "th"
    };
    if let Some(spec) = source_port {
        clauses.push(format!("{port_proto} sport {}", port_expr(spec)));
    }
    if let Some(spec) = dest_port {
        clauses.push(format!("{port_proto} dport {}", port_expr(spec)));
    }

    if let Some(limit) = &rule.rate_limit
        && let Some(rate) = non_empty(Some(limit.rate.as_str()))
    {
        let mut clause = format!("limit rate {}", interpolate(rate, Interp::Token));
        if let Some(burst) = limit.burst {
            let _ = write!(clause, " burst {burst} packets");
        }
        clauses.push(clause);
    }

    clauses.push(action_clause(rule));

    if !rule.comment.is_empty() {
        clauses.push(format!(
            "comment {}",
            interpolate(&rule.comment, Interp::Quoted)
        ));
    }

    format!("{} # {name}", clauses.join(" "))
}

fn action_clause(rule: &Rule) -> String {
    match rule.effective_action() {
        Action::Accept => "accept".to_string(),
        Action::Drop => "drop".to_string(),
        Action::Reject => "reject".to_string(),
        Action::Log => {
            let mut clause = String::from("log");
            if let Some(prefix) = non_empty(rule.log_prefix.as_deref()) {
                let _ = write!(clause, " prefix {}", interpolate(prefix, Interp::Quoted));
            }
            if let Some(level) = rule.log_level {
                let _ = write!(clause, " level {level}");
            }
            clause
        }
        Action::Masquerade => "masquerade".to_string(),
        Action::Snat => match non_empty(rule.nat_address.as_deref()) {
            Some(addr) => format!("snat to {}", interpolate(addr, Interp::Token)),
            None => "snat".to_string(),
        },
        Action::Dnat => match non_empty(rule.nat_address.as_deref()) {
            Some(addr) => {
                let addr = interpolate(addr, Interp::Token);
                match rule.nat_port {
                    Some(port) if addr.contains(':') => format!("dnat to [{addr}]:{port}"),
                    Some(port) => format!("dnat to {addr}:{port}"),
                    None => format!("dnat to {addr}"),
                }
            }
            None => "dnat".to_string(),
        },
        Action::Redirect => match rule.nat_port {
            Some(port) => format!("redirect to :{port}"),
            None => "redirect".to_string(),
        },
    }
}

/// Single port, `lo-hi` range, or a comma list rendered as an anonymous set.
fn port_expr(spec: &str) -> String {
    if spec.contains(',') {
        let items: Vec<String> = spec
            .split(',')
            .map(|p| interpolate(p.trim(), Interp::Token))
            .filter(|p| !p.is_empty())
            .collect();
        format!("{{ {} }}", items.join(", "))
    } else {
        interpolate(spec, Interp::Token)
    }
}

fn address_family(addr: &str) -> &'static str {
    if addr.contains(':') { "ip6" } else { "ip" }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
