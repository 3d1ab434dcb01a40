#[cfg(test)]
mod tests_impl {
    use crate::core::compiler::{compile, compile_rules, render_rule};
    use crate::core::firewall::{
        Action, Chain, ChainPolicy, LogLevel, ProfileSettings, Protocol, RateLimit, Rule,
        RuleDefinition,
    };
    use crate::core::test_helpers::{create_tcp_rule, create_test_profile, create_test_rule};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    fn rule_from(def: RuleDefinition) -> Rule {
        Rule::from_definition(def, Uuid::nil(), "tester")
    }

    #[test]
    fn test_tcp_rule_renders_single_statement() {
        let rule = create_tcp_rule("ssh", "22");
        assert_eq!(render_rule(&rule), "tcp dport 22 accept # ssh");
    }

    #[test]
    fn test_script_starts_with_header_and_flush() {
        let profile = create_test_profile(ProfileSettings::new("web"));
        let script = compile(&profile, &[], at());

        assert!(script.starts_with("#!/usr/sbin/nft -f\n"));
        assert!(script.contains("# Profile: web\n"));
        assert!(script.contains("# Generated at: 2026-01-02T03:04:05Z\n"));
        assert!(script.contains("\nflush ruleset\n"));
    }

    #[test]
    fn test_family_follows_ipv6_setting() {
        let mut settings = ProfileSettings::new("v4");
        let v4 = compile(&create_test_profile(settings.clone()), &[], at());
        assert!(v4.contains("table ip filter {"));
        assert!(!v4.contains("icmpv6"));

        settings.enable_ipv6 = true;
        let dual = compile(&create_test_profile(settings), &[], at());
        assert!(dual.contains("table inet filter {"));
        assert!(dual.contains("icmpv6 type echo-request accept # allow ping v6"));
    }

    #[test]
    fn test_default_chain_policies() {
        let script = compile(&create_test_profile(ProfileSettings::new("p")), &[], at());
        assert!(script.contains("type filter hook input priority filter; policy drop;"));
        assert!(script.contains("type filter hook output priority filter; policy accept;"));
        assert!(script.contains("type filter hook forward priority filter; policy drop;"));
    }

    #[test]
    fn test_explicit_chain_policies() {
        let mut settings = ProfileSettings::new("open");
        settings.input_policy = Some(ChainPolicy::Accept);
        settings.output_policy = Some(ChainPolicy::Drop);
        let script = compile(&create_test_profile(settings), &[], at());
        assert!(script.contains("hook input priority filter; policy accept;"));
        assert!(script.contains("hook output priority filter; policy drop;"));
    }

    #[test]
    fn test_base_rule_ordering() {
        let script = compile(&create_test_profile(ProfileSettings::new("p")), &[], at());
        let lo = script.find("iifname \"lo\" accept").unwrap();
        let est = script.find("ct state established,related accept").unwrap();
        let invalid = script.find("ct state invalid drop").unwrap();
        let ping = script.find("icmp type echo-request accept").unwrap();
        assert!(lo < est && est < invalid && invalid < ping);
    }

    #[test]
    fn test_established_requires_conntrack() {
        let mut settings = ProfileSettings::new("p");
        settings.enable_conntrack = false;
        let script = compile(&create_test_profile(settings), &[], at());
        assert!(!script.contains("ct state"));
    }

    #[test]
    fn test_base_rules_can_be_disabled() {
        let mut settings = ProfileSettings::new("bare");
        settings.allow_loopback = false;
        settings.allow_established = false;
        settings.allow_icmp_ping = false;
        let script = compile(&create_test_profile(settings), &[], at());
        assert!(!script.contains("lo\""));
        assert!(!script.contains("echo-request"));
        assert!(!script.contains("ct state"));
    }

    #[test]
    fn test_disabled_rules_are_omitted() {
        let mut off = create_tcp_rule("off", "8080");
        off.enabled = false;
        let on = create_tcp_rule("on", "443");
        let script = compile(
            &create_test_profile(ProfileSettings::new("p")),
            &[off, on],
            at(),
        );
        assert!(script.contains("tcp dport 443 accept # on"));
        assert!(!script.contains("8080"));
    }

    #[test]
    fn test_rules_ordered_by_priority_then_association() {
        let rules = vec![
            create_test_rule("third", Chain::Input, 10),
            create_test_rule("first", Chain::Input, -5),
            create_test_rule("second", Chain::Input, 0),
            create_test_rule("second-tie", Chain::Input, 0),
        ];
        let script = compile(&create_test_profile(ProfileSettings::new("p")), &rules, at());
        let pos = |name: &str| script.find(&format!("# {name}\n")).unwrap();
        assert!(pos("first") < pos("second"));
        assert!(pos("second") < pos("second-tie"));
        assert!(pos("second-tie") < pos("third"));
    }

    #[test]
    fn test_rules_land_in_their_chain() {
        let rules = vec![
            create_test_rule("out-rule", Chain::Output, 0),
            create_test_rule("fwd-rule", Chain::Forward, 0),
        ];
        let script = compile(&create_test_profile(ProfileSettings::new("p")), &rules, at());
        let output = script.find("chain output {").unwrap();
        let forward = script.find("chain forward {").unwrap();
        let out_rule = script.find("# out-rule").unwrap();
        let fwd_rule = script.find("# fwd-rule").unwrap();
        assert!(output < out_rule && out_rule < forward);
        assert!(forward < fwd_rule);
    }

    #[test]
    fn test_nat_table_only_when_enabled() {
        let masq = rule_from(RuleDefinition {
            interface_out: Some("eth0".into()),
            action: Some(Action::Masquerade),
            ..RuleDefinition::new("masq", Chain::Postrouting)
        });

        let without = compile(
            &create_test_profile(ProfileSettings::new("p")),
            std::slice::from_ref(&masq),
            at(),
        );
        assert!(!without.contains("nat"));
        assert!(!without.contains("masquerade"));

        let mut settings = ProfileSettings::new("gw");
        settings.enable_nat = true;
        let with = compile(&create_test_profile(settings), &[masq], at());
        assert!(with.contains("table ip nat {"));
        assert!(with.contains("type nat hook prerouting priority dstnat; policy accept;"));
        assert!(with.contains("type nat hook postrouting priority srcnat; policy accept;"));
        assert!(with.contains("oifname \"eth0\" masquerade # masq"));
    }

    #[test]
    fn test_dnat_rendering() {
        let v4 = rule_from(RuleDefinition {
            protocol: Protocol::Tcp,
            dest_port: Some("8080".into()),
            action: Some(Action::Dnat),
            nat_address: Some("10.0.0.5".into()),
            nat_port: Some(80),
            ..RuleDefinition::new("web", Chain::Prerouting)
        });
        assert_eq!(
            render_rule(&v4),
            "tcp dport 8080 dnat to 10.0.0.5:80 # web"
        );

        let v6 = rule_from(RuleDefinition {
            action: Some(Action::Dnat),
            nat_address: Some("2001:db8::5".into()),
            nat_port: Some(443),
            ..RuleDefinition::new("web6", Chain::Prerouting)
        });
        assert_eq!(render_rule(&v6), "dnat to [2001:db8::5]:443 # web6");
    }

    #[test]
    fn test_snat_and_redirect() {
        let snat = rule_from(RuleDefinition {
            action: Some(Action::Snat),
            nat_address: Some("203.0.113.1".into()),
            ..RuleDefinition::new("snat", Chain::Postrouting)
        });
        assert_eq!(render_rule(&snat), "snat to 203.0.113.1 # snat");

        let redirect = rule_from(RuleDefinition {
            protocol: Protocol::Tcp,
            dest_port: Some("80".into()),
            action: Some(Action::Redirect),
            nat_port: Some(3128),
            ..RuleDefinition::new("proxy", Chain::Prerouting)
        });
        assert_eq!(
            render_rule(&redirect),
            "tcp dport 80 redirect to :3128 # proxy"
        );
    }

    #[test]
    fn test_full_rule_clause_order() {
        let rule = rule_from(RuleDefinition {
            protocol: Protocol::Tcp,
            source_ip: Some("10.0.0.0/8".into()),
            dest_port: Some("22".into()),
            interface_in: Some("eth0".into()),
            ct_state: Some("NEW, established".into()),
            rate_limit: Some(RateLimit {
                rate: "10/minute".into(),
                burst: Some(5),
                over_limit: None,
            }),
            action: Some(Action::Accept),
            comment: "mgmt".into(),
            ..RuleDefinition::new("ssh", Chain::Input)
        });
        assert_eq!(
            render_rule(&rule),
            "iifname \"eth0\" ct state new,established ip saddr 10.0.0.0/8 tcp dport 22 \
             limit rate 10/minute burst 5 packets accept comment \"mgmt\" # ssh"
        );
    }

    #[test]
    fn test_port_list_and_range() {
        let list = create_tcp_rule("web", "80, 443");
        assert_eq!(render_rule(&list), "tcp dport { 80, 443 } accept # web");

        let range = create_tcp_rule("high", "1024-2048");
        assert_eq!(render_rule(&range), "tcp dport 1024-2048 accept # high");
    }

    #[test]
    fn test_protocol_without_ports() {
        let icmp = rule_from(RuleDefinition {
            protocol: Protocol::Icmp,
            action: Some(Action::Drop),
            ..RuleDefinition::new("no-icmp", Chain::Input)
        });
        assert_eq!(render_rule(&icmp), "meta l4proto icmp drop # no-icmp");

        let all_ports = rule_from(RuleDefinition {
            dest_port: Some("53".into()),
            ..RuleDefinition::new("dns", Chain::Input)
        });
        assert_eq!(render_rule(&all_ports), "th dport 53 accept # dns");
    }

    #[test]
    fn test_ipv6_address_uses_ip6() {
        let rule = rule_from(RuleDefinition {
            source_ip: Some("2001:db8::/32".into()),
            action: Some(Action::Drop),
            ..RuleDefinition::new("v6", Chain::Input)
        });
        assert_eq!(render_rule(&rule), "ip6 saddr 2001:db8::/32 drop # v6");
    }

    #[test]
    fn test_log_action() {
        let rule = rule_from(RuleDefinition {
            action: Some(Action::Log),
            log_prefix: Some("dropped: ".into()),
            log_level: Some(LogLevel::Warn),
            ..RuleDefinition::new("log", Chain::Input)
        });
        assert_eq!(
            render_rule(&rule),
            "log prefix \"dropped: \" level warn # log"
        );
    }

    #[test]
    fn test_raw_expression_overrides_fields() {
        let rule = rule_from(RuleDefinition {
            protocol: Protocol::Udp,
            dest_port: Some("53".into()),
            raw_expression: Some("  ip saddr @blocklist drop ".into()),
            ..RuleDefinition::new("raw", Chain::Input)
        });
        assert_eq!(render_rule(&rule), "ip saddr @blocklist drop # raw");
    }

    #[test]
    fn test_comment_quotes_are_escaped() {
        let rule = rule_from(RuleDefinition {
            comment: r#"say "hi"; flush ruleset"#.into(),
            ..RuleDefinition::new("quoted", Chain::Input)
        });
        assert_eq!(
            render_rule(&rule),
            r#"accept comment "say \"hi\"; flush ruleset" # quoted"#
        );
    }

    #[test]
    fn test_name_newline_cannot_inject_statement() {
        let rule = create_tcp_rule("ssh\nflush ruleset", "22");
        let script = compile(&create_test_profile(ProfileSettings::new("p")), &[rule], at());
        assert_eq!(script.matches("\nflush ruleset").count(), 1);
        assert!(script.contains("tcp dport 22 accept # ssh flush ruleset\n"));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let profile = create_test_profile(ProfileSettings::new("p"));
        let rules = vec![create_tcp_rule("a", "22"), create_tcp_rule("b", "80")];
        assert_eq!(compile(&profile, &rules, at()), compile(&profile, &rules, at()));
    }

    #[test]
    fn test_compile_rules_uses_defaults() {
        let rules = vec![create_tcp_rule("ssh", "22")];
        let script = compile_rules(&rules, at());
        assert!(script.contains("table ip filter {"));
        assert!(script.contains("# Profile: rules\n"));
        assert!(script.contains("tcp dport 22 accept # ssh"));
        assert!(!script.contains("table ip nat"));
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::compiler::{Interp, compile, interpolate, render_rule};
    use crate::core::firewall::{Action, Chain, ProfileSettings, Protocol, Rule, RuleDefinition};
    use crate::core::test_helpers::create_test_profile;
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    prop_compose! {
        fn arb_port()(port in 1u16..=65535) -> u16 {
            port
        }
    }

    prop_compose! {
        fn arb_port_spec()(start in arb_port(), end in arb_port(), list in any::<bool>()) -> String {
            if start == end {
                start.to_string()
            } else if list {
                format!("{start},{end}")
            } else {
                format!("{}-{}", start.min(end), start.max(end))
            }
        }
    }

    prop_compose! {
        fn arb_rule()(
            name in "[a-zA-Z0-9 \"\\\\\n#;{}]{1,40}",
            comment in "[a-zA-Z0-9 \"\\\\\n]{0,40}",
            chain in prop_oneof![
                Just(Chain::Input),
                Just(Chain::Output),
                Just(Chain::Forward),
            ],
            protocol in prop_oneof![
                Just(Protocol::Tcp),
                Just(Protocol::Udp),
                Just(Protocol::All),
            ],
            dest_port in proptest::option::of(arb_port_spec()),
            action in prop_oneof![
                Just(Action::Accept),
                Just(Action::Drop),
                Just(Action::Reject),
            ],
            priority in -100i32..100,
            enabled in any::<bool>(),
        ) -> Rule {
            let def = RuleDefinition {
                protocol,
                dest_port,
                action: Some(action),
                priority,
                comment,
                enabled,
                ..RuleDefinition::new(name, chain)
            };
            Rule::from_definition(def, Uuid::nil(), "prop")
        }
    }

    proptest! {
        #[test]
        fn test_quoted_output_never_has_unescaped_quote(value in ".{0,64}") {
            let quoted = interpolate(&value, Interp::Quoted);
            let inner = &quoted[1..quoted.len() - 1];
            let mut escaped = false;
            for c in inner.chars() {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else {
                    prop_assert_ne!(c, '"');
                }
                prop_assert!(!c.is_control());
            }
            prop_assert!(!escaped);
        }

        #[test]
        fn test_line_comment_is_single_line(value in ".{0,64}") {
            let rendered = interpolate(&value, Interp::LineComment);
            prop_assert!(!rendered.contains('\n'));
            prop_assert!(!rendered.contains('\r'));
        }

        #[test]
        fn test_token_has_no_syntax_characters(value in ".{0,64}") {
            let token = interpolate(&value, Interp::Token);
            let has_syntax =
                token.contains(|c: char| matches!(c, ';' | '{' | '}' | '"' | ' ' | '\n' | '#'));
            prop_assert!(!has_syntax, "token {:?} kept a syntax character", token);
        }

        #[test]
        fn test_rendered_rule_is_one_line(rule in arb_rule()) {
            let line = render_rule(&rule);
            prop_assert!(!line.contains('\n'));
        }

        #[test]
        fn test_compile_never_panics_and_keeps_structure(rules in prop::collection::vec(arb_rule(), 0..10)) {
            let mut settings = ProfileSettings::new("prop");
            settings.allow_loopback = false;
            settings.allow_established = false;
            settings.allow_icmp_ping = false;
            let script = compile(&create_test_profile(settings), &rules, Utc::now());

            prop_assert_eq!(script.matches("\nflush ruleset\n").count(), 1);
            let enabled = rules.iter().filter(|r| r.enabled).count();
            let user_lines = script
                .lines()
                .filter(|l| l.starts_with("        ") && !l.contains("type filter hook"))
                .count();
            prop_assert_eq!(user_lines, enabled);
        }
    }
}

#[cfg(test)]
mod orchestrator_tests {
    use crate::config::ServiceConfig;
    use crate::core::deployment::{DeploymentAction, DeploymentFilter, DeploymentStatus};
    use crate::core::error::Error;
    use crate::core::executor::{Directive, TaskConfig};
    use crate::core::firewall::{Action, Chain, ProfileSettings, RuleDefinition};
    use crate::core::orchestrator::ApplyRequest;
    use crate::core::templates::{
        EXPORT_FORMAT_VERSION, MaterializeMode, ProfileExport, TemplateService,
    };
    use crate::core::test_helpers::{AGENT, Behavior, Harness, tcp_definition};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use uuid::Uuid;

    fn request(h: &Harness, profile_id: Uuid, dry_run: bool) -> ApplyRequest {
        ApplyRequest {
            tenant_id: h.tenant,
            profile_id,
            agent_id: AGENT.to_string(),
            dry_run,
            actor: "alice".to_string(),
        }
    }

    async fn web_harness(behavior: Behavior) -> (Harness, Uuid) {
        let h = Harness::new(ServiceConfig::default(), behavior);
        let profile = h
            .profile_with(
                ProfileSettings::new("web"),
                vec![tcp_definition("ssh", "22"), tcp_definition("https", "443")],
            )
            .await;
        (h, profile.id)
    }

    #[tokio::test]
    async fn test_dry_run_applies_without_executor() {
        let (h, profile_id) = web_harness(Behavior::Succeed(String::new())).await;

        let ticket = h.orchestrator.apply(request(&h, profile_id, true)).await.unwrap();

        assert!(ticket.handle.is_none());
        let d = ticket.deployment;
        assert_eq!(d.status, DeploymentStatus::Applied);
        assert!(d.dry_run);
        assert!(d.started_at.is_some());
        assert_eq!(d.started_at, d.completed_at);
        assert!(d.output.contains("tcp dport 22 accept # ssh"));
        assert_eq!(d.snapshot().unwrap().len(), 2);
        assert!(h.executor.calls().is_empty());
        assert!(h.events.types().is_empty());
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_apply_success_records_everything() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;

        let ticket = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        assert_eq!(ticket.deployment.status, DeploymentStatus::Pending);
        assert_eq!(ticket.deployment.agent_name, "edge-01");

        let done = ticket.handle.unwrap().wait().await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Applied);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(done.output, "ok");
        assert!(done.status_message.contains("'web'"));

        let calls = h.executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, AGENT);
        assert_eq!(calls[0].1.task_type, "nftables");
        match &calls[0].1.config {
            TaskConfig::Apply { config_content } => {
                assert!(config_content.contains("flush ruleset"));
                assert!(config_content.contains("tcp dport 443 accept # https"));
            }
            other => panic!("unexpected task config: {other:?}"),
        }

        let stored = h.artifacts.stored.lock().unwrap().clone();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, h.tenant);
        assert!(stored[0].1.starts_with("agent-1/"));
        assert_eq!(stored[0].2, "firewall-backup");
        assert_eq!(stored[0].3["checksum"].as_str().unwrap().len(), 64);

        assert_eq!(h.events.types(), vec!["deploy.started", "deploy.completed"]);
        let audit = h.audit.entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].0, "alice");
        assert_eq!(audit[0].1.action, "firewall.apply");
        assert!(audit[0].1.success);

        let stored = h.orchestrator.records().get(h.tenant, done.id).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Applied);
    }

    #[tokio::test]
    async fn test_failed_execution_ends_in_error() {
        let (h, profile_id) =
            web_harness(Behavior::Fail("Error: syntax error, unexpected newline".into())).await;

        let ticket = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let done = ticket.handle.unwrap().wait().await.unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done.completed_at.is_some());
        assert!(done.status_message.contains("syntax error"));
        assert_eq!(done.output, "remote stdout");
        assert_eq!(h.events.types(), vec!["deploy.started", "deploy.failed"]);
        let audit = h.audit.entries();
        assert!(!audit[0].1.success);
        assert!(audit[0].1.error.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_agent_ends_in_error() {
        let (h, profile_id) = web_harness(Behavior::Unreachable).await;
        let ticket = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let done = ticket.handle.unwrap().wait().await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done.status_message.contains("agent unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ends_in_error() {
        let config = ServiceConfig {
            apply_timeout_secs: 5,
            ..ServiceConfig::default()
        };
        let h = Harness::new(config, Behavior::Delay(Duration::from_secs(60)));
        let profile = h
            .profile_with(ProfileSettings::new("slow"), vec![tcp_definition("ssh", "22")])
            .await;

        let ticket = h.orchestrator.apply(request(&h, profile.id, false)).await.unwrap();
        let done = ticket.handle.unwrap().wait().await.unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done.status_message.contains("timed out after 5s"));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_ends_in_error() {
        let (h, profile_id) = web_harness(Behavior::Delay(Duration::from_secs(600))).await;

        let ticket = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let handle = ticket.handle.unwrap();
        while h.executor.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        handle.cancel();
        let done = handle.wait().await.unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert_eq!(done.status_message, "Deployment cancelled");
        assert_eq!(h.events.types(), vec!["deploy.started", "deploy.failed"]);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_requests() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        h.orchestrator.shutdown();
        assert!(h.orchestrator.is_shut_down());

        let err = h
            .orchestrator
            .apply(request(&h, profile_id, false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Cancelled));
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_backup_failure_is_not_fatal() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        h.artifacts.fail.store(true, Ordering::SeqCst);

        let ticket = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let done = ticket.handle.unwrap().wait().await.unwrap();

        assert_eq!(done.status, DeploymentStatus::Applied);
        assert!(done.status_message.contains("backup failed"));
        assert_eq!(h.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_can_be_disabled() {
        let config = ServiceConfig {
            backup_enabled: false,
            ..ServiceConfig::default()
        };
        let h = Harness::new(config, Behavior::Succeed("ok".into()));
        let profile = h
            .profile_with(ProfileSettings::new("p"), vec![tcp_definition("ssh", "22")])
            .await;
        let ticket = h.orchestrator.apply(request(&h, profile.id, false)).await.unwrap();
        ticket.handle.unwrap().wait().await.unwrap();
        assert!(h.artifacts.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_failure_does_not_change_outcome() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        h.events.fail.store(true, Ordering::SeqCst);

        let ticket = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let done = ticket.handle.unwrap().wait().await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Applied);
        assert_eq!(h.audit.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_event_bus_does_not_stall_deployment() {
        let config = ServiceConfig {
            apply_timeout_secs: 5,
            ..ServiceConfig::default()
        };
        let h = Harness::new(config, Behavior::Succeed("ok".into()));
        let profile = h
            .profile_with(ProfileSettings::new("web"), vec![tcp_definition("ssh", "22")])
            .await;
        h.events.stall.store(true, Ordering::SeqCst);

        let ticket = h.orchestrator.apply(request(&h, profile.id, false)).await.unwrap();
        let done = tokio::time::timeout(Duration::from_secs(3600), ticket.handle.unwrap().wait())
            .await
            .expect("deployment stuck behind event publisher")
            .unwrap();

        assert_eq!(done.status, DeploymentStatus::Applied);
        assert!(done.completed_at.is_some());
        assert_eq!(h.executor.calls().len(), 1);
        assert!(h.events.types().is_empty());
        assert_eq!(h.audit.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_audit_sink_does_not_stall_deployment() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Fail("boom".into()));
        h.audit.stall.store(true, Ordering::SeqCst);

        let ticket = h.orchestrator.flush(h.tenant, AGENT, true, "alice").await.unwrap();
        let done = tokio::time::timeout(Duration::from_secs(3600), ticket.handle.unwrap().wait())
            .await
            .expect("deployment stuck behind audit sink")
            .unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert_eq!(h.events.types(), vec!["flush.started", "flush.failed"]);
        assert!(h.audit.entries().is_empty());

        let stored = h.orchestrator.records().get(h.tenant, done.id).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_agent_deployments_are_serialized() {
        let (h, profile_id) = web_harness(Behavior::Delay(Duration::from_secs(1))).await;

        let first = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let second = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();

        let a = first.handle.unwrap().wait().await.unwrap();
        let b = second.handle.unwrap().wait().await.unwrap();

        assert_eq!(a.status, DeploymentStatus::Applied);
        assert_eq!(b.status, DeploymentStatus::Applied);
        assert_eq!(h.executor.max_in_flight.load(Ordering::SeqCst), 1);
        let (early, late) = if a.started_at <= b.started_at { (a, b) } else { (b, a) };
        assert!(early.completed_at <= late.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_agents_run_concurrently() {
        let (h, profile_id) = web_harness(Behavior::Delay(Duration::from_secs(1))).await;

        let first = h.orchestrator.apply(request(&h, profile_id, false)).await.unwrap();
        let mut other = request(&h, profile_id, false);
        other.agent_id = "agent-2".to_string();
        let second = h.orchestrator.apply(other).await.unwrap();

        first.handle.unwrap().wait().await.unwrap();
        second.handle.unwrap().wait().await.unwrap();
        assert_eq!(h.executor.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rollback_creates_new_deployment() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        let applied = h
            .orchestrator
            .apply(request(&h, profile_id, false))
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        let ticket = h
            .orchestrator
            .rollback(h.tenant, applied.id, "bob")
            .await
            .unwrap();
        let rollback = ticket.handle.unwrap().wait().await.unwrap();

        assert_ne!(rollback.id, applied.id);
        assert_eq!(rollback.action, DeploymentAction::Rollback);
        assert_eq!(rollback.agent_id, applied.agent_id);
        assert_eq!(rollback.profile_id, applied.profile_id);
        assert_eq!(rollback.rollback_of, Some(applied.id));
        assert_eq!(rollback.status, DeploymentStatus::RolledBack);

        let calls = h.executor.calls();
        assert!(matches!(
            calls.last().unwrap().1.config,
            TaskConfig::Directive {
                action: Directive::Rollback,
                ..
            }
        ));
        let audit = h.audit.entries();
        assert_eq!(audit.last().unwrap().0, "bob");
        assert_eq!(audit.last().unwrap().1.action, "firewall.rollback");
    }

    #[tokio::test]
    async fn test_rollback_of_dry_run_is_refused() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        let dry = h
            .orchestrator
            .apply(request(&h, profile_id, true))
            .await
            .unwrap()
            .deployment;

        let err = h
            .orchestrator
            .rollback(h.tenant, dry.id, "bob")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_rollback_other_tenant_not_found() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        let applied = h
            .orchestrator
            .apply(request(&h, profile_id, true))
            .await
            .unwrap()
            .deployment;

        let err = h
            .orchestrator
            .rollback(Uuid::new_v4(), applied.id, "mallory")
            .await
            .err()
            .unwrap();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_flush_requires_confirmation() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Succeed(String::new()));

        let err = h
            .orchestrator
            .flush(h.tenant, AGENT, false, "alice")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "confirm"));

        let count = h
            .orchestrator
            .records()
            .count(h.tenant, &DeploymentFilter::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_flush_sends_confirmed_directive() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Succeed(String::new()));
        let done = h
            .orchestrator
            .flush(h.tenant, AGENT, true, "alice")
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.status, DeploymentStatus::Applied);
        assert_eq!(done.profile_id, None);
        assert_eq!(
            h.executor.calls()[0].1.config,
            TaskConfig::Directive {
                action: Directive::Flush,
                confirm_flush: Some(true),
            }
        );
        assert_eq!(h.events.types(), vec!["flush.started", "flush.completed"]);
    }

    #[tokio::test]
    async fn test_audit_returns_live_ruleset() {
        let h = Harness::new(
            ServiceConfig::default(),
            Behavior::Succeed("table ip filter {\n}\n".into()),
        );
        let done = h
            .orchestrator
            .audit(h.tenant, AGENT, "alice")
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.action, DeploymentAction::Audit);
        assert_eq!(done.status, DeploymentStatus::Applied);
        assert!(done.output.contains("table ip filter"));
    }

    #[tokio::test]
    async fn test_failed_rollback_ends_in_error() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        let applied = h
            .orchestrator
            .apply(request(&h, profile_id, false))
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();
        h.executor.set_behavior(Behavior::Fail("no previous ruleset".into()));

        let done = h
            .orchestrator
            .rollback(h.tenant, applied.id, "bob")
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done.completed_at.is_some());
        assert!(done.status_message.contains("no previous ruleset"));
        assert_eq!(
            h.events.types(),
            vec![
                "deploy.started",
                "deploy.completed",
                "rollback.started",
                "rollback.failed"
            ]
        );
        let audit = h.audit.entries();
        let (actor, entry) = audit.last().unwrap();
        assert_eq!(actor, "bob");
        assert_eq!(entry.action, "firewall.rollback");
        assert!(!entry.success);

        let original = h.orchestrator.records().get(h.tenant, applied.id).await.unwrap();
        assert_eq!(original.status, DeploymentStatus::Applied);
    }

    #[tokio::test]
    async fn test_failed_audit_ends_in_error() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Unreachable);
        let done = h
            .orchestrator
            .audit(h.tenant, AGENT, "alice")
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done.completed_at.is_some());
        assert!(done.status_message.contains("agent unreachable"));
        assert_eq!(h.events.types(), vec!["audit.started", "audit.failed"]);
        let audit = h.audit.entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].1.action, "firewall.audit");
        assert!(!audit[0].1.success);
    }

    #[tokio::test]
    async fn test_failed_flush_ends_in_error() {
        let h = Harness::new(
            ServiceConfig::default(),
            Behavior::Fail("Error: Operation not permitted".into()),
        );
        let done = h
            .orchestrator
            .flush(h.tenant, AGENT, true, "alice")
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done.completed_at.is_some());
        assert_eq!(done.output, "remote stdout");
        assert_eq!(h.events.types(), vec!["flush.started", "flush.failed"]);
        let audit = h.audit.entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].0, "alice");
        assert_eq!(audit[0].1.action, "firewall.flush");
        assert!(!audit[0].1.success);
        assert!(audit[0].1.error.is_some());
    }

    #[tokio::test]
    async fn test_capability_checked_before_record() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;

        let mut docker = request(&h, profile_id, false);
        docker.agent_id = "docker-host".to_string();
        assert!(matches!(
            h.orchestrator.apply(docker).await.err().unwrap(),
            Error::Capability { .. }
        ));

        let mut missing = request(&h, profile_id, false);
        missing.agent_id = "ghost".to_string();
        assert!(matches!(
            h.orchestrator.apply(missing).await.err().unwrap(),
            Error::NotFound { .. }
        ));

        let count = h
            .orchestrator
            .records()
            .count(h.tenant, &DeploymentFilter::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_disabled_profile_is_refused() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Succeed("ok".into()));
        let mut settings = ProfileSettings::new("off");
        settings.enabled = false;
        let profile = h.profile_with(settings, vec![]).await;

        let err = h
            .orchestrator
            .apply(request(&h, profile.id, false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_ipv6_rule_in_ip_profile_is_refused() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Succeed("ok".into()));
        let v6 = RuleDefinition {
            source_ip: Some("2001:db8::/64".into()),
            ..tcp_definition("v6-ssh", "22")
        };
        let profile = h.profile_with(ProfileSettings::new("v4-only"), vec![v6]).await;

        let err = h
            .orchestrator
            .apply(request(&h, profile.id, false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("v6-ssh"));
        assert!(
            h.orchestrator
                .preview(h.tenant, profile.id, AGENT)
                .await
                .is_err()
        );

        let count = h
            .orchestrator
            .records()
            .count(h.tenant, &DeploymentFilter::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(h.executor.calls().is_empty());

        let mut settings = profile.settings.clone();
        settings.enable_ipv6 = true;
        h.orchestrator
            .policy()
            .update_profile(h.tenant, profile.id, settings)
            .await
            .unwrap();
        let done = h
            .orchestrator
            .apply(request(&h, profile.id, false))
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(done.status, DeploymentStatus::Applied);
    }

    #[tokio::test]
    async fn test_disabled_rules_not_snapshotted() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        let rules = h
            .orchestrator
            .policy()
            .profile_rules(h.tenant, profile_id)
            .await
            .unwrap();
        h.orchestrator
            .policy()
            .set_rule_enabled(h.tenant, rules[0].id, false)
            .await
            .unwrap();

        let ticket = h.orchestrator.apply(request(&h, profile_id, true)).await.unwrap();
        let snapshot = ticket.deployment.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "https");
    }

    #[tokio::test]
    async fn test_preview_against_last_apply() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;

        let first = h
            .orchestrator
            .preview(h.tenant, profile_id, AGENT)
            .await
            .unwrap();
        assert!(first.baseline.is_none());
        assert!(first.diff.unwrap().contains("+ flush ruleset"));

        let applied = h
            .orchestrator
            .apply(request(&h, profile_id, false))
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        let unchanged = h
            .orchestrator
            .preview(h.tenant, profile_id, AGENT)
            .await
            .unwrap();
        assert_eq!(unchanged.baseline, Some(applied.id));
        assert!(unchanged.diff.is_none());

        let extra = h
            .orchestrator
            .policy()
            .create_rule(h.tenant, tcp_definition("dns", "53"), "alice")
            .await
            .unwrap();
        h.orchestrator
            .policy()
            .add_rules(h.tenant, profile_id, &[extra.id])
            .await
            .unwrap();

        let changed = h
            .orchestrator
            .preview(h.tenant, profile_id, AGENT)
            .await
            .unwrap();
        let diff = changed.diff.unwrap();
        assert!(
            diff.lines()
                .any(|l| l.starts_with("+ ") && l.ends_with("tcp dport 53 accept # dns"))
        );
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        for _ in 0..3 {
            h.orchestrator
                .apply(request(&h, profile_id, true))
                .await
                .unwrap();
        }
        h.orchestrator
            .audit(h.tenant, AGENT, "alice")
            .await
            .unwrap()
            .handle
            .unwrap()
            .wait()
            .await
            .unwrap();

        let records = h.orchestrator.records();
        let applies = DeploymentFilter {
            action: Some(DeploymentAction::Apply),
            ..DeploymentFilter::default()
        };
        assert_eq!(records.count(h.tenant, &applies).await.unwrap(), 3);

        let page = DeploymentFilter {
            limit: Some(2),
            ..DeploymentFilter::default()
        };
        let listed = records.list(h.tenant, &page).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at >= listed[1].created_at);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let (h, profile_id) = web_harness(Behavior::Succeed("ok".into())).await;
        let templates = TemplateService::new(h.orchestrator.policy().clone(), MaterializeMode::Strict);

        let export = templates
            .export_profile(h.tenant, profile_id, "alice")
            .await
            .unwrap();
        let json = serde_json::to_string(&export).unwrap();
        let parsed = serde_json::from_str(&json).unwrap();

        let other_tenant = Uuid::new_v4();
        let (imported, report) = templates
            .import_profile(other_tenant, parsed, "bob")
            .await
            .unwrap();
        assert_eq!(imported.name(), "web");
        assert_eq!(imported.tenant_id, other_tenant);
        assert_eq!(report.created.len(), 2);
        assert!(report.skipped.is_empty());

        let rules = h
            .orchestrator
            .policy()
            .profile_rules(other_tenant, imported.id)
            .await
            .unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ssh", "https"]);
    }

    #[tokio::test]
    async fn test_builtin_template_compiles() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Succeed("ok".into()));
        let templates =
            TemplateService::new(h.orchestrator.policy().clone(), MaterializeMode::BestEffort);
        templates.seed_builtin_templates().await.unwrap();

        let mut settings = ProfileSettings::new("gw");
        settings.enable_nat = true;
        let profile = h.profile_with(settings, vec![]).await;
        let template = templates.find_template(h.tenant, "nat-gateway").await.unwrap();
        let report = templates
            .apply_template(h.tenant, template.id, profile.id, "alice")
            .await
            .unwrap();
        assert_eq!(report.created.len(), 3);

        let preview = h
            .orchestrator
            .preview(h.tenant, profile.id, AGENT)
            .await
            .unwrap();
        assert!(preview.script.contains("table ip nat {"));
        assert!(preview.script.contains("oifname \"eth0\" masquerade"));
        assert!(preview.script.contains("iifname \"eth1\" oifname \"eth0\" accept"));
    }

    #[tokio::test]
    async fn test_best_effort_import_skips_invalid_rules() {
        let h = Harness::new(ServiceConfig::default(), Behavior::Succeed("ok".into()));
        let templates =
            TemplateService::new(h.orchestrator.policy().clone(), MaterializeMode::BestEffort);

        let bad = RuleDefinition {
            action: Some(Action::Masquerade),
            ..RuleDefinition::new("masq in input", Chain::Input)
        };
        let export = ProfileExport {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: chrono::Utc::now(),
            exported_by: "alice".into(),
            profile: ProfileSettings {
                is_default: true,
                ..ProfileSettings::new("mixed")
            },
            rules: vec![tcp_definition("ssh", "22"), bad.clone()],
        };

        let (profile, report) = templates
            .import_profile(h.tenant, export.clone(), "alice")
            .await
            .unwrap();
        assert!(!profile.settings.is_default);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].name, "masq in input");

        let strict =
            TemplateService::new(h.orchestrator.policy().clone(), MaterializeMode::Strict);
        let err = strict
            .import_profile(h.tenant, export, "alice")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(
            h.orchestrator.policy().list_profiles(h.tenant).await.unwrap().len(),
            1
        );
    }
}
