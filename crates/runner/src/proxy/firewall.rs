//! First-match firewall evaluation.
//!
//! Evaluation is pure: every connection is decided from the registry entry's
//! rule list and the observed (host, destination, port) with no shared
//! state. No matching rule means deny.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::types::{FirewallRule, RuleAction};

/// Outcome of evaluating one connection against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { rule: String },
    Deny { rule: Option<String> },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn rule(&self) -> Option<&str> {
        match self {
            Self::Allow { rule } => Some(rule),
            Self::Deny { rule } => rule.as_deref(),
        }
    }
}

/// Evaluate rules in order; the first rule whose present matchers all hold
/// decides. An empty list denies everything.
pub fn evaluate(
    rules: &[FirewallRule],
    host: Option<&str>,
    dest: Option<IpAddr>,
    port: u16,
) -> Decision {
    for rule in rules {
        if !rule_matches(rule, host, dest, port) {
            continue;
        }
        let label = rule_label(rule);
        return match rule.action {
            RuleAction::Allow => Decision::Allow { rule: label },
            RuleAction::Deny => Decision::Deny { rule: Some(label) },
        };
    }
    Decision::Deny { rule: None }
}

fn rule_matches(rule: &FirewallRule, host: Option<&str>, dest: Option<IpAddr>, port: u16) -> bool {
    if rule.host.is_none() && rule.cidr.is_none() && rule.port.is_none() {
        // A bare action is a terminal rule.
        return true;
    }
    if let Some(pattern) = &rule.host {
        match host {
            Some(host) if glob_match(pattern, host) => {}
            _ => return false,
        }
    }
    if let Some(cidr) = &rule.cidr {
        let Some(dest) = dest else { return false };
        match cidr.parse::<IpNet>() {
            Ok(net) if net.contains(&dest) => {}
            _ => return false,
        }
    }
    if let Some(rule_port) = rule.port
        && rule_port != port
    {
        return false;
    }
    true
}

fn rule_label(rule: &FirewallRule) -> String {
    if let Some(host) = &rule.host {
        format!("host:{host}")
    } else if let Some(cidr) = &rule.cidr {
        format!("cidr:{cidr}")
    } else if let Some(port) = rule.port {
        format!("port:{port}")
    } else {
        "any".to_string()
    }
}

/// Case-insensitive wildcard match: `*` spans any run of characters,
/// `?` exactly one.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.split_first(), value.split_first()) {
            (None, None) => true,
            (Some((b'*', rest)), _) => {
                inner(rest, value)
                    || (!value.is_empty() && inner(pattern, value.get(1..).unwrap_or_default()))
            }
            (Some((b'?', p_rest)), Some((_, v_rest))) => inner(p_rest, v_rest),
            (Some((p, p_rest)), Some((v, v_rest))) => {
                p.eq_ignore_ascii_case(v) && inner(p_rest, v_rest)
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

/// Targets the proxy never forwards to, regardless of policy: loopback,
/// link-local (cloud metadata), RFC1918, and `.internal` hostnames.
pub fn is_forbidden_target(host: Option<&str>, dest: Option<IpAddr>) -> bool {
    if let Some(host) = host {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".internal") {
            return true;
        }
        if let Ok(ip) = host.parse::<IpAddr>()
            && ip_is_forbidden(ip)
        {
            return true;
        }
    }
    dest.is_some_and(ip_is_forbidden)
}

fn ip_is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            // Mapped IPv4 must not bypass the v4 rules.
            if let Some(v4) = v6.to_ipv4_mapped() {
                return ip_is_forbidden(IpAddr::V4(v4));
            }
            // Symmetric with the v4 arm: fe80::/10 link-local (metadata
            // services), fc00::/7 unique-local (RFC 4193 private).
            let [seg0, ..] = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg0 & 0xffc0) == 0xfe80
                || (seg0 & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn allow_host(pattern: &str) -> FirewallRule {
        FirewallRule {
            action: RuleAction::Allow,
            host: Some(pattern.into()),
            cidr: None,
            port: None,
        }
    }

    fn deny_all() -> FirewallRule {
        FirewallRule {
            action: RuleAction::Deny,
            host: None,
            cidr: None,
            port: None,
        }
    }

    #[test]
    fn glob_exact_and_wildcards() {
        assert!(glob_match("api.example.com", "api.example.com"));
        assert!(glob_match("API.Example.COM", "api.example.com"));
        assert!(glob_match("*.example.com", "api.example.com"));
        assert!(glob_match("*.example.com", "a.b.example.com"));
        assert!(!glob_match("*.example.com", "example.com"));
        assert!(!glob_match("*.example.com", "example.org"));
        assert!(glob_match("api.?.example.com", "api.a.example.com"));
        assert!(glob_match("*", "anything.at.all"));
    }

    #[test]
    fn first_match_wins() {
        let rules = vec![
            FirewallRule {
                action: RuleAction::Deny,
                host: Some("evil.example.com".into()),
                cidr: None,
                port: None,
            },
            allow_host("*.example.com"),
        ];
        let deny = evaluate(&rules, Some("evil.example.com"), None, 443);
        assert!(!deny.is_allow());
        assert_eq!(deny.rule(), Some("host:evil.example.com"));

        let allow = evaluate(&rules, Some("api.example.com"), None, 443);
        assert!(allow.is_allow());
        assert_eq!(allow.rule(), Some("host:*.example.com"));
    }

    #[test]
    fn no_rule_means_deny() {
        let decision = evaluate(&[], Some("api.example.com"), None, 443);
        assert_eq!(decision, Decision::Deny { rule: None });

        let rules = vec![allow_host("api.example.com")];
        let decision = evaluate(&rules, Some("other.example.com"), None, 443);
        assert_eq!(decision, Decision::Deny { rule: None });
    }

    #[test]
    fn cidr_rule_matches_destination() {
        let rules = vec![FirewallRule {
            action: RuleAction::Allow,
            host: None,
            cidr: Some("93.184.0.0/16".into()),
            port: None,
        }];
        let inside = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        let outside = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert!(evaluate(&rules, None, Some(inside), 443).is_allow());
        assert!(!evaluate(&rules, None, Some(outside), 443).is_allow());
        // CIDR rule can't match without a resolved destination.
        assert!(!evaluate(&rules, Some("example.com"), None, 443).is_allow());
    }

    #[test]
    fn port_rule_scopes_matches() {
        let rules = vec![
            FirewallRule {
                action: RuleAction::Allow,
                host: Some("api.example.com".into()),
                cidr: None,
                port: Some(443),
            },
            deny_all(),
        ];
        assert!(evaluate(&rules, Some("api.example.com"), None, 443).is_allow());
        assert!(!evaluate(&rules, Some("api.example.com"), None, 80).is_allow());
    }

    #[test]
    fn terminal_rule_matches_everything() {
        let rules = vec![allow_host("api.example.com"), deny_all()];
        let decision = evaluate(&rules, Some("nope.example.org"), None, 443);
        assert_eq!(decision.rule(), Some("any"));
        assert!(!decision.is_allow());
    }

    #[test]
    fn forbidden_targets() {
        assert!(is_forbidden_target(Some("localhost"), None));
        assert!(is_forbidden_target(Some("foo.internal"), None));
        assert!(is_forbidden_target(Some("169.254.169.254"), None));
        assert!(is_forbidden_target(
            None,
            Some(IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)))
        ));
        assert!(is_forbidden_target(
            None,
            Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)))
        ));
        assert!(is_forbidden_target(
            None,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        ));
        assert!(!is_forbidden_target(
            Some("api.example.com"),
            Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        ));
    }

    #[test]
    fn forbidden_ipv6_targets() {
        use std::net::Ipv6Addr;

        // Link-local and unique-local, same treatment as their v4 peers.
        assert!(is_forbidden_target(None, Some("fe80::1".parse().unwrap())));
        assert!(is_forbidden_target(
            None,
            Some("fd00:ec2::254".parse().unwrap())
        ));
        assert!(is_forbidden_target(
            None,
            Some("fc00::1".parse().unwrap())
        ));
        assert!(is_forbidden_target(
            None,
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        ));
        assert!(is_forbidden_target(
            None,
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        ));
        // Mapped IPv4 goes through the v4 rules.
        assert!(is_forbidden_target(
            None,
            Some("::ffff:169.254.169.254".parse().unwrap())
        ));
        assert!(is_forbidden_target(
            None,
            Some("::ffff:10.1.2.3".parse().unwrap())
        ));
        // Global unicast stays reachable.
        assert!(!is_forbidden_target(
            None,
            Some("2606:4700::1111".parse().unwrap())
        ));
    }
}
