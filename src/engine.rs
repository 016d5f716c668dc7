//! Allow/reject decision for one proxied request.
//!
//! Candidates from the forwarded-for chain are checked in order. For each one
//! the accept rules win first; a deny-rule match then rejects only if the
//! reject-path list says so. When nothing matches the request is allowed.

use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::{
    config::RulesConfig,
    error::{RequestError, RuleError},
    forwarded::{
        X_CF_FORWARDED_URL, X_FORWARDED_FOR, candidate_ips, first_path_segment,
        parse_candidate_ip,
    },
    rules::{RejectPaths, RuleSet, SubnetRule},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject,
}

/// Outcome of an evaluation together with what caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Candidate matched an accept rule.
    Accepted { ip: IpAddr, rule: SubnetRule },
    /// Candidate matched a deny rule and the reject-path list applied.
    Denied {
        ip: IpAddr,
        rule: SubnetRule,
        path: String,
    },
    /// Candidate matched a deny rule, but the request path is not a reject path.
    ///
    /// Counter-intuitive: with specific reject paths configured, a deny-listed
    /// address is let through on every other path.
    DenyOverridden {
        ip: IpAddr,
        rule: SubnetRule,
        path: String,
    },
    /// No candidate matched either list.
    NoMatch,
    /// The request could not be evaluated.
    Rejected(RequestError),
}

impl Decision {
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        match self {
            Self::Accepted { .. } | Self::DenyOverridden { .. } | Self::NoMatch => Verdict::Allow,
            Self::Denied { .. } | Self::Rejected(_) => Verdict::Reject,
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.verdict() == Verdict::Allow
    }

    fn log(&self) {
        match self {
            Self::Accepted { ip, rule } => {
                info!(verdict = "allow", client_ip = %ip, rule = %rule, "Matched accept rule");
            }
            Self::Denied { ip, rule, path } => {
                warn!(verdict = "reject", client_ip = %ip, rule = %rule, path = %path, "Matched deny rule and reject path");
            }
            Self::DenyOverridden { ip, rule, path } => {
                info!(verdict = "allow", client_ip = %ip, rule = %rule, path = %path, "Matched deny rule but no reject path");
            }
            Self::NoMatch => {
                info!(verdict = "allow", "No rule matched, passing through");
            }
            Self::Rejected(e) => {
                warn!(verdict = "reject", error = %e, "Rejecting request");
            }
        }
    }
}

/// Immutable rule state shared by every request.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    accept: RuleSet,
    deny: RuleSet,
    reject_paths: RejectPaths,
}

impl DecisionEngine {
    pub fn new(rules: &RulesConfig) -> Result<Self, RuleError> {
        let accept = RuleSet::build(&rules.accept_source_ips)?;
        let deny = RuleSet::build(&rules.deny_source_ips)?;
        let reject_paths = RejectPaths::parse(&rules.deny_url_paths);

        info!(
            accept_rules = accept.rules().len(),
            deny_rules = deny.rules().len(),
            path_override = reject_paths.is_enabled(),
            "Decision engine ready"
        );
        Ok(Self::from_parts(accept, deny, reject_paths))
    }

    #[must_use]
    pub fn from_parts(accept: RuleSet, deny: RuleSet, reject_paths: RejectPaths) -> Self {
        Self {
            accept,
            deny,
            reject_paths,
        }
    }

    /// `true` to forward the request, `false` to reject it.
    pub fn decide<S: AsRef<str>>(&self, forwarded_for: &[S], forwarded_url: Option<&str>) -> bool {
        self.evaluate(forwarded_for, forwarded_url).is_allowed()
    }

    /// Evaluates one request from its X-Forwarded-For values and its forwarded URL.
    pub fn evaluate<S: AsRef<str>>(
        &self,
        forwarded_for: &[S],
        forwarded_url: Option<&str>,
    ) -> Decision {
        let decision = self
            .check(forwarded_for, forwarded_url)
            .unwrap_or_else(Decision::Rejected);
        decision.log();
        decision
    }

    fn check<S: AsRef<str>>(
        &self,
        forwarded_for: &[S],
        forwarded_url: Option<&str>,
    ) -> Result<Decision, RequestError> {
        let candidates = candidate_ips(forwarded_for);
        if candidates.is_empty() {
            return Err(RequestError::MissingHeader(X_FORWARDED_FOR));
        }

        let request_path = match forwarded_url.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => first_path_segment(url)?,
            None if self.reject_paths.is_enabled() => {
                return Err(RequestError::MissingHeader(X_CF_FORWARDED_URL));
            }
            None => String::new(),
        };

        for candidate in candidates {
            let Some(ip) = parse_candidate_ip(candidate) else {
                debug!(candidate, "Skipping candidate that is not an IP address");
                continue;
            };
            debug!(client_ip = %ip, "Checking candidate");

            if let Some(rule) = self.accept.first_match(ip) {
                return Ok(Decision::Accepted { ip, rule: *rule });
            }

            if let Some(rule) = self.deny.first_match(ip) {
                debug!(client_ip = %ip, rule = %rule, path = %request_path, "Matched deny rule, checking reject paths");
                let rule = *rule;
                let path = request_path;
                return Ok(if self.reject_paths.rejects(&path) {
                    Decision::Denied { ip, rule, path }
                } else {
                    Decision::DenyOverridden { ip, rule, path }
                });
            }
        }

        Ok(Decision::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn engine(accept: &str, deny: &str, paths: &str) -> DecisionEngine {
        DecisionEngine::new(&RulesConfig {
            accept_source_ips: accept.to_string(),
            deny_source_ips: deny.to_string(),
            deny_url_paths: paths.to_string(),
        })
        .unwrap()
    }

    mod scenarios {
        use super::*;

        #[test]
        fn accept_list_match_allows() {
            let engine = engine("10.0.0.0/8", "", "");
            assert!(engine.decide(&["10.1.2.3"], None));
        }

        #[test]
        fn deny_ip_on_reject_path_rejects() {
            let engine = engine("", "192.168.0.0/16", "admin");
            let decision = engine.evaluate(&["192.168.5.5"], Some("/admin/users"));
            assert_eq!(
                decision,
                Decision::Denied {
                    ip: "192.168.5.5".parse().unwrap(),
                    rule: SubnetRule::parse("192.168.0.0/16").unwrap(),
                    path: "admin".to_string(),
                }
            );
            assert_eq!(decision.verdict(), Verdict::Reject);
        }

        #[test]
        fn deny_ip_off_reject_path_is_let_through() {
            // Deny list only bites together with a reject path.
            let engine = engine("", "192.168.0.0/16", "admin");
            let decision = engine.evaluate(&["192.168.5.5"], Some("/public/page"));
            assert!(matches!(decision, Decision::DenyOverridden { ref path, .. } if path == "public"));
            assert!(decision.is_allowed());
        }

        #[test]
        fn deny_ip_with_match_all_rejects() {
            let engine = engine("", "1.2.3.4/32", "%%%MATCH_ALL_PATHS%%%");
            assert!(!engine.decide(&["1.2.3.4"], Some("/anything")));
        }

        #[test]
        fn unmatched_ip_passes_through() {
            let engine = engine("", "", "");
            assert_eq!(engine.evaluate(&["8.8.8.8"], None), Decision::NoMatch);
        }

        #[test]
        fn no_candidates_rejects() {
            let engine = engine("10.0.0.0/8", "", "");
            assert_eq!(
                engine.evaluate::<&str>(&[], Some("/x")),
                Decision::Rejected(RequestError::MissingHeader(X_FORWARDED_FOR))
            );
            assert!(!engine.decide(&["", " "], Some("/x")));
        }
    }

    mod precedence {
        use super::*;

        #[test]
        fn accept_beats_deny_and_paths() {
            let engine = engine("1.2.3.4", "1.2.3.4, 0.0.0.0/0", "%%%MATCH_ALL_PATHS%%%");
            assert!(engine.decide(&["1.2.3.4"], Some("/admin")));
        }

        #[test]
        fn plain_deny_rejects_without_reject_paths() {
            let engine = engine("", "203.0.113.0/24", "");
            assert!(!engine.decide(&["203.0.113.9"], None));
            assert!(!engine.decide(&["203.0.113.9"], Some("/public")));
        }

        #[test]
        fn reject_path_compare_ignores_case() {
            let engine = engine("", "203.0.113.0/24", "Admin");
            assert!(!engine.decide(&["203.0.113.9"], Some("https://app.example.com/ADMIN/x")));
            assert!(!engine.decide(&["203.0.113.9"], Some("https://app.example.com/%61dmin")));
            assert!(engine.decide(&["203.0.113.9"], Some("https://app.example.com/administrator")));
        }

        #[test]
        fn first_matching_candidate_decides() {
            let engine = engine("10.0.0.0/8", "203.0.113.0/24", "");
            // First candidate unmatched, second denied.
            assert!(!engine.decide(&["8.8.8.8, 203.0.113.9, 10.0.0.1"], None));
            // Accepted before the denied one is reached.
            assert!(engine.decide(&["10.0.0.1", "203.0.113.9"], None));
        }

        #[test]
        fn overridden_deny_stops_evaluation() {
            let with_accept = engine("10.0.0.0/8", "203.0.113.0/24", "admin");
            let decision = with_accept.evaluate(&["203.0.113.9", "10.0.0.1"], Some("/public"));
            assert!(matches!(decision, Decision::DenyOverridden { .. }));

            let deny_only = engine("", "203.0.113.0/24, 198.51.100.0/24", "admin");
            assert!(deny_only.decide(&["203.0.113.9", "198.51.100.1"], Some("/public")));
        }

        #[test]
        fn broadcast_candidate_hits_empty_accept_placeholder() {
            let engine = engine("", "1.2.3.4", "%%%MATCH_ALL_PATHS%%%");
            let decision = engine.evaluate(&["255.255.255.255", "1.2.3.4"], Some("/x"));
            assert_eq!(
                decision,
                Decision::Accepted {
                    ip: "255.255.255.255".parse().unwrap(),
                    rule: SubnetRule::parse("255.255.255.255/32").unwrap(),
                }
            );
            assert!(!engine.decide(&["1.2.3.4", "255.255.255.255"], Some("/x")));
        }

        #[test]
        fn non_address_candidates_are_skipped() {
            let engine = engine("", "203.0.113.0/24", "");
            assert!(!engine.decide(&["unknown, 203.0.113.9:4711"], None));
            assert_eq!(engine.evaluate(&["unknown"], None), Decision::NoMatch);
        }
    }

    mod address_families {
        use super::*;

        #[test]
        fn ipv6_candidate_never_matches_ipv4_rules() {
            let engine = engine("0.0.0.0/0", "0.0.0.0/0", "");
            assert_eq!(engine.evaluate(&["2001:db8::1"], None), Decision::NoMatch);
            assert_eq!(engine.evaluate(&["::ffff:10.0.0.1"], None), Decision::NoMatch);
        }

        #[test]
        fn ipv4_candidate_never_matches_ipv6_rules() {
            let engine = engine("::/0", "", "");
            assert_eq!(engine.evaluate(&["10.0.0.1"], None), Decision::NoMatch);
        }

        #[test]
        fn ipv6_rules() {
            let engine = engine("2001:db8::/32", "fd00::1", "");
            assert!(matches!(
                engine.evaluate(&["[2001:db8:1::5]:443"], None),
                Decision::Accepted { .. }
            ));
            assert!(!engine.decide(&["fd00::1"], None));
            assert_eq!(engine.evaluate(&["fd00::2"], None), Decision::NoMatch);
        }
    }

    mod construction {
        use super::*;

        fn build(accept: &str, deny: &str) -> Result<DecisionEngine, RuleError> {
            DecisionEngine::new(&RulesConfig {
                accept_source_ips: accept.to_string(),
                deny_source_ips: deny.to_string(),
                deny_url_paths: String::new(),
            })
        }

        #[test]
        fn bad_accept_token_is_fatal() {
            assert_eq!(
                build("10.0.0.0/8, nope", "").unwrap_err(),
                RuleError::InvalidAddress {
                    rule: "nope".to_string()
                }
            );
        }

        #[test]
        fn bad_deny_token_is_fatal() {
            assert_eq!(
                build("", "10.0.0.0/40").unwrap_err(),
                RuleError::InvalidPrefix {
                    rule: "10.0.0.0/40".to_string()
                }
            );
        }
    }

    mod forwarded_url {
        use super::*;

        #[test]
        fn missing_url_rejects_when_paths_configured() {
            let engine = engine("10.0.0.0/8", "", "admin");
            assert_eq!(
                engine.evaluate(&["10.0.0.1"], None),
                Decision::Rejected(RequestError::MissingHeader(X_CF_FORWARDED_URL))
            );
            assert!(!engine.decide(&["10.0.0.1"], Some("  ")));
        }

        #[test]
        fn missing_url_is_fine_without_paths() {
            let engine = engine("10.0.0.0/8", "", "");
            assert!(engine.decide(&["10.0.0.1"], None));
        }

        #[test]
        fn malformed_url_rejects() {
            let engine = engine("10.0.0.0/8", "", "");
            let decision = engine.evaluate(&["10.0.0.1"], Some("http://[::1/admin"));
            assert!(matches!(
                decision,
                Decision::Rejected(RequestError::MalformedTargetUrl { .. })
            ));
        }

        #[test]
        fn rfc_illegal_target_rejects_instead_of_overriding_deny() {
            // Deny IP off a reject path would otherwise be let through.
            let engine = engine("", "1.2.3.4", "admin");
            for url in [
                "http://app.example.com/pub lic",
                "/<x>",
                "/%zz",
                "/a|b",
            ] {
                let decision = engine.evaluate(&["1.2.3.4"], Some(url));
                assert!(
                    matches!(
                        decision,
                        Decision::Rejected(RequestError::MalformedTargetUrl { .. })
                    ),
                    "{url}: {decision:?}"
                );
            }
            assert!(engine.decide(&["1.2.3.4"], Some("/pub%20lic")));
        }

        #[test]
        fn missing_candidates_checked_before_url() {
            let engine = engine("", "", "admin");
            assert_eq!(
                engine.evaluate::<&str>(&[], None),
                Decision::Rejected(RequestError::MissingHeader(X_FORWARDED_FOR))
            );
        }
    }

    mod purity {
        use super::*;

        #[test]
        fn same_inputs_same_decision() {
            let engine = engine("10.0.0.0/8", "192.168.0.0/16", "admin");
            for (ips, url) in [
                (["10.1.1.1"], "/admin"),
                (["192.168.1.1"], "/admin"),
                (["192.168.1.1"], "/public"),
                (["8.8.8.8"], "/admin"),
            ] {
                assert_eq!(engine.evaluate(&ips, Some(url)), engine.evaluate(&ips, Some(url)));
            }
        }

        #[test]
        fn shared_across_threads() {
            const fn assert_send_sync<T: Send + Sync>() {}
            assert_send_sync::<DecisionEngine>();

            let engine = Arc::new(engine("", "192.168.0.0/16", "admin"));
            let verdicts: Vec<bool> = thread::scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|i| {
                        let engine = Arc::clone(&engine);
                        let path = if i % 2 == 0 { "/admin" } else { "/public" };
                        scope.spawn(move || engine.decide(&["192.168.0.1"], Some(path)))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            for (i, allowed) in verdicts.into_iter().enumerate() {
                assert_eq!(allowed, i % 2 == 1);
            }
        }
    }
}
