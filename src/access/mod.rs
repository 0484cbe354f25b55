// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Access-control evaluator (§4.F): three rule families — path, literal
//! (variables/queries/callbacks), and context (persistent class regex
//! match) — all sharing the same admit/deny two-list shape with
//! deny-overrides-admit semantics.

use std::{net::IpAddr, path::Path};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// The shared two-list shape every evaluator in this module uses: an
/// empty admit list means deny-all, and any matching deny rule overrides
/// a matching admit rule.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TwoList<R> {
    #[serde(default)]
    pub admit: Vec<R>,
    #[serde(default)]
    pub deny: Vec<R>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathRule {
    pub pattern: String,
    #[serde(default)]
    pub encrypt_required: bool,
    #[serde(default)]
    pub maproot: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NameRule {
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextRule {
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RuleSet {
    #[serde(default)]
    pub path: TwoList<PathRule>,
    #[serde(default)]
    pub literal: TwoList<NameRule>,
    #[serde(default)]
    pub variable: TwoList<NameRule>,
    #[serde(default)]
    pub context: TwoList<ContextRule>,
}

impl RuleSet {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProtocolError::Fatal(format!("reading access rules {:?}: {e}", path.as_ref()))
        })?;
        serde_yaml::from_str(&text)
            .map_err(|e| ProtocolError::Fatal(format!("parsing access rules: {e}")))
    }
}

/// Result of evaluating a path request: whether it's admitted, and
/// whether it also grants root-privilege mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathDecision {
    pub allowed: bool,
    pub map_root: bool,
}

/// Maps the protocol's virtual `/var/cfengine` prefix onto the configured
/// working directory, then normalizes separators. Symlink resolution is
/// left to the filesystem layer that actually opens the file; this
/// function only rewrites the logical path used for rule matching.
pub fn normalize_path(requested: &str, workdir: &Path) -> String {
    const VIRTUAL_PREFIX: &str = "/var/cfengine";
    let rewritten = if let Some(rest) = requested.strip_prefix(VIRTUAL_PREFIX) {
        format!("{}{rest}", workdir.display())
    } else {
        requested.to_string()
    };
    rewritten.replace('\\', "/")
}

/// Exact match or "rule path names an ancestor directory of the request"
/// (prefix match at a path separator boundary).
fn path_matches(rule_pattern: &str, request: &str) -> bool {
    if rule_pattern == request {
        return true;
    }
    let prefix = rule_pattern.trim_end_matches('/');
    request
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Evaluates a path-access request per §4.F: find the most specific
/// matching admit rule, check `encrypt-required`, evaluate `maproot`, then
/// let any matching deny rule override. Root mapping additionally
/// requires `rsa_authenticated`.
pub fn evaluate_path(
    rules: &TwoList<PathRule>,
    request_path: &str,
    encrypted: bool,
    rsa_authenticated: bool,
    peer_ip: IpAddr,
    peer_hostname: &str,
) -> PathDecision {
    let admit_rule = rules
        .admit
        .iter()
        .filter(|r| path_matches(&r.pattern, request_path))
        .max_by_key(|r| r.pattern.len());

    let Some(admit_rule) = admit_rule else {
        return PathDecision { allowed: false, map_root: false };
    };

    if admit_rule.encrypt_required && !encrypted {
        return PathDecision { allowed: false, map_root: false };
    }

    let denied = rules.deny.iter().any(|r| path_matches(&r.pattern, request_path));
    if denied {
        return PathDecision { allowed: false, map_root: false };
    }

    let peer_ip_str = peer_ip.to_string();
    let map_root = rsa_authenticated
        && admit_rule
            .maproot
            .iter()
            .any(|h| h == &peer_ip_str || h == peer_hostname);

    PathDecision { allowed: true, map_root }
}

/// Evaluates a literal/variable-access request: exact name match, with
/// deny taking precedence over admit.
pub fn evaluate_name(rules: &TwoList<NameRule>, name: &str) -> bool {
    let admitted = rules.admit.iter().any(|r| r.pattern == name);
    if !admitted {
        return false;
    }
    !rules.deny.iter().any(|r| r.pattern == name)
}

/// Evaluates a context-access request: full-regex match of the requested
/// class pattern against each persistent class name, returning the names
/// that both match an admit rule's pattern and aren't denied.
pub fn evaluate_context<'a>(
    rules: &TwoList<ContextRule>,
    requested_pattern: &str,
    persistent_classes: &'a [String],
) -> Result<Vec<&'a str>> {
    let requested = Regex::new(requested_pattern)
        .map_err(|e| ProtocolError::ProtocolViolation(format!("bad class regex: {e}")))?;

    let admit_regexes: Vec<Regex> = rules
        .admit
        .iter()
        .map(|r| Regex::new(&r.pattern))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ProtocolError::Fatal(format!("bad configured admit regex: {e}")))?;
    let deny_regexes: Vec<Regex> = rules
        .deny
        .iter()
        .map(|r| Regex::new(&r.pattern))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ProtocolError::Fatal(format!("bad configured deny regex: {e}")))?;

    Ok(persistent_classes
        .iter()
        .filter(|name| requested.is_match(name))
        .filter(|name| admit_regexes.iter().any(|r| r.is_match(name)))
        .filter(|name| !deny_regexes.iter().any(|r| r.is_match(name)))
        .map(|s| s.as_str())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn empty_admit_list_denies_everything() {
        let rules = TwoList::<PathRule>::default();
        let decision = evaluate_path(&rules, "/a/b", false, false, ip(), "host");
        assert!(!decision.allowed);
    }

    #[test]
    fn exact_and_ancestor_prefix_match() {
        let rules = TwoList {
            admit: vec![PathRule {
                pattern: "/srv/data".to_string(),
                encrypt_required: false,
                maproot: vec![],
            }],
            deny: vec![],
        };
        assert!(evaluate_path(&rules, "/srv/data", false, false, ip(), "h").allowed);
        assert!(evaluate_path(&rules, "/srv/data/sub/file", false, false, ip(), "h").allowed);
        assert!(!evaluate_path(&rules, "/srv/datax", false, false, ip(), "h").allowed);
    }

    #[test]
    fn encrypt_required_rejects_plaintext_request() {
        let rules = TwoList {
            admit: vec![PathRule {
                pattern: "/srv/secret".to_string(),
                encrypt_required: true,
                maproot: vec![],
            }],
            deny: vec![],
        };
        assert!(!evaluate_path(&rules, "/srv/secret", false, false, ip(), "h").allowed);
        assert!(evaluate_path(&rules, "/srv/secret", true, false, ip(), "h").allowed);
    }

    #[test]
    fn deny_overrides_matching_admit() {
        let rules = TwoList {
            admit: vec![PathRule {
                pattern: "/srv".to_string(),
                encrypt_required: false,
                maproot: vec![],
            }],
            deny: vec![PathRule {
                pattern: "/srv/private".to_string(),
                encrypt_required: false,
                maproot: vec![],
            }],
        };
        assert!(evaluate_path(&rules, "/srv/public", false, false, ip(), "h").allowed);
        assert!(!evaluate_path(&rules, "/srv/private/file", false, false, ip(), "h").allowed);
    }

    #[test]
    fn maproot_requires_both_match_and_rsa_authenticated() {
        let rules = TwoList {
            admit: vec![PathRule {
                pattern: "/srv".to_string(),
                encrypt_required: false,
                maproot: vec!["10.0.0.5".to_string()],
            }],
            deny: vec![],
        };
        let not_auth = evaluate_path(&rules, "/srv/x", false, false, ip(), "h");
        assert!(not_auth.allowed && !not_auth.map_root);
        let auth = evaluate_path(&rules, "/srv/x", false, true, ip(), "h");
        assert!(auth.allowed && auth.map_root);
    }

    #[test]
    fn name_rule_deny_overrides_admit() {
        let rules = TwoList {
            admit: vec![NameRule { pattern: "foo".to_string() }],
            deny: vec![NameRule { pattern: "foo".to_string() }],
        };
        assert!(!evaluate_name(&rules, "foo"));
        assert!(!evaluate_name(&rules, "bar"));
    }

    #[test]
    fn context_rule_matches_by_regex() {
        let rules = TwoList {
            admit: vec![ContextRule { pattern: "^linux_.*".to_string() }],
            deny: vec![ContextRule { pattern: "^linux_test$".to_string() }],
        };
        let classes = vec![
            "linux_prod".to_string(),
            "linux_test".to_string(),
            "windows_prod".to_string(),
        ];
        let matched = evaluate_context(&rules, "linux_.*", &classes).expect("evaluate");
        assert_eq!(matched, vec!["linux_prod"]);
    }
}
