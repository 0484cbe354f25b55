// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use cfprotocol::{access::{evaluate_path, RuleSet}, error::ProtocolError};

#[test]
fn loaded_ruleset_evaluates_nested_deny_over_broad_admit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rules.yaml");
    std::fs::write(
        &path,
        r#"
path:
  admit:
    - pattern: /srv/data
      encrypt_required: false
      maproot: []
  deny:
    - pattern: /srv/data/private
      encrypt_required: false
      maproot: []
"#,
    )
    .expect("write rules");

    let rules = RuleSet::load_from_file(&path).expect("load rules");
    let ip = "10.0.0.9".parse().expect("valid ip");

    assert!(
        evaluate_path(&rules.path, "/srv/data/public/report.txt", false, false, ip, "host")
            .allowed
    );
    assert!(
        !evaluate_path(&rules.path, "/srv/data/private/secret.txt", false, false, ip, "host")
            .allowed
    );
}

#[test]
fn missing_rules_file_is_a_fatal_error() {
    let err = RuleSet::load_from_file("/nonexistent/path/rules.yaml").unwrap_err();
    assert!(matches!(err, ProtocolError::Fatal(_)));
}
