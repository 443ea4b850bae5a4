//! Rule corpus loading from a directory tree.
//!
//! A malformed rule file is skipped (the rest of the corpus loads); graph
//! problems that make an evaluation order impossible fail the whole load.

use std::fs;
use std::path::Path;

use discern::{DiscernError, RuleSet};
use tempfile::tempdir;

fn write_rule(dir: &Path, file: &str, name: &str, namespace: &str, scope: &str, features: &str) {
    let text = format!(
        "rule:\n  meta:\n    name: {name}\n    namespace: {namespace}\n    scope: {scope}\n  features:\n{features}"
    );
    let path = dir.join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}

#[test]
fn test_nested_directories_load_and_malformed_files_are_skipped() {
    let dir = tempdir().unwrap();
    let root = dir.path();

    write_rule(root, "net/dns.yml", "resolve DNS", "communication/dns", "thread", "    - api: GetAddrInfoW\n");
    write_rule(root, "net/http.yaml", "fetch URL", "communication/http", "call", "    - api: InternetOpenUrlA\n");
    write_rule(root, "file-rules/import.yml", "imports winsock", "linking/winsock", "file", "    - import: WSAStartup\n");
    fs::write(root.join("net/broken.yml"), "rule:\n  features: [nonsense").unwrap();
    fs::write(root.join("README.txt"), "not a rule").unwrap();

    let set = RuleSet::from_directory(root).unwrap();
    assert_eq!(set.len(), 3);
    assert!(set.by_name("resolve DNS").is_some());
    assert!(set.by_name("fetch URL").is_some());
    assert_eq!(set.in_namespace("communication").count(), 2);
}

#[test]
fn test_missing_directory_is_an_error() {
    let err = RuleSet::from_directory("/does/not/exist").unwrap_err();
    assert!(matches!(err, DiscernError::RuleDirectoryNotFound { .. }), "{err}");
}

#[test]
fn test_cycle_across_files_fails_the_load() {
    let dir = tempdir().unwrap();
    let root = dir.path();

    write_rule(root, "a.yml", "alpha", "ns/a", "file", "    - match: beta\n");
    write_rule(root, "b.yml", "beta", "ns/b", "file", "    - match: alpha\n");

    let err = RuleSet::from_directory(root).unwrap_err();
    match err {
        DiscernError::CyclicDependency { cycle } => {
            assert!(cycle.contains(&"alpha".to_string()));
            assert!(cycle.contains(&"beta".to_string()));
        }
        other => panic!("expected cycle error, got {other}"),
    }
}

#[test]
fn test_duplicate_rule_names_fail_the_load() {
    let dir = tempdir().unwrap();
    let root = dir.path();

    write_rule(root, "one.yml", "twin", "ns/a", "file", "    - string: a\n");
    write_rule(root, "two.yml", "twin", "ns/b", "file", "    - string: b\n");

    let err = RuleSet::from_directory(root).unwrap_err();
    match &err {
        DiscernError::DuplicateRule { name, first_seen } => {
            assert_eq!(name, "twin");
            assert!(first_seen.ends_with("one.yml"), "{first_seen}");
        }
        other => panic!("expected duplicate error, got {other}"),
    }
    assert!(err.is_fatal());
}

#[test]
fn test_unresolved_reference_fails_the_load() {
    let dir = tempdir().unwrap();
    let root = dir.path();

    write_rule(root, "dangling.yml", "dangling", "ns", "file", "    - match: missing/rule\n");

    let err = RuleSet::from_directory(root).unwrap_err();
    assert!(matches!(err, DiscernError::UnresolvedReference { .. }), "{err}");
}

#[test]
fn test_evaluation_order_puts_referenced_rules_first() {
    let dir = tempdir().unwrap();
    let root = dir.path();

    write_rule(root, "z-top.yml", "z wrapper", "summary", "process", "    - match: leaf/api\n");
    write_rule(root, "a-leaf.yml", "a leaf", "leaf/api", "call", "    - api: free\n");

    let set = RuleSet::from_directory(root).unwrap();
    let order: Vec<&str> = set
        .evaluation_order()
        .iter()
        .map(|&id| set.rule(id).name.as_str())
        .collect();
    assert_eq!(order, ["a leaf", "z wrapper"]);
}
