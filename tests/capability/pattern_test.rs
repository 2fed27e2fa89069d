//! Resource pattern grammar and normalization.

use warden::capability::{matches, minimal_grant, normalize_resource, Grant, PatternError};

#[test]
fn single_star_stays_within_one_segment() {
    assert!(matches("/data/*.json", "/data/a.json"));
    assert!(!matches("/data/*.json", "/data/sub/b.json"));
    assert!(!matches("/data/*.json", "/data/a.txt"));
}

#[test]
fn double_star_matches_any_depth() {
    assert!(matches("/data/**", "/data/sub/b.json"));
    assert!(matches("/data/**", "/data/a.json"));
    assert!(!matches("/data/**", "/other/a.json"));
}

#[test]
fn traversal_never_escapes_the_pattern() {
    assert!(!matches("/data/**", "/data/../etc/passwd"));
    assert!(!matches("/data/**", "/data/%2e%2e/etc/passwd"));
    assert!(!matches("/data/**", "/data/..%2fetc/passwd"));
    assert!(!matches("/data/**", "/data/a\0.json"));
    // Traversal that stays inside still resolves.
    assert!(matches("/data/**", "/data/x/../a.json"));
}

#[test]
fn matching_is_deterministic() {
    for _ in 0..10 {
        assert!(matches("/data/*.json", "/data/a.json"));
        assert!(!matches("/data/*.json", "/data/sub/a.json"));
    }
}

#[test]
fn url_patterns_match_scheme_host_and_path() {
    let pattern = "https://api.example.com/v1/**";
    assert!(matches(pattern, "https://api.example.com/v1/users/7"));
    assert!(matches(pattern, "https://API.example.com/v1/users?page=2"));
    assert!(matches(pattern, "https://api.example.com:443/v1/x"));
    assert!(!matches(pattern, "http://api.example.com/v1/users"));
    assert!(!matches(pattern, "https://api.example.com:8443/v1/users"));
    assert!(!matches(pattern, "https://evil.example.com/v1/users"));
    assert!(!matches(pattern, "https://api.example.com/v2/users"));
}

#[test]
fn malformed_patterns_match_nothing() {
    assert!(!matches("", "/data/a.json"));
    assert!(!matches("/data/**/x", "/data/a/x"));
    assert!(!matches("https://*.example.com/**", "https://api.example.com/a"));
    assert!(!matches("/data/../etc/**", "/etc/passwd"));
}

#[test]
fn grant_parsing() {
    let grant = Grant::parse("file.read:/data/**").expect("valid grant");
    assert_eq!(grant.permission.family(), "file");
    assert_eq!(grant.permission.action(), "read");
    assert_eq!(grant.to_string(), "file.read:/data/**");

    let url = Grant::parse("http.get:https://api.example.com/**").expect("url grant");
    assert!(url.pattern.matches("https://api.example.com/a/b"));

    assert!(matches!(
        Grant::parse("no-colon-here"),
        Err(PatternError::MalformedGrant(_))
    ));
    assert!(Grant::parse("FILE:/data/**").is_err());
}

#[test]
fn normalization_and_minimal_grant() {
    assert_eq!(
        normalize_resource("/data/x/../a.json").expect("normalizes"),
        "/data/a.json"
    );
    assert!(normalize_resource("/../etc/passwd").is_err());
    assert_eq!(
        minimal_grant("file.read", "/data//sub/./b.json").as_deref(),
        Some("file.read:/data/sub/b.json")
    );
    assert_eq!(minimal_grant("file.read", "/data/%2e%2e/x"), None);
}

#[test]
fn url_path_never_comes_from_query_or_fragment() {
    assert!(!matches(
        "https://api.example.com/secret",
        "https://api.example.com?q=/secret"
    ));
    assert!(!matches(
        "https://api.example.com/admin/**",
        "https://api.example.com#/admin/x"
    ));
    assert!(!matches(
        "https://api.example.com/admin/**",
        "https://api.example.com/public?next=/admin/x"
    ));
}
