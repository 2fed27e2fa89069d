//! Token store, context inheritance, revocation, and expiry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use warden::capability::{IssueError, TokenStore, FILE_READ};
use warden::config::CapabilityConfig;

fn store() -> TokenStore {
    TokenStore::new(&CapabilityConfig::default())
}

#[test]
fn empty_root_authorizes_nothing() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let decision = store.has_permission(&root, "/data/a.json", FILE_READ);
    assert!(!decision.granted);
    assert_eq!(decision.token, None);
}

#[test]
fn single_star_stays_within_one_segment() {
    let store = store();
    let root = store.root_context("worker", "alice");
    store
        .issue(&root, "/data/*.json", &["file.read"], Duration::minutes(5))
        .expect("issue");

    assert!(store.has_permission(&root, "/data/a.json", FILE_READ).granted);
    assert!(!store.has_permission(&root, "/data/sub/b.json", FILE_READ).granted);
    assert!(!store.has_permission(&root, "/data/a.json", "file.write").granted);
}

#[test]
fn double_star_spans_segments() {
    let store = store();
    let root = store.root_context("worker", "alice");
    store
        .issue(&root, "/data/**", &["file.read"], Duration::minutes(5))
        .expect("issue");
    assert!(store.has_permission(&root, "/data/sub/b.json", FILE_READ).granted);
    assert!(!store.has_permission(&root, "/data/../etc/passwd", FILE_READ).granted);
}

#[test]
fn children_inherit_and_lose_access_on_parent_revoke() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let child = store.child_context(&root, "task").expect("child");
    let grandchild = store.child_context(&child, "subtask").expect("grandchild");
    let token = store
        .issue(&root, "/data/**", &["file.read"], Duration::minutes(5))
        .expect("issue");

    let decision = store.has_permission(&grandchild, "/data/x", FILE_READ);
    assert!(decision.granted);
    assert_eq!(decision.source_context, Some(root.id()));
    assert_eq!(decision.token, Some(token.id()));

    assert!(store.revoke(token.id()));
    assert!(!store.revoke(token.id()), "second revoke is a no-op");
    assert!(!store.has_permission(&grandchild, "/data/x", FILE_READ).granted);
    assert!(!store.has_permission(&child, "/data/x", FILE_READ).granted);
}

#[test]
fn child_tokens_do_not_leak_upward() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let child = store.child_context(&root, "task").expect("child");
    store
        .issue(&child, "/data/**", &["file.read"], Duration::minutes(5))
        .expect("issue");
    assert!(store.has_permission(&child, "/data/x", FILE_READ).granted);
    assert!(!store.has_permission(&root, "/data/x", FILE_READ).granted);
}

#[test]
fn expired_tokens_stop_authorizing_descendants() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let child = store.child_context(&root, "task").expect("child");
    let token = store
        .issue(&root, "/data/**", &["file.read"], Duration::seconds(30))
        .expect("issue");

    let now = Utc::now();
    assert!(store.has_permission_at(&child, "/data/x", FILE_READ, now).granted);
    let later = token.expires_at() + Duration::seconds(1);
    assert!(!store.has_permission_at(&child, "/data/x", FILE_READ, later).granted);
    assert!(!token.is_active_at(later));
}

#[test]
fn dropped_parent_fails_closed() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let child = store.child_context(&root, "task").expect("child");
    store
        .issue(&root, "/data/**", &["file.read"], Duration::minutes(5))
        .expect("issue");
    drop(root);
    assert!(child.parent().is_none());
    assert!(!store.has_permission(&child, "/data/x", FILE_READ).granted);
}

#[test]
fn issue_rejects_bad_input() {
    let store = store();
    let root = store.root_context("worker", "alice");
    assert_eq!(
        store
            .issue(&root, "/data/**", &["file.read"], Duration::zero())
            .err(),
        Some(IssueError::InvalidTtl(0))
    );
    assert_eq!(
        store.issue(&root, "/data/**", &[], Duration::minutes(1)).err(),
        Some(IssueError::NoPermissions)
    );
    assert!(matches!(
        store.issue(&root, "/data/**/x", &["file.read"], Duration::minutes(1)),
        Err(IssueError::Pattern(_))
    ));
}

#[test]
fn depth_limit_is_enforced() {
    let store = TokenStore::new(&CapabilityConfig {
        max_depth: 2,
        ..CapabilityConfig::default()
    });
    let root = store.root_context("worker", "alice");
    let one = store.child_context(&root, "one").expect("depth 1");
    let two = store.child_context(&one, "two").expect("depth 2");
    assert_eq!(two.depth(), 2);
    assert_eq!(
        store.child_context(&two, "three").err(),
        Some(IssueError::DepthExceeded { max: 2 })
    );
}

#[test]
fn revoke_context_and_purge() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let a = store
        .issue(&root, "/a/**", &["file.read"], Duration::minutes(5))
        .expect("issue");
    let b = store
        .issue(&root, "/b/**", &["file.read", "file.write"], Duration::minutes(5))
        .expect("issue");
    assert_eq!(store.active_tokens(root.id()).len(), 2);

    let mut revoked = store.revoke_context(root.id());
    revoked.sort();
    let mut expected = vec![a.id(), b.id()];
    expected.sort();
    assert_eq!(revoked, expected);
    assert!(store.active_tokens(root.id()).is_empty());
    assert_eq!(store.purge(), 2);
}

#[test]
fn shutdown_revokes_everything_and_refuses_issue() {
    let store = store();
    let root = store.root_context("worker", "alice");
    let token = store
        .issue(&root, "/data/**", &["file.read"], Duration::minutes(5))
        .expect("issue");
    store.shutdown();
    assert!(token.is_revoked());
    assert_eq!(
        store
            .issue(&root, "/data/**", &["file.read"], Duration::minutes(5))
            .err(),
        Some(IssueError::ShutDown)
    );
}

#[tokio::test]
async fn concurrent_contexts_are_isolated() {
    let store = Arc::new(store());
    let root_a = store.root_context("worker-a", "alice");
    let root_b = store.root_context("worker-b", "bob");
    let token_a = store
        .issue(&root_a, "/shared/**", &["file.read"], Duration::minutes(5))
        .expect("issue a");
    store
        .issue(&root_b, "/shared/**", &["file.read"], Duration::minutes(5))
        .expect("issue b");

    let worker_a = {
        let store = Arc::clone(&store);
        let ctx = Arc::clone(&root_a);
        tokio::spawn(async move {
            let before = store.has_permission(&ctx, "/shared/x", FILE_READ).granted;
            store.revoke(token_a.id());
            tokio::task::yield_now().await;
            let after = store.has_permission(&ctx, "/shared/x", FILE_READ).granted;
            (before, after)
        })
    };
    let worker_b = {
        let store = Arc::clone(&store);
        let ctx = Arc::clone(&root_b);
        tokio::spawn(async move {
            let mut granted = Vec::new();
            for _ in 0..50 {
                granted.push(store.has_permission(&ctx, "/shared/x", FILE_READ).granted);
                tokio::task::yield_now().await;
            }
            granted
        })
    };

    let (before, after) = worker_a.await.expect("worker a");
    let b_results = worker_b.await.expect("worker b");
    assert!(before);
    assert!(!after);
    assert!(b_results.iter().all(|g| *g), "b's grant is unaffected by a's revoke");

    let decision = store.has_permission(&root_b, "/shared/x", FILE_READ);
    assert_eq!(decision.source_context, Some(root_b.id()));
}
