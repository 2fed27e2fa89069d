//! Scoped acquisition and release.

use std::sync::Arc;

use chrono::Duration;
use warden::capability::{ContextStack, TokenStore, FILE_READ, HTTP_GET};
use warden::config::CapabilityConfig;

fn stack() -> (Arc<TokenStore>, ContextStack) {
    let store = Arc::new(TokenStore::new(&CapabilityConfig::default()));
    let root = store.root_context("worker", "alice");
    let stack = ContextStack::new(Arc::clone(&store), root);
    (store, stack)
}

#[test]
fn scope_grants_then_releases_on_drop() {
    let (store, mut stack) = stack();
    let root = Arc::clone(stack.current());
    let scoped;
    {
        let scope = stack
            .acquire(
                &["file.read:/data/**", "http.get:https://api.example.com/**"],
                Duration::minutes(5),
            )
            .expect("acquire");
        scoped = Arc::clone(scope.context());
        assert!(store.has_permission(&scoped, "/data/a.json", FILE_READ).granted);
        assert!(store
            .has_permission(&scoped, "https://api.example.com/v1", HTTP_GET)
            .granted);
        assert!(!store.has_permission(&root, "/data/a.json", FILE_READ).granted);
        assert_eq!(scope.tokens().len(), 2);
    }
    assert_eq!(stack.depth(), 1);
    // A context leaked past its scope holds nothing.
    assert!(!store.has_permission(&scoped, "/data/a.json", FILE_READ).granted);
    assert!(store.active_tokens(scoped.id()).is_empty());
}

#[test]
fn nested_scopes_unwind_in_order() {
    let (store, mut stack) = stack();
    {
        let mut outer = stack
            .acquire(&["file.read:/data/**"], Duration::minutes(5))
            .expect("outer");
        {
            let inner = outer
                .acquire(&["file.read:/tmp/**"], Duration::minutes(5))
                .expect("inner");
            let ctx = inner.context();
            assert!(store.has_permission(ctx, "/data/a", FILE_READ).granted);
            assert!(store.has_permission(ctx, "/tmp/a", FILE_READ).granted);
        }
        let ctx = outer.context();
        assert!(store.has_permission(ctx, "/data/a", FILE_READ).granted);
        assert!(!store.has_permission(ctx, "/tmp/a", FILE_READ).granted);
    }
    assert_eq!(stack.depth(), 1);
}

fn failing_work(stack: &mut ContextStack, store: &TokenStore) -> Result<(), String> {
    let scope = stack
        .acquire(&["file.read:/data/**"], Duration::minutes(5))
        .map_err(|e| e.to_string())?;
    if store
        .has_permission(scope.context(), "/etc/passwd", FILE_READ)
        .granted
    {
        return Ok(());
    }
    Err("denied".to_owned())
}

#[test]
fn scope_is_released_on_early_return() {
    let (store, mut stack) = stack();
    assert!(failing_work(&mut stack, &store).is_err());
    assert_eq!(stack.depth(), 1);
    assert!(!store
        .has_permission(stack.current(), "/data/a", FILE_READ)
        .granted);
}

#[test]
fn scope_is_released_on_panic() {
    let (store, mut stack) = stack();
    let mut scoped = None;
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let scope = stack
            .acquire(&["file.read:/data/**"], Duration::minutes(5))
            .expect("acquire");
        scoped = Some(Arc::clone(scope.context()));
        panic!("unit failed");
    }));
    assert!(result.is_err());
    assert_eq!(stack.depth(), 1);
    let scoped = scoped.expect("scope was acquired");
    assert!(!store.has_permission(&scoped, "/data/a", FILE_READ).granted);
}

#[test]
fn default_ttl_acquire() {
    let (store, mut stack) = stack();
    let scope = stack.acquire_default(&["file.read:/data/**"]).expect("acquire");
    let tokens = store.active_tokens(scope.context().id());
    assert_eq!(tokens.len(), 1);
    let ttl = tokens[0].expires_at() - tokens[0].issued_at();
    assert_eq!(ttl, Duration::seconds(3600));
}
