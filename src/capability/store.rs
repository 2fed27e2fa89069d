//! Token store and context tree.
//!
//! Contexts form a tree through weak child→parent references: a parent
//! neither owns nor enumerates its children. Each context owns its token list
//! behind a reader-biased lock; authorization walks from the asking context to
//! the root, taking only read locks.
//!
//! The store keeps weak indexes of tokens and contexts so tokens can be
//! revoked by id and incident response can find a context's tokens.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CapabilityConfig;

use super::pattern::{Grant, PatternError, Permission, ResourcePattern};

/// Failure to create a context or issue a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    /// TTL must be strictly positive.
    #[error("token ttl must be positive, got {0}s")]
    InvalidTtl(i64),
    /// Pattern, permission, or grant string is malformed.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// A token needs at least one permission.
    #[error("token must carry at least one permission")]
    NoPermissions,
    /// Nesting would exceed the configured depth.
    #[error("context depth limit of {max} exceeded")]
    DepthExceeded {
        /// Configured maximum depth.
        max: usize,
    },
    /// The store has been shut down.
    #[error("token store is shut down")]
    ShutDown,
}

/// A grant of permissions over a resource pattern.
///
/// Immutable once issued, except for the revoked flag.
#[derive(Debug)]
pub struct CapabilityToken {
    id: Uuid,
    pattern: ResourcePattern,
    permissions: BTreeSet<Permission>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    context_id: Uuid,
    revoked: AtomicBool,
}

impl CapabilityToken {
    /// Token id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resource pattern covered by the token.
    pub fn pattern(&self) -> &ResourcePattern {
        &self.pattern
    }

    /// Granted permissions.
    pub fn permissions(&self) -> &BTreeSet<Permission> {
        &self.permissions
    }

    /// Issue time.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Expiry time (exclusive).
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Context the token was issued to.
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    /// Whether the token has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Not revoked and not expired at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && now < self.expires_at
    }

    fn revoke(&self) -> bool {
        !self.revoked.swap(true, Ordering::AcqRel)
    }

    fn authorizes(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> bool {
        self.is_active_at(now)
            && self.permissions.iter().any(|p| p.as_str() == permission)
            && self.pattern.matches(resource)
    }

    /// Serializable view for audit payloads and CLI output.
    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            id: self.id,
            pattern: self.pattern.to_string(),
            permissions: self.permissions.iter().map(ToString::to_string).collect(),
            expires_at: self.expires_at,
            revoked: self.is_revoked(),
        }
    }
}

/// Snapshot of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    /// Token id.
    pub id: Uuid,
    /// Resource pattern.
    pub pattern: String,
    /// Permissions.
    pub permissions: Vec<String>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Revoked flag.
    pub revoked: bool,
}

/// A node in the context tree.
#[derive(Debug)]
pub struct CapabilityContext {
    id: Uuid,
    name: String,
    identity: String,
    depth: usize,
    parent: Option<Weak<CapabilityContext>>,
    tokens: RwLock<Vec<Arc<CapabilityToken>>>,
}

impl CapabilityContext {
    /// Context id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity that owns this context tree.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Distance from the root (root is 0).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Parent context, if it is still alive.
    pub fn parent(&self) -> Option<Arc<CapabilityContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Tokens issued directly to this context, including inactive ones.
    pub fn own_tokens(&self) -> Vec<Arc<CapabilityToken>> {
        match self.tokens.read() {
            Ok(tokens) => tokens.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn own_grant(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> Option<Uuid> {
        // Poisoned lock: fail closed.
        let tokens = self.tokens.read().ok()?;
        tokens
            .iter()
            .find(|t| t.authorizes(resource, permission, now))
            .map(|t| t.id)
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    /// Whether access is allowed.
    pub granted: bool,
    /// Context whose token authorized the access.
    pub source_context: Option<Uuid>,
    /// The authorizing token.
    pub token: Option<Uuid>,
}

impl AccessDecision {
    const DENIED: Self = Self {
        granted: false,
        source_context: None,
        token: None,
    };
}

/// Explicitly constructed registry of contexts and tokens.
#[derive(Debug)]
pub struct TokenStore {
    max_depth: usize,
    default_ttl: Duration,
    tokens: RwLock<HashMap<Uuid, Weak<CapabilityToken>>>,
    contexts: RwLock<HashMap<Uuid, Weak<CapabilityContext>>>,
    shut_down: AtomicBool,
}

impl TokenStore {
    /// Create a store.
    pub fn new(config: &CapabilityConfig) -> Self {
        let ttl_seconds = i64::try_from(config.default_ttl_seconds).unwrap_or(i64::MAX);
        Self {
            max_depth: config.max_depth,
            default_ttl: Duration::try_seconds(ttl_seconds).unwrap_or(Duration::MAX),
            tokens: RwLock::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// TTL used when a caller does not pick one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn register(&self, context: &Arc<CapabilityContext>) {
        if let Ok(mut contexts) = self.contexts.write() {
            contexts.insert(context.id, Arc::downgrade(context));
        }
    }

    /// Create a root context for an identity. It holds no tokens.
    pub fn root_context(&self, name: &str, identity: &str) -> Arc<CapabilityContext> {
        let context = Arc::new(CapabilityContext {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            identity: identity.to_owned(),
            depth: 0,
            parent: None,
            tokens: RwLock::new(Vec::new()),
        });
        self.register(&context);
        debug!(context = %context.id, name, identity, "root context created");
        context
    }

    /// Create a child context inheriting from `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`IssueError::DepthExceeded`] past the configured depth.
    pub fn child_context(
        &self,
        parent: &Arc<CapabilityContext>,
        name: &str,
    ) -> Result<Arc<CapabilityContext>, IssueError> {
        let depth = parent.depth.saturating_add(1);
        if depth > self.max_depth {
            return Err(IssueError::DepthExceeded {
                max: self.max_depth,
            });
        }
        let context = Arc::new(CapabilityContext {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            identity: parent.identity.clone(),
            depth,
            parent: Some(Arc::downgrade(parent)),
            tokens: RwLock::new(Vec::new()),
        });
        self.register(&context);
        debug!(context = %context.id, parent = %parent.id, name, depth, "child context created");
        Ok(context)
    }

    /// Look up a live context by id.
    pub fn context(&self, id: Uuid) -> Option<Arc<CapabilityContext>> {
        self.contexts.read().ok()?.get(&id).and_then(Weak::upgrade)
    }

    /// Issue a token to `context`.
    ///
    /// # Errors
    ///
    /// Fails when `ttl` is not positive, no permissions are given, or the
    /// pattern or a permission is malformed.
    pub fn issue(
        &self,
        context: &CapabilityContext,
        pattern: &str,
        permissions: &[&str],
        ttl: Duration,
    ) -> Result<Arc<CapabilityToken>, IssueError> {
        let pattern = ResourcePattern::parse(pattern)?;
        let permissions = permissions
            .iter()
            .map(|p| Permission::new(p))
            .collect::<Result<BTreeSet<_>, _>>()?;
        self.insert(context, pattern, permissions, ttl)
    }

    /// Issue a token for a parsed grant.
    ///
    /// # Errors
    ///
    /// Fails when `ttl` is not positive.
    pub fn issue_grant(
        &self,
        context: &CapabilityContext,
        grant: &Grant,
        ttl: Duration,
    ) -> Result<Arc<CapabilityToken>, IssueError> {
        let permissions = BTreeSet::from([grant.permission.clone()]);
        self.insert(context, grant.pattern.clone(), permissions, ttl)
    }

    fn insert(
        &self,
        context: &CapabilityContext,
        pattern: ResourcePattern,
        permissions: BTreeSet<Permission>,
        ttl: Duration,
    ) -> Result<Arc<CapabilityToken>, IssueError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(IssueError::ShutDown);
        }
        if ttl <= Duration::zero() {
            return Err(IssueError::InvalidTtl(ttl.num_seconds()));
        }
        if permissions.is_empty() {
            return Err(IssueError::NoPermissions);
        }
        let issued_at = Utc::now();
        let token = Arc::new(CapabilityToken {
            id: Uuid::new_v4(),
            pattern,
            permissions,
            issued_at,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            context_id: context.id,
            revoked: AtomicBool::new(false),
        });

        context
            .tokens
            .write()
            .map_err(|_| IssueError::ShutDown)?
            .push(Arc::clone(&token));
        if let Ok(mut index) = self.tokens.write() {
            index.insert(token.id, Arc::downgrade(&token));
        }

        info!(
            token = %token.id,
            context = %context.id,
            pattern = %token.pattern,
            expires_at = %token.expires_at,
            "capability token issued"
        );
        Ok(token)
    }

    /// Revoke a token by id. Returns whether a live token was newly revoked.
    pub fn revoke(&self, token_id: Uuid) -> bool {
        let token = self
            .tokens
            .read()
            .ok()
            .and_then(|index| index.get(&token_id).and_then(Weak::upgrade));
        match token {
            Some(token) => {
                let newly = token.revoke();
                if newly {
                    info!(token = %token_id, context = %token.context_id, "capability token revoked");
                }
                newly
            }
            None => false,
        }
    }

    /// Revoke every token owned by a context. Returns the ids revoked.
    pub fn revoke_context(&self, context_id: Uuid) -> Vec<Uuid> {
        let Some(context) = self.context(context_id) else {
            warn!(context = %context_id, "revoke requested for unknown context");
            return Vec::new();
        };
        let revoked: Vec<Uuid> = context
            .own_tokens()
            .iter()
            .filter(|t| t.revoke())
            .map(|t| t.id)
            .collect();
        info!(context = %context_id, count = revoked.len(), "context tokens revoked");
        revoked
    }

    /// Check whether `context` may perform `permission` on `resource` now.
    pub fn has_permission(
        &self,
        context: &CapabilityContext,
        resource: &str,
        permission: &str,
    ) -> AccessDecision {
        self.has_permission_at(context, resource, permission, Utc::now())
    }

    /// Check access as of `now`.
    ///
    /// Own tokens are consulted first, then ancestors. A dropped ancestor ends
    /// the walk. Never errors: anything ambiguous is a denial.
    pub fn has_permission_at(
        &self,
        context: &CapabilityContext,
        resource: &str,
        permission: &str,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        if let Some(token) = context.own_grant(resource, permission, now) {
            return AccessDecision {
                granted: true,
                source_context: Some(context.id),
                token: Some(token),
            };
        }
        let mut current = context.parent();
        let mut hops = 0usize;
        while let Some(node) = current {
            hops = hops.saturating_add(1);
            if hops > self.max_depth {
                return AccessDecision::DENIED;
            }
            if let Some(token) = node.own_grant(resource, permission, now) {
                return AccessDecision {
                    granted: true,
                    source_context: Some(node.id),
                    token: Some(token),
                };
            }
            current = node.parent();
        }
        AccessDecision::DENIED
    }

    /// Active tokens owned by a context.
    pub fn active_tokens(&self, context_id: Uuid) -> Vec<Arc<CapabilityToken>> {
        let now = Utc::now();
        self.context(context_id)
            .map(|c| {
                c.own_tokens()
                    .into_iter()
                    .filter(|t| t.is_active_at(now))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired and revoked tokens and dead index entries. Returns the
    /// number of tokens removed from contexts.
    pub fn purge(&self) -> usize {
        self.purge_at(Utc::now())
    }

    /// [`TokenStore::purge`] as of `now`.
    pub fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let live: Vec<Arc<CapabilityContext>> = match self.contexts.write() {
            Ok(mut contexts) => {
                contexts.retain(|_, c| c.strong_count() > 0);
                contexts.values().filter_map(Weak::upgrade).collect()
            }
            Err(_) => Vec::new(),
        };

        let mut removed = 0usize;
        for context in live {
            if let Ok(mut tokens) = context.tokens.write() {
                let before = tokens.len();
                tokens.retain(|t| t.is_active_at(now));
                removed = removed.saturating_add(before.saturating_sub(tokens.len()));
            }
        }
        if let Ok(mut index) = self.tokens.write() {
            index.retain(|_, t| t.upgrade().is_some_and(|t| t.is_active_at(now)));
        }
        debug!(removed, "token store purged");
        removed
    }

    /// Revoke everything and refuse further issues.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let tokens: Vec<Arc<CapabilityToken>> = match self.tokens.write() {
            Ok(mut index) => index.drain().filter_map(|(_, t)| t.upgrade()).collect(),
            Err(_) => Vec::new(),
        };
        for token in &tokens {
            token.revoke();
        }
        if let Ok(mut contexts) = self.contexts.write() {
            contexts.clear();
        }
        info!(revoked = tokens.len(), "token store shut down");
    }
}

/// Purge `store` every `interval` until `shutdown_rx` turns true or closes.
pub async fn run_purger(
    store: Arc<TokenStore>,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = interval.max(std::time::Duration::from_secs(1));
    info!(interval_secs = interval.as_secs(), "token purger started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.purge();
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("token purger stopped");
}
