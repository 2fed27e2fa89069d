//! Scoped capability acquisition for a single worker.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;
use uuid::Uuid;

use super::pattern::Grant;
use super::store::{CapabilityContext, IssueError, TokenStore};

/// Per-worker stack of nested contexts.
///
/// Deliberately not `Clone`: each worker owns exactly one stack and the
/// contexts on it are never shared across workers.
#[derive(Debug)]
pub struct ContextStack {
    store: Arc<TokenStore>,
    frames: Vec<Arc<CapabilityContext>>,
}

impl ContextStack {
    /// Start a stack at `root`.
    pub fn new(store: Arc<TokenStore>, root: Arc<CapabilityContext>) -> Self {
        Self {
            store,
            frames: vec![root],
        }
    }

    /// The innermost context.
    pub fn current(&self) -> &Arc<CapabilityContext> {
        // `frames` always holds the root.
        &self.frames[self.frames.len().saturating_sub(1)]
    }

    /// Number of frames, root included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push a child context holding `grants` for `ttl`.
    ///
    /// The returned guard revokes the grants and pops the context when it
    /// goes out of scope, on every exit path.
    ///
    /// # Errors
    ///
    /// Fails without side effects if any grant is malformed, the ttl is not
    /// positive, or the depth limit is reached.
    pub fn acquire(
        &mut self,
        grants: &[&str],
        ttl: Duration,
    ) -> Result<CapabilityScope<'_>, IssueError> {
        let parsed = grants
            .iter()
            .map(|g| Grant::parse(g))
            .collect::<Result<Vec<_>, _>>()?;
        if ttl <= Duration::zero() {
            return Err(IssueError::InvalidTtl(ttl.num_seconds()));
        }

        let parent = Arc::clone(self.current());
        let name = format!("{}/scope-{}", parent.name(), self.frames.len());
        let child = self.store.child_context(&parent, &name)?;

        let mut tokens = Vec::with_capacity(parsed.len());
        for grant in &parsed {
            match self.store.issue_grant(&child, grant, ttl) {
                Ok(token) => tokens.push(token.id()),
                Err(e) => {
                    for id in tokens {
                        self.store.revoke(id);
                    }
                    return Err(e);
                }
            }
        }

        debug!(context = %child.id(), grants = parsed.len(), "capability scope acquired");
        self.frames.push(child);
        Ok(CapabilityScope {
            stack: self,
            tokens,
        })
    }

    /// [`ContextStack::acquire`] with the store's default TTL.
    ///
    /// # Errors
    ///
    /// See [`ContextStack::acquire`].
    pub fn acquire_default(&mut self, grants: &[&str]) -> Result<CapabilityScope<'_>, IssueError> {
        let ttl = self.store.default_ttl();
        self.acquire(grants, ttl)
    }
}

/// Guard for an acquired scope.
#[derive(Debug)]
pub struct CapabilityScope<'a> {
    stack: &'a mut ContextStack,
    tokens: Vec<Uuid>,
}

impl CapabilityScope<'_> {
    /// The scope's context.
    pub fn context(&self) -> &Arc<CapabilityContext> {
        self.stack.current()
    }

    /// Tokens issued for this scope.
    pub fn tokens(&self) -> &[Uuid] {
        &self.tokens
    }

    /// Acquire a nested scope inside this one.
    ///
    /// # Errors
    ///
    /// See [`ContextStack::acquire`].
    pub fn acquire(
        &mut self,
        grants: &[&str],
        ttl: Duration,
    ) -> Result<CapabilityScope<'_>, IssueError> {
        self.stack.acquire(grants, ttl)
    }
}

impl Drop for CapabilityScope<'_> {
    fn drop(&mut self) {
        for id in &self.tokens {
            self.stack.store.revoke(*id);
        }
        if let Some(context) = self.stack.frames.pop() {
            debug!(context = %context.id(), "capability scope released");
        }
    }
}
