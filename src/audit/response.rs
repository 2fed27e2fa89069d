//! Automated incident response.
//!
//! A CRITICAL incident triggers containment: every token of the offending
//! context is revoked, its live runs are terminated, and a notifier is told.
//! Each action is reported back as a [`ResponseRecord`] so the committer can
//! audit it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::capability::TokenStore;
use crate::sandbox::executor::RunRegistry;

use super::Incident;

/// Kind of automated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseActionKind {
    /// Revoke every token of the context.
    RevokeTokens,
    /// Terminate the context's live runs.
    TerminateRuns,
    /// Tell a human.
    Notify,
}

/// Outcome of one automated action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// What was done.
    pub action: ResponseActionKind,
    /// Human-readable outcome.
    pub detail: String,
    /// Whether it succeeded.
    pub success: bool,
}

/// Reacts to CRITICAL incidents.
#[async_trait]
pub trait IncidentResponder: Send + Sync {
    /// Apply containment and report what was done.
    async fn respond(&self, incident: &Incident) -> Vec<ResponseRecord>;
}

/// Delivers incident notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification.
    async fn notify(&self, incident: &Incident) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, incident: &Incident) -> anyhow::Result<()> {
        error!(
            incident = %incident.id,
            kind = ?incident.incident_type,
            severity = %incident.severity,
            identity = ?incident.identity,
            context = ?incident.context_name,
            evidence = incident.evidence.len(),
            "security incident requires attention"
        );
        Ok(())
    }
}

/// Revokes, terminates, then notifies.
pub struct DefaultResponder {
    store: Arc<TokenStore>,
    registry: Arc<RunRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for DefaultResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultResponder").finish_non_exhaustive()
    }
}

impl DefaultResponder {
    /// Responder acting on `store` and `registry`.
    pub fn new(
        store: Arc<TokenStore>,
        registry: Arc<RunRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
        }
    }
}

#[async_trait]
impl IncidentResponder for DefaultResponder {
    async fn respond(&self, incident: &Incident) -> Vec<ResponseRecord> {
        let mut records = Vec::new();

        match incident.context_id {
            Some(context_id) => {
                let revoked = self.store.revoke_context(context_id);
                records.push(ResponseRecord {
                    action: ResponseActionKind::RevokeTokens,
                    detail: format!("revoked {} token(s) in context {context_id}", revoked.len()),
                    success: true,
                });

                let reason = format!("incident {}", incident.id);
                let terminated = self.registry.terminate_context(context_id, &reason);
                records.push(ResponseRecord {
                    action: ResponseActionKind::TerminateRuns,
                    detail: format!("terminated {terminated} live run(s) in context {context_id}"),
                    success: true,
                });
            }
            None => {
                warn!(incident = %incident.id, "incident has no context, skipping containment");
            }
        }

        let notified = self.notifier.notify(incident).await;
        records.push(ResponseRecord {
            action: ResponseActionKind::Notify,
            detail: match &notified {
                Ok(()) => "notification sent".to_owned(),
                Err(e) => format!("notification failed: {e:#}"),
            },
            success: notified.is_ok(),
        });
        records
    }
}
