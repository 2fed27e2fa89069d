//! Incident correlation and lifecycle.
//!
//! Two rules open incidents: a burst of capability denials for one identity
//! (HIGH), and any run terminated for a policy violation (CRITICAL).
//! Incidents only move forward: Open → Contained → Eradicated → Recovered → Closed.
//!
//! State is bounded: evidence per incident is capped, idle denial windows are
//! dropped, and only the most recent closed incidents are retained.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::analysis::Severity;

use super::{AuditEvent, AuditEventType};

/// Evidence events kept per incident; later ones are only counted.
pub const MAX_EVIDENCE: usize = 256;

/// Closed incidents retained; older ones are forgotten first.
pub const MAX_CLOSED_INCIDENTS: usize = 128;

/// Incident lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Detected, not yet handled.
    Open,
    /// Damage limited.
    Contained,
    /// Cause removed.
    Eradicated,
    /// Normal operation restored.
    Recovered,
    /// Done.
    Closed,
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Contained => "contained",
            Self::Eradicated => "eradicated",
            Self::Recovered => "recovered",
            Self::Closed => "closed",
        })
    }
}

/// What opened the incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    /// Repeated capability denials for one identity.
    DenialBurst,
    /// A run breached its policy ceiling.
    SandboxViolation,
}

/// One lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Status entered.
    pub status: IncidentStatus,
    /// Free-form note.
    pub note: String,
}

/// A security incident with its full evidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    /// Incident id.
    pub id: Uuid,
    /// What opened it.
    pub incident_type: IncidentType,
    /// Severity.
    pub severity: Severity,
    /// Current status.
    pub status: IncidentStatus,
    /// Identity involved.
    pub identity: Option<String>,
    /// Context involved.
    pub context_id: Option<Uuid>,
    /// Context name.
    pub context_name: Option<String>,
    /// Lifecycle history, oldest first.
    pub timeline: Vec<TimelineEntry>,
    /// Copies of the events that support the incident.
    pub evidence: Vec<AuditEvent>,
    /// Supporting events seen after `evidence` reached [`MAX_EVIDENCE`].
    pub evidence_dropped: u64,
}

impl Incident {
    fn attach(&mut self, event: &AuditEvent) {
        if self.evidence.len() < MAX_EVIDENCE {
            self.evidence.push(event.clone());
        } else {
            self.evidence_dropped = self.evidence_dropped.saturating_add(1);
        }
    }
}

/// Incident lifecycle misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IncidentError {
    /// No incident with that id.
    #[error("incident {0} not found")]
    NotFound(Uuid),
    /// Transition would not move forward.
    #[error("incident cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: IncidentStatus,
        /// Requested status.
        to: IncidentStatus,
    },
}

/// Opens incidents from audit events and tracks their lifecycle.
#[derive(Debug)]
pub struct IncidentManager {
    denial_threshold: usize,
    denial_window: chrono::Duration,
    denials: HashMap<String, VecDeque<AuditEvent>>,
    incidents: Vec<Incident>,
}

impl IncidentManager {
    /// Open a HIGH incident once `denial_threshold` denials for one
    /// identity fall within `denial_window`.
    pub fn new(denial_threshold: usize, denial_window: Duration) -> Self {
        Self {
            denial_threshold: denial_threshold.max(1),
            denial_window: chrono::Duration::from_std(denial_window)
                .unwrap_or(chrono::Duration::MAX),
            denials: HashMap::new(),
            incidents: Vec::new(),
        }
    }

    /// All incidents, oldest first.
    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    /// Look up an incident.
    pub fn get(&self, id: Uuid) -> Option<&Incident> {
        self.incidents.iter().find(|i| i.id == id)
    }

    /// Feed a committed event. Returns incidents it opened.
    pub fn correlate(&mut self, event: &AuditEvent) -> Vec<Incident> {
        match event.event_type {
            AuditEventType::CapabilityDenied => self.denial(event).into_iter().collect(),
            AuditEventType::RunTerminated if event.data_str("cause") == Some("violation") => {
                vec![self.open(IncidentType::SandboxViolation, Severity::Critical, event, vec![event.clone()])]
            }
            _ => Vec::new(),
        }
    }

    fn denial(&mut self, event: &AuditEvent) -> Option<Incident> {
        let identity = event.identity.clone()?;

        // An open burst for this identity absorbs further denials.
        if let Some(open) = self.incidents.iter_mut().rev().find(|i| {
            i.incident_type == IncidentType::DenialBurst
                && i.identity.as_deref() == Some(identity.as_str())
                && i.status != IncidentStatus::Closed
        }) {
            open.attach(event);
            return None;
        }

        let window_start = event
            .timestamp
            .checked_sub_signed(self.denial_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.denials.entry(identity.clone()).or_default().push_back(event.clone());
        // Every identity's window slides with the newest event.
        self.denials.retain(|_, recent| {
            while recent.front().is_some_and(|e| e.timestamp < window_start) {
                recent.pop_front();
            }
            !recent.is_empty()
        });
        if self.denials.get(&identity)?.len() < self.denial_threshold {
            return None;
        }

        let evidence: Vec<AuditEvent> = self
            .denials
            .remove(&identity)
            .map(Vec::from)
            .unwrap_or_default();
        Some(self.open(IncidentType::DenialBurst, Severity::High, event, evidence))
    }

    /// Identities with denials still inside the correlation window.
    pub fn pending_identities(&self) -> usize {
        self.denials.len()
    }

    fn forget_closed(&mut self) {
        let closed = self
            .incidents
            .iter()
            .filter(|i| i.status == IncidentStatus::Closed)
            .count();
        let mut excess = closed.saturating_sub(MAX_CLOSED_INCIDENTS);
        self.incidents.retain(|i| {
            if excess > 0 && i.status == IncidentStatus::Closed {
                excess = excess.saturating_sub(1);
                return false;
            }
            true
        });
    }

    fn open(
        &mut self,
        incident_type: IncidentType,
        severity: Severity,
        trigger: &AuditEvent,
        evidence: Vec<AuditEvent>,
    ) -> Incident {
        let incident = Incident {
            id: Uuid::new_v4(),
            incident_type,
            severity,
            status: IncidentStatus::Open,
            identity: trigger.identity.clone(),
            context_id: trigger.context_id,
            context_name: trigger.context_name.clone(),
            timeline: vec![TimelineEntry {
                at: Utc::now(),
                status: IncidentStatus::Open,
                note: format!("opened by {} event {}", trigger.event_type, trigger.event_id),
            }],
            evidence,
            evidence_dropped: 0,
        };
        warn!(
            incident = %incident.id,
            kind = ?incident_type,
            %severity,
            identity = ?incident.identity,
            "incident opened"
        );
        self.incidents.push(incident.clone());
        incident
    }

    /// Move an incident forward.
    ///
    /// # Errors
    ///
    /// [`IncidentError::NotFound`] for unknown ids and
    /// [`IncidentError::InvalidTransition`] unless `to` is later than the
    /// current status.
    pub fn advance(&mut self, id: Uuid, to: IncidentStatus, note: &str) -> Result<(), IncidentError> {
        let incident = self
            .incidents
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(IncidentError::NotFound(id))?;
        if to <= incident.status {
            return Err(IncidentError::InvalidTransition {
                from: incident.status,
                to,
            });
        }
        incident.status = to;
        incident.timeline.push(TimelineEntry {
            at: Utc::now(),
            status: to,
            note: note.to_owned(),
        });
        if to == IncidentStatus::Closed {
            self.forget_closed();
        }
        Ok(())
    }
}
