//! Audit trail, anomaly detection, and incident response.
//!
//! Producers hand [`NewEvent`]s to an [`AuditHandle`]. A background committer
//! redacts payloads, stamps ids and timestamps, links each event into a
//! SHA-256 hash chain, and appends batches to an [`AuditStore`]. Committed
//! events then feed the anomaly detector and the incident correlator; a
//! CRITICAL incident triggers the configured [`IncidentResponder`].
//!
//! Ingestion is bounded: when the queue is full, `record` waits. Events are
//! never dropped.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::Severity;
use crate::capability::CapabilityContext;
use crate::config::AuditConfig;

pub mod anomaly;
pub mod incident;
pub mod redactor;
pub mod response;
pub mod store;

use anomaly::AnomalyDetector;
pub use incident::{Incident, IncidentError, IncidentManager, IncidentStatus, IncidentType};
pub use redactor::Redactor;
pub use response::{DefaultResponder, IncidentResponder, LogNotifier, Notifier, ResponseRecord};
pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore};

/// Hash of the (virtual) event before the first one.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of audited occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Detector or tracker finding.
    ThreatFinding,
    /// Tainted flow evidence.
    DataFlowPath,
    /// Program rejected by static analysis.
    AnalysisBlocked,
    /// Capability check passed.
    CapabilityGranted,
    /// Capability check failed.
    CapabilityDenied,
    /// Token issued.
    TokenIssued,
    /// Token revoked.
    TokenRevoked,
    /// Run started.
    RunStarted,
    /// Run completed normally.
    RunCompleted,
    /// Run hit its wall-clock limit.
    RunTimedOut,
    /// Run force-terminated.
    RunTerminated,
    /// Unit failed or panicked.
    RunCrashed,
    /// Event rate outside the baseline.
    AnomalyDetected,
    /// Incident opened.
    IncidentOpened,
    /// Incident lifecycle step.
    IncidentTransition,
    /// Automated response action.
    ResponseAction,
}

impl AuditEventType {
    /// Whether the event was produced by the audit subsystem itself.
    pub fn is_derived(self) -> bool {
        matches!(
            self,
            Self::AnomalyDetected
                | Self::IncidentOpened
                | Self::IncidentTransition
                | Self::ResponseAction
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A committed, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event id.
    pub event_id: Uuid,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
    /// Event type.
    pub event_type: AuditEventType,
    /// Severity.
    pub severity: Severity,
    /// Identity responsible.
    pub identity: Option<String>,
    /// Context name.
    pub context_name: Option<String>,
    /// Context id.
    pub context_id: Option<Uuid>,
    /// Resource involved.
    pub resource: Option<String>,
    /// Structured payload (redacted).
    pub data: Map<String, Value>,
    /// Hash of the previous event in the chain.
    pub prev_hash: String,
    /// SHA-256 over this event (minus `hash`) and `prev_hash`.
    pub hash: String,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    event_id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    event_type: &'a AuditEventType,
    severity: &'a Severity,
    identity: &'a Option<String>,
    context_name: &'a Option<String>,
    context_id: &'a Option<Uuid>,
    resource: &'a Option<String>,
    data: &'a Map<String, Value>,
    prev_hash: &'a str,
}

impl AuditEvent {
    /// Recompute this event's hash from its fields.
    pub fn compute_hash(&self) -> String {
        let fields = HashedFields {
            event_id: &self.event_id,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            severity: &self.severity,
            identity: &self.identity,
            context_name: &self.context_name,
            context_id: &self.context_id,
            resource: &self.resource,
            data: &self.data,
            prev_hash: &self.prev_hash,
        };
        // Map keys are sorted, so the encoding is canonical.
        let encoded = serde_json::to_vec(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Payload field as a string, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Check that `events` form an unbroken chain starting from `GENESIS_HASH`.
///
/// # Errors
///
/// Returns [`AuditError::ChainBroken`] at the first event whose link or hash
/// does not verify.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), AuditError> {
    let mut prev = GENESIS_HASH.to_owned();
    for (index, event) in events.iter().enumerate() {
        if event.prev_hash != prev {
            return Err(AuditError::ChainBroken {
                index,
                reason: "previous hash does not link",
            });
        }
        if event.compute_hash() != event.hash {
            return Err(AuditError::ChainBroken {
                index,
                reason: "event hash does not match contents",
            });
        }
        prev.clone_from(&event.hash);
    }
    Ok(())
}

/// An event as submitted by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Event type.
    pub event_type: AuditEventType,
    /// Severity.
    pub severity: Severity,
    /// Identity responsible.
    pub identity: Option<String>,
    /// Context name.
    pub context_name: Option<String>,
    /// Context id.
    pub context_id: Option<Uuid>,
    /// Resource involved.
    pub resource: Option<String>,
    /// Payload.
    pub data: Map<String, Value>,
}

impl NewEvent {
    /// Start an event.
    pub fn new(event_type: AuditEventType, severity: Severity) -> Self {
        Self {
            event_type,
            severity,
            identity: None,
            context_name: None,
            context_id: None,
            resource: None,
            data: Map::new(),
        }
    }

    /// Attribute the event to a context and its identity.
    #[must_use]
    pub fn context(mut self, context: &CapabilityContext) -> Self {
        self.identity = Some(context.identity().to_owned());
        self.context_name = Some(context.name().to_owned());
        self.context_id = Some(context.id());
        self
    }

    /// Set the identity.
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the resource.
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Add a payload field.
    #[must_use]
    pub fn data(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.to_owned(), value);
        self
    }
}

/// Audit subsystem failure.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The pipeline has shut down.
    #[error("audit pipeline is closed")]
    Closed,
    /// Store I/O failure.
    #[error("audit store error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record could not be encoded or decoded.
    #[error("audit record encoding error at line {line}: {source}")]
    Encoding {
        /// 1-based line (0 when encoding).
        line: usize,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Hash chain verification failed.
    #[error("audit chain broken at event {index}: {reason}")]
    ChainBroken {
        /// 0-based event index.
        index: usize,
        /// What failed.
        reason: &'static str,
    },
    /// Store refused the write.
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

enum Command {
    Record(NewEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable producer side of the pipeline.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<Command>,
    incidents: Arc<Mutex<IncidentManager>>,
}

impl fmt::Debug for AuditHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditHandle")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl AuditHandle {
    /// Submit an event, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Closed`] once the pipeline has shut down.
    pub async fn record(&self, event: NewEvent) -> Result<(), AuditError> {
        self.tx
            .send(Command::Record(event))
            .await
            .map_err(|_| AuditError::Closed)
    }

    /// Wait until everything submitted so far is committed and correlated.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Closed`] once the pipeline has shut down.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .await
            .map_err(|_| AuditError::Closed)?;
        wait.await.map_err(|_| AuditError::Closed)
    }

    /// Commit everything pending and stop the committer.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Closed`] if it was already stopped.
    pub async fn shutdown(&self) -> Result<(), AuditError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(done))
            .await
            .map_err(|_| AuditError::Closed)?;
        wait.await.map_err(|_| AuditError::Closed)
    }

    /// Snapshot of all incidents.
    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .incidents()
            .to_vec()
    }

    /// Move an incident forward in its lifecycle.
    ///
    /// # Errors
    ///
    /// See [`IncidentManager::advance`].
    pub fn advance_incident(
        &self,
        id: Uuid,
        to: IncidentStatus,
        note: &str,
    ) -> Result<(), IncidentError> {
        self.incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(id, to, note)
    }
}

/// Builder for the background committer.
pub struct AuditPipeline {
    store: Arc<dyn AuditStore>,
    config: AuditConfig,
    redactor: Redactor,
    responder: Option<Arc<dyn IncidentResponder>>,
}

impl AuditPipeline {
    /// Pipeline writing to `store`.
    pub fn new(store: Arc<dyn AuditStore>, config: &AuditConfig) -> Self {
        let secrets = config
            .redact_env
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .collect();
        Self {
            store,
            config: config.clone(),
            redactor: Redactor::new(secrets),
            responder: None,
        }
    }

    /// Replace the payload redactor.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Respond automatically to CRITICAL incidents.
    #[must_use]
    pub fn with_responder(mut self, responder: Arc<dyn IncidentResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Start the committer.
    ///
    /// # Errors
    ///
    /// Fails if the store's chain head cannot be read.
    pub async fn start(self) -> Result<(AuditHandle, JoinHandle<()>), AuditError> {
        let head = self
            .store
            .last_hash()
            .await?
            .unwrap_or_else(|| GENESIS_HASH.to_owned());
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        let incidents = Arc::new(Mutex::new(IncidentManager::new(
            self.config.denial_threshold,
            Duration::from_secs(self.config.denial_window_seconds),
        )));

        let committer = Committer {
            store: self.store,
            redactor: self.redactor,
            responder: self.responder,
            anomaly: AnomalyDetector::new(&self.config.anomaly),
            incidents: Arc::clone(&incidents),
            head,
            batch_size: self.config.batch_size.max(1),
            max_backoff: Duration::from_millis(self.config.max_backoff_ms.max(1)),
        };
        let task = tokio::spawn(committer.run(rx));
        info!("audit pipeline started");
        Ok((AuditHandle { tx, incidents }, task))
    }
}

struct Committer {
    store: Arc<dyn AuditStore>,
    redactor: Redactor,
    responder: Option<Arc<dyn IncidentResponder>>,
    anomaly: AnomalyDetector,
    incidents: Arc<Mutex<IncidentManager>>,
    head: String,
    batch_size: usize,
    max_backoff: Duration,
}

impl Committer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(first) = rx.recv().await {
            let mut pending = Vec::new();
            let mut waiters = Vec::new();
            let mut stop = None;

            let mut next = Some(first);
            while let Some(command) = next.take() {
                match command {
                    Command::Record(event) => pending.push(event),
                    Command::Flush(done) => waiters.push(done),
                    Command::Shutdown(done) => {
                        stop = Some(done);
                        break;
                    }
                }
                if pending.len() >= self.batch_size {
                    break;
                }
                next = rx.try_recv().ok();
            }

            self.process(pending).await;
            for done in waiters {
                let _ = done.send(());
            }
            if let Some(done) = stop {
                rx.close();
                let mut rest = Vec::new();
                while let Some(command) = rx.recv().await {
                    if let Command::Record(event) = command {
                        rest.push(event);
                    }
                }
                self.process(rest).await;
                info!("audit pipeline stopped");
                let _ = done.send(());
                return;
            }
        }
        debug!("audit handles dropped, committer exiting");
    }

    /// Commit events, then everything they give rise to.
    async fn process(&mut self, mut pending: Vec<NewEvent>) {
        while !pending.is_empty() {
            let batch: Vec<AuditEvent> = pending.drain(..).map(|e| self.seal(e)).collect();
            self.commit(&batch).await;
            for event in &batch {
                pending.extend(self.correlate(event).await);
            }
        }
    }

    fn seal(&mut self, event: NewEvent) -> AuditEvent {
        let mut sealed = AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event.event_type,
            severity: event.severity,
            identity: event.identity,
            context_name: event.context_name,
            context_id: event.context_id,
            resource: event.resource.map(|r| self.redactor.redact(&r)),
            data: self.redactor.redact_map(event.data),
            prev_hash: self.head.clone(),
            hash: String::new(),
        };
        sealed.hash = sealed.compute_hash();
        self.head.clone_from(&sealed.hash);
        sealed
    }

    /// Append with capped exponential backoff until the store accepts.
    async fn commit(&self, batch: &[AuditEvent]) {
        let mut backoff = Duration::from_millis(10);
        let mut attempt = 0u32;
        loop {
            match self.store.append(batch).await {
                Ok(()) => {
                    debug!(events = batch.len(), "audit batch committed");
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if attempt == 1 {
                        warn!(error = %e, events = batch.len(), "audit commit failed, retrying");
                    } else {
                        error!(error = %e, attempt, "audit commit still failing");
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(self.max_backoff);
                }
            }
        }
    }

    async fn correlate(&mut self, event: &AuditEvent) -> Vec<NewEvent> {
        let mut derived = Vec::new();

        if !event.event_type.is_derived() {
            if let (Some(identity), Some(resource)) = (&event.identity, &event.resource) {
                if let Some(anomaly) = self.anomaly.observe(identity, resource, event.timestamp) {
                    warn!(identity, resource, count = anomaly.count, "event rate anomaly");
                    derived.push(
                        NewEvent::new(AuditEventType::AnomalyDetected, Severity::Medium)
                            .identity(identity.clone())
                            .resource(resource.clone())
                            .data("count", anomaly.count)
                            .data("mean", anomaly.mean)
                            .data("stddev", anomaly.stddev)
                            .data("trigger", event.event_id),
                    );
                }
            }
        }

        let opened = self
            .incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .correlate(event);
        for incident in opened {
            derived.push(incident_opened_event(&incident));
            if incident.severity == Severity::Critical {
                derived.extend(self.respond(&incident).await);
            }
        }
        derived
    }

    async fn respond(&self, incident: &Incident) -> Vec<NewEvent> {
        let Some(responder) = &self.responder else {
            return Vec::new();
        };
        let records = responder.respond(incident).await;
        let mut events: Vec<NewEvent> = records
            .iter()
            .map(|record| {
                let mut event = NewEvent::new(AuditEventType::ResponseAction, Severity::High)
                    .data("incident_id", incident.id)
                    .data("action", record.action)
                    .data("detail", &record.detail)
                    .data("success", record.success);
                event.identity = incident.identity.clone();
                event.context_id = incident.context_id;
                event.context_name = incident.context_name.clone();
                event
            })
            .collect();

        let contained = self
            .incidents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(incident.id, IncidentStatus::Contained, "automated response applied");
        match contained {
            Ok(()) => events.push(
                NewEvent::new(AuditEventType::IncidentTransition, Severity::Info)
                    .data("incident_id", incident.id)
                    .data("status", IncidentStatus::Contained),
            ),
            Err(e) => warn!(incident = %incident.id, error = %e, "could not mark incident contained"),
        }
        events
    }
}

fn incident_opened_event(incident: &Incident) -> NewEvent {
    let mut event = NewEvent::new(AuditEventType::IncidentOpened, incident.severity)
        .data("incident_id", incident.id)
        .data("incident_type", incident.incident_type)
        .data(
            "evidence",
            incident
                .evidence
                .iter()
                .map(|e| e.event_id)
                .collect::<Vec<_>>(),
        );
    event.identity = incident.identity.clone();
    event.context_id = incident.context_id;
    event.context_name = incident.context_name.clone();
    event
}
