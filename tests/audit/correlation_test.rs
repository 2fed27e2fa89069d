//! Denial bursts, rate anomalies, and incident lifecycle through the pipeline.

use std::sync::Arc;

use warden::analysis::Severity;
use warden::audit::{
    AuditEventType, AuditPipeline, IncidentError, IncidentStatus, IncidentType, MemoryAuditStore,
    NewEvent,
};
use warden::config::{AnomalyConfig, AuditConfig};

fn denial(identity: &str, resource: &str) -> NewEvent {
    NewEvent::new(AuditEventType::CapabilityDenied, Severity::Medium)
        .identity(identity)
        .resource(resource)
        .data("permission", "file.read")
}

#[tokio::test]
async fn denial_burst_opens_one_high_incident() {
    let store = Arc::new(MemoryAuditStore::new());
    let (audit, _task) = AuditPipeline::new(store.clone(), &AuditConfig::default())
        .start()
        .await
        .expect("start");

    for i in 0..4 {
        audit
            .record(denial("mallory", &format!("/etc/secret{i}")))
            .await
            .expect("record");
    }
    audit.flush().await.expect("flush");
    assert!(audit.incidents().is_empty());

    audit.record(denial("mallory", "/etc/secret4")).await.expect("record");
    audit.record(denial("mallory", "/etc/secret5")).await.expect("record");
    audit.record(denial("trent", "/etc/secret0")).await.expect("record");
    audit.flush().await.expect("flush");

    let incidents = audit.incidents();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.incident_type, IncidentType::DenialBurst);
    assert_eq!(incident.severity, Severity::High);
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.identity.as_deref(), Some("mallory"));
    assert_eq!(incident.evidence.len(), 6);

    let events = store.events();
    let opened: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::IncidentOpened)
        .collect();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].severity, Severity::High);
    assert!(!events
        .iter()
        .any(|e| e.event_type == AuditEventType::ResponseAction));
}

#[tokio::test]
async fn incidents_only_move_forward() {
    let store = Arc::new(MemoryAuditStore::new());
    let config = AuditConfig {
        denial_threshold: 2,
        ..AuditConfig::default()
    };
    let (audit, _task) = AuditPipeline::new(store, &config)
        .start()
        .await
        .expect("start");
    audit.record(denial("mallory", "/a")).await.expect("record");
    audit.record(denial("mallory", "/b")).await.expect("record");
    audit.flush().await.expect("flush");

    let id = audit.incidents()[0].id;
    audit
        .advance_incident(id, IncidentStatus::Eradicated, "tokens rotated")
        .expect("forward");
    assert_eq!(
        audit.advance_incident(id, IncidentStatus::Contained, "late"),
        Err(IncidentError::InvalidTransition {
            from: IncidentStatus::Eradicated,
            to: IncidentStatus::Contained,
        })
    );
    audit
        .advance_incident(id, IncidentStatus::Closed, "done")
        .expect("close");

    let incident = audit.incidents().remove(0);
    let statuses: Vec<_> = incident.timeline.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            IncidentStatus::Open,
            IncidentStatus::Eradicated,
            IncidentStatus::Closed
        ]
    );

    // A closed burst no longer absorbs new denials.
    audit.record(denial("mallory", "/c")).await.expect("record");
    audit.record(denial("mallory", "/d")).await.expect("record");
    audit.flush().await.expect("flush");
    assert_eq!(audit.incidents().len(), 2);
}

#[tokio::test]
async fn rate_spike_raises_one_anomaly_event() {
    let store = Arc::new(MemoryAuditStore::new());
    let config = AuditConfig {
        anomaly: AnomalyConfig {
            window_seconds: 3600,
            history: 4,
            min_windows: 0,
            threshold_sigma: 3.0,
            min_count: 3,
        },
        ..AuditConfig::default()
    };
    let (audit, _task) = AuditPipeline::new(store.clone(), &config)
        .start()
        .await
        .expect("start");

    for _ in 0..6 {
        audit
            .record(
                NewEvent::new(AuditEventType::CapabilityGranted, Severity::Info)
                    .identity("alice")
                    .resource("/data/report.csv"),
            )
            .await
            .expect("record");
    }
    audit.flush().await.expect("flush");

    let anomalies: Vec<_> = store
        .events()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::AnomalyDetected)
        .collect();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].severity, Severity::Medium);
    assert_eq!(anomalies[0].identity.as_deref(), Some("alice"));
    assert_eq!(anomalies[0].data["count"], serde_json::json!(3));
}
