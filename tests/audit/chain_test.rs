//! Hash chain integrity and persistence across restarts.

use std::sync::Arc;

use warden::analysis::Severity;
use warden::audit::{
    verify_chain, AuditError, AuditEventType, AuditPipeline, JsonlAuditStore, MemoryAuditStore,
    NewEvent, GENESIS_HASH,
};
use warden::config::AuditConfig;

fn granted(resource: &str) -> NewEvent {
    NewEvent::new(AuditEventType::CapabilityGranted, Severity::Info)
        .identity("alice")
        .resource(resource)
        .data("permission", "file.read")
}

#[tokio::test]
async fn committed_events_form_a_verifiable_chain() {
    let store = Arc::new(MemoryAuditStore::new());
    let (audit, _task) = AuditPipeline::new(store.clone(), &AuditConfig::default())
        .start()
        .await
        .expect("start");
    for i in 0..3 {
        audit
            .record(granted(&format!("/data/{i}.csv")))
            .await
            .expect("record");
    }
    audit.flush().await.expect("flush");

    let events = store.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].prev_hash, GENESIS_HASH);
    assert_eq!(events[1].prev_hash, events[0].hash);
    verify_chain(&events).expect("intact chain");
}

#[tokio::test]
async fn edited_or_removed_events_break_the_chain() {
    let store = Arc::new(MemoryAuditStore::new());
    let (audit, _task) = AuditPipeline::new(store.clone(), &AuditConfig::default())
        .start()
        .await
        .expect("start");
    for i in 0..4 {
        audit
            .record(granted(&format!("/data/{i}.csv")))
            .await
            .expect("record");
    }
    audit.flush().await.expect("flush");
    let events = store.events();

    let mut edited = events.clone();
    edited[1].resource = Some("/data/other.csv".into());
    assert!(matches!(
        verify_chain(&edited),
        Err(AuditError::ChainBroken { index: 1, .. })
    ));

    let mut removed = events.clone();
    removed.remove(2);
    assert!(matches!(
        verify_chain(&removed),
        Err(AuditError::ChainBroken { index: 2, .. })
    ));

    let mut reordered = events;
    reordered.swap(0, 1);
    assert!(matches!(
        verify_chain(&reordered),
        Err(AuditError::ChainBroken { index: 0, .. })
    ));
}

#[tokio::test]
async fn jsonl_log_resumes_chain_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("logs").join("audit.jsonl");

    let store = JsonlAuditStore::open(&path).await.expect("open");
    let (audit, task) = AuditPipeline::new(Arc::new(store), &AuditConfig::default())
        .start()
        .await
        .expect("start");
    audit.record(granted("/data/a.csv")).await.expect("record");
    audit.record(granted("/data/b.csv")).await.expect("record");
    audit.shutdown().await.expect("shutdown");
    task.await.expect("committer");
    assert!(matches!(
        audit.record(granted("/data/late.csv")).await,
        Err(AuditError::Closed)
    ));

    let reopened = JsonlAuditStore::open(&path).await.expect("reopen");
    let (audit, task) = AuditPipeline::new(Arc::new(reopened), &AuditConfig::default())
        .start()
        .await
        .expect("start");
    audit.record(granted("/data/c.csv")).await.expect("record");
    audit.shutdown().await.expect("shutdown");
    task.await.expect("committer");

    let events = JsonlAuditStore::read_all(&path).await.expect("read");
    assert_eq!(events.len(), 3);
    verify_chain(&events).expect("chain spans restart");
    assert_eq!(events[2].prev_hash, events[1].hash);
}
