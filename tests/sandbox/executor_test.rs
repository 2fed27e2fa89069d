//! Run lifecycle: completion, exhaustion, violations, timeouts, termination.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use warden::analysis::Severity;
use warden::audit::{AuditEventType, IncidentStatus, IncidentType};
use warden::capability::{FILE_READ, HTTP_GET};
use warden::sandbox::{
    OperationError, ResourceExhausted, RunState, SandboxPolicy, SandboxViolation,
    SpawnRequest, TerminationCause,
};

use crate::support::{unit, Harness};

#[tokio::test]
async fn completed_run_keeps_unit_output() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "alice");
    let run = h
        .executor
        .run(
            unit("noop", |_host| async { Ok(json!({"answer": 42})) }),
            SandboxPolicy::default(),
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert!(run.is_completed());
    assert_eq!(run.output, Some(json!({"answer": 42})));
    assert!(run.started_at.is_some() && run.ended_at.is_some());
    assert_eq!(h.of_type(AuditEventType::RunStarted).await.len(), 1);
    assert_eq!(h.of_type(AuditEventType::RunCompleted).await.len(), 1);
}

#[tokio::test]
async fn memory_exhaustion_terminates_with_one_critical_event() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "alice");
    let policy = SandboxPolicy {
        memory_limit_bytes: 1024,
        ..SandboxPolicy::default()
    };
    let run = h
        .executor
        .run(
            unit("hog", |host| async move {
                host.reserve_memory(512)?;
                host.reserve_memory(1024)?;
                Ok(json!(null))
            }),
            policy,
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert_eq!(
        run.state,
        RunState::Terminated(TerminationCause::ResourceExhausted(
            ResourceExhausted::Memory {
                limit_bytes: 1024,
                requested_bytes: 1536,
            }
        ))
    );

    let events = h.committed().await;
    let critical: Vec<_> = events
        .iter()
        .filter(|e| e.severity == Severity::Critical)
        .collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].event_type, AuditEventType::RunTerminated);
    assert_eq!(critical[0].data_str("cause"), Some("resource_exhausted"));
    assert!(h.audit.incidents().is_empty());
}

#[tokio::test]
async fn network_violation_opens_contained_incident_and_revokes_tokens() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("fetcher", "bob");
    h.store
        .issue(&ctx, "https://api.example.com/**", &["http.get"], chrono::Duration::minutes(5))
        .expect("issue");
    h.store
        .issue(&ctx, "/data/**", &["file.read"], chrono::Duration::minutes(5))
        .expect("issue");

    let run = h
        .executor
        .run(
            unit("fetch", |host| async move {
                let body = host.http_get("https://api.example.com/v1/items").await?;
                Ok(json!(body))
            }),
            SandboxPolicy::default(),
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert_eq!(
        run.violation(),
        Some(&SandboxViolation::NetworkDisabled {
            resource: "https://api.example.com/v1/items".into(),
        })
    );

    let events = h.committed().await;
    let terminated: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::RunTerminated)
        .collect();
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].severity, Severity::Critical);
    assert_eq!(terminated[0].data_str("cause"), Some("violation"));

    let incidents = h.audit.incidents();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.incident_type, IncidentType::SandboxViolation);
    assert_eq!(incident.severity, Severity::Critical);
    assert_eq!(incident.status, IncidentStatus::Contained);
    assert_eq!(incident.context_id, Some(ctx.id()));

    let responses = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::ResponseAction)
        .count();
    assert_eq!(responses, 3);
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::IncidentTransition));

    assert!(!h
        .store
        .has_permission(&ctx, "https://api.example.com/v1/items", HTTP_GET)
        .granted);
    assert!(!h.store.has_permission(&ctx, "/data/a.csv", FILE_READ).granted);
}

#[tokio::test]
async fn spawning_without_policy_permission_is_a_violation() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "carol");
    h.store
        .issue(&ctx, "/bin/echo", &["process.spawn"], chrono::Duration::minutes(5))
        .expect("issue");
    let run = h
        .executor
        .run(
            unit("spawn", |host| async move {
                host.spawn(SpawnRequest::new("/bin/echo", &["hi"])).await?;
                Ok(json!(null))
            }),
            SandboxPolicy::default(),
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert!(matches!(
        run.violation(),
        Some(SandboxViolation::ProcessSpawnDisabled { program }) if program == "/bin/echo"
    ));
}

#[tokio::test]
async fn slow_unit_times_out() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "alice");
    let policy = SandboxPolicy {
        timeout_seconds: 0.05,
        ..SandboxPolicy::default()
    };
    let run = h
        .executor
        .run(
            unit("sleeper", |_host| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            }),
            policy,
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert_eq!(run.state, RunState::TimedOut);
    let timed_out = h.of_type(AuditEventType::RunTimedOut).await;
    assert_eq!(timed_out.len(), 1);
    assert_eq!(timed_out[0].severity, Severity::High);
}

#[tokio::test]
async fn denial_is_recoverable_by_default() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("reader", "dave");
    let run = h
        .executor
        .run(
            unit("lookup", |host| async move {
                match host.read_file("/etc/hostname").await {
                    Err(OperationError::Denied(e)) => Ok(json!(e.minimal_grant)),
                    Err(other) => Err(other),
                    Ok(_) => Ok(json!("unexpected")),
                }
            }),
            SandboxPolicy::default(),
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert!(run.is_completed());
    assert_eq!(run.output, Some(json!("file.read:/etc/hostname")));

    let denied = h.of_type(AuditEventType::CapabilityDenied).await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].severity, Severity::Medium);
    assert_eq!(denied[0].resource.as_deref(), Some("/etc/hostname"));
    assert_eq!(denied[0].identity.as_deref(), Some("dave"));
}

#[tokio::test]
async fn abort_on_denial_ends_the_run() {
    let h = Harness::new(true).await;
    let ctx = h.store.root_context("reader", "erin");
    let run = h
        .executor
        .run(
            unit("stubborn", |host| async move {
                let _ = host.read_file("/etc/hostname").await;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            }),
            SandboxPolicy::default(),
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    let RunState::Terminated(TerminationCause::CapabilityDenied(error)) = &run.state else {
        panic!("expected capability termination, got {:?}", run.state);
    };
    assert_eq!(error.permission, "file.read");

    let terminated = h.of_type(AuditEventType::RunTerminated).await;
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].severity, Severity::High);
    assert_eq!(terminated[0].data_str("cause"), Some("capability_denied"));
}

#[tokio::test]
async fn unit_error_is_a_crash() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "alice");
    let run = h
        .executor
        .run(
            unit("broken", |_host| async {
                Err(OperationError::Http("upstream returned 500".into()))
            }),
            SandboxPolicy::default(),
            Arc::clone(&ctx),
        )
        .await
        .expect("valid policy");

    assert!(matches!(run.state, RunState::Crashed(ref msg) if msg.contains("500")));
    assert_eq!(h.of_type(AuditEventType::RunCrashed).await.len(), 1);
}

#[tokio::test]
async fn invalid_policy_is_rejected_before_running() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "alice");
    let policy = SandboxPolicy {
        memory_limit_bytes: 0,
        ..SandboxPolicy::default()
    };
    let result = h
        .executor
        .run(unit("never", |_host| async { Ok(json!(null)) }), policy, ctx)
        .await;
    assert!(result.is_err());
    assert!(h.committed().await.is_empty());
}

#[tokio::test]
async fn registry_terminates_live_runs_of_a_context() {
    let h = Harness::new(false).await;
    let ctx = h.store.root_context("worker", "frank");
    let executor = h.executor.clone();
    let run_ctx = Arc::clone(&ctx);
    let running = tokio::spawn(async move {
        executor
            .run(
                unit("long", |_host| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!(null))
                }),
                SandboxPolicy::default(),
                run_ctx,
            )
            .await
    });

    let registry = h.executor.registry();
    for _ in 0..200 {
        if !registry.live_runs(ctx.id()).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(registry.terminate_context(ctx.id(), "operator request"), 1);

    let run = running
        .await
        .expect("join")
        .expect("valid policy");
    assert_eq!(
        run.state,
        RunState::Terminated(TerminationCause::External("operator request".into()))
    );
    assert!(registry.is_empty());
    assert_eq!(registry.terminate_context(ctx.id(), "again"), 0);
}
