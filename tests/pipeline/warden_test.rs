//! End-to-end submissions through `Warden`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Value};
use warden::analysis::Severity;
use warden::ast::{Expr, Program, Span, Stmt};
use warden::audit::{AuditError, AuditEvent, AuditEventType, MemoryAuditStore};
use warden::capability::{IssueError, FILE_READ};
use warden::config::WardenConfig;
use warden::pipeline::{SubmitError, Submission, Warden};
use warden::sandbox::{OperationError, ProcessBackend, RunState, SandboxHost, UnitOfWork};

struct Flag(Arc<AtomicBool>);

#[async_trait]
impl UnitOfWork for Flag {
    fn name(&self) -> &str {
        "flag"
    }

    async fn run(&self, _host: SandboxHost) -> Result<Value, OperationError> {
        self.0.store(true, Ordering::SeqCst);
        Ok(json!("ran"))
    }
}

fn at(line: u32) -> Span {
    Span::new(line, 0)
}

fn eval_program() -> Program {
    Program::new(
        "evil",
        vec![Stmt::expr(
            Expr::call(
                Expr::name("eval", at(3)),
                vec![Expr::string("__import__('os').system('id')", at(3))],
                at(3),
            ),
            at(3),
        )],
    )
}

fn tainted_program() -> Program {
    Program::new(
        "lookup",
        vec![
            Stmt::assign(
                "name",
                Expr::call(Expr::name("input", at(1)), vec![], at(1)),
                at(1),
            ),
            Stmt::expr(
                Expr::call(
                    Expr::dotted("cursor.execute", at(2)),
                    vec![Expr::name("name", at(2))],
                    at(2),
                ),
                at(2),
            ),
        ],
    )
}

async fn warden(config: &WardenConfig) -> (Warden, Arc<MemoryAuditStore>) {
    let events = Arc::new(MemoryAuditStore::new());
    let warden = Warden::new(config, events.clone(), Arc::new(ProcessBackend::new()))
        .await
        .expect("warden");
    (warden, events)
}

async fn committed(warden: &Warden, events: &MemoryAuditStore) -> Vec<AuditEvent> {
    warden.audit().flush().await.expect("flush");
    events.events()
}

fn count(events: &[AuditEvent], event_type: AuditEventType) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

#[tokio::test]
async fn blocked_program_never_runs() {
    let (warden, events) = warden(&WardenConfig::default()).await;
    let ran = Arc::new(AtomicBool::new(false));
    let ctx = warden.store().root_context("worker", "alice");

    let result = warden
        .submit(Submission {
            program: eval_program(),
            unit: Arc::new(Flag(Arc::clone(&ran))),
            policy: None,
            context: Arc::clone(&ctx),
        })
        .await;

    assert!(matches!(result, Err(SubmitError::Blocked(_))));
    assert!(!ran.load(Ordering::SeqCst));

    let events = committed(&warden, &events).await;
    assert_eq!(count(&events, AuditEventType::RunStarted), 0);
    assert_eq!(count(&events, AuditEventType::ThreatFinding), 1);
    let blocked: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::AnalysisBlocked)
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].severity, Severity::Critical);
    assert_eq!(blocked[0].identity.as_deref(), Some("alice"));
    assert_eq!(blocked[0].data_str("program"), Some("evil"));
}

#[tokio::test]
async fn clean_program_runs_to_completion() {
    let (warden, events) = warden(&WardenConfig::default()).await;
    let ran = Arc::new(AtomicBool::new(false));
    let ctx = warden.store().root_context("worker", "alice");
    let program = Program::new(
        "clean",
        vec![Stmt::assign("x", Expr::int(1, at(1)), at(1))],
    );

    let run = warden
        .submit(Submission {
            program,
            unit: Arc::new(Flag(Arc::clone(&ran))),
            policy: None,
            context: ctx,
        })
        .await
        .expect("accepted");

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.output, Some(json!("ran")));
    assert!(ran.load(Ordering::SeqCst));
    let events = committed(&warden, &events).await;
    assert_eq!(count(&events, AuditEventType::RunStarted), 1);
    assert_eq!(count(&events, AuditEventType::RunCompleted), 1);
}

#[tokio::test]
async fn findings_below_threshold_are_audited_and_run() {
    let mut config = WardenConfig::default();
    config.analysis.block_threshold = Severity::Critical;
    let (warden, events) = warden(&config).await;
    let ctx = warden.store().root_context("worker", "alice");

    let report = warden
        .analyze(&tainted_program(), &ctx)
        .await
        .expect("below threshold");
    assert_eq!(report.flows.len(), 1);

    let events = committed(&warden, &events).await;
    assert_eq!(count(&events, AuditEventType::ThreatFinding), 1);
    assert_eq!(count(&events, AuditEventType::DataFlowPath), 1);
    assert_eq!(count(&events, AuditEventType::AnalysisBlocked), 0);
}

#[tokio::test]
async fn grants_and_revocations_are_audited() {
    let (warden, events) = warden(&WardenConfig::default()).await;
    let ctx = warden.store().root_context("worker", "alice");

    let token = warden
        .grant(&ctx, "file.read:/data/**", Duration::minutes(5))
        .await
        .expect("grant");
    assert!(warden
        .store()
        .has_permission(&ctx, "/data/x.csv", FILE_READ)
        .granted);

    assert!(warden.revoke(token.id()).await);
    assert!(!warden.revoke(token.id()).await);
    assert!(!warden
        .store()
        .has_permission(&ctx, "/data/x.csv", FILE_READ)
        .granted);

    let events = committed(&warden, &events).await;
    let issued: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::TokenIssued)
        .collect();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].resource.as_deref(), Some("/data/**"));
    assert_eq!(issued[0].data_str("grant"), Some("file.read:/data/**"));
    assert_eq!(issued[0].data["token"]["id"], json!(token.id()));
    assert_eq!(count(&events, AuditEventType::TokenRevoked), 1);

    assert!(warden
        .grant(&ctx, "file.read", Duration::minutes(5))
        .await
        .is_err());
}

#[tokio::test]
async fn shutdown_revokes_everything_and_closes_the_trail() {
    let (warden, events) = warden(&WardenConfig::default()).await;
    let ctx = warden.store().root_context("worker", "alice");
    warden
        .grant(&ctx, "file.read:/data/**", Duration::minutes(5))
        .await
        .expect("grant");

    warden.shutdown().await.expect("shutdown");

    assert!(!warden
        .store()
        .has_permission(&ctx, "/data/x.csv", FILE_READ)
        .granted);
    assert!(matches!(
        warden
            .grant(&ctx, "file.read:/data/**", Duration::minutes(5))
            .await,
        Err(IssueError::ShutDown)
    ));
    assert_eq!(count(&events.events(), AuditEventType::TokenIssued), 1);
    assert!(warden.audit().flush().await.is_err());
}

#[tokio::test]
async fn nothing_runs_once_the_audit_trail_is_closed() {
    let mut config = WardenConfig::default();
    config.analysis.block_threshold = Severity::Critical;
    let (warden, _events) = warden(&config).await;
    let ctx = warden.store().root_context("worker", "alice");
    warden.shutdown().await.expect("shutdown");

    assert!(matches!(
        warden.analyze(&tainted_program(), &ctx).await,
        Err(SubmitError::Audit(AuditError::Closed))
    ));

    let ran = Arc::new(AtomicBool::new(false));
    let result = warden
        .submit(Submission {
            program: Program::new(
                "clean",
                vec![Stmt::assign("x", Expr::int(1, at(1)), at(1))],
            ),
            unit: Arc::new(Flag(Arc::clone(&ran))),
            policy: None,
            context: ctx,
        })
        .await;
    assert!(matches!(result, Err(SubmitError::Audit(AuditError::Closed))));
    assert!(!ran.load(Ordering::SeqCst));
}
