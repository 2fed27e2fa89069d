//! Combined analyzer thresholds.

use warden::analysis::{Analyzer, FindingKind, SecurityError, Severity};
use warden::ast::{Expr, Program, Span, Stmt};
use warden::config::{AnalysisConfig, TaintConfig};

fn at(line: u32) -> Span {
    Span::new(line, 0)
}

fn tainted_shell() -> Program {
    Program::new(
        "tainted",
        vec![
            Stmt::assign(
                "cmd",
                Expr::call(Expr::name("input", at(1)), vec![], at(1)),
                at(1),
            ),
            Stmt::expr(
                Expr::call(
                    Expr::dotted("subprocess.call", at(2)),
                    vec![Expr::name("cmd", at(2))],
                    at(2),
                ),
                at(2),
            ),
        ],
    )
}

#[test]
fn clean_program_passes() {
    let analyzer = Analyzer::new(&AnalysisConfig::default(), &TaintConfig::default());
    let program = Program::new(
        "clean",
        vec![Stmt::assign("x", Expr::int(1, at(1)), at(1))],
    );
    let report = analyzer.analyze(&program).expect("clean");
    assert!(report.is_clean());
    assert_eq!(report.highest_severity(), None);
}

#[test]
fn critical_detector_finding_blocks_before_taint() {
    let analyzer = Analyzer::new(&AnalysisConfig::default(), &TaintConfig::default());
    let program = Program::new(
        "evil",
        vec![Stmt::expr(
            Expr::call(
                Expr::name("exec", at(7)),
                vec![Expr::string("import os", at(7))],
                at(7),
            ),
            at(7),
        )],
    );
    let err = analyzer.analyze(&program).expect_err("must block");
    let SecurityError::Blocked {
        threshold,
        blocking,
        ..
    } = &err;
    assert_eq!(*threshold, Severity::High);
    assert_eq!(blocking.len(), 1);
    assert_eq!(blocking[0].line, 7);
    assert_eq!(err.findings().len(), 1);
}

#[test]
fn tainted_flow_blocks_at_default_threshold() {
    let analyzer = Analyzer::new(&AnalysisConfig::default(), &TaintConfig::default());
    let err = analyzer.analyze(&tainted_shell()).expect_err("must block");
    assert!(err
        .findings()
        .iter()
        .any(|f| f.kind == FindingKind::TaintedFlow));
}

#[test]
fn tainted_flow_is_reported_under_critical_threshold() {
    let analyzer = Analyzer::new(
        &AnalysisConfig {
            block_threshold: Severity::Critical,
            ..AnalysisConfig::default()
        },
        &TaintConfig::default(),
    );
    let report = analyzer.analyze(&tainted_shell()).expect("below threshold");
    assert_eq!(report.flows.len(), 1);
    assert_eq!(report.highest_severity(), Some(Severity::High));
    assert_eq!(report.findings[0].kind, FindingKind::TaintedFlow);
}
