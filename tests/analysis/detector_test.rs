//! Threat detector behavior.

use warden::analysis::detector::Detector;
use warden::analysis::{FindingKind, Severity};
use warden::ast::{Alias, Expr, Keyword, Program, Span, Stmt, StmtKind};
use warden::config::AnalysisConfig;

fn at(line: u32) -> Span {
    Span::new(line, 0)
}

fn detector() -> Detector {
    Detector::new(&AnalysisConfig::default())
}

#[test]
fn eval_of_string_is_one_critical_finding() {
    let program = Program::new(
        "demo",
        vec![
            Stmt::assign("x", Expr::int(1, at(1)), at(1)),
            Stmt::assign("y", Expr::int(2, at(2)), at(2)),
            Stmt::expr(
                Expr::call(
                    Expr::name("eval", at(3)),
                    vec![Expr::string("1 + 1", Span::new(3, 5))],
                    at(3),
                ),
                at(3),
            ),
        ],
    );

    let findings = detector().scan(&program);
    assert_eq!(findings.len(), 1);
    let finding = &findings[0];
    assert_eq!(finding.kind, FindingKind::CodeInjection);
    assert_eq!(finding.severity, Severity::Critical);
    assert_eq!(finding.line, 3);
    assert_eq!(finding.classification_id, "CWE-95");
    assert!(finding.code_snippet.contains("eval"));
    assert!(!finding.suggested_fix.is_empty());
}

#[test]
fn scan_is_deterministic() {
    let program = Program::new(
        "demo",
        vec![
            Stmt::import("subprocess", at(1)),
            Stmt::expr(
                Expr::call(Expr::dotted("os.system", at(2)), vec![Expr::name("cmd", at(2))], at(2)),
                at(2),
            ),
            Stmt::expr(
                Expr::call(Expr::name("exec", at(3)), vec![Expr::name("code", at(3))], at(3)),
                at(3),
            ),
        ],
    );
    let detector = detector();
    let first = detector.scan(&program);
    let second = detector.scan(&program);
    assert_eq!(first, second);
    let lines: Vec<u32> = first.iter().map(|f| f.line).collect();
    assert_eq!(lines, vec![1, 2, 3]);
}

#[test]
fn denied_import_respects_grants() {
    let program = Program::new("demo", vec![Stmt::import("os.path", at(1))]);
    let findings = detector().scan(&program);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::DeniedImport);
    assert_eq!(findings[0].severity, Severity::High);

    let granted = Detector::new(&AnalysisConfig {
        granted_modules: vec!["os".to_owned()],
        ..AnalysisConfig::default()
    });
    let findings = granted.scan(&program);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Info);
}

#[test]
fn dynamic_import_literal_and_computed() {
    let literal = Program::new(
        "demo",
        vec![Stmt::expr(
            Expr::call(
                Expr::name("__import__", at(1)),
                vec![Expr::string("socket", at(1))],
                at(1),
            ),
            at(1),
        )],
    );
    let findings = detector().scan(&literal);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::DeniedImport);

    let computed = Program::new(
        "demo",
        vec![Stmt::expr(
            Expr::call(
                Expr::dotted("importlib.import_module", at(1)),
                vec![Expr::name("name", at(1))],
                at(1),
            ),
            at(1),
        )],
    );
    let findings = detector().scan(&computed);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::CodeInjection);
    assert_eq!(findings[0].severity, Severity::Critical);
}

#[test]
fn reflection_chain_reports_once_at_outermost_node() {
    // ().__class__.__bases__[0].__subclasses__()
    let span = at(4);
    let chain = Expr::call(
        Expr::attr(
            Expr::subscript(
                Expr::attr(
                    Expr::attr(Expr::name("obj", span), "__class__", span),
                    "__bases__",
                    span,
                ),
                Expr::int(0, span),
                span,
            ),
            "__subclasses__",
            span,
        ),
        vec![],
        span,
    );
    let program = Program::new("demo", vec![Stmt::expr(chain, span)]);
    let findings = detector().scan(&program);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::ReflectionAbuse);
    assert_eq!(findings[0].severity, Severity::Critical);
    assert_eq!(findings[0].classification_id, "CWE-470");
}

#[test]
fn getattr_with_privileged_name_is_reflection() {
    let span = at(2);
    let call = Expr::call(
        Expr::name("getattr", span),
        vec![Expr::name("fn", span), Expr::string("__globals__", span)],
        span,
    );
    let program = Program::new("demo", vec![Stmt::expr(call, span)]);
    let findings = detector().scan(&program);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::ReflectionAbuse);
}

#[test]
fn shell_true_and_unsafe_deserialization() {
    let span = at(1);
    let shell = Expr::call_kw(
        Expr::dotted("subprocess.run", span),
        vec![Expr::name("cmd", span)],
        vec![Keyword {
            name: "shell".to_owned(),
            value: Expr::bool(true, span),
        }],
        span,
    );
    let no_shell = Expr::call(
        Expr::dotted("subprocess.run", at(2)),
        vec![Expr::name("argv", at(2))],
        at(2),
    );
    let pickle = Expr::call(
        Expr::dotted("pickle.loads", at(3)),
        vec![Expr::name("blob", at(3))],
        at(3),
    );
    let program = Program::new(
        "demo",
        vec![
            Stmt::expr(shell, span),
            Stmt::expr(no_shell, at(2)),
            Stmt::expr(pickle, at(3)),
        ],
    );
    let findings = detector().scan(&program);
    let kinds: Vec<(u32, FindingKind)> = findings.iter().map(|f| (f.line, f.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (1, FindingKind::ShellExecution),
            (3, FindingKind::UnsafeDeserialization)
        ]
    );
}

fn import_as(module: Option<&str>, name: &str, asname: &str, line: u32) -> Stmt {
    let names = vec![Alias {
        name: name.to_owned(),
        asname: Some(asname.to_owned()),
    }];
    let kind = match module {
        Some(module) => StmtKind::ImportFrom {
            module: module.to_owned(),
            names,
        },
        None => StmtKind::Import { names },
    };
    Stmt::new(kind, at(line))
}

#[test]
fn aliased_primitives_are_still_detected() {
    // import subprocess as sp
    // sp.call(cmd, shell=True)
    // from os import system as s
    // s(cmd)
    // e = eval
    // e(code)
    let program = Program::new(
        "aliased",
        vec![
            import_as(None, "subprocess", "sp", 1),
            Stmt::expr(
                Expr::call_kw(
                    Expr::dotted("sp.call", at(2)),
                    vec![Expr::name("cmd", at(2))],
                    vec![Keyword {
                        name: "shell".to_owned(),
                        value: Expr::bool(true, at(2)),
                    }],
                    at(2),
                ),
                at(2),
            ),
            import_as(Some("os"), "system", "s", 3),
            Stmt::expr(
                Expr::call(Expr::name("s", at(4)), vec![Expr::name("cmd", at(4))], at(4)),
                at(4),
            ),
            Stmt::assign("e", Expr::name("eval", at(5)), at(5)),
            Stmt::expr(
                Expr::call(Expr::name("e", at(6)), vec![Expr::name("code", at(6))], at(6)),
                at(6),
            ),
        ],
    );

    let findings = detector().scan(&program);
    let calls: Vec<(u32, FindingKind, &str)> = findings
        .iter()
        .filter(|f| f.kind != FindingKind::DeniedImport)
        .map(|f| (f.line, f.kind, f.matched_pattern.as_str()))
        .collect();
    assert_eq!(
        calls,
        vec![
            (2, FindingKind::ShellExecution, "subprocess.call"),
            (4, FindingKind::ShellExecution, "os.system"),
            (6, FindingKind::CodeInjection, "eval"),
        ]
    );
}

#[test]
fn aliased_call_without_shell_flag_stays_clean() {
    let program = Program::new(
        "aliased",
        vec![
            import_as(None, "subprocess", "sp", 1),
            Stmt::expr(
                Expr::call(
                    Expr::dotted("sp.run", at(2)),
                    vec![Expr::name("argv", at(2))],
                    at(2),
                ),
                at(2),
            ),
            Stmt::assign("show", Expr::name("print", at(3)), at(3)),
            Stmt::expr(
                Expr::call(Expr::name("show", at(4)), vec![Expr::name("x", at(4))], at(4)),
                at(4),
            ),
        ],
    );
    let findings = detector().scan(&program);
    assert!(findings.iter().all(|f| f.kind == FindingKind::DeniedImport));
}
