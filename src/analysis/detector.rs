//! Pattern detector over the typed AST.
//!
//! Flags code-injection primitives, denylisted imports, reflection chains
//! that climb type hierarchies, direct shell execution, and unsafe
//! deserialization. The scan is a pure function of the program: it never
//! stops at the first hit and always returns findings in the same order.
//!
//! Call targets are matched through every name they may be bound to, so
//! `import subprocess as sp`, `from os import system as run` and `e = eval`
//! do not hide the underlying primitive.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Alias, Expr, ExprKind, Keyword, Literal, Program, Span, Stmt, StmtKind};
use crate::config::AnalysisConfig;

use super::{snippet, sort_findings, FindingKind, Severity, ThreatFinding};

/// Calls that evaluate or compile strings as code.
const EVAL_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "execfile",
    "builtins.eval",
    "builtins.exec",
    "builtins.compile",
    "__builtins__.eval",
    "__builtins__.exec",
];

/// Calls that import a module by (possibly computed) name.
const DYNAMIC_IMPORT_CALLS: &[&str] = &["__import__", "importlib.import_module"];

/// Calls that always go through a shell.
const SHELL_CALLS: &[&str] = &[
    "os.system",
    "os.popen",
    "commands.getoutput",
    "commands.getstatusoutput",
    "subprocess.getoutput",
    "subprocess.getstatusoutput",
];

/// Calls that use a shell only when `shell=True` is passed.
const SHELL_FLAG_CALLS: &[&str] = &[
    "subprocess.run",
    "subprocess.call",
    "subprocess.check_call",
    "subprocess.check_output",
    "subprocess.Popen",
];

/// Deserializers that can construct arbitrary objects.
const UNSAFE_DESERIALIZERS: &[&str] = &[
    "pickle.loads",
    "pickle.load",
    "cPickle.loads",
    "cPickle.load",
    "marshal.loads",
    "marshal.load",
    "shelve.open",
    "yaml.unsafe_load",
];

/// Attributes that expose interpreter internals on their own.
const PRIVILEGED_ATTRS: &[&str] = &[
    "__globals__",
    "__builtins__",
    "__code__",
    "__closure__",
    "func_globals",
    "gi_frame",
    "f_globals",
    "f_locals",
    "f_back",
];

/// Attributes that start a walk up the type hierarchy.
const HIERARCHY_ENTRY: &[&str] = &["__class__", "__base__", "__bases__", "__mro__"];

/// Attributes that, after a hierarchy entry, reach other types or globals.
const HIERARCHY_PIVOT: &[&str] = &[
    "__subclasses__",
    "__bases__",
    "__base__",
    "__mro__",
    "__globals__",
    "__builtins__",
];

/// Bound on alias-of-alias resolution.
const MAX_ALIAS_DEPTH: usize = 8;

/// Stateless threat detector.
#[derive(Debug, Clone)]
pub struct Detector {
    denied_modules: BTreeSet<String>,
    granted_modules: BTreeSet<String>,
}

impl Detector {
    /// Build a detector from the analysis configuration.
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            denied_modules: config.denied_modules.iter().cloned().collect(),
            granted_modules: config.granted_modules.iter().cloned().collect(),
        }
    }

    /// Scan a program and return all findings ordered by location.
    pub fn scan(&self, program: &Program) -> Vec<ThreatFinding> {
        let mut scan = Scan {
            detector: self,
            aliases: Aliases::collect(&program.body),
            findings: Vec::new(),
        };
        scan.stmts(&program.body);
        let mut findings = scan.findings;
        sort_findings(&mut findings);
        findings
    }

    fn module_rule<'a>(set: &'a BTreeSet<String>, module: &str) -> Option<&'a str> {
        set.iter()
            .find(|entry| module_covers(entry, module))
            .map(String::as_str)
    }
}

/// `os` covers `os` and `os.path`, but not `osmosis`.
fn module_covers(entry: &str, module: &str) -> bool {
    module == entry
        || module
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Local names bound to modules or callables, gathered over the whole
/// program regardless of statement order. A name rebound several times keeps
/// every target.
#[derive(Debug, Default)]
struct Aliases(BTreeMap<String, BTreeSet<String>>);

impl Aliases {
    fn collect(stmts: &[Stmt]) -> Self {
        let mut aliases = Self::default();
        aliases.visit(stmts);
        aliases
    }

    fn bind(&mut self, local: &str, target: String) {
        if local != target {
            self.0.entry(local.to_owned()).or_default().insert(target);
        }
    }

    fn visit(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Import { names } => {
                    for alias in names {
                        if let Some(local) = &alias.asname {
                            self.bind(local, alias.name.clone());
                        }
                    }
                }
                StmtKind::ImportFrom { module, names } => {
                    for alias in names {
                        let local = alias.asname.as_deref().unwrap_or(&alias.name);
                        self.bind(local, format!("{module}.{}", alias.name));
                    }
                }
                StmtKind::Assign { targets, value } => {
                    let Some(source) = value.dotted_name() else {
                        continue;
                    };
                    for target in targets {
                        if let ExprKind::Name { id } = &target.kind {
                            self.bind(id, source.clone());
                        }
                    }
                }
                StmtKind::FunctionDef { body, .. }
                | StmtKind::While { body, .. }
                | StmtKind::For { body, .. }
                | StmtKind::With { body, .. } => self.visit(body),
                StmtKind::If { body, orelse, .. } => {
                    self.visit(body);
                    self.visit(orelse);
                }
                StmtKind::Try {
                    body,
                    handlers,
                    finalbody,
                } => {
                    self.visit(body);
                    for handler in handlers {
                        self.visit(handler);
                    }
                    self.visit(finalbody);
                }
                StmtKind::Expr { .. }
                | StmtKind::AugAssign { .. }
                | StmtKind::Return { .. }
                | StmtKind::Pass => {}
            }
        }
    }

    /// Every dotted name `name` may refer to, itself first.
    fn expand(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::from([name.to_owned()]);
        let mut resolved = vec![name.to_owned()];
        let mut frontier = vec![name.to_owned()];
        for _ in 0..MAX_ALIAS_DEPTH {
            let mut next = Vec::new();
            for current in &frontier {
                let (head, tail) = match current.split_once('.') {
                    Some((head, tail)) => (head, Some(tail)),
                    None => (current.as_str(), None),
                };
                let Some(targets) = self.0.get(head) else {
                    continue;
                };
                for target in targets {
                    let candidate = match tail {
                        Some(tail) => format!("{target}.{tail}"),
                        None => target.clone(),
                    };
                    if seen.insert(candidate.clone()) {
                        next.push(candidate);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            resolved.extend(next.iter().cloned());
            frontier = next;
        }
        resolved
    }
}

struct Scan<'a> {
    detector: &'a Detector,
    aliases: Aliases,
    findings: Vec<ThreatFinding>,
}

impl Scan<'_> {
    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr { value } => self.expr(value, false),
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.expr(target, false);
                }
                self.expr(value, false);
            }
            StmtKind::AugAssign { target, value } => {
                self.expr(target, false);
                self.expr(value, false);
            }
            StmtKind::Import { names } => {
                for alias in names {
                    self.import(&alias.name, &render_import(None, alias), stmt.span);
                }
            }
            StmtKind::ImportFrom { module, names } => {
                for alias in names {
                    let full = format!("{module}.{}", alias.name);
                    self.import(&full, &render_import(Some(module), alias), stmt.span);
                }
            }
            StmtKind::FunctionDef { body, .. } => self.stmts(body),
            StmtKind::Return { value } => {
                if let Some(value) = value {
                    self.expr(value, false);
                }
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test, false);
                self.stmts(body);
                self.stmts(orelse);
            }
            StmtKind::While { test, body } => {
                self.expr(test, false);
                self.stmts(body);
            }
            StmtKind::For { target, iter, body } => {
                self.expr(target, false);
                self.expr(iter, false);
                self.stmts(body);
            }
            StmtKind::With { items, body } => {
                for item in items {
                    self.expr(&item.context, false);
                    if let Some(target) = &item.target {
                        self.expr(target, false);
                    }
                }
                self.stmts(body);
            }
            StmtKind::Try {
                body,
                handlers,
                finalbody,
            } => {
                self.stmts(body);
                for handler in handlers {
                    self.stmts(handler);
                }
                self.stmts(finalbody);
            }
            StmtKind::Pass => {}
        }
    }

    /// Visit an expression. `in_chain` is set while descending the object
    /// side of an attribute/call/subscript chain whose outermost node has
    /// already been checked for reflection patterns.
    fn expr(&mut self, expr: &Expr, in_chain: bool) {
        if !in_chain && is_chain_node(expr) {
            self.reflection(expr);
        }
        match &expr.kind {
            ExprKind::Name { .. } | ExprKind::Constant { .. } => {}
            ExprKind::Attribute { value, .. } => self.expr(value, true),
            ExprKind::Subscript { value, index } => {
                self.expr(value, true);
                self.expr(index, false);
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.call(expr, func, args, keywords);
                self.expr(func, true);
                for arg in args {
                    self.expr(arg, false);
                }
                for kw in keywords {
                    self.expr(&kw.value, false);
                }
            }
            ExprKind::BinOp { left, right, .. } => {
                self.expr(left, false);
                self.expr(right, false);
            }
            ExprKind::FormattedString { parts } => {
                for part in parts {
                    self.expr(part, false);
                }
            }
            ExprKind::Collection { elements } => {
                for element in elements {
                    self.expr(element, false);
                }
            }
            ExprKind::Lambda { body, .. } => self.expr(body, false),
        }
    }

    fn call(&mut self, call: &Expr, func: &Expr, args: &[Expr], keywords: &[Keyword]) {
        let Some(written) = func.dotted_name() else {
            return;
        };
        for name in self.aliases.expand(&written) {
            if self.call_rule(call, &name, args, keywords) {
                return;
            }
        }
    }

    /// Apply the call rules to one resolved name; true when a rule fired.
    fn call_rule(
        &mut self,
        call: &Expr,
        name: &str,
        args: &[Expr],
        keywords: &[Keyword],
    ) -> bool {
        if EVAL_CALLS.contains(&name) {
            self.push(
                call,
                FindingKind::CodeInjection,
                Severity::Critical,
                name,
                format!("'{name}' evaluates a string as code at runtime"),
                "replace dynamic evaluation with explicit logic or a safe parser such as ast.literal_eval",
            );
            return true;
        }

        if DYNAMIC_IMPORT_CALLS.contains(&name) {
            match args.first().and_then(Expr::as_str_literal) {
                Some(module) => self.import(module, &call.to_string(), call.span),
                None => self.push(
                    call,
                    FindingKind::CodeInjection,
                    Severity::Critical,
                    name,
                    format!("'{name}' loads a module whose name is computed at runtime"),
                    "import modules statically by literal name",
                ),
            }
            return true;
        }

        if SHELL_CALLS.contains(&name)
            || (SHELL_FLAG_CALLS.contains(&name) && keyword_is_true(keywords, "shell"))
        {
            self.push(
                call,
                FindingKind::ShellExecution,
                Severity::High,
                name,
                format!("'{name}' runs its argument through a system shell"),
                "pass an argument list without shell=True, and request a process.exec grant",
            );
            return true;
        }

        let unsafe_yaml = name == "yaml.load" && !keyword_names_safe_loader(keywords);
        if UNSAFE_DESERIALIZERS.contains(&name) || unsafe_yaml {
            self.push(
                call,
                FindingKind::UnsafeDeserialization,
                Severity::High,
                name,
                format!("'{name}' can instantiate arbitrary objects from its input"),
                "use a data-only format such as json, or yaml.safe_load",
            );
            return true;
        }
        false
    }

    fn import(&mut self, module: &str, rendered: &str, span: Span) {
        let Some(rule) = Detector::module_rule(&self.detector.denied_modules, module) else {
            return;
        };
        let granted = Detector::module_rule(&self.detector.granted_modules, module);
        let (severity, reason, fix) = match granted {
            Some(grant) => (
                Severity::Info,
                format!("import of denylisted module '{module}' is covered by grant '{grant}'"),
                "none required".to_owned(),
            ),
            None => (
                Severity::High,
                format!("import of denylisted module '{module}' without a declared grant"),
                format!("declare a grant for '{rule}' or remove the import"),
            ),
        };
        self.findings.push(ThreatFinding {
            kind: FindingKind::DeniedImport,
            severity,
            line: span.line,
            column: span.column,
            code_snippet: snippet(rendered),
            matched_pattern: rule.to_owned(),
            reason,
            suggested_fix: fix,
            classification_id: "CWE-829".to_owned(),
        });
    }

    fn reflection(&mut self, outermost: &Expr) {
        let mut chain = Vec::new();
        collect_chain(outermost, &mut chain);
        let Some(pattern) = reflection_pattern(&chain) else {
            return;
        };
        self.push(
            outermost,
            FindingKind::ReflectionAbuse,
            Severity::Critical,
            &pattern,
            format!("attribute chain '{pattern}' reaches interpreter internals"),
            "remove introspection of dunder attributes; expose the needed value explicitly",
        );
    }

    fn push(
        &mut self,
        node: &Expr,
        kind: FindingKind,
        severity: Severity,
        pattern: &str,
        reason: String,
        fix: &str,
    ) {
        let classification = match kind {
            FindingKind::CodeInjection => "CWE-95",
            FindingKind::ReflectionAbuse => "CWE-470",
            FindingKind::DeniedImport => "CWE-829",
            FindingKind::ShellExecution => "CWE-78",
            FindingKind::UnsafeDeserialization => "CWE-502",
            FindingKind::TaintedFlow => "CWE-20",
        };
        self.findings.push(ThreatFinding {
            kind,
            severity,
            line: node.span.line,
            column: node.span.column,
            code_snippet: snippet(&node.to_string()),
            matched_pattern: pattern.to_owned(),
            reason,
            suggested_fix: fix.to_owned(),
            classification_id: classification.to_owned(),
        });
    }
}

fn render_import(module: Option<&str>, alias: &Alias) -> String {
    let base = match module {
        Some(m) => format!("from {m} import {}", alias.name),
        None => format!("import {}", alias.name),
    };
    match &alias.asname {
        Some(a) => format!("{base} as {a}"),
        None => base,
    }
}

fn is_chain_node(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Attribute { .. } | ExprKind::Call { .. } | ExprKind::Subscript { .. }
    )
}

/// Collect attribute names along a chain, innermost first.
///
/// `getattr(obj, "name")` with a literal name counts as `.name`.
fn collect_chain<'e>(expr: &'e Expr, out: &mut Vec<&'e str>) {
    match &expr.kind {
        ExprKind::Attribute { value, attr } => {
            collect_chain(value, out);
            out.push(attr);
        }
        ExprKind::Subscript { value, .. } => collect_chain(value, out),
        ExprKind::Call { func, args, .. } => {
            let is_getattr = matches!(&func.kind, ExprKind::Name { id } if id == "getattr");
            match (is_getattr, args.first(), args.get(1).and_then(Expr::as_str_literal)) {
                (true, Some(target), Some(name)) => {
                    collect_chain(target, out);
                    out.push(name);
                }
                _ => collect_chain(func, out),
            }
        }
        _ => {}
    }
}

fn reflection_pattern(chain: &[&str]) -> Option<String> {
    if let Some(attr) = chain.iter().find(|a| PRIVILEGED_ATTRS.contains(a)) {
        return Some(match chain.iter().find(|a| HIERARCHY_ENTRY.contains(a)) {
            Some(entry) => format!("{entry} -> {attr}"),
            None => (*attr).to_owned(),
        });
    }
    let entry = chain.iter().position(|a| HIERARCHY_ENTRY.contains(a))?;
    let mut rest = chain.iter().skip(entry);
    let entry_attr = rest.next()?;
    let pivot = rest.find(|a| HIERARCHY_PIVOT.contains(a))?;
    Some(format!("{entry_attr} -> {pivot}"))
}

fn keyword_is_true(keywords: &[Keyword], name: &str) -> bool {
    keywords.iter().any(|kw| {
        kw.name == name
            && matches!(
                kw.value.kind,
                ExprKind::Constant {
                    value: Literal::Bool(true)
                }
            )
    })
}

fn keyword_names_safe_loader(keywords: &[Keyword]) -> bool {
    keywords.iter().any(|kw| {
        kw.name == "Loader"
            && kw
                .value
                .dotted_name()
                .is_some_and(|n| n.ends_with("SafeLoader"))
    })
}
