//! Data-flow taint tracking from untrusted sources to dangerous sinks.
//!
//! Taint enters at configured source calls (user input, network and file
//! reads, environment) and at the parameters of configured entry points. It
//! propagates through assignment, concatenation, interpolation, collection
//! building, and call argument/return edges. Function summaries are solved
//! with a worklist over the call graph of the analyzed program only; calls to
//! anything outside the program are treated as pass-through.
//!
//! A value that goes through a recognized sanitizer loses its taint.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ast::{Expr, ExprKind, Program, Stmt, StmtKind};
use crate::config::{SinkRule, SourceRule, TaintConfig};

use super::{snippet, FindingKind, Severity, ThreatFinding};

/// Pseudo-function name for top-level statements.
const MODULE_UNIT: &str = "<module>";

/// Upper bound on worklist iterations before giving up on a fixed point.
const MAX_WORKLIST_STEPS: usize = 10_000;

/// Loop bodies are re-run at most this many times to propagate carried taint.
const MAX_LOOP_PASSES: usize = 3;

/// Paths longer than this stop recording further steps.
const MAX_PATH_STEPS: usize = 48;

/// Where untrusted data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Parameter of an externally invoked entry point.
    Parameter,
    /// Interactive or request input.
    UserInput,
    /// Data read from the network.
    NetworkRead,
    /// Data read from a file.
    FileRead,
    /// Environment variables.
    Environment,
}

/// What a dangerous sink does with its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Database query execution.
    SqlQuery,
    /// Shell or process command.
    ShellCommand,
    /// Dynamic code evaluation.
    CodeEvaluation,
    /// Filesystem path operation.
    FilePath,
    /// Outbound network request target.
    NetworkRequest,
}

impl SinkKind {
    /// Weakness classification for flows into this sink.
    pub fn classification_id(self) -> &'static str {
        match self {
            Self::SqlQuery => "CWE-89",
            Self::ShellCommand => "CWE-78",
            Self::CodeEvaluation => "CWE-95",
            Self::FilePath => "CWE-22",
            Self::NetworkRequest => "CWE-918",
        }
    }

    fn fix(self) -> &'static str {
        match self {
            Self::SqlQuery => "use parameterized queries instead of building SQL from input",
            Self::ShellCommand => "pass arguments as a list and quote them with shlex.quote",
            Self::CodeEvaluation => "never evaluate input; parse it with a data-only parser",
            Self::FilePath => "normalize the path and reduce it with os.path.basename",
            Self::NetworkRequest => "validate the target against an allowlist before requesting it",
        }
    }
}

/// A flow-analysis entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintSource {
    /// Source call or parameter (`request.args.get`, `handler(user)`).
    pub name: String,
    /// Source category.
    pub kind: SourceKind,
    /// Line where the taint is introduced.
    pub line: u32,
}

/// A flow-analysis endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintSink {
    /// Sink call name.
    pub name: String,
    /// Sink category.
    pub kind: SinkKind,
    /// Line of the sink call.
    pub line: u32,
    /// Column of the sink call.
    pub column: u32,
    /// Rendered sink call.
    pub code_snippet: String,
}

/// One hop along a data-flow path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Line of the hop.
    pub line: u32,
    /// What happened to the value.
    pub description: String,
}

/// Evidence that a tainted value reaches a sink without sanitization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlowPath {
    /// Where the taint entered.
    pub source: TaintSource,
    /// Where it was consumed.
    pub sink: TaintSink,
    /// Ordered hops from source to sink.
    pub steps: Vec<FlowStep>,
}

impl DataFlowPath {
    /// Render the path as a HIGH tainted-flow finding located at the sink.
    pub fn to_finding(&self) -> ThreatFinding {
        ThreatFinding {
            kind: FindingKind::TaintedFlow,
            severity: Severity::High,
            line: self.sink.line,
            column: self.sink.column,
            code_snippet: self.sink.code_snippet.clone(),
            matched_pattern: format!("{} -> {}", self.source.name, self.sink.name),
            reason: format!(
                "untrusted value from '{}' (line {}) reaches '{}' without sanitization",
                self.source.name, self.source.line, self.sink.name
            ),
            suggested_fix: self.sink.kind.fix().to_owned(),
            classification_id: self.sink.kind.classification_id().to_owned(),
        }
    }
}

/// Taint tracker configured with source, sink, and sanitizer rules.
#[derive(Debug, Clone)]
pub struct TaintTracker {
    sources: Vec<SourceRule>,
    sinks: Vec<SinkRule>,
    sanitizers: Vec<String>,
    entry_points: BTreeSet<String>,
}

impl TaintTracker {
    /// Build a tracker from configuration.
    pub fn new(config: &TaintConfig) -> Self {
        Self {
            sources: config.sources.clone(),
            sinks: config.sinks.clone(),
            sanitizers: config.sanitizers.clone(),
            entry_points: config.entry_points.iter().cloned().collect(),
        }
    }

    /// Find every source-to-sink path in a program, deterministically ordered.
    pub fn analyze(&self, program: &Program) -> Vec<DataFlowPath> {
        let units = collect_units(program);
        let mut registry = Registry::default();
        let mut summaries: BTreeMap<&str, Summary> = units
            .iter()
            .map(|(name, _)| (name.as_str(), Summary::default()))
            .collect();
        let mut callers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        let mut queue: VecDeque<&str> = units.iter().map(|(n, _)| n.as_str()).collect();
        let mut queued: BTreeSet<&str> = queue.iter().copied().collect();
        let mut steps = 0usize;

        while let Some(name) = queue.pop_front() {
            queued.remove(name);
            steps = steps.saturating_add(1);
            if steps > MAX_WORKLIST_STEPS {
                warn!(program = %program.name, "taint worklist did not converge, using partial summaries");
                break;
            }
            let Some(unit) = units.get(name) else {
                continue;
            };
            let (computed, callees) =
                self.run_unit(name, unit, &units, &summaries, &mut registry, None);
            for callee in callees {
                callers.entry(callee).or_default().insert(name.to_owned());
            }
            let grew = summaries
                .get_mut(name)
                .map(|current| current.absorb(computed))
                .unwrap_or(false);
            if grew {
                if let Some(dependents) = callers.get(name) {
                    for dependent in dependents {
                        if let Some((key, _)) = units.get_key_value(dependent.as_str()) {
                            if queued.insert(key.as_str()) {
                                queue.push_back(key.as_str());
                            }
                        }
                    }
                }
            }
        }

        let mut paths = Vec::new();
        for (name, unit) in &units {
            self.run_unit(name, unit, &units, &summaries, &mut registry, Some(&mut paths));
        }

        let mut seen = BTreeSet::new();
        paths.retain(|p: &DataFlowPath| {
            seen.insert((
                p.source.name.clone(),
                p.source.line,
                p.sink.name.clone(),
                p.sink.line,
                p.sink.column,
            ))
        });
        paths.sort_by(|a, b| {
            (a.sink.line, a.sink.column, a.source.line, &a.source.name).cmp(&(
                b.sink.line,
                b.sink.column,
                b.source.line,
                &b.source.name,
            ))
        });
        paths
    }

    fn run_unit(
        &self,
        name: &str,
        unit: &Unit<'_>,
        units: &BTreeMap<String, Unit<'_>>,
        summaries: &BTreeMap<&str, Summary>,
        registry: &mut Registry,
        report: Option<&mut Vec<DataFlowPath>>,
    ) -> (Summary, BTreeSet<String>) {
        let mut pass = Pass {
            tracker: self,
            units,
            summaries,
            registry,
            report,
            summary: Summary::default(),
            callees: BTreeSet::new(),
            env: BTreeMap::new(),
        };

        let seed_sources = pass.report.is_some() && self.entry_points.contains(name);
        for (index, param) in unit.params.iter().enumerate() {
            let mut taint = Taint::new();
            taint.insert(
                Origin::Param(index),
                vec![FlowStep {
                    line: unit.line,
                    description: format!("parameter '{param}' of {name}"),
                }],
            );
            if seed_sources {
                let source = TaintSource {
                    name: format!("{name}({param})"),
                    kind: SourceKind::Parameter,
                    line: unit.line,
                };
                let id = pass.registry.source(source);
                taint.insert(
                    Origin::Source(id),
                    vec![FlowStep {
                        line: unit.line,
                        description: format!("external input '{param}' of entry point {name}"),
                    }],
                );
            }
            pass.env.insert(param.clone(), taint);
        }

        pass.block(unit.body);
        (pass.summary, pass.callees)
    }

    fn source_rule(&self, call: &str) -> Option<&SourceRule> {
        self.sources.iter().find(|r| call_matches(&r.call, call))
    }

    fn sink_rule(&self, call: &str) -> Option<&SinkRule> {
        self.sinks.iter().find(|r| call_matches(&r.call, call))
    }

    fn is_sanitizer(&self, call: &str) -> bool {
        self.sanitizers.iter().any(|s| call_matches(s, call))
    }
}

/// A rule name matches a call if it is the whole dotted name or a suffix of
/// it on a `.` boundary: `cursor.execute` matches `self.db.cursor.execute`.
fn call_matches(rule: &str, call: &str) -> bool {
    call == rule
        || call
            .strip_suffix(rule)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// An analyzable body: a function or the module top level.
struct Unit<'p> {
    params: Vec<String>,
    body: &'p [Stmt],
    line: u32,
}

fn collect_units(program: &Program) -> BTreeMap<String, Unit<'_>> {
    let mut units = BTreeMap::new();
    units.insert(
        MODULE_UNIT.to_owned(),
        Unit {
            params: Vec::new(),
            body: &program.body,
            line: 1,
        },
    );
    collect_defs(&program.body, &mut units);
    units
}

fn collect_defs<'p>(stmts: &'p [Stmt], units: &mut BTreeMap<String, Unit<'p>>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::FunctionDef { name, params, body } => {
                units.insert(
                    name.clone(),
                    Unit {
                        params: params.clone(),
                        body,
                        line: stmt.span.line,
                    },
                );
                collect_defs(body, units);
            }
            StmtKind::If { body, orelse, .. } => {
                collect_defs(body, units);
                collect_defs(orelse, units);
            }
            StmtKind::While { body, .. }
            | StmtKind::For { body, .. }
            | StmtKind::With { body, .. } => collect_defs(body, units),
            StmtKind::Try {
                body,
                handlers,
                finalbody,
            } => {
                collect_defs(body, units);
                for handler in handlers {
                    collect_defs(handler, units);
                }
                collect_defs(finalbody, units);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Origin {
    /// Index into the registry's sources.
    Source(usize),
    /// Parameter position of the unit being analyzed.
    Param(usize),
}

type Taint = BTreeMap<Origin, Vec<FlowStep>>;

/// Sources and sinks seen so far, deduplicated across passes so indices stay stable.
#[derive(Default)]
struct Registry {
    sources: Vec<TaintSource>,
    source_ids: BTreeMap<(String, u32), usize>,
    sinks: Vec<TaintSink>,
    sink_ids: BTreeMap<(String, u32, u32), usize>,
}

impl Registry {
    fn source(&mut self, source: TaintSource) -> usize {
        let key = (source.name.clone(), source.line);
        if let Some(&id) = self.source_ids.get(&key) {
            return id;
        }
        let id = self.sources.len();
        self.sources.push(source);
        self.source_ids.insert(key, id);
        id
    }

    fn sink(&mut self, sink: TaintSink) -> usize {
        let key = (sink.name.clone(), sink.line, sink.column);
        if let Some(&id) = self.sink_ids.get(&key) {
            return id;
        }
        let id = self.sinks.len();
        self.sinks.push(sink);
        self.sink_ids.insert(key, id);
        id
    }
}

/// Taint behavior of one unit as seen by its callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Summary {
    /// Parameter flows to the return value.
    param_to_return: BTreeMap<usize, Vec<FlowStep>>,
    /// The return value is tainted by a source inside the unit.
    return_sources: BTreeMap<usize, Vec<FlowStep>>,
    /// Parameter reaches a sink inside the unit.
    param_to_sink: BTreeMap<(usize, usize), Vec<FlowStep>>,
}

impl Summary {
    /// Merge `other` into `self`, keeping existing paths. Returns whether
    /// anything new was learned.
    fn absorb(&mut self, other: Summary) -> bool {
        let before = self.len();
        for (k, v) in other.param_to_return {
            self.param_to_return.entry(k).or_insert(v);
        }
        for (k, v) in other.return_sources {
            self.return_sources.entry(k).or_insert(v);
        }
        for (k, v) in other.param_to_sink {
            self.param_to_sink.entry(k).or_insert(v);
        }
        self.len() > before
    }

    fn len(&self) -> usize {
        self.param_to_return
            .len()
            .saturating_add(self.return_sources.len())
            .saturating_add(self.param_to_sink.len())
    }
}

struct Pass<'a, 'p> {
    tracker: &'a TaintTracker,
    units: &'a BTreeMap<String, Unit<'p>>,
    summaries: &'a BTreeMap<&'a str, Summary>,
    registry: &'a mut Registry,
    report: Option<&'a mut Vec<DataFlowPath>>,
    summary: Summary,
    callees: BTreeSet<String>,
    env: BTreeMap<String, Taint>,
}

fn union_into(target: &mut Taint, other: Taint) {
    for (origin, steps) in other {
        target.entry(origin).or_insert(steps);
    }
}

fn with_step(taint: &Taint, line: u32, description: &str) -> Taint {
    taint
        .iter()
        .map(|(origin, steps)| {
            let mut steps = steps.clone();
            if steps.len() < MAX_PATH_STEPS {
                steps.push(FlowStep {
                    line,
                    description: description.to_owned(),
                });
            }
            (*origin, steps)
        })
        .collect()
}

fn join_steps(prefix: &[FlowStep], rest: &[FlowStep]) -> Vec<FlowStep> {
    prefix
        .iter()
        .chain(rest.iter())
        .take(MAX_PATH_STEPS)
        .cloned()
        .collect()
}

fn same_origins(a: &BTreeMap<String, Taint>, b: &BTreeMap<String, Taint>) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|((ka, ta), (kb, tb))| {
            ka == kb && ta.len() == tb.len() && ta.keys().zip(tb.keys()).all(|(x, y)| x == y)
        })
}

fn merge_env(target: &mut BTreeMap<String, Taint>, other: BTreeMap<String, Taint>) {
    for (name, taint) in other {
        union_into(target.entry(name).or_default(), taint);
    }
}

impl Pass<'_, '_> {
    fn block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        let line = stmt.span.line;
        match &stmt.kind {
            StmtKind::Expr { value } => {
                self.expr(value);
            }
            StmtKind::Assign { targets, value } => {
                let taint = self.expr(value);
                for target in targets {
                    self.assign(target, &taint, line);
                }
            }
            StmtKind::AugAssign { target, value } => {
                let mut taint = self.expr(target);
                union_into(&mut taint, self.expr(value));
                self.assign(target, &taint, line);
            }
            StmtKind::Return { value } => {
                if let Some(value) = value {
                    let taint = self.expr(value);
                    self.returned(taint, line);
                }
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test);
                let before = self.env.clone();
                self.block(body);
                let taken = std::mem::replace(&mut self.env, before);
                self.block(orelse);
                merge_env(&mut self.env, taken);
            }
            StmtKind::While { test, body } => {
                self.expr(test);
                self.looped(body);
            }
            StmtKind::For { target, iter, body } => {
                let taint = self.expr(iter);
                self.assign(target, &taint, line);
                self.looped(body);
            }
            StmtKind::With { items, body } => {
                for item in items {
                    let taint = self.expr(&item.context);
                    if let Some(target) = &item.target {
                        self.assign(target, &taint, line);
                    }
                }
                self.block(body);
            }
            StmtKind::Try {
                body,
                handlers,
                finalbody,
            } => {
                self.block(body);
                let after_body = self.env.clone();
                for handler in handlers {
                    self.block(handler);
                }
                merge_env(&mut self.env, after_body);
                self.block(finalbody);
            }
            StmtKind::FunctionDef { .. }
            | StmtKind::Import { .. }
            | StmtKind::ImportFrom { .. }
            | StmtKind::Pass => {}
        }
    }

    fn looped(&mut self, body: &[Stmt]) {
        for _ in 0..MAX_LOOP_PASSES {
            let before = self.env.clone();
            self.block(body);
            let mut merged = before.clone();
            merge_env(&mut merged, std::mem::take(&mut self.env));
            self.env = merged;
            if same_origins(&before, &self.env) {
                break;
            }
        }
    }

    fn assign(&mut self, target: &Expr, taint: &Taint, line: u32) {
        match &target.kind {
            ExprKind::Name { id } => {
                let stepped = with_step(taint, line, &format!("assigned to {id}"));
                self.env.insert(id.clone(), stepped);
            }
            ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => {
                if let Some(root) = root_name(target) {
                    let stepped = with_step(taint, line, &format!("stored into {target}"));
                    union_into(self.env.entry(root).or_default(), stepped);
                }
            }
            ExprKind::Collection { elements } => {
                for element in elements {
                    self.assign(element, taint, line);
                }
            }
            _ => {}
        }
    }

    fn returned(&mut self, taint: Taint, line: u32) {
        for (origin, mut steps) in taint {
            if steps.len() < MAX_PATH_STEPS {
                steps.push(FlowStep {
                    line,
                    description: "returned".to_owned(),
                });
            }
            match origin {
                Origin::Param(p) => {
                    self.summary.param_to_return.entry(p).or_insert(steps);
                }
                Origin::Source(s) => {
                    self.summary.return_sources.entry(s).or_insert(steps);
                }
            }
        }
    }

    fn expr(&mut self, expr: &Expr) -> Taint {
        match &expr.kind {
            ExprKind::Name { id } => self.env.get(id).cloned().unwrap_or_default(),
            ExprKind::Constant { .. } | ExprKind::Lambda { .. } => Taint::new(),
            ExprKind::Attribute { value, .. } => self.expr(value),
            ExprKind::Subscript { value, index } => {
                self.expr(index);
                self.expr(value)
            }
            ExprKind::BinOp { left, right, .. } => {
                let mut taint = self.expr(left);
                union_into(&mut taint, self.expr(right));
                taint
            }
            ExprKind::FormattedString { parts } => {
                let mut taint = Taint::new();
                for part in parts {
                    union_into(&mut taint, self.expr(part));
                }
                with_step(&taint, expr.span.line, "interpolated into string")
            }
            ExprKind::Collection { elements } => {
                let mut taint = Taint::new();
                for element in elements {
                    union_into(&mut taint, self.expr(element));
                }
                taint
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                let mut arg_taints: Vec<Taint> = args.iter().map(|a| self.expr(a)).collect();
                let kw_taints: Vec<Taint> = keywords.iter().map(|k| self.expr(&k.value)).collect();
                let receiver = match &func.kind {
                    ExprKind::Attribute { value, .. } => self.expr(value),
                    _ => Taint::new(),
                };
                let Some(name) = func.dotted_name() else {
                    let mut taint = self.expr(func);
                    for t in arg_taints.drain(..).chain(kw_taints) {
                        union_into(&mut taint, t);
                    }
                    return taint;
                };
                self.call(expr, &name, arg_taints, kw_taints, receiver)
            }
        }
    }

    fn call(
        &mut self,
        call: &Expr,
        name: &str,
        args: Vec<Taint>,
        keywords: Vec<Taint>,
        receiver: Taint,
    ) -> Taint {
        let line = call.span.line;
        let tracker = self.tracker;

        if tracker.is_sanitizer(name) {
            return Taint::new();
        }

        if let Some(rule) = tracker.sink_rule(name) {
            let sink_id = self.registry.sink(TaintSink {
                name: name.to_owned(),
                kind: rule.kind,
                line,
                column: call.span.column,
                code_snippet: snippet(&call.to_string()),
            });
            for taint in args.iter().chain(keywords.iter()) {
                let arriving = with_step(taint, line, &format!("reaches sink {name}"));
                self.at_sink(sink_id, arriving);
            }
            return Taint::new();
        }

        if let Some(rule) = tracker.source_rule(name) {
            let id = self.registry.source(TaintSource {
                name: name.to_owned(),
                kind: rule.kind,
                line,
            });
            let mut taint = Taint::new();
            taint.insert(
                Origin::Source(id),
                vec![FlowStep {
                    line,
                    description: format!("read from {name}"),
                }],
            );
            return taint;
        }

        let method = name.strip_prefix("self.");
        let local = method.unwrap_or(name);
        if let Some(unit) = self.units.get(local).filter(|_| local != MODULE_UNIT) {
            // A method call binds its receiver to the leading `self` parameter.
            let bound = if method.is_some() && unit.params.first().is_some_and(|p| p == "self") {
                std::iter::once(receiver).chain(args).collect()
            } else {
                args
            };
            return self.local_call(local, line, &bound);
        }

        // Unknown external call: result derives from its inputs.
        let mut taint = receiver;
        for t in args.into_iter().chain(keywords) {
            union_into(&mut taint, t);
        }
        taint
    }

    fn local_call(&mut self, callee: &str, line: u32, args: &[Taint]) -> Taint {
        self.callees.insert(callee.to_owned());
        let Some(summary) = self.summaries.get(callee) else {
            return Taint::new();
        };
        let summary = summary.clone();
        let mut result = Taint::new();

        for (param, inner) in &summary.param_to_return {
            let Some(arg) = args.get(*param) else {
                continue;
            };
            let passed = with_step(arg, line, &format!("passed to {callee}(arg {param})"));
            for (origin, steps) in passed {
                let mut path = join_steps(&steps, inner);
                if path.len() < MAX_PATH_STEPS {
                    path.push(FlowStep {
                        line,
                        description: format!("returned from {callee}"),
                    });
                }
                result.entry(origin).or_insert(path);
            }
        }

        for (source, inner) in &summary.return_sources {
            let mut path = inner.clone();
            if path.len() < MAX_PATH_STEPS {
                path.push(FlowStep {
                    line,
                    description: format!("returned from {callee}"),
                });
            }
            result.entry(Origin::Source(*source)).or_insert(path);
        }

        for ((param, sink_id), inner) in &summary.param_to_sink {
            let Some(arg) = args.get(*param) else {
                continue;
            };
            let passed = with_step(arg, line, &format!("passed to {callee}(arg {param})"));
            let arriving: Taint = passed
                .into_iter()
                .map(|(origin, steps)| (origin, join_steps(&steps, inner)))
                .collect();
            self.at_sink(*sink_id, arriving);
        }

        result
    }

    fn at_sink(&mut self, sink_id: usize, taint: Taint) {
        for (origin, steps) in taint {
            match origin {
                Origin::Param(p) => {
                    self.summary.param_to_sink.entry((p, sink_id)).or_insert(steps);
                }
                Origin::Source(s) => {
                    let Some(report) = self.report.as_deref_mut() else {
                        continue;
                    };
                    let (Some(source), Some(sink)) =
                        (self.registry.sources.get(s), self.registry.sinks.get(sink_id))
                    else {
                        continue;
                    };
                    report.push(DataFlowPath {
                        source: source.clone(),
                        sink: sink.clone(),
                        steps,
                    });
                }
            }
        }
    }
}

fn root_name(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Name { id } => Some(id.clone()),
        ExprKind::Attribute { value, .. } | ExprKind::Subscript { value, .. } => root_name(value),
        _ => None,
    }
}
