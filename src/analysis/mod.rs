//! Static analysis of submitted programs before they are allowed to run.
//!
//! Two passes run over the typed [`Program`]: the [`detector`] looks for
//! dangerous code shapes (dynamic evaluation, denied imports, reflection
//! chains) and the [`taint`] tracker follows untrusted values into dangerous
//! sinks. The [`Analyzer`] combines both and fails fast with a
//! [`SecurityError`] when a finding reaches the blocking threshold.
//!
//! Static results are a pre-filter only. Runtime capability checks in the
//! sandbox remain authoritative even for programs that scan clean.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ast::Program;
use crate::config::{AnalysisConfig, TaintConfig};

pub mod detector;
pub mod taint;

use detector::Detector;
use taint::{DataFlowPath, TaintTracker};

/// Finding severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational, no action needed.
    #[default]
    Info,
    /// Minor concern.
    Low,
    /// Needs review.
    Medium,
    /// Likely exploitable.
    High,
    /// Must never run.
    Critical,
}

impl Severity {
    /// Upper-case label used in records and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Category of a static finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Dynamic evaluation or compilation of strings.
    CodeInjection,
    /// Type-hierarchy traversal reaching interpreter internals.
    ReflectionAbuse,
    /// Import of a denylisted module.
    DeniedImport,
    /// Direct shell execution primitive.
    ShellExecution,
    /// Deserialization that can instantiate arbitrary objects.
    UnsafeDeserialization,
    /// Untrusted data reaching a dangerous sink.
    TaintedFlow,
}

impl FindingKind {
    /// Snake-case label used in records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeInjection => "code_injection",
            Self::ReflectionAbuse => "reflection_abuse",
            Self::DeniedImport => "denied_import",
            Self::ShellExecution => "shell_execution",
            Self::UnsafeDeserialization => "unsafe_deserialization",
            Self::TaintedFlow => "tainted_flow",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One static-analysis result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatFinding {
    /// Finding category.
    pub kind: FindingKind,
    /// Severity assigned by policy.
    pub severity: Severity,
    /// 1-based source line.
    pub line: u32,
    /// 0-based source column.
    pub column: u32,
    /// Rendered source of the offending node.
    pub code_snippet: String,
    /// Which rule matched (call name, module, attribute chain).
    pub matched_pattern: String,
    /// Human-readable explanation.
    pub reason: String,
    /// How to fix or what to grant.
    pub suggested_fix: String,
    /// Weakness classification (CWE identifier).
    pub classification_id: String,
}

/// Static finding at or above the blocking threshold.
///
/// Raised before any side effect; the program never reaches the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// One or more findings reached the threshold.
    #[error("program '{program}' blocked: {} finding(s) at or above {threshold}, highest {}", blocking.len(), highest_of(blocking))]
    Blocked {
        /// Program name.
        program: String,
        /// Threshold that was applied.
        threshold: Severity,
        /// Findings that triggered the block.
        blocking: Vec<ThreatFinding>,
        /// Every finding produced before the block.
        findings: Vec<ThreatFinding>,
    },
}

fn highest_of(findings: &[ThreatFinding]) -> Severity {
    findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or_default()
}

impl SecurityError {
    /// All findings produced before analysis stopped.
    pub fn findings(&self) -> &[ThreatFinding] {
        match self {
            Self::Blocked { findings, .. } => findings,
        }
    }
}

/// Result of a successful (non-blocking) analysis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    /// Program name.
    pub program: String,
    /// Detector and tracker findings, ordered by location.
    pub findings: Vec<ThreatFinding>,
    /// Evidence paths behind each tainted-flow finding.
    pub flows: Vec<DataFlowPath>,
}

impl AnalysisReport {
    /// Highest severity among the findings, if any.
    pub fn highest_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Whether no findings were produced.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Combined detector and taint tracker with a blocking policy.
#[derive(Debug, Clone)]
pub struct Analyzer {
    detector: Detector,
    tracker: TaintTracker,
    block_threshold: Severity,
}

impl Analyzer {
    /// Build an analyzer from configuration.
    pub fn new(analysis: &AnalysisConfig, taint: &TaintConfig) -> Self {
        Self {
            detector: Detector::new(analysis),
            tracker: TaintTracker::new(taint),
            block_threshold: analysis.block_threshold,
        }
    }

    /// Severity at which findings block execution.
    pub fn block_threshold(&self) -> Severity {
        self.block_threshold
    }

    /// Run both passes over a program.
    ///
    /// The detector runs to completion first. If it reports anything CRITICAL
    /// or at/above the threshold the tracker is skipped and the program is
    /// rejected immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Blocked`] when any finding reaches the threshold.
    pub fn analyze(&self, program: &Program) -> Result<AnalysisReport, SecurityError> {
        let detected = self.detector.scan(program);
        debug!(program = %program.name, findings = detected.len(), "detector pass complete");
        self.check_threshold(program, &detected)?;

        let flows = self.tracker.analyze(program);
        let mut findings = detected;
        findings.extend(flows.iter().map(DataFlowPath::to_finding));
        sort_findings(&mut findings);
        self.check_threshold(program, &findings)?;

        info!(
            program = %program.name,
            findings = findings.len(),
            flows = flows.len(),
            "program accepted by static analysis"
        );
        Ok(AnalysisReport {
            program: program.name.clone(),
            findings,
            flows,
        })
    }

    fn check_threshold(
        &self,
        program: &Program,
        findings: &[ThreatFinding],
    ) -> Result<(), SecurityError> {
        let threshold = self.block_threshold;
        let blocking: Vec<ThreatFinding> = findings
            .iter()
            .filter(|f| f.severity >= threshold)
            .cloned()
            .collect();
        if blocking.is_empty() {
            return Ok(());
        }
        Err(SecurityError::Blocked {
            program: program.name.clone(),
            threshold,
            blocking,
            findings: findings.to_vec(),
        })
    }
}

/// Deterministic ordering: location first, then kind, then matched rule.
pub(crate) fn sort_findings(findings: &mut Vec<ThreatFinding>) {
    findings.sort_by(|a, b| {
        (a.line, a.column, a.kind, &a.matched_pattern).cmp(&(
            b.line,
            b.column,
            b.kind,
            &b.matched_pattern,
        ))
    });
    findings.dedup_by(|a, b| {
        a.line == b.line
            && a.column == b.column
            && a.kind == b.kind
            && a.matched_pattern == b.matched_pattern
    });
}

/// Truncate a rendered snippet to a readable length.
pub(crate) fn snippet(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        return text.to_owned();
    }
    let mut cut: String = text.chars().take(MAX).collect();
    cut.push_str("...");
    cut
}
