//! Secret redaction for audit payloads.

use regex::Regex;
use serde_json::{Map, Value};

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Redacts known secret values and token-shaped strings.
#[derive(Debug, Clone)]
pub struct Redactor {
    exact_secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Redactor {
    /// Create a redactor from known secret values.
    pub fn new(exact_secrets: Vec<String>) -> Self {
        Self {
            exact_secrets,
            patterns: default_patterns(),
        }
    }

    /// Redact exact known secrets and known secret patterns.
    pub fn redact(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for secret in &self.exact_secrets {
            if !secret.is_empty() {
                sanitized = sanitized.replace(secret, REDACTION_MARKER);
            }
        }
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .to_string();
        }
        sanitized
    }

    /// Redact every string inside a payload map.
    pub fn redact_map(&self, map: Map<String, Value>) -> Map<String, Value> {
        map.into_iter()
            .map(|(k, v)| (k, self.redact_value(v)))
            .collect()
    }

    fn redact_value(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(self.redact_map(map)),
            other => other,
        }
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xoxb-[A-Za-z0-9\-]{20,}",
        r"AKIA[0-9A-Z]{16}",
        r"(?i)bearer\s+[A-Za-z0-9_\-\.=]{16,}",
        r"(?i)(password|passwd|secret|api_key|token)=[^&\s]+",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
