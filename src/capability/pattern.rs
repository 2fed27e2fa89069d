//! Permissions, resource patterns, and grant strings.
//!
//! Patterns are `/`-separated. A literal segment matches itself, a segment
//! containing `*` matches within exactly one segment, and a final `**`
//! matches zero or more trailing segments. URL patterns additionally pin the
//! scheme, host, and port.
//!
//! Resources are normalized before matching: `.` segments are dropped, `..`
//! pops the previous segment, and anything that would climb above the root
//! (or hides a traversal behind percent-encoding) is rejected outright.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Failure to parse a permission, pattern, grant, or resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// Permission is not `<family>.<action>`.
    #[error("malformed permission '{0}': expected <family>.<action>")]
    MalformedPermission(String),
    /// Pattern violates the glob grammar.
    #[error("malformed pattern '{pattern}': {reason}")]
    MalformedPattern {
        /// Offending pattern.
        pattern: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// Grant string is not `<permission>:<pattern>`.
    #[error("malformed grant '{0}': expected <family>.<action>:<pattern>")]
    MalformedGrant(String),
    /// Resource cannot be normalized safely.
    #[error("unresolvable resource '{resource}': {reason}")]
    Unresolvable {
        /// Offending resource.
        resource: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// A validated `<family>.<action>` permission such as `file.read`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission(String);

impl Permission {
    /// Validate and wrap a permission string.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::MalformedPermission`] unless the input is two
    /// non-empty parts of lowercase ASCII, digits, `_` or `-` joined by a dot.
    pub fn new(value: &str) -> Result<Self, PatternError> {
        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        };
        match value.split_once('.') {
            Some((family, action)) if valid_part(family) && valid_part(action) => {
                Ok(Self(value.to_owned()))
            }
            _ => Err(PatternError::MalformedPermission(value.to_owned())),
        }
    }

    /// The permission string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the dot (`file`).
    pub fn family(&self) -> &str {
        self.0.split_once('.').map_or("", |(f, _)| f)
    }

    /// The part after the dot (`read`).
    pub fn action(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, a)| a)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Permission {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Permission {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.0
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Glob(Regex),
    AnyTrailing,
}

impl Segment {
    fn parse(pattern: &str, text: &str, last: bool) -> Result<Self, PatternError> {
        let malformed = |reason| PatternError::MalformedPattern {
            pattern: pattern.to_owned(),
            reason,
        };
        if text == "." || text == ".." {
            return Err(malformed("dot segments are not allowed in patterns"));
        }
        if text == "**" {
            return if last {
                Ok(Self::AnyTrailing)
            } else {
                Err(malformed("'**' is only allowed as the final segment"))
            };
        }
        if text.contains("**") {
            return Err(malformed("'**' must be a whole segment"));
        }
        if text.contains('\\') || text.contains('\0') {
            return Err(malformed("backslashes and NUL are not allowed"));
        }
        if !text.contains('*') {
            return Ok(Self::Literal(text.to_owned()));
        }
        let body = text
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[^/]*");
        Regex::new(&format!("^{body}$"))
            .map(Self::Glob)
            .map_err(|_| malformed("segment does not compile"))
    }

    fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Literal(lit) => lit == segment,
            Self::Glob(re) => re.is_match(segment),
            Self::AnyTrailing => true,
        }
    }
}

fn match_segments(pattern: &[Segment], resource: &[String]) -> bool {
    match pattern.split_last() {
        Some((Segment::AnyTrailing, head)) => {
            resource.len() >= head.len()
                && head.iter().zip(resource).all(|(p, r)| p.matches(r))
        }
        _ => {
            pattern.len() == resource.len()
                && pattern.iter().zip(resource).all(|(p, r)| p.matches(r))
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Path {
        absolute: bool,
        segments: Vec<Segment>,
    },
    Url {
        scheme: String,
        host: String,
        port: Option<u16>,
        segments: Vec<Segment>,
    },
}

/// A compiled resource pattern.
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    raw: String,
    target: Target,
}

impl ResourcePattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::MalformedPattern`] for empty patterns, dot
    /// segments, a non-final `**`, wildcard hosts, or unparsable URLs.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let malformed = |reason| PatternError::MalformedPattern {
            pattern: raw.to_owned(),
            reason,
        };
        if raw.trim().is_empty() {
            return Err(malformed("pattern is empty"));
        }

        let target = if let Some((scheme, rest)) = raw.split_once("://") {
            if rest.contains('?') || rest.contains('#') {
                return Err(malformed("query and fragment are not part of a pattern"));
            }
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            if authority.is_empty() || authority.contains('*') || authority.contains('@') {
                return Err(malformed("host must be a literal without credentials"));
            }
            let base = url::Url::parse(&format!("{scheme}://{authority}/"))
                .map_err(|_| malformed("invalid URL scheme or authority"))?;
            let host = base
                .host_str()
                .ok_or_else(|| malformed("URL pattern needs a host"))?
                .to_ascii_lowercase();
            Target::Url {
                scheme: base.scheme().to_owned(),
                host,
                port: base.port_or_known_default(),
                segments: parse_segments(raw, path)?,
            }
        } else {
            Target::Path {
                absolute: raw.starts_with('/'),
                segments: parse_segments(raw, raw)?,
            }
        };

        Ok(Self {
            raw: raw.to_owned(),
            target,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `resource` is covered by this pattern.
    ///
    /// Unresolvable resources never match.
    pub fn matches(&self, resource: &str) -> bool {
        match &self.target {
            Target::Path { absolute, segments } => match normalize_path(resource) {
                Ok((res_absolute, res_segments)) => {
                    *absolute == res_absolute && match_segments(segments, &res_segments)
                }
                Err(_) => false,
            },
            Target::Url {
                scheme,
                host,
                port,
                segments,
            } => match normalize_url(resource) {
                Ok(url) => {
                    url.scheme == *scheme
                        && url.host == *host
                        && url.port == *port
                        && match_segments(segments, &url.segments)
                }
                Err(_) => false,
            },
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_segments(raw: &str, path: &str) -> Result<Vec<Segment>, PatternError> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let last = parts.len().saturating_sub(1);
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| Segment::parse(raw, part, i == last))
        .collect()
}

/// Whether `pattern` matches `resource`. Malformed patterns match nothing.
pub fn matches(pattern: &str, resource: &str) -> bool {
    ResourcePattern::parse(pattern)
        .map(|p| p.matches(resource))
        .unwrap_or(false)
}

fn reject_encoded(resource: &str) -> Result<(), PatternError> {
    let unresolvable = |reason| PatternError::Unresolvable {
        resource: resource.to_owned(),
        reason,
    };
    if resource.contains('\0') {
        return Err(unresolvable("contains NUL"));
    }
    if resource.contains('\\') {
        return Err(unresolvable("contains a backslash"));
    }
    let lower = resource.to_ascii_lowercase();
    if ["%2e", "%2f", "%5c", "%00"].iter().any(|e| lower.contains(e)) {
        return Err(unresolvable("percent-encoded separator or dot"));
    }
    Ok(())
}

/// Resolve `.` and `..` in a path, returning (absolute, segments).
fn normalize_path(resource: &str) -> Result<(bool, Vec<String>), PatternError> {
    reject_encoded(resource)?;
    if resource.is_empty() {
        return Err(PatternError::Unresolvable {
            resource: resource.to_owned(),
            reason: "empty resource",
        });
    }
    let mut segments: Vec<String> = Vec::new();
    for part in resource.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PatternError::Unresolvable {
                        resource: resource.to_owned(),
                        reason: "'..' escapes the root",
                    });
                }
            }
            other => segments.push(other.to_owned()),
        }
    }
    Ok((resource.starts_with('/'), segments))
}

struct NormalizedUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    segments: Vec<String>,
}

fn normalize_url(resource: &str) -> Result<NormalizedUrl, PatternError> {
    let unresolvable = |reason| PatternError::Unresolvable {
        resource: resource.to_owned(),
        reason,
    };
    reject_encoded(resource)?;
    let parsed = url::Url::parse(resource).map_err(|_| unresolvable("invalid URL"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| unresolvable("URL has no host"))?
        .to_ascii_lowercase();

    // Resolve the path as written; the URL parser would silently clamp `..`.
    // Query and fragment go first so a `/` inside them is never read as path.
    let after_scheme = resource
        .split_once("://")
        .map_or("", |(_, rest)| rest);
    let before_query = after_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let raw_path = before_query
        .find('/')
        .and_then(|i| before_query.get(i..))
        .unwrap_or_default();
    let (_, segments) = if raw_path.is_empty() {
        (true, Vec::new())
    } else {
        normalize_path(raw_path)?
    };

    Ok(NormalizedUrl {
        scheme: parsed.scheme().to_owned(),
        host,
        port: parsed.port_or_known_default(),
        segments,
    })
}

/// Render a resource in normalized form (`/data/x/../a.json` → `/data/a.json`).
///
/// # Errors
///
/// Returns [`PatternError::Unresolvable`] when the resource cannot be normalized.
pub fn normalize_resource(resource: &str) -> Result<String, PatternError> {
    if resource.contains("://") {
        let url = normalize_url(resource)?;
        let default_port = match url.scheme.as_str() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        let authority = match url.port {
            Some(port) if Some(port) != default_port => format!("{}:{port}", url.host),
            _ => url.host.clone(),
        };
        return Ok(format!(
            "{}://{authority}/{}",
            url.scheme,
            url.segments.join("/")
        ));
    }
    let (absolute, segments) = normalize_path(resource)?;
    let joined = segments.join("/");
    Ok(if absolute { format!("/{joined}") } else { joined })
}

/// The narrowest grant that would authorize `permission` on `resource`.
pub fn minimal_grant(permission: &str, resource: &str) -> Option<String> {
    normalize_resource(resource)
        .ok()
        .map(|normalized| format!("{permission}:{normalized}"))
}

/// A parsed `<family>.<action>:<pattern>` grant.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Granted permission.
    pub permission: Permission,
    /// Resources it applies to.
    pub pattern: ResourcePattern,
}

impl Grant {
    /// Parse a grant string.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when either half is malformed.
    pub fn parse(grant: &str) -> Result<Self, PatternError> {
        let (permission, pattern) = grant
            .split_once(':')
            .ok_or_else(|| PatternError::MalformedGrant(grant.to_owned()))?;
        Ok(Self {
            permission: Permission::new(permission)?,
            pattern: ResourcePattern::parse(pattern)?,
        })
    }
}

impl FromStr for Grant {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.permission, self.pattern)
    }
}
