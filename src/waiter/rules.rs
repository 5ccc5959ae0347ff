//! Termination Rules
//!
//! A rule set is an ordered list of (matcher, outcome) pairs plus the poll
//! interval and attempt bound. Rules are evaluated in declared order on every
//! poll and the first match decides the outcome for that poll.
//!
//! Rules serialize in the botocore acceptor shape
//! (`{"matcher": "pathAll", "argument": "...", "expected": ..., "state": "success"}`)
//! so existing waiter documents load unchanged.

use crate::domain::ports::RemoteError;
use crate::error::{Error, Result};
use crate::serde_util::seconds;
use crate::waiter::path::ExtractPath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// =============================================================================
// Outcome
// =============================================================================

/// What a matching rule means for the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

// =============================================================================
// Matchers
// =============================================================================

/// Condition evaluated against one poll result
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    /// Value at path equals expected
    Exact {
        path: Option<ExtractPath>,
        expected: Value,
    },
    /// Every element of the (non-empty) list at path equals expected
    AllMatch {
        path: Option<ExtractPath>,
        expected: Value,
    },
    /// At least one element of the list at path equals expected
    AnyMatch {
        path: Option<ExtractPath>,
        expected: Value,
    },
    /// The query failed with this remote error code
    ErrorCode { code: String },
}

impl Matcher {
    /// Panics on an invalid path; for statically known rule sets
    pub fn exact(path: &str, expected: impl Into<Value>) -> Self {
        Matcher::Exact {
            path: Some(static_path(path)),
            expected: expected.into(),
        }
    }

    pub fn all(path: &str, expected: impl Into<Value>) -> Self {
        Matcher::AllMatch {
            path: Some(static_path(path)),
            expected: expected.into(),
        }
    }

    pub fn any(path: &str, expected: impl Into<Value>) -> Self {
        Matcher::AnyMatch {
            path: Some(static_path(path)),
            expected: expected.into(),
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Matcher::ErrorCode { code: code.into() }
    }

    /// Evaluate against one poll result
    pub fn matches(
        &self,
        result: &std::result::Result<Value, RemoteError>,
        default_path: Option<&ExtractPath>,
    ) -> bool {
        let response = match (self, result) {
            (Matcher::ErrorCode { code }, Err(err)) => return err.code == *code,
            (Matcher::ErrorCode { .. }, Ok(_)) | (_, Err(_)) => return false,
            (_, Ok(response)) => response,
        };

        match self {
            Matcher::Exact { path, expected } => {
                extract(path.as_ref().or(default_path), response).as_ref() == Some(expected)
            }
            Matcher::AllMatch { path, expected } => {
                match extract(path.as_ref().or(default_path), response) {
                    Some(Value::Array(items)) => {
                        !items.is_empty() && items.iter().all(|item| item == expected)
                    }
                    _ => false,
                }
            }
            Matcher::AnyMatch { path, expected } => {
                match extract(path.as_ref().or(default_path), response) {
                    Some(Value::Array(items)) => items.iter().any(|item| item == expected),
                    _ => false,
                }
            }
            Matcher::ErrorCode { .. } => false,
        }
    }

    fn kind(&self) -> MatcherKind {
        match self {
            Matcher::Exact { .. } => MatcherKind::Path,
            Matcher::AllMatch { .. } => MatcherKind::PathAll,
            Matcher::AnyMatch { .. } => MatcherKind::PathAny,
            Matcher::ErrorCode { .. } => MatcherKind::Error,
        }
    }
}

fn static_path(path: &str) -> ExtractPath {
    match ExtractPath::parse(path) {
        Ok(parsed) => parsed,
        Err(e) => panic!("invalid static extract path {:?}: {}", path, e),
    }
}

fn extract(path: Option<&ExtractPath>, response: &Value) -> Option<Value> {
    match path {
        Some(path) => path.evaluate(response),
        None => Some(response.clone()),
    }
}

// =============================================================================
// Termination Rule
// =============================================================================

/// One condition/outcome pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAcceptor", into = "RawAcceptor")]
pub struct TerminationRule {
    pub matcher: Matcher,
    pub outcome: Outcome,
}

impl TerminationRule {
    pub fn new(matcher: Matcher, outcome: Outcome) -> Self {
        Self { matcher, outcome }
    }
}

/// Whether some rule consumes this remote error code
pub fn handles_error(rules: &[TerminationRule], code: &str) -> bool {
    rules
        .iter()
        .any(|rule| matches!(&rule.matcher, Matcher::ErrorCode { code: c } if c == code))
}

impl std::fmt::Display for TerminationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.matcher {
            Matcher::Exact { path, expected } => {
                write!(f, "{} == {} -> {}", display_path(path), expected, self.outcome)
            }
            Matcher::AllMatch { path, expected } => {
                write!(f, "all({}) == {} -> {}", display_path(path), expected, self.outcome)
            }
            Matcher::AnyMatch { path, expected } => {
                write!(f, "any({}) == {} -> {}", display_path(path), expected, self.outcome)
            }
            Matcher::ErrorCode { code } => write!(f, "error {} -> {}", code, self.outcome),
        }
    }
}

fn display_path(path: &Option<ExtractPath>) -> &str {
    path.as_ref().map(ExtractPath::as_str).unwrap_or("@")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum MatcherKind {
    #[serde(rename = "path", alias = "exact")]
    Path,
    #[serde(rename = "pathAll", alias = "all-match")]
    PathAll,
    #[serde(rename = "pathAny", alias = "any-match")]
    PathAny,
    #[serde(rename = "error", alias = "error-code")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAcceptor {
    matcher: MatcherKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    argument: Option<ExtractPath>,
    expected: Value,
    #[serde(alias = "outcome")]
    state: Outcome,
}

impl TryFrom<RawAcceptor> for TerminationRule {
    type Error = Error;

    fn try_from(raw: RawAcceptor) -> Result<Self> {
        let matcher = match raw.matcher {
            MatcherKind::Path => Matcher::Exact {
                path: raw.argument,
                expected: raw.expected,
            },
            MatcherKind::PathAll => Matcher::AllMatch {
                path: raw.argument,
                expected: raw.expected,
            },
            MatcherKind::PathAny => Matcher::AnyMatch {
                path: raw.argument,
                expected: raw.expected,
            },
            MatcherKind::Error => match raw.expected {
                Value::String(code) => Matcher::ErrorCode { code },
                other => {
                    return Err(Error::Configuration(format!(
                        "error matcher expects a string code, got {}",
                        other
                    )))
                }
            },
        };

        Ok(Self {
            matcher,
            outcome: raw.state,
        })
    }
}

impl From<TerminationRule> for RawAcceptor {
    fn from(rule: TerminationRule) -> Self {
        let kind = rule.matcher.kind();
        let (argument, expected) = match rule.matcher {
            Matcher::Exact { path, expected }
            | Matcher::AllMatch { path, expected }
            | Matcher::AnyMatch { path, expected } => (path, expected),
            Matcher::ErrorCode { code } => (None, Value::String(code)),
        };

        RawAcceptor {
            matcher: kind,
            argument,
            expected,
            state: rule.outcome,
        }
    }
}

// =============================================================================
// Rule Set
// =============================================================================

/// Ordered termination rules plus polling bounds (a waiter model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Delay between polls
    #[serde(rename = "delay", with = "seconds")]
    pub poll_interval: Duration,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    /// Upper bound of random delay added to each poll interval
    #[serde(
        rename = "jitter",
        default,
        with = "seconds",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub poll_jitter: Duration,
    #[serde(rename = "acceptors")]
    pub rules: Vec<TerminationRule>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            name: name.into(),
            poll_interval,
            max_attempts,
            poll_jitter: Duration::ZERO,
            rules: Vec::new(),
        }
    }

    pub fn success(mut self, matcher: Matcher) -> Self {
        self.rules.push(TerminationRule::new(matcher, Outcome::Success));
        self
    }

    pub fn failure(mut self, matcher: Matcher) -> Self {
        self.rules.push(TerminationRule::new(matcher, Outcome::Failure));
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    pub fn with_bounds(mut self, poll_interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_attempts = max_attempts;
        self
    }

    /// First rule matching this poll result, with its index
    pub fn evaluate(
        &self,
        result: &std::result::Result<Value, RemoteError>,
        default_path: Option<&ExtractPath>,
    ) -> Option<(usize, &TerminationRule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matcher.matches(result, default_path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration(format!(
                "rule set {} must allow at least one attempt",
                self.name
            )));
        }
        if self.rules.is_empty() {
            return Err(Error::Configuration(format!(
                "rule set {} has no rules",
                self.name
            )));
        }
        if !self.rules.iter().any(|r| r.outcome == Outcome::Success) {
            return Err(Error::Configuration(format!(
                "rule set {} has no success rule",
                self.name
            )));
        }
        Ok(())
    }
}
