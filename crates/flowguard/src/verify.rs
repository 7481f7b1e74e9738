//! Verification Engine
//!
//! A claim pairs a [`Capture`] (what to read from a [`PageSnapshot`]) with an
//! [`Expected`] value or relation. Claims whose expectation is only a type
//! check are rejected when they are built, never when they run.
//!
//! The canonical use is delta verification: capture a baseline before the
//! triggering steps, capture again after, and assert the quantified change.

use crate::driver::AutomationDriver;
use crate::locator::{normalize_whitespace, ElementReference, Resolution};
use crate::retry::{FailureCategory, FailurePhase, FailureRecord};
use crate::snapshot::PageSnapshot;
use crate::wait::{WaitDefaults, WaitEngine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// =============================================================================
// VALUES
// =============================================================================

/// A value read from the page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Comparable {
    /// Counts
    Int(i64),
    /// Text, URL, input value
    Text(String),
    /// Checked / visible flags
    Bool(bool),
    /// Accessible names, in document order
    Names(Vec<String>),
    /// The captured element did not resolve to exactly one node
    Absent,
}

impl Comparable {
    /// Kind of the value, `None` for [`Comparable::Absent`]
    #[must_use]
    pub const fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Int(_) => Some(ValueKind::Int),
            Self::Text(_) => Some(ValueKind::Text),
            Self::Bool(_) => Some(ValueKind::Bool),
            Self::Names(_) => Some(ValueKind::Names),
            Self::Absent => None,
        }
    }
}

impl fmt::Display for Comparable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "\"{s}\""),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Names(names) => write!(f, "{names:?}"),
            Self::Absent => f.write_str("<absent>"),
        }
    }
}

/// Kinds of [`Comparable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Integer
    Int,
    /// Text
    Text,
    /// Boolean
    Bool,
    /// Name list
    Names,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int => "int",
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Names => "names",
        };
        f.write_str(s)
    }
}

// =============================================================================
// CAPTURE
// =============================================================================

/// Snapshot reader for custom captures
pub type CaptureFn = Arc<dyn Fn(&PageSnapshot) -> Comparable + Send + Sync>;

/// What a claim reads from a snapshot
#[derive(Clone)]
pub enum Capture {
    /// Number of visible matches (ordinal ignored)
    Count(ElementReference),
    /// Rendered text of the unique match
    Text(ElementReference),
    /// Input value of the unique match
    Value(ElementReference),
    /// Checked state of the unique match
    Checked(ElementReference),
    /// Accessible names of all matches
    Names(ElementReference),
    /// Page URL
    Url,
    /// Whether the reference resolves to exactly one visible element
    Visible(ElementReference),
    /// Caller-provided reader with a declared kind
    Custom {
        /// Declared value kind
        kind: ValueKind,
        /// Label used in descriptions
        label: String,
        /// Reader
        read: CaptureFn,
    },
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom { kind, label, .. } => f
                .debug_struct("Custom")
                .field("kind", kind)
                .field("label", label)
                .finish_non_exhaustive(),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(r) => write!(f, "count({r})"),
            Self::Text(r) => write!(f, "text({r})"),
            Self::Value(r) => write!(f, "value({r})"),
            Self::Checked(r) => write!(f, "checked({r})"),
            Self::Names(r) => write!(f, "names({r})"),
            Self::Url => f.write_str("url"),
            Self::Visible(r) => write!(f, "visible({r})"),
            Self::Custom { label, .. } => f.write_str(label),
        }
    }
}

impl Capture {
    /// Custom capture
    pub fn custom<F>(kind: ValueKind, label: impl Into<String>, read: F) -> Self
    where
        F: Fn(&PageSnapshot) -> Comparable + Send + Sync + 'static,
    {
        Self::Custom {
            kind,
            label: label.into(),
            read: Arc::new(read),
        }
    }

    /// Kind of value this capture produces
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Count(_) => ValueKind::Int,
            Self::Text(_) | Self::Value(_) | Self::Url => ValueKind::Text,
            Self::Checked(_) | Self::Visible(_) => ValueKind::Bool,
            Self::Names(_) => ValueKind::Names,
            Self::Custom { kind, .. } => *kind,
        }
    }

    /// Read the value from a snapshot
    #[must_use]
    pub fn read(&self, snapshot: &PageSnapshot) -> Comparable {
        match self {
            Self::Count(r) => snapshot
                .count(r)
                .map_or(Comparable::Absent, |n| {
                    Comparable::Int(i64::try_from(n).unwrap_or(i64::MAX))
                }),
            Self::Text(r) => match snapshot.resolve(r) {
                Resolution::Found(node) => Comparable::Text(normalize_whitespace(&node.text)),
                _ => Comparable::Absent,
            },
            Self::Value(r) => match snapshot.resolve(r) {
                Resolution::Found(node) => {
                    Comparable::Text(node.value.clone().unwrap_or_default())
                }
                _ => Comparable::Absent,
            },
            Self::Checked(r) => match snapshot.resolve(r) {
                Resolution::Found(node) => Comparable::Bool(node.checked.unwrap_or(false)),
                _ => Comparable::Absent,
            },
            Self::Names(r) => snapshot.names(r).map_or(Comparable::Absent, |names| {
                Comparable::Names(names.iter().map(|n| normalize_whitespace(n)).collect())
            }),
            Self::Url => Comparable::Text(snapshot.url.clone()),
            Self::Visible(r) => Comparable::Bool(snapshot.resolve(r).is_found()),
            Self::Custom { read, .. } => read(snapshot),
        }
    }
}

// =============================================================================
// EXPECTATION
// =============================================================================

/// Relation between a baseline and the current value
pub type RelationFn = Arc<dyn Fn(&Comparable, &Comparable) -> bool + Send + Sync>;

/// What the captured value must satisfy
#[derive(Clone)]
pub enum Expected {
    /// Equal to a concrete value
    Equals(Comparable),
    /// Integer changed by exactly this much since the baseline
    Delta(i64),
    /// Integer at least this large
    AtLeast(i64),
    /// Text contains this substring
    Contains(String),
    /// Text matches this regex
    Matches(String),
    /// Name list includes this name
    Includes(String),
    /// Name list does not include this name
    Excludes(String),
    /// Same value as the baseline
    Unchanged,
    /// Caller relation over (baseline, current)
    Relation {
        /// Label used in descriptions
        label: String,
        /// Relation
        holds: RelationFn,
    },
    /// Only the value's type. Never a valid claim; rejected at construction.
    TypeIs(ValueKind),
}

impl fmt::Debug for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(v) => write!(f, "== {v}"),
            Self::Delta(d) => write!(f, "changed by {d:+}"),
            Self::AtLeast(n) => write!(f, ">= {n}"),
            Self::Contains(s) => write!(f, "contains \"{s}\""),
            Self::Matches(p) => write!(f, "matches /{p}/"),
            Self::Includes(s) => write!(f, "includes \"{s}\""),
            Self::Excludes(s) => write!(f, "excludes \"{s}\""),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Relation { label, .. } => f.write_str(label),
            Self::TypeIs(k) => write!(f, "is {k}"),
        }
    }
}

impl Expected {
    /// Relation over (baseline, current)
    pub fn relation<F>(label: impl Into<String>, holds: F) -> Self
    where
        F: Fn(&Comparable, &Comparable) -> bool + Send + Sync + 'static,
    {
        Self::Relation {
            label: label.into(),
            holds: Arc::new(holds),
        }
    }

    /// Whether a baseline must be captured before the triggering steps
    #[must_use]
    pub const fn needs_baseline(&self) -> bool {
        matches!(self, Self::Delta(_) | Self::Unchanged | Self::Relation { .. })
    }
}

/// Rejected claim construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Expectation only checks the value's type
    #[error("claim \"{description}\" only checks that the value is {kind}; assert a concrete value or relation")]
    TypeOnly {
        /// Claim description
        description: String,
        /// Checked kind
        kind: ValueKind,
    },
    /// Expectation does not fit the captured kind
    #[error("claim \"{description}\": {expected} cannot apply to a {capture} capture")]
    KindMismatch {
        /// Claim description
        description: String,
        /// Captured kind
        capture: ValueKind,
        /// Expectation
        expected: String,
    },
    /// `Equals(Absent)` would pass whenever resolution fails
    #[error("claim \"{description}\" expects <absent>; use element_absent instead")]
    ExpectsAbsent {
        /// Claim description
        description: String,
    },
    /// Regex does not compile
    #[error("claim \"{description}\": invalid pattern: {message}")]
    BadPattern {
        /// Claim description
        description: String,
        /// Regex error
        message: String,
    },
    /// Missing description
    #[error("claim description must not be empty")]
    EmptyDescription,
}

// =============================================================================
// CLAIM
// =============================================================================

/// How long a claim may take to become true after the triggering steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Evaluate once
    Immediate,
    /// Poll up to the engine's default timeout
    EngineDefault,
    /// Poll up to this long
    Window(Duration),
}

/// A validated statement about page state
#[derive(Debug, Clone)]
pub struct VerificationClaim {
    description: String,
    capture: Capture,
    expected: Expected,
    settle: Settle,
    pattern: Option<regex::Regex>,
}

impl VerificationClaim {
    /// Build a claim, rejecting type-only and ill-typed expectations.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError`] if the expectation is a type check, does not
    /// fit the capture's kind, expects absence, or carries a bad regex.
    pub fn new(
        description: impl Into<String>,
        capture: Capture,
        expected: Expected,
    ) -> Result<Self, ClaimError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(ClaimError::EmptyDescription);
        }
        let kind = capture.kind();
        let mismatch = |expected: &Expected| ClaimError::KindMismatch {
            description: description.clone(),
            capture: kind,
            expected: expected.to_string(),
        };

        let mut pattern = None;
        match &expected {
            Expected::TypeIs(k) => {
                return Err(ClaimError::TypeOnly {
                    description: description.clone(),
                    kind: *k,
                })
            }
            Expected::Equals(Comparable::Absent) => {
                return Err(ClaimError::ExpectsAbsent {
                    description: description.clone(),
                })
            }
            Expected::Equals(v) if v.kind() != Some(kind) => return Err(mismatch(&expected)),
            Expected::Delta(_) | Expected::AtLeast(_) if kind != ValueKind::Int => {
                return Err(mismatch(&expected))
            }
            Expected::Contains(_) if kind != ValueKind::Text => return Err(mismatch(&expected)),
            Expected::Matches(p) => {
                if kind != ValueKind::Text {
                    return Err(mismatch(&expected));
                }
                pattern = Some(regex::Regex::new(p).map_err(|e| ClaimError::BadPattern {
                    description: description.clone(),
                    message: e.to_string(),
                })?);
            }
            Expected::Includes(_) | Expected::Excludes(_) if kind != ValueKind::Names => {
                return Err(mismatch(&expected))
            }
            _ => {}
        }

        Ok(Self {
            description,
            capture,
            expected,
            settle: Settle::Immediate,
            pattern,
        })
    }

    fn trusted(description: String, capture: Capture, expected: Expected) -> Self {
        Self {
            description,
            capture,
            expected,
            settle: Settle::Immediate,
            pattern: None,
        }
    }

    /// Count of `reference` changes by exactly `delta`
    #[must_use]
    pub fn count_delta(reference: ElementReference, delta: i64) -> Self {
        Self::trusted(
            format!("count of {reference} changes by {delta:+}"),
            Capture::Count(reference),
            Expected::Delta(delta),
        )
    }

    /// Count of `reference` is at least `min`
    #[must_use]
    pub fn count_at_least(reference: ElementReference, min: i64) -> Self {
        Self::trusted(
            format!("count of {reference} >= {min}"),
            Capture::Count(reference),
            Expected::AtLeast(min),
        )
    }

    /// Captured value equals `expected`
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError`] if `expected` does not fit the capture.
    pub fn value_equals(capture: Capture, expected: Comparable) -> Result<Self, ClaimError> {
        let description = format!("{capture} == {expected}");
        Self::new(description, capture, Expected::Equals(expected))
    }

    /// Page URL equals `url`
    #[must_use]
    pub fn url_equals(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::trusted(
            format!("url == {url}"),
            Capture::Url,
            Expected::Equals(Comparable::Text(url)),
        )
    }

    /// Unique match's text equals `text` (whitespace-normalized)
    #[must_use]
    pub fn text_equals(reference: ElementReference, text: impl Into<String>) -> Self {
        let text = normalize_whitespace(&text.into());
        Self::trusted(
            format!("text of {reference} == \"{text}\""),
            Capture::Text(reference),
            Expected::Equals(Comparable::Text(text)),
        )
    }

    /// Unique match's text contains `needle`
    #[must_use]
    pub fn text_contains(reference: ElementReference, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::trusted(
            format!("text of {reference} contains \"{needle}\""),
            Capture::Text(reference),
            Expected::Contains(needle),
        )
    }

    /// No visible element matches `reference`, allowing for render lag
    #[must_use]
    pub fn element_absent(reference: ElementReference) -> Self {
        Self::trusted(
            format!("{reference} absent"),
            Capture::Count(reference),
            Expected::Equals(Comparable::Int(0)),
        )
        .with_settle(Settle::EngineDefault)
    }

    /// Accessible names of `reference` matches include `name`
    #[must_use]
    pub fn names_include(reference: ElementReference, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::trusted(
            format!("{reference} includes \"{name}\""),
            Capture::Names(reference),
            Expected::Includes(name),
        )
    }

    /// Accessible names of `reference` matches exclude `name`
    #[must_use]
    pub fn names_exclude(reference: ElementReference, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::trusted(
            format!("{reference} excludes \"{name}\""),
            Capture::Names(reference),
            Expected::Excludes(name),
        )
    }

    /// Captured value is the same as its baseline
    #[must_use]
    pub fn unchanged(capture: Capture) -> Self {
        Self::trusted(format!("{capture} unchanged"), capture, Expected::Unchanged)
    }

    /// Set the settle window
    #[must_use]
    pub const fn with_settle(mut self, settle: Settle) -> Self {
        self.settle = settle;
        self
    }

    /// Replace the description
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Description
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Capture
    #[must_use]
    pub const fn capture(&self) -> &Capture {
        &self.capture
    }

    /// Expectation
    #[must_use]
    pub const fn expected(&self) -> &Expected {
        &self.expected
    }

    /// Settle window
    #[must_use]
    pub const fn settle(&self) -> Settle {
        self.settle
    }

    /// Whether a baseline is required
    #[must_use]
    pub const fn needs_baseline(&self) -> bool {
        self.expected.needs_baseline()
    }

    /// Check an observed value against the expectation.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch.
    pub fn check(&self, baseline: Option<&Comparable>, observed: &Comparable) -> Result<(), String> {
        if matches!(observed, Comparable::Absent) {
            return Err(format!("{} did not resolve to a single value", self.capture));
        }
        let baseline_required = || {
            baseline.ok_or_else(|| format!("no baseline captured for {}", self.capture))
        };
        let ok = match (&self.expected, observed) {
            (Expected::Equals(v), o) => v == o,
            (Expected::Delta(d), Comparable::Int(after)) => match baseline_required()? {
                Comparable::Int(before) => match after.checked_sub(*before) {
                    Some(change) => change == *d,
                    None => {
                        return Err(format!(
                            "{} changed from {before} to {after}, which overflows a count delta",
                            self.capture
                        ))
                    }
                },
                other => return Err(format!("baseline {other} is not a count")),
            },
            (Expected::AtLeast(min), Comparable::Int(n)) => n >= min,
            (Expected::Contains(s), Comparable::Text(t)) => t.contains(s.as_str()),
            (Expected::Matches(_), Comparable::Text(t)) => {
                self.pattern.as_ref().is_some_and(|re| re.is_match(t))
            }
            (Expected::Includes(s), Comparable::Names(names)) => names.contains(s),
            (Expected::Excludes(s), Comparable::Names(names)) => !names.contains(s),
            (Expected::Unchanged, o) => baseline_required()? == o,
            (Expected::Relation { holds, .. }, o) => holds(baseline_required()?, o),
            (expected, o) => return Err(format!("{expected} cannot apply to {o}")),
        };
        if ok {
            return Ok(());
        }
        Err(match (&self.expected, baseline) {
            (Expected::Delta(d), Some(Comparable::Int(before))) => {
                let after = if let Comparable::Int(a) = observed { *a } else { 0 };
                let change = after
                    .checked_sub(*before)
                    .map_or_else(|| "overflow".to_string(), |c| format!("{c:+}"));
                format!(
                    "expected {} to change by {d:+} from {before}, observed {after} ({change})",
                    self.capture
                )
            }
            (expected, Some(before)) if expected.needs_baseline() => format!(
                "expected {} {expected} (baseline {before}), observed {observed}",
                self.capture
            ),
            (expected, _) => format!("expected {} {expected}, observed {observed}", self.capture),
        })
    }
}

// =============================================================================
// VERIFIER
// =============================================================================

/// A claim that held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    /// Claim description
    pub description: String,
    /// Value that satisfied it
    pub observed: Comparable,
    /// Time spent settling
    pub elapsed: Duration,
}

/// Evaluates claims against snapshots read from a driver
#[derive(Debug)]
pub struct Verifier<'a, D: ?Sized> {
    driver: &'a D,
    waits: WaitEngine<'a, D>,
}

impl<'a, D: AutomationDriver + ?Sized> Verifier<'a, D> {
    /// Create a verifier
    #[must_use]
    pub const fn new(driver: &'a D, defaults: WaitDefaults) -> Self {
        Self {
            driver,
            waits: WaitEngine::new(driver, defaults),
        }
    }

    /// Capture a claim's baseline from one fresh snapshot
    ///
    /// # Errors
    ///
    /// Returns a failure if the page could not be read.
    pub async fn baseline(&self, claim: &VerificationClaim) -> Result<Comparable, FailureRecord> {
        let snapshot = self.driver.read_snapshot().await.map_err(|err| {
            FailureRecord::new(
                FailureCategory::Unknown,
                FailurePhase::Verification,
                format!("baseline for {}", claim.description),
                err.to_string(),
            )
        })?;
        Ok(claim.capture.read(&snapshot))
    }

    /// Evaluate a claim, polling within its settle window.
    ///
    /// # Errors
    ///
    /// Returns an `AssertionFailure` if the claim is still false when its
    /// window closes. Never retryable.
    pub async fn verify(
        &self,
        claim: &VerificationClaim,
        baseline: Option<&Comparable>,
    ) -> Result<Verified, FailureRecord> {
        let window = match claim.settle {
            Settle::Immediate => Duration::ZERO,
            Settle::EngineDefault => self.waits.defaults().timeout,
            Settle::Window(d) => d,
        };
        let polled = self
            .waits
            .poll_until(window, None, |snap| {
                claim.check(baseline, &claim.capture.read(snap)).is_ok()
            })
            .await;

        let Some(snapshot) = polled.last_snapshot else {
            return Err(FailureRecord::new(
                FailureCategory::Unknown,
                FailurePhase::Verification,
                claim.description.clone(),
                polled
                    .last_error
                    .unwrap_or_else(|| "page could not be read".to_string()),
            ));
        };
        let observed = claim.capture.read(&snapshot);
        if polled.satisfied {
            debug!(claim = %claim.description, observed = %observed, "claim holds");
            return Ok(Verified {
                description: claim.description.clone(),
                observed,
                elapsed: polled.elapsed,
            });
        }
        let detail = claim
            .check(baseline, &observed)
            .err()
            .unwrap_or_else(|| format!("claim did not hold within {}ms", window.as_millis()));
        Err(FailureRecord::assertion(claim.description.clone(), detail))
    }

    /// Capture a baseline, run `segment`, then verify the claim against it
    ///
    /// # Errors
    ///
    /// Returns the segment's failure, or the claim's.
    pub async fn verify_around<T, Fut>(
        &self,
        claim: &VerificationClaim,
        segment: Fut,
    ) -> Result<(T, Verified), FailureRecord>
    where
        Fut: Future<Output = Result<T, FailureRecord>>,
    {
        let baseline = self.baseline(claim).await?;
        let value = segment.await?;
        let verified = self.verify(claim, Some(&baseline)).await?;
        Ok((value, verified))
    }
}
