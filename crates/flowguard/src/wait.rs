//! Wait Engine
//!
//! Condition-based synchronization over [`PageSnapshot`]s. This is the only
//! mechanism the engine uses to tolerate asynchronous rendering: fixed delays
//! exist solely as a bounded grace period applied *after* a condition held.
//!
//! - **Pure predicates**: a [`WaitCondition`] is a side-effect-free function of
//!   a snapshot and may be evaluated any number of times
//! - **Poll floor**: polling never runs tighter than the configured minimum
//! - **Bounded**: every wait carries a timeout and reports `TimedOut` as a value

use crate::driver::AutomationDriver;
use crate::locator::{normalize_whitespace, ElementReference, Resolution};
use crate::snapshot::PageSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default timeout for wait operations (5 seconds)
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Default polling interval (100ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Polling never runs tighter than this (10ms)
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Network idle threshold (500ms without requests)
pub const NETWORK_IDLE_THRESHOLD_MS: u64 = 500;

/// Upper bound on any trailing grace period (2 seconds)
pub const MAX_GRACE_MS: u64 = 2_000;

// =============================================================================
// URL PATTERN
// =============================================================================

/// URL pattern for matching page URLs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlPattern {
    /// Exact URL match
    Exact(String),
    /// Prefix match
    Prefix(String),
    /// Contains substring
    Contains(String),
    /// Regex match, compiled once
    Regex(UrlRegex),
    /// Glob pattern (e.g., "**/contacts/*")
    Glob(String),
    /// Match any URL
    Any,
}

impl UrlPattern {
    /// Regex pattern
    ///
    /// # Errors
    ///
    /// Returns the compile error for an invalid regex.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        UrlRegex::new(pattern).map(Self::Regex)
    }

    /// Check if a URL matches this pattern
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Exact(pattern) => url == pattern,
            Self::Prefix(pattern) => url.starts_with(pattern.as_str()),
            Self::Contains(pattern) => url.contains(pattern.as_str()),
            Self::Regex(re) => re.is_match(url),
            Self::Glob(pattern) => glob_matches(pattern, url),
            Self::Any => true,
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => write!(f, "= {p}"),
            Self::Prefix(p) => write!(f, "{p}*"),
            Self::Contains(p) => write!(f, "*{p}*"),
            Self::Regex(re) => write!(f, "/{}/", re.as_str()),
            Self::Glob(p) => f.write_str(p),
            Self::Any => f.write_str("*"),
        }
    }
}

/// Compiled URL regex. Compares and serializes as its source text.
#[derive(Debug, Clone)]
pub struct UrlRegex(regex::Regex);

impl UrlRegex {
    /// Compile `pattern`
    ///
    /// # Errors
    ///
    /// Returns the compile error for an invalid regex.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        regex::Regex::new(pattern).map(Self)
    }

    /// Source text
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether `url` matches
    #[must_use]
    pub fn is_match(&self, url: &str) -> bool {
        self.0.is_match(url)
    }
}

impl PartialEq for UrlRegex {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for UrlRegex {}

impl Serialize for UrlRegex {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UrlRegex {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

fn glob_matches(pattern: &str, url: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let [first, middle @ .., last] = parts.as_slice() else {
        // no '*' at all
        return pattern == url;
    };
    let Some(mut rest) = url.strip_prefix(first) else {
        return false;
    };
    for part in middle.iter().filter(|p| !p.is_empty()) {
        match rest.find(part) {
            Some(found) => rest = &rest[found + part.len()..],
            None => return false,
        }
    }
    // the final literal is anchored at the end, not at its first occurrence
    rest.ends_with(last)
}

// =============================================================================
// WAIT CONDITION
// =============================================================================

/// Snapshot predicate shared between condition clones
pub type Predicate = Arc<dyn Fn(&PageSnapshot) -> bool + Send + Sync>;

/// A named predicate over page state with its own timing.
///
/// Timing left unset falls back to the engine's [`WaitDefaults`].
#[derive(Clone)]
pub struct WaitCondition {
    predicate: Predicate,
    description: String,
    timeout: Option<Duration>,
    poll_interval: Option<Duration>,
    grace: Duration,
}

impl fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCondition")
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl WaitCondition {
    /// Create a condition from a pure predicate
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&PageSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            description: description.into(),
            timeout: None,
            poll_interval: None,
            grace: Duration::ZERO,
        }
    }

    /// Element resolves to exactly one visible node
    #[must_use]
    pub fn element_visible(reference: ElementReference) -> Self {
        let description = format!("{reference} visible");
        Self::new(description, move |snap| snap.resolve(&reference).is_found())
    }

    /// No visible node matches the element
    #[must_use]
    pub fn element_hidden(reference: ElementReference) -> Self {
        let description = format!("{reference} hidden");
        Self::new(description, move |snap| {
            matches!(snap.resolve(&reference), Resolution::NotFound)
        })
    }

    /// Element is rendered and, when it resolves uniquely, enabled.
    ///
    /// An ambiguous match satisfies the condition so that the resolver, not a
    /// timeout, reports the ambiguity.
    #[must_use]
    pub fn actionable(reference: ElementReference) -> Self {
        let description = format!("{reference} actionable");
        Self::new(description, move |snap| match snap.resolve(&reference) {
            Resolution::Found(node) => node.enabled,
            Resolution::Ambiguous(_) => true,
            Resolution::NotFound => false,
        })
    }

    /// Number of visible matches equals `count`
    #[must_use]
    pub fn count_equals(reference: ElementReference, count: usize) -> Self {
        let description = format!("count of {reference} == {count}");
        Self::new(description, move |snap| snap.count(&reference) == Some(count))
    }

    /// Page URL matches the pattern
    #[must_use]
    pub fn url_matches(pattern: UrlPattern) -> Self {
        let description = format!("url matches {pattern}");
        Self::new(description, move |snap| pattern.matches(&snap.url))
    }

    /// Element resolves uniquely and its text (or input value) equals `value`
    #[must_use]
    pub fn text_equals(reference: ElementReference, value: impl Into<String>) -> Self {
        let expected = normalize_whitespace(&value.into());
        let description = format!("{reference} text == \"{expected}\"");
        Self::new(description, move |snap| {
            snap.resolve(&reference)
                .found()
                .is_some_and(|node| normalize_whitespace(node.observed_text()) == expected)
        })
    }

    /// No request in flight for at least `window`
    #[must_use]
    pub fn network_quiescent(window: Duration) -> Self {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let description = format!("network idle for {window_ms}ms");
        Self::new(description, move |snap| {
            !snap.is_network_busy() && snap.idle_for_ms >= window_ms
        })
    }

    /// Override the timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the polling interval (still subject to the floor)
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Trailing delay applied once the condition held
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Replace the description
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Evaluate against one snapshot
    #[must_use]
    pub fn evaluate(&self, snapshot: &PageSnapshot) -> bool {
        (self.predicate)(snapshot)
    }

    /// Human readable description
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Explicit timeout, if any
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Trailing grace period
    #[must_use]
    pub const fn grace(&self) -> Duration {
        self.grace
    }
}

// =============================================================================
// WAIT RESULT
// =============================================================================

/// Condition held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSuccess {
    /// Condition description
    pub description: String,
    /// Time until the condition held (grace excluded)
    pub elapsed: Duration,
    /// Snapshots evaluated
    pub polls: u32,
}

/// Condition never became true within its timeout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {}ms waiting for {description} ({polls} polls)", .elapsed.as_millis())]
pub struct TimedOut {
    /// Condition description
    pub description: String,
    /// Time spent waiting
    pub elapsed: Duration,
    /// Snapshots evaluated
    pub polls: u32,
    /// Last driver error seen while polling
    pub last_error: Option<String>,
}

/// Outcome of a raw poll loop, with the last snapshot observed
#[derive(Debug)]
pub struct Polled {
    /// Whether the check passed
    pub satisfied: bool,
    /// Time spent polling
    pub elapsed: Duration,
    /// Snapshots evaluated
    pub polls: u32,
    /// Last snapshot read successfully
    pub last_snapshot: Option<PageSnapshot>,
    /// Last driver error
    pub last_error: Option<String>,
}

// =============================================================================
// WAIT ENGINE
// =============================================================================

/// Timing defaults applied to conditions that do not set their own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitDefaults {
    /// Timeout for conditions without one
    pub timeout: Duration,
    /// Polling interval for conditions without one
    pub poll_interval: Duration,
    /// Floor for any polling interval
    pub min_poll_interval: Duration,
    /// Cap for trailing grace periods
    pub max_grace: Duration,
}

impl Default for WaitDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            min_poll_interval: Duration::from_millis(MIN_POLL_INTERVAL_MS),
            max_grace: Duration::from_millis(MAX_GRACE_MS),
        }
    }
}

impl WaitDefaults {
    /// Effective polling interval for a requested one
    #[must_use]
    pub fn effective_poll(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.poll_interval)
            .max(self.min_poll_interval)
    }
}

/// Evaluates wait conditions against snapshots read from a driver
#[derive(Debug)]
pub struct WaitEngine<'a, D: ?Sized> {
    driver: &'a D,
    defaults: WaitDefaults,
}

impl<'a, D: AutomationDriver + ?Sized> WaitEngine<'a, D> {
    /// Create a wait engine
    #[must_use]
    pub const fn new(driver: &'a D, defaults: WaitDefaults) -> Self {
        Self { driver, defaults }
    }

    /// Engine defaults
    #[must_use]
    pub const fn defaults(&self) -> &WaitDefaults {
        &self.defaults
    }

    /// Poll until the condition holds or its timeout elapses
    pub async fn await_condition(&self, condition: &WaitCondition) -> Result<WaitSuccess, TimedOut> {
        let timeout = condition.timeout.unwrap_or(self.defaults.timeout);
        let polled = self
            .poll_until(timeout, condition.poll_interval, |snap| condition.evaluate(snap))
            .await;

        if !polled.satisfied {
            debug!(condition = %condition.description, polls = polled.polls, "wait timed out");
            return Err(TimedOut {
                description: condition.description.clone(),
                elapsed: polled.elapsed,
                polls: polled.polls,
                last_error: polled.last_error,
            });
        }

        let grace = condition.grace.min(self.defaults.max_grace);
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }
        trace!(condition = %condition.description, polls = polled.polls, "wait satisfied");
        Ok(WaitSuccess {
            description: condition.description.clone(),
            elapsed: polled.elapsed,
            polls: polled.polls,
        })
    }

    /// Read snapshots until `check` passes or `timeout` elapses.
    ///
    /// Always evaluates at least one snapshot. Driver errors are remembered
    /// and polling continues. Sleeps never overshoot the deadline.
    pub async fn poll_until<F>(
        &self,
        timeout: Duration,
        poll_interval: Option<Duration>,
        mut check: F,
    ) -> Polled
    where
        F: FnMut(&PageSnapshot) -> bool + Send,
    {
        let interval = self.defaults.effective_poll(poll_interval);
        let start = Instant::now();
        let mut polls = 0u32;
        let mut last_snapshot = None;
        let mut last_error = None;

        loop {
            polls += 1;
            match self.driver.read_snapshot().await {
                Ok(snapshot) => {
                    let satisfied = check(&snapshot);
                    last_snapshot = Some(snapshot);
                    if satisfied {
                        return Polled {
                            satisfied: true,
                            elapsed: start.elapsed(),
                            polls,
                            last_snapshot,
                            last_error,
                        };
                    }
                }
                Err(err) => {
                    trace!(error = %err, "snapshot read failed while polling");
                    last_error = Some(err.to_string());
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Polled {
                    satisfied: false,
                    elapsed,
                    polls,
                    last_snapshot,
                    last_error,
                };
            }
            tokio::time::sleep(interval.min(timeout - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Role;
    use crate::mock::{MockDom, MockDriver};
    use crate::snapshot::SnapshotNode;

    fn fast() -> WaitDefaults {
        WaitDefaults {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
            ..WaitDefaults::default()
        }
    }

    fn dialog_page() -> (MockDriver, crate::mock::NodeId) {
        let mut dom = MockDom::new("https://app.test/contacts");
        let root = dom.root();
        let dialog = dom.add(root, Role::Dialog, "Add contact");
        dom.add(dialog, Role::Button, "Confirm");
        (MockDriver::new(dom), dialog)
    }

    // =========================================================================
    // URL PATTERN
    // =========================================================================

    mod url_pattern_tests {
        use super::*;

        #[test]
        fn test_variants() {
            let url = "https://app.test/contacts/42";
            assert!(UrlPattern::Exact(url.into()).matches(url));
            assert!(UrlPattern::Prefix("https://app.test".into()).matches(url));
            assert!(UrlPattern::Contains("contacts".into()).matches(url));
            assert!(UrlPattern::regex(r"/contacts/\d+$").unwrap().matches(url));
            assert!(UrlPattern::Glob("https://*/contacts/*".into()).matches(url));
            assert!(!UrlPattern::Glob("*/documents/*".into()).matches(url));
            assert!(UrlPattern::Any.matches(""));
        }

        #[test]
        fn test_bad_regex_rejected() {
            assert!(UrlPattern::regex("(").is_err());
            let parsed: Result<UrlPattern, _> = serde_yaml_ng::from_str("regex: \"(\"");
            assert!(parsed.is_err());
        }

        #[test]
        fn test_regex_round_trips_as_text() {
            let pattern: UrlPattern = serde_yaml_ng::from_str("regex: '^https://app\\.test/'").unwrap();
            assert_eq!(pattern, UrlPattern::regex("^https://app\\.test/").unwrap());
            assert_eq!(pattern.to_string(), "/^https://app\\.test//");
            assert!(pattern.matches("https://app.test/contacts"));
        }

        #[test]
        fn test_glob_anchors_last_segment_at_end() {
            let url = "https://a/contacts/x/contacts";
            assert!(UrlPattern::Glob("*/contacts".into()).matches(url));
            assert!(UrlPattern::Glob("https://*/x/*".into()).matches(url));
            assert!(!UrlPattern::Glob("*/x".into()).matches(url));
            assert!(!UrlPattern::Glob("http://*".into()).matches(url));
            assert!(UrlPattern::Glob(url.into()).matches(url));
        }
    }

    // =========================================================================
    // CONDITION LIBRARY
    // =========================================================================

    mod condition_tests {
        use super::*;

        fn snap_with(nodes: Vec<SnapshotNode>) -> PageSnapshot {
            let mut snap = PageSnapshot::new("https://app.test/contacts");
            snap.nodes = nodes;
            snap
        }

        fn textbox(value: &str, enabled: bool) -> SnapshotNode {
            SnapshotNode {
                id: "n1".into(),
                role: Role::Textbox,
                name: "Name".into(),
                parent: None,
                visible: true,
                enabled,
                text: String::new(),
                value: Some(value.into()),
                checked: None,
            }
        }

        #[test]
        fn test_text_equals_reads_input_value() {
            let cond = WaitCondition::text_equals(ElementReference::named(Role::Textbox, "Name"), "QA  One");
            assert!(cond.evaluate(&snap_with(vec![textbox("QA One", true)])));
            assert!(!cond.evaluate(&snap_with(vec![textbox("QA", true)])));
        }

        #[test]
        fn test_actionable_requires_enabled() {
            let cond = WaitCondition::actionable(ElementReference::named(Role::Textbox, "Name"));
            assert!(cond.evaluate(&snap_with(vec![textbox("", true)])));
            assert!(!cond.evaluate(&snap_with(vec![textbox("", false)])));
            assert!(!cond.evaluate(&snap_with(vec![])));
        }

        #[test]
        fn test_network_quiescent() {
            let cond = WaitCondition::network_quiescent(Duration::from_millis(500));
            let mut snap = snap_with(vec![]);
            snap.idle_for_ms = 499;
            assert!(!cond.evaluate(&snap));
            snap.idle_for_ms = 500;
            assert!(cond.evaluate(&snap));
            snap.pending_requests = 1;
            assert!(!cond.evaluate(&snap));
        }

        #[test]
        fn test_descriptions() {
            let cond = WaitCondition::count_equals(ElementReference::role(Role::Row), 3);
            assert_eq!(cond.description(), "count of row == 3");
            let cond = WaitCondition::url_matches(UrlPattern::Contains("/contacts".into()));
            assert_eq!(cond.description(), "url matches */contacts*");
        }

        #[test]
        fn test_builders() {
            let cond = WaitCondition::new("always", |_| true)
                .with_timeout(Duration::from_secs(1))
                .with_grace(Duration::from_millis(5));
            assert_eq!(cond.timeout(), Some(Duration::from_secs(1)));
            assert!(format!("{cond:?}").contains("always"));
        }
    }

    // =========================================================================
    // ENGINE
    // =========================================================================

    mod engine_tests {
        use super::*;

        #[tokio::test]
        async fn test_immediate_success() {
            let (driver, _) = dialog_page();
            let engine = WaitEngine::new(&driver, fast());
            let cond = WaitCondition::element_visible(ElementReference::named(Role::Dialog, "Add contact"));
            let ok = engine.await_condition(&cond).await.unwrap();
            assert_eq!(ok.polls, 1);
        }

        #[tokio::test]
        async fn test_waits_for_deferred_change() {
            let (driver, dialog) = dialog_page();
            driver.with_dom(|dom| {
                dom.defer(Duration::from_millis(40), move |dom| dom.set_visible(dialog, false));
            });
            let engine = WaitEngine::new(&driver, fast());
            let cond = WaitCondition::element_hidden(ElementReference::named(Role::Dialog, "Add contact"));
            let ok = engine.await_condition(&cond).await.unwrap();
            assert!(ok.polls > 1);
            assert!(ok.elapsed >= Duration::from_millis(30));
        }

        #[tokio::test]
        async fn test_times_out_as_value() {
            let (driver, _) = dialog_page();
            let engine = WaitEngine::new(&driver, fast());
            let cond = WaitCondition::element_hidden(ElementReference::named(Role::Dialog, "Add contact"))
                .with_timeout(Duration::from_millis(60));
            let err = engine.await_condition(&cond).await.unwrap_err();
            assert!(err.elapsed >= Duration::from_millis(60));
            assert!(err.elapsed < Duration::from_millis(250));
            assert!(err.to_string().contains("hidden"));
        }

        #[tokio::test]
        async fn test_poll_floor_limits_reads() {
            let (driver, _) = dialog_page();
            let defaults = WaitDefaults {
                min_poll_interval: Duration::from_millis(20),
                ..fast()
            };
            let engine = WaitEngine::new(&driver, defaults);
            let cond = WaitCondition::new("never", |_| false)
                .with_timeout(Duration::from_millis(100))
                .with_poll_interval(Duration::from_millis(1));
            let err = engine.await_condition(&cond).await.unwrap_err();
            // 100ms at a 20ms floor is at most 6 reads plus the final one
            assert!(err.polls <= 7, "polled {} times", err.polls);
        }

        #[tokio::test]
        async fn test_grace_is_capped() {
            let (driver, _) = dialog_page();
            let defaults = WaitDefaults {
                max_grace: Duration::from_millis(20),
                ..fast()
            };
            let engine = WaitEngine::new(&driver, defaults);
            let cond = WaitCondition::new("always", |_| true).with_grace(Duration::from_secs(30));
            let start = Instant::now();
            engine.await_condition(&cond).await.unwrap();
            assert!(start.elapsed() < Duration::from_secs(1));
        }

        #[tokio::test]
        async fn test_driver_errors_are_reported_on_timeout() {
            let (driver, _) = dialog_page();
            driver.fail_snapshots(true);
            let engine = WaitEngine::new(&driver, fast());
            let cond = WaitCondition::new("anything", |_| true).with_timeout(Duration::from_millis(30));
            let err = engine.await_condition(&cond).await.unwrap_err();
            assert!(err.last_error.is_some());
        }
    }
}
