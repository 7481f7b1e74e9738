//! Failure classification and bounded retry.
//!
//! Every locator, wait and action failure becomes a [`FailureRecord`] with a
//! [`FailureCategory`]. Only transient categories are retried, with linear
//! backoff and a fixed budget; exhausting the budget surfaces the original
//! classified failure.

use crate::result::FlowError;
use crate::wait::TimedOut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Element absent, ambiguous, or of the wrong kind
    ResolutionFailure,
    /// A wait condition never became true
    Timeout,
    /// A resolved handle was invalidated before use
    StaleElement,
    /// A verification claim evaluated false
    AssertionFailure,
    /// A cleanup step itself failed
    CleanupFailed,
    /// Anything else (driver crash, navigation error)
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResolutionFailure => "resolution failure",
            Self::Timeout => "timeout",
            Self::StaleElement => "stale element",
            Self::AssertionFailure => "assertion failure",
            Self::CleanupFailed => "cleanup failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Where in a step the failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// Waiting for the target to be actionable
    Precondition,
    /// Resolving the target reference
    Resolution,
    /// Performing the interaction
    Interaction,
    /// Waiting for the action's postcondition
    Postcondition,
    /// Standalone wait or navigation step
    Synchronization,
    /// Evaluating a verification claim
    Verification,
    /// Running cleanup
    Cleanup,
}

/// A classified failure, carrying enough context to explain itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Category
    pub category: FailureCategory,
    /// Phase
    pub phase: FailurePhase,
    /// What was being attempted
    pub context: String,
    /// What went wrong
    pub detail: String,
    /// Whether a retry may succeed
    pub retryable: bool,
    /// Attempts made before surfacing
    pub attempts: u32,
    /// Step position, outermost first (`[2, 0]` is step 0 of the workflow at step 2)
    #[serde(default)]
    pub step_path: Vec<usize>,
    /// Workflow the step belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

impl FailureRecord {
    /// Create a record with the category's default retryability
    #[must_use]
    pub fn new(
        category: FailureCategory,
        phase: FailurePhase,
        context: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            category,
            phase,
            context: context.into(),
            detail: detail.into(),
            retryable: matches!(
                category,
                FailureCategory::Timeout | FailureCategory::StaleElement
            ),
            attempts: 1,
            step_path: Vec::new(),
            workflow: None,
        }
    }

    /// Nothing matched the reference; it may still render, so retryable
    #[must_use]
    pub fn not_found(phase: FailurePhase, context: impl Into<String>, reference: &str) -> Self {
        Self::new(
            FailureCategory::ResolutionFailure,
            phase,
            context,
            format!("no element matches {reference}"),
        )
        .with_retryable(true)
    }

    /// Several elements matched; only a more specific reference helps
    #[must_use]
    pub fn ambiguous(
        phase: FailurePhase,
        context: impl Into<String>,
        reference: &str,
        count: usize,
    ) -> Self {
        Self::new(
            FailureCategory::ResolutionFailure,
            phase,
            context,
            format!("{count} elements match {reference}; add a scope or an explicit ordinal"),
        )
    }

    /// Element is of a kind the interaction cannot target
    #[must_use]
    pub fn wrong_kind(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            FailureCategory::ResolutionFailure,
            FailurePhase::Resolution,
            context,
            detail,
        )
    }

    /// A wait condition timed out
    #[must_use]
    pub fn timed_out(timeout: &TimedOut, phase: FailurePhase, context: impl Into<String>) -> Self {
        let mut detail = timeout.to_string();
        if let Some(err) = &timeout.last_error {
            detail.push_str(&format!("; last driver error: {err}"));
        }
        Self::new(FailureCategory::Timeout, phase, context, detail)
    }

    /// A claim evaluated false
    #[must_use]
    pub fn assertion(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            FailureCategory::AssertionFailure,
            FailurePhase::Verification,
            context,
            detail,
        )
    }

    /// Override retryability
    #[must_use]
    pub const fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Set the attempt count
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Mark that the step's side effect has already happened.
    ///
    /// A non-idempotent interaction must not be repeated once it reached the
    /// page, so the failure stops being retryable.
    #[must_use]
    pub fn after_side_effect(mut self, idempotent: bool) -> Self {
        if !idempotent && self.retryable {
            self.retryable = false;
            self.detail
                .push_str(" (interaction already performed; not repeated)");
        }
        self
    }

    /// Re-file the failure as a cleanup failure, keeping its detail
    #[must_use]
    pub fn into_cleanup(mut self) -> Self {
        self.detail = format!("{}: {}", self.category, self.detail);
        self.category = FailureCategory::CleanupFailed;
        self.phase = FailurePhase::Cleanup;
        self.retryable = false;
        self
    }

    /// Whether the failure signals a defect in the system under test
    #[must_use]
    pub const fn is_defect_signal(&self) -> bool {
        matches!(self.category, FailureCategory::AssertionFailure)
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(workflow) = &self.workflow {
            write!(f, "[{workflow}")?;
            for i in &self.step_path {
                write!(f, ".{i}")?;
            }
            f.write_str("] ")?;
        }
        write!(f, "{}: {} - {}", self.category, self.context, self.detail)?;
        if self.attempts > 1 {
            write!(f, " (after {} attempts)", self.attempts)?;
        }
        Ok(())
    }
}

/// Classify a raw driver or construction error
#[must_use]
pub fn classify(error: &FlowError, phase: FailurePhase, context: impl Into<String>) -> FailureRecord {
    let detail = error.to_string();
    match error {
        FlowError::StaleElement { .. } => {
            FailureRecord::new(FailureCategory::StaleElement, phase, context, detail)
        }
        FlowError::Timeout { .. } => {
            FailureRecord::new(FailureCategory::Timeout, phase, context, detail)
        }
        // Disabled or covered elements usually become actionable shortly
        FlowError::NotInteractable { .. } => {
            FailureRecord::new(FailureCategory::ResolutionFailure, phase, context, detail)
                .with_retryable(true)
        }
        _ => FailureRecord::new(FailureCategory::Unknown, phase, context, detail),
    }
}

/// Retry budget with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,
    /// Backoff added per attempt: attempt `n` waits `n * step`
    pub backoff_step_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(max_attempts: u32, backoff_step_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_step_ms,
        }
    }

    /// Single attempt, no retry
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, 0)
    }

    /// Delay after failed attempt `attempt` (1-based)
    #[must_use]
    pub const fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(attempt as u64))
    }
}

/// Run `op` until it succeeds, fails non-retryably, or the budget runs out.
///
/// `op` receives the 1-based attempt number. A non-retryable failure is
/// returned immediately; an exhausted budget returns the *first* failure with
/// its attempt count set.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, FailureRecord>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FailureRecord>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut original: Option<FailureRecord> = None;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) if !failure.retryable => return Err(failure.with_attempts(attempt)),
            Err(failure) => {
                if attempt >= max_attempts {
                    let surfaced = original.unwrap_or(failure);
                    return Err(surfaced.with_attempts(attempt));
                }
                let delay = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    category = %failure.category,
                    context = %failure.context,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying after transient failure"
                );
                original.get_or_insert(failure);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout_failure(detail: &str) -> FailureRecord {
        FailureRecord::new(
            FailureCategory::Timeout,
            FailurePhase::Precondition,
            "click button \"Save\"",
            detail,
        )
    }

    mod classify_tests {
        use super::*;

        #[test]
        fn test_transient_errors_are_retryable() {
            let r = classify(&FlowError::stale("n4"), FailurePhase::Interaction, "click");
            assert_eq!(r.category, FailureCategory::StaleElement);
            assert!(r.retryable);

            let r = classify(&FlowError::Timeout { ms: 100 }, FailurePhase::Interaction, "click");
            assert_eq!(r.category, FailureCategory::Timeout);
            assert!(r.retryable);
        }

        #[test]
        fn test_unknown_is_not_retryable() {
            let r = classify(&FlowError::driver("socket closed"), FailurePhase::Interaction, "fill");
            assert_eq!(r.category, FailureCategory::Unknown);
            assert!(!r.retryable);
        }

        #[test]
        fn test_resolution_retryability() {
            assert!(FailureRecord::not_found(FailurePhase::Resolution, "c", "button").retryable);
            assert!(!FailureRecord::ambiguous(FailurePhase::Resolution, "c", "button", 2).retryable);
            assert!(!FailureRecord::wrong_kind("c", "checkbox is not selectable").retryable);
        }

        #[test]
        fn test_assertion_never_retryable() {
            let r = FailureRecord::assertion("row count", "expected +1, observed 0");
            assert!(!r.retryable);
            assert!(r.is_defect_signal());
        }

        #[test]
        fn test_after_side_effect() {
            let r = timeout_failure("dialog hidden").after_side_effect(false);
            assert!(!r.retryable);
            let r = timeout_failure("dialog hidden").after_side_effect(true);
            assert!(r.retryable);
        }

        #[test]
        fn test_into_cleanup() {
            let r = timeout_failure("row gone").into_cleanup();
            assert_eq!(r.category, FailureCategory::CleanupFailed);
            assert_eq!(r.phase, FailurePhase::Cleanup);
            assert!(r.detail.starts_with("timeout: "));
        }

        #[test]
        fn test_display_with_path() {
            let mut r = FailureRecord::assertion("row count", "expected 3, observed 2");
            r.workflow = Some("create contact".into());
            r.step_path = vec![3, 1];
            assert_eq!(
                r.to_string(),
                "[create contact.3.1] assertion failure: row count - expected 3, observed 2"
            );
        }
    }

    mod with_retry_tests {
        use super::*;

        fn quick(max: u32) -> RetryPolicy {
            RetryPolicy::new(max, 1)
        }

        #[tokio::test]
        async fn test_success_after_transient() {
            let calls = AtomicU32::new(0);
            let result = with_retry(&quick(3), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(timeout_failure("not yet"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
            assert_eq!(result.unwrap(), 2);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn test_exhaustion_surfaces_original() {
            let result: Result<(), _> = with_retry(&quick(3), |attempt| async move {
                if attempt == 1 {
                    Err(timeout_failure("first"))
                } else {
                    Err(FailureRecord::new(
                        FailureCategory::StaleElement,
                        FailurePhase::Interaction,
                        "click",
                        "later",
                    ))
                }
            })
            .await;
            let failure = result.unwrap_err();
            assert_eq!(failure.category, FailureCategory::Timeout);
            assert_eq!(failure.detail, "first");
            assert_eq!(failure.attempts, 3);
        }

        #[tokio::test]
        async fn test_assertion_not_retried() {
            let calls = AtomicU32::new(0);
            let result: Result<(), _> = with_retry(&quick(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FailureRecord::assertion("count", "expected +1, observed 0")) }
            })
            .await;
            assert_eq!(result.unwrap_err().attempts, 1);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_zero_budget_still_runs_once() {
            let calls = AtomicU32::new(0);
            let _ = with_retry(&RetryPolicy::new(0, 0), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(timeout_failure("x")) }
            })
            .await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn test_linear_backoff() {
            let p = RetryPolicy::new(4, 200);
            assert_eq!(p.backoff(1), Duration::from_millis(200));
            assert_eq!(p.backoff(3), Duration::from_millis(600));
        }
    }

    proptest! {
        #[test]
        fn prop_retry_attempts_bounded(max in 0u32..6, fail_until in 0u32..10) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let calls = AtomicU32::new(0);
            let result = rt.block_on(with_retry(&RetryPolicy::new(max, 0), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt <= fail_until {
                        Err(timeout_failure("transient"))
                    } else {
                        Ok(())
                    }
                }
            }));
            let budget = max.max(1);
            let made = calls.load(Ordering::SeqCst);
            prop_assert!(made <= budget);
            if fail_until < budget {
                prop_assert!(result.is_ok());
                prop_assert_eq!(made, fail_until + 1);
            } else {
                let failure = result.unwrap_err();
                prop_assert_eq!(failure.category, FailureCategory::Timeout);
                prop_assert_eq!(failure.attempts, budget);
            }
        }
    }
}
