//! Test Data Lifecycle Manager
//!
//! Tracks every entity a workflow run created and guarantees one cleanup
//! attempt per entity, whatever happened to the run's assertions.
//!
//! - **Exactly once**: [`LifecycleManager::release_all`] drains its handles, so
//!   a handle's cleanup cannot be attempted twice
//! - **No short-circuit**: one failed cleanup does not stop the others
//! - **Collision-free keys**: [`unique_key`] never repeats across runs or
//!   concurrent workflows

use crate::retry::FailureRecord;
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// A created entity that must not outlive the test
#[derive(Debug)]
pub struct TestDataHandle {
    /// Entity kind, e.g. "contact"
    pub entity_kind: String,
    /// Identifying key
    pub key: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Workflow that removes the entity
    pub cleanup: Workflow,
}

impl TestDataHandle {
    /// Create a handle stamped now
    #[must_use]
    pub fn new(entity_kind: impl Into<String>, key: impl Into<String>, cleanup: Workflow) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            key: key.into(),
            created_at: Utc::now(),
            cleanup,
        }
    }
}

/// Outcome of one cleanup attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// Entity removed
    Cleaned,
    /// Cleanup ran and failed
    CleanupFailed(String),
}

/// Cleanup result for one entity (or one cleanup step list)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// Entity kind, or "workflow" for a workflow's own cleanup steps
    pub entity_kind: String,
    /// Entity key, or the workflow name
    pub key: String,
    /// Outcome
    pub outcome: CleanupOutcome,
    /// Failure behind a `CleanupFailed` outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl CleanupResult {
    /// Successful cleanup
    #[must_use]
    pub fn cleaned(entity_kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            key: key.into(),
            outcome: CleanupOutcome::Cleaned,
            failure: None,
        }
    }

    /// Failed cleanup
    #[must_use]
    pub fn failed(
        entity_kind: impl Into<String>,
        key: impl Into<String>,
        failure: FailureRecord,
    ) -> Self {
        let failure = failure.into_cleanup();
        Self {
            entity_kind: entity_kind.into(),
            key: key.into(),
            outcome: CleanupOutcome::CleanupFailed(failure.to_string()),
            failure: Some(failure),
        }
    }

    /// Whether the entity was removed
    #[must_use]
    pub const fn is_cleaned(&self) -> bool {
        matches!(self.outcome, CleanupOutcome::Cleaned)
    }
}

/// Runs a cleanup workflow to completion
#[async_trait]
pub trait CleanupRunner: Send + Sync {
    /// Run `workflow`; `Err` carries the failure that stopped it
    async fn run_cleanup(&self, workflow: Workflow) -> Result<(), FailureRecord>;
}

/// Owns test-data handles from registration until their cleanup was attempted
#[derive(Debug, Default)]
pub struct LifecycleManager {
    handles: Vec<TestDataHandle>,
}

impl LifecycleManager {
    /// Create an empty manager
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Take ownership of a handle
    pub fn register(&mut self, handle: TestDataHandle) {
        debug!(kind = %handle.entity_kind, key = %handle.key, "registered test data");
        self.handles.push(handle);
    }

    /// Handles not yet released
    #[must_use]
    pub fn pending(&self) -> usize {
        self.handles.len()
    }

    /// Keys of handles not yet released, in registration order
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.key.as_str()).collect()
    }

    /// Attempt every handle's cleanup, newest first.
    ///
    /// Never stops at a failure. Handles are consumed, so each cleanup is
    /// attempted exactly once.
    pub async fn release_all(&mut self, runner: &dyn CleanupRunner) -> Vec<CleanupResult> {
        let mut results = Vec::with_capacity(self.handles.len());
        while let Some(handle) = self.handles.pop() {
            let TestDataHandle {
                entity_kind,
                key,
                cleanup,
                ..
            } = handle;
            match runner.run_cleanup(cleanup).await {
                Ok(()) => {
                    debug!(kind = %entity_kind, key = %key, "test data cleaned");
                    results.push(CleanupResult::cleaned(entity_kind, key));
                }
                Err(failure) => {
                    warn!(kind = %entity_kind, key = %key, failure = %failure, "test data cleanup failed");
                    results.push(CleanupResult::failed(entity_kind, key, failure));
                }
            }
        }
        results
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        for handle in &self.handles {
            warn!(kind = %handle.entity_kind, key = %handle.key, "test data dropped without cleanup");
        }
    }
}

static KEY_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Collision-free key: prefix, UTC timestamp, process sequence and a random
/// suffix, e.g. `QA_Test_20261019T101502_0007_3f9a1c2e`
#[must_use]
pub fn unique_key(prefix: &str) -> String {
    let seq = KEY_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}_{}_{seq:04}_{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        &random[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{FailureCategory, FailurePhase};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        ran: Mutex<Vec<String>>,
        fail: Vec<String>,
    }

    #[async_trait]
    impl CleanupRunner for RecordingRunner {
        async fn run_cleanup(&self, workflow: Workflow) -> Result<(), FailureRecord> {
            self.ran.lock().unwrap().push(workflow.name.clone());
            if self.fail.contains(&workflow.name) {
                return Err(FailureRecord::new(
                    FailureCategory::Timeout,
                    FailurePhase::Precondition,
                    "click button \"Delete\"",
                    "row never appeared",
                ));
            }
            Ok(())
        }
    }

    fn handle(key: &str) -> TestDataHandle {
        TestDataHandle::new("contact", key, Workflow::new(format!("delete {key}")))
    }

    #[tokio::test]
    async fn test_release_all_is_lifo_and_complete() {
        let runner = RecordingRunner {
            fail: vec!["delete b".to_string()],
            ..RecordingRunner::default()
        };
        let mut manager = LifecycleManager::new();
        for key in ["a", "b", "c"] {
            manager.register(handle(key));
        }
        assert_eq!(manager.keys(), vec!["a", "b", "c"]);

        let results = manager.release_all(&runner).await;
        assert_eq!(
            *runner.ran.lock().unwrap(),
            vec!["delete c", "delete b", "delete a"]
        );
        assert_eq!(results.len(), 3);
        assert!(results[0].is_cleaned());
        assert!(!results[1].is_cleaned());
        assert!(results[2].is_cleaned());
        assert_eq!(
            results[1].failure.as_ref().map(|f| f.category),
            Some(FailureCategory::CleanupFailed)
        );
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_release_twice_runs_once() {
        let runner = RecordingRunner::default();
        let mut manager = LifecycleManager::new();
        manager.register(handle("a"));
        manager.release_all(&runner).await;
        let second = manager.release_all(&runner).await;
        assert!(second.is_empty());
        assert_eq!(runner.ran.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cleanup_result_serializes() {
        let json = serde_json::to_value(CleanupResult::cleaned("contact", "QA_1")).unwrap();
        assert_eq!(json["outcome"]["status"], "cleaned");
    }

    #[test]
    fn test_unique_key_shape() {
        let key = unique_key("QA_Test");
        assert!(key.starts_with("QA_Test_"));
        assert_eq!(key.split('_').count(), 5);
    }

    proptest! {
        #[test]
        fn prop_unique_keys_never_collide(n in 1usize..200) {
            let keys: HashSet<String> = (0..n).map(|_| unique_key("QA")).collect();
            prop_assert_eq!(keys.len(), n);
        }
    }

    #[test]
    fn test_unique_keys_across_threads() {
        let keys: Vec<String> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..250).map(|_| unique_key("QA")).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        let unique: HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), 1000);
    }
}
