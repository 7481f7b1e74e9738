//! Workflow Orchestrator
//!
//! Runs one [`Workflow`] instance through its state machine:
//!
//! ```text
//! Defined ──► Running ──► Completed ─┐
//!                 │                  ├──► CleanupRunning ──► Terminal
//!                 └─────► Failed ────┘
//! ```
//!
//! Steps run strictly in order and the first failure halts them. Cleanup
//! always runs: nested workflows' cleanup first (innermost, most recent
//! first), then the workflow's own cleanup steps, then release of every test
//! entity registered along the way. A cleanup failure never replaces the
//! step failure as the reported cause.

use crate::action::ActionExecutor;
use crate::config::EngineConfig;
use crate::driver::AutomationDriver;
use crate::evidence::{EvidenceEvent, EvidenceRecorder, NullRecorder, StepEvent};
use crate::lifecycle::{CleanupResult, CleanupRunner, LifecycleManager, TestDataHandle};
use crate::retry::{classify, with_retry, FailureCategory, FailurePhase, FailureRecord};
use crate::verify::{Capture, Comparable, Verifier};
use crate::wait::WaitEngine;
use crate::workflow::{EntityRegistration, Workflow, WorkflowStep};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, info, info_span, warn, Instrument};

/// Run state of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Built, not started
    Defined,
    /// Steps executing
    Running,
    /// All steps passed
    Completed,
    /// A step failed
    Failed,
    /// Cleanup executing
    CleanupRunning,
    /// Done
    Terminal,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Defined => "defined",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::CleanupRunning => "cleanup-running",
            Self::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// Final status reported to the test runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps and cleanup all passed
    Completed,
    /// Steps passed, some cleanup failed
    CompletedWithCleanupIssues,
    /// A step failed
    Failed,
}

/// Outcome of one workflow run
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// Workflow name
    pub name: String,
    /// Final status
    pub status: WorkflowStatus,
    /// The step failure first (if any), then cleanup failures
    pub failures: Vec<FailureRecord>,
    /// One result per cleanup step list and per registered entity
    pub cleanup_results: Vec<CleanupResult>,
    /// Steps started, including nested and cleanup steps
    pub steps_executed: usize,
    /// Wall time
    pub duration: Duration,
    /// States visited, in order
    pub states: Vec<WorkflowState>,
}

impl WorkflowResult {
    /// Steps and cleanup all passed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// The reported cause: the step failure, or the first cleanup failure
    #[must_use]
    pub fn cause(&self) -> Option<&FailureRecord> {
        self.failures.first()
    }

    /// Cleanup results that failed
    pub fn cleanup_failures(&self) -> impl Iterator<Item = &CleanupResult> {
        self.cleanup_results.iter().filter(|r| !r.is_cleaned())
    }

    /// Multi-line human summary
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{}: {:?} in {}ms ({} steps)",
            self.name,
            self.status,
            self.duration.as_millis(),
            self.steps_executed
        );
        for failure in &self.failures {
            out.push_str(&format!("\n  - {failure}"));
        }
        out
    }
}

/// Deferred cleanup work of one workflow instance
struct Frame {
    name: String,
    cleanup: Vec<WorkflowStep>,
    children: Vec<Frame>,
    lifecycle: LifecycleManager,
    interacted: bool,
    in_cleanup: bool,
}

impl Frame {
    fn new(name: String, cleanup: Vec<WorkflowStep>, in_cleanup: bool) -> Self {
        Self {
            name,
            cleanup,
            children: Vec::new(),
            lifecycle: LifecycleManager::new(),
            interacted: false,
            in_cleanup,
        }
    }

    fn register(&mut self, entity: EntityRegistration) {
        info!(workflow = %self.name, kind = %entity.kind, key = %entity.key, "test data registered");
        self.lifecycle
            .register(TestDataHandle::new(entity.kind, entity.key, entity.cleanup));
    }
}

/// Baselines for the delta claims of one step list, captured from a single
/// snapshot right before the list's first state-changing step
struct Baselines {
    needed: Vec<(usize, Capture)>,
    values: Option<Result<HashMap<usize, Comparable>, String>>,
}

impl Baselines {
    /// Claims with no action or nested workflow before them get no baseline
    fn plan(steps: &[WorkflowStep]) -> Self {
        let Some(first_trigger) = steps.iter().position(|step| {
            matches!(step, WorkflowStep::Action { .. } | WorkflowStep::Workflow { .. })
        }) else {
            return Self {
                needed: Vec::new(),
                values: None,
            };
        };
        let needed = steps
            .iter()
            .enumerate()
            .skip(first_trigger + 1)
            .filter_map(|(i, step)| match step {
                WorkflowStep::Verify(claim) if claim.needs_baseline() => {
                    Some((i, claim.capture().clone()))
                }
                _ => None,
            })
            .collect();
        Self {
            needed,
            values: None,
        }
    }

    async fn capture_if_pending<D: AutomationDriver + ?Sized>(&mut self, driver: &D) {
        if self.values.is_some() || self.needed.is_empty() {
            return;
        }
        self.values = Some(match driver.read_snapshot().await {
            Ok(snapshot) => Ok(self
                .needed
                .iter()
                .map(|(i, capture)| (*i, capture.read(&snapshot)))
                .collect()),
            Err(err) => {
                warn!(error = %err, "baseline snapshot failed");
                Err(err.to_string())
            }
        });
    }

    fn get(&self, index: usize) -> Result<Option<&Comparable>, String> {
        match &self.values {
            Some(Ok(values)) => Ok(values.get(&index)),
            Some(Err(err)) => Err(err.clone()),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
struct RunStats {
    steps_executed: usize,
}

/// One exclusively owned automation session running workflows
pub struct Session<D> {
    driver: D,
    config: EngineConfig,
    recorder: Arc<dyn EvidenceRecorder>,
}

impl<D: fmt::Debug> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("driver", &self.driver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: AutomationDriver + 'static> Session<D> {
    /// Create a session that discards evidence
    #[must_use]
    pub fn new(driver: D, config: EngineConfig) -> Self {
        Self {
            driver,
            config,
            recorder: Arc::new(NullRecorder),
        }
    }

    /// Send evidence to `recorder`
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn EvidenceRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// The driver
    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// The configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Release the driver
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Run a workflow to its terminal state. Never panics on step failure and
    /// never skips cleanup.
    pub async fn run(&self, workflow: Workflow) -> WorkflowResult {
        let span = info_span!("workflow", name = %workflow.name);
        self.execute(workflow).instrument(span).await
    }

    async fn execute(&self, workflow: Workflow) -> WorkflowResult {
        let started = Instant::now();
        let Workflow {
            name,
            steps,
            cleanup,
        } = workflow;
        let mut states = vec![WorkflowState::Defined];
        let mut stats = RunStats::default();
        let mut frame = Frame::new(name.clone(), cleanup, false);

        transition(&name, &mut states, WorkflowState::Running);
        let outcome = self
            .run_steps(&mut frame, steps, Vec::new(), &mut stats)
            .await;
        transition(
            &name,
            &mut states,
            if outcome.is_ok() {
                WorkflowState::Completed
            } else {
                WorkflowState::Failed
            },
        );

        transition(&name, &mut states, WorkflowState::CleanupRunning);
        let mut cleanup_results = Vec::new();
        self.release_frame(frame, &mut cleanup_results, &mut stats)
            .await;
        transition(&name, &mut states, WorkflowState::Terminal);

        let step_failed = outcome.is_err();
        let mut failures: Vec<FailureRecord> = outcome.err().into_iter().collect();
        failures.extend(cleanup_results.iter().filter_map(|r| r.failure.clone()));

        let status = if step_failed {
            WorkflowStatus::Failed
        } else if cleanup_results.iter().any(|r| !r.is_cleaned()) {
            WorkflowStatus::CompletedWithCleanupIssues
        } else {
            WorkflowStatus::Completed
        };
        info!(workflow = %name, status = ?status, steps = stats.steps_executed, "workflow finished");

        WorkflowResult {
            name,
            status,
            failures,
            cleanup_results,
            steps_executed: stats.steps_executed,
            duration: started.elapsed(),
            states,
        }
    }

    fn run_steps<'a>(
        &'a self,
        frame: &'a mut Frame,
        steps: Vec<WorkflowStep>,
        path: Vec<usize>,
        stats: &'a mut RunStats,
    ) -> BoxFuture<'a, Result<(), FailureRecord>> {
        Box::pin(async move {
            let mut baselines = Baselines::plan(&steps);
            for (index, step) in steps.into_iter().enumerate() {
                let mut step_path = path.clone();
                step_path.push(index);

                if matches!(step, WorkflowStep::Action { .. } | WorkflowStep::Workflow { .. }) {
                    baselines.capture_if_pending(&self.driver).await;
                }

                stats.steps_executed += 1;
                let description = step.describe();
                self.emit(frame, &step_path, StepEvent::StepStarted, &description, None);

                let span = debug_span!("step", path = ?step_path, step = %description);
                let outcome = self
                    .run_step(frame, step, &step_path, &baselines, index, stats)
                    .instrument(span)
                    .await;

                match outcome {
                    Ok(()) => {
                        self.emit(frame, &step_path, StepEvent::StepSucceeded, &description, None);
                    }
                    Err(mut failure) => {
                        let mut snapshot_ref = None;
                        if failure.workflow.is_none() {
                            failure.workflow = Some(frame.name.clone());
                            failure.step_path.clone_from(&step_path);
                            snapshot_ref = self.capture_failure_snapshot().await;
                        }
                        warn!(workflow = %frame.name, failure = %failure, "step failed");
                        self.emit(frame, &step_path, StepEvent::StepFailed, &description, snapshot_ref);
                        return Err(failure);
                    }
                }
            }
            Ok(())
        })
    }

    fn run_step<'a>(
        &'a self,
        frame: &'a mut Frame,
        step: WorkflowStep,
        path: &'a [usize],
        baselines: &'a Baselines,
        index: usize,
        stats: &'a mut RunStats,
    ) -> BoxFuture<'a, Result<(), FailureRecord>> {
        Box::pin(async move {
            let policy = self.config.retry;
            match step {
                WorkflowStep::Action { action, creates } => {
                    let executor = ActionExecutor::new(&self.driver, self.config.wait_defaults());
                    let interacted = AtomicBool::new(false);
                    let (exec, act, flag) = (&executor, &action, &interacted);
                    let result = with_retry(&policy, move |_| async move {
                        let outcome = exec.execute(act).await;
                        if side_effect_possible(&outcome) {
                            flag.store(true, Ordering::SeqCst);
                        }
                        outcome
                    })
                    .await;

                    // The entity may exist even when the postcondition failed
                    if interacted.load(Ordering::SeqCst) {
                        frame.interacted = true;
                        if let Some(entity) = creates {
                            frame.register(entity);
                        }
                    }
                    let report = result?;
                    debug!(handle = %report.handle_id, elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX), "action done");
                    Ok(())
                }
                WorkflowStep::Verify(claim) => {
                    let baseline = if claim.needs_baseline() {
                        let baseline = baselines.get(index).map_err(|err| {
                            FailureRecord::new(
                                FailureCategory::Unknown,
                                FailurePhase::Verification,
                                claim.description(),
                                format!("baseline unavailable: {err}"),
                            )
                        })?;
                        if baseline.is_none() {
                            return Err(FailureRecord::assertion(
                                claim.description(),
                                "no baseline: no action or nested workflow precedes this claim",
                            ));
                        }
                        baseline
                    } else {
                        None
                    };
                    let verifier = Verifier::new(&self.driver, self.config.wait_defaults());
                    let verified = verifier.verify(&claim, baseline).await?;
                    debug!(claim = %verified.description, observed = %verified.observed, "verified");
                    Ok(())
                }
                WorkflowStep::Workflow { workflow, creates } => {
                    let Workflow {
                        name,
                        steps,
                        cleanup,
                    } = *workflow;
                    info!(parent = %frame.name, workflow = %name, "entering nested workflow");
                    let mut child = Frame::new(name, cleanup, frame.in_cleanup);
                    let result = self.run_steps(&mut child, steps, path.to_vec(), stats).await;
                    let interacted = child.interacted;
                    frame.children.push(child);
                    if interacted {
                        frame.interacted = true;
                        if let Some(entity) = creates {
                            frame.register(entity);
                        }
                    }
                    result
                }
                WorkflowStep::Navigate(target) => {
                    let url = self.config.resolve_url(&target);
                    let context = format!("navigate to {url}");
                    let (driver, url_ref, ctx) = (&self.driver, url.as_str(), context.as_str());
                    with_retry(&policy, move |_| async move {
                        driver
                            .navigate(url_ref)
                            .await
                            .map_err(|err| classify(&err, FailurePhase::Synchronization, ctx))
                    })
                    .await
                }
                WorkflowStep::Wait(condition) => {
                    let condition = if condition.grace().is_zero() && self.config.grace_period_ms > 0 {
                        condition.with_grace(Duration::from_millis(self.config.grace_period_ms))
                    } else {
                        condition
                    };
                    let waits = WaitEngine::new(&self.driver, self.config.wait_defaults());
                    let (engine, cond) = (&waits, &condition);
                    with_retry(&policy, move |_| async move {
                        engine.await_condition(cond).await.map(|_| ()).map_err(|t| {
                            FailureRecord::timed_out(&t, FailurePhase::Synchronization, cond.description())
                        })
                    })
                    .await
                }
            }
        })
    }

    fn release_frame<'a>(
        &'a self,
        frame: Frame,
        results: &'a mut Vec<CleanupResult>,
        stats: &'a mut RunStats,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Frame {
                name,
                cleanup,
                children,
                mut lifecycle,
                ..
            } = frame;

            for child in children.into_iter().rev() {
                self.release_frame(child, results, stats).await;
            }

            if !cleanup.is_empty() {
                let mut cleanup_frame = Frame::new(name.clone(), Vec::new(), true);
                match self
                    .run_steps(&mut cleanup_frame, cleanup, Vec::new(), stats)
                    .await
                {
                    Ok(()) => results.push(CleanupResult::cleaned("workflow", name.as_str())),
                    Err(failure) => {
                        warn!(workflow = %name, failure = %failure, "cleanup steps failed");
                        results.push(CleanupResult::failed("workflow", name.as_str(), failure));
                    }
                }
                self.release_frame(cleanup_frame, results, stats).await;
            }

            if lifecycle.pending() > 0 {
                results.extend(lifecycle.release_all(self).await);
            }
        })
    }

    fn emit(
        &self,
        frame: &Frame,
        path: &[usize],
        event: StepEvent,
        description: &str,
        snapshot_ref: Option<String>,
    ) {
        let description = if frame.in_cleanup {
            format!("cleanup: {description}")
        } else {
            description.to_string()
        };
        let mut evidence = EvidenceEvent::new(frame.name.clone(), path.to_vec(), event, description);
        evidence.snapshot_ref = snapshot_ref;
        self.recorder.record(evidence);
    }

    async fn capture_failure_snapshot(&self) -> Option<String> {
        match self.driver.read_snapshot().await {
            Ok(snapshot) => {
                let snapshot_ref = uuid::Uuid::new_v4().to_string();
                self.recorder.record_snapshot(&snapshot_ref, &snapshot);
                Some(snapshot_ref)
            }
            Err(err) => {
                debug!(error = %err, "no failure snapshot");
                None
            }
        }
    }
}

#[async_trait]
impl<D: AutomationDriver + 'static> CleanupRunner for Session<D> {
    async fn run_cleanup(&self, workflow: Workflow) -> Result<(), FailureRecord> {
        let name = workflow.name.clone();
        let result = self.execute(workflow).await;
        match result.status {
            WorkflowStatus::Completed => Ok(()),
            _ => Err(result.failures.into_iter().next().unwrap_or_else(|| {
                FailureRecord::new(
                    FailureCategory::Unknown,
                    FailurePhase::Cleanup,
                    name,
                    "cleanup workflow did not complete",
                )
            })),
        }
    }
}

/// Whether the page may have seen the interaction
fn side_effect_possible<T>(outcome: &Result<T, FailureRecord>) -> bool {
    match outcome {
        Ok(_) => true,
        Err(f) => {
            f.phase == FailurePhase::Postcondition
                || (f.phase == FailurePhase::Interaction && f.category == FailureCategory::Timeout)
        }
    }
}

fn transition(name: &str, states: &mut Vec<WorkflowState>, next: WorkflowState) {
    if let Some(previous) = states.last() {
        info!(workflow = %name, from = %previous, to = %next, "workflow state");
    }
    states.push(next);
}
