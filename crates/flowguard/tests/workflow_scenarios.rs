//! End-to-end workflow scenarios against the scripted contacts app.

mod common;

use common::{
    button, config, contact, contacts_app, dialog, in_dialog, row, rows, SEEDED,
};
use flowguard::mock::{MockDom, MockDriver};
use flowguard::{
    unique_key, with_retry, Action, ActionExecutor, Capture, ChannelRecorder, ClaimError,
    ElementReference, EvidenceMessage, Expected, FailureCategory, FailurePhase, FailureRecord,
    LocatorResolver, Resolution, RetryPolicy, Role, Session, StepEvent, ValueKind,
    VerificationClaim, WaitCondition, Workflow, WorkflowStatus,
};
use flowguard::wait::MAX_GRACE_MS;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn create_contact(name: &str, email: &str) -> Workflow {
    Workflow::new("create contact")
        .navigate("/contacts")
        .then(Action::click(button("Add contact")))
        .then(Action::fill(in_dialog(Role::Textbox, "Name"), name))
        .then(Action::fill(in_dialog(Role::Textbox, "Email"), email))
        .creating(Action::click(in_dialog(Role::Button, "Confirm")), contact(name))
        .then(WaitCondition::element_hidden(dialog()))
        .verify(VerificationClaim::count_delta(rows(), 1))
        .verify(VerificationClaim::names_include(rows(), name))
}

// =============================================================================
// Create / cancel / delete
// =============================================================================

#[tokio::test]
async fn test_create_contact_and_clean_up() {
    let common::ContactsApp {
        driver,
        ids,
        deletes,
    } = contacts_app();
    let session = Session::new(driver, config());

    let result = session
        .run(create_contact("QA_Test_17001", "qa17001@test.local"))
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed, "{}", result.summary());
    assert_eq!(result.cleanup_results.len(), 1);
    assert_eq!(result.cleanup_results[0].key, "QA_Test_17001");
    assert!(result.cleanup_results[0].is_cleaned());
    assert!(session.driver().was_called("navigate:https://contacts.test/contacts"));

    // Cleanup brought the table back to its baseline
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
    assert_eq!(common::row_names(session.driver(), &ids), SEEDED.to_vec());
}

#[tokio::test]
async fn test_cancel_add_leaves_no_entity() {
    let app = contacts_app();
    let session = Session::new(app.driver, config());

    let workflow = Workflow::new("cancel add")
        .then(Action::click(button("Add contact")))
        .then(Action::fill(in_dialog(Role::Textbox, "Name"), "Cancel_Me"))
        .then(Action::click(in_dialog(Role::Button, "Cancel")))
        .then(WaitCondition::element_hidden(dialog()))
        .verify(VerificationClaim::count_delta(rows(), 0))
        .verify(VerificationClaim::names_exclude(rows(), "Cancel_Me"));

    let result = session.run(workflow).await;
    assert!(result.is_success(), "{}", result.summary());
    assert!(result.cleanup_results.is_empty());
}

#[tokio::test]
async fn test_delete_contact_counts_minus_one() {
    let app = contacts_app();
    let session = Session::new(app.driver, config());

    let workflow = Workflow::new("delete contact")
        .then(Action::click(button("Delete").within(row("Carl Cox"))))
        .then(WaitCondition::element_hidden(row("Carl Cox")))
        .verify(VerificationClaim::count_delta(rows(), -1))
        .verify(VerificationClaim::names_exclude(rows(), "Carl Cox"));

    let result = session.run(workflow).await;
    assert!(result.is_success(), "{}", result.summary());
    assert_eq!(app.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wrong_delta_is_assertion_failure() {
    let app = contacts_app();
    let session = Session::new(app.driver, config());

    let workflow = Workflow::new("cancel claims a create")
        .then(Action::click(button("Add contact")))
        .then(Action::click(in_dialog(Role::Button, "Cancel")))
        .verify(
            VerificationClaim::count_delta(rows(), 1)
                .with_settle(flowguard::Settle::Window(Duration::from_millis(100))),
        );

    let result = session.run(workflow).await;
    assert_eq!(result.status, WorkflowStatus::Failed);
    let cause = result.cause().unwrap();
    assert_eq!(cause.category, FailureCategory::AssertionFailure);
    assert_eq!(cause.step_path, vec![2]);
    assert_eq!(cause.attempts, 1);
}

#[tokio::test]
async fn test_delta_claim_needs_a_preceding_action() {
    let app = contacts_app();
    let session = Session::new(app.driver, config());

    let workflow = Workflow::new("nothing happened")
        .then(WaitCondition::element_visible(row("Carl Cox")))
        .verify(VerificationClaim::count_delta(rows(), 0))
        .verify(VerificationClaim::count_delta(row("Carl Cox"), 0));

    let result = session.run(workflow).await;
    assert_eq!(result.status, WorkflowStatus::Failed);
    let cause = result.cause().unwrap();
    assert_eq!(cause.category, FailureCategory::AssertionFailure);
    assert_eq!(cause.step_path, vec![1]);
    assert!(cause.detail.contains("no baseline"), "{}", cause.detail);
}

#[tokio::test]
async fn test_unchanged_claim_after_action_holds() {
    let app = contacts_app();
    let session = Session::new(app.driver, config());

    let workflow = Workflow::new("open and cancel")
        .then(Action::click(button("Add contact")))
        .then(Action::click(in_dialog(Role::Button, "Cancel")))
        .then(WaitCondition::element_hidden(dialog()))
        .verify(VerificationClaim::unchanged(Capture::Count(rows())));

    let result = session.run(workflow).await;
    assert!(result.is_success(), "{}", result.summary());
}

// =============================================================================
// Cleanup regardless of outcome
// =============================================================================

#[tokio::test]
async fn test_cleanup_runs_after_mid_workflow_failure() {
    let app = contacts_app();
    let deletes = Arc::clone(&app.deletes);
    let session = Session::new(app.driver, config().with_retry(RetryPolicy::none()));

    let workflow = create_contact("QA_Test_17002", "qa17002@test.local")
        .verify(VerificationClaim::url_equals("https://contacts.test/never"));

    let result = session.run(workflow).await;
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.cause().unwrap().category, FailureCategory::AssertionFailure);
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
    assert!(result.cleanup_results.iter().all(|r| r.is_cleaned()));
}

#[tokio::test]
async fn test_failed_cleanup_is_reported_not_masking() {
    let app = contacts_app();
    let session = Session::new(app.driver, config().with_retry(RetryPolicy::none()));

    // The registered cleanup targets a row that never exists
    let workflow = Workflow::new("create with broken cleanup")
        .then(Action::click(button("Add contact")))
        .then(Action::fill(in_dialog(Role::Textbox, "Name"), "QA_Test_17003"))
        .creating(
            Action::click(in_dialog(Role::Button, "Confirm")),
            contact("Somebody Else"),
        )
        .then(WaitCondition::element_hidden(dialog()));

    let result = session.run(workflow).await;
    assert_eq!(result.status, WorkflowStatus::CompletedWithCleanupIssues);
    let failure = result.cause().unwrap();
    assert_eq!(failure.category, FailureCategory::CleanupFailed);
    assert_eq!(failure.phase, FailurePhase::Cleanup);
}

// =============================================================================
// Resolution
// =============================================================================

fn two_edit_rows() -> MockDriver {
    let mut dom = MockDom::new("https://contacts.test/contacts");
    let root = dom.root();
    let table = dom.add(root, Role::Table, "Contacts");
    for name in ["Ann", "Bea"] {
        let r = dom.add(table, Role::Row, name);
        dom.add(r, Role::Button, "Edit");
    }
    MockDriver::new(dom)
}

#[tokio::test]
async fn test_ambiguous_reference_never_narrows() {
    let driver = two_edit_rows();
    let resolver = LocatorResolver::new(&driver);

    let resolution = resolver.resolve(&button("Edit")).await.unwrap();
    assert!(matches!(resolution, Resolution::Ambiguous(2)));

    let scoped = resolver.resolve(&button("Edit").within(row("Bea"))).await.unwrap();
    assert!(scoped.is_found());
    let second = resolver.resolve(&button("Edit").nth(1)).await.unwrap();
    assert!(second.is_found());
}

#[tokio::test]
async fn test_ambiguous_click_does_not_act() {
    let driver = two_edit_rows();
    let executor = ActionExecutor::new(&driver, config().wait_defaults());

    let failure = executor
        .execute(&Action::click(button("Edit")))
        .await
        .unwrap_err();
    assert_eq!(failure.category, FailureCategory::ResolutionFailure);
    assert!(!failure.retryable);
    assert_eq!(driver.act_count(), 0);
}

#[tokio::test]
async fn test_stale_handle_is_reresolved() {
    let app = contacts_app();
    app.driver.fail_next_acts_stale(1);
    let session = Session::new(app.driver, config());

    let workflow = Workflow::new("edit betty")
        .then(Action::click(button("Edit").within(row("Betty Boop"))));
    let result = session.run(workflow).await;

    assert!(result.is_success(), "{}", result.summary());
    assert_eq!(session.driver().call_count("act:click"), 2);
    assert!(session.driver().call_count("find_elements:button:Edit") >= 2);
}

// =============================================================================
// Synchronization
// =============================================================================

#[tokio::test]
async fn test_typing_alone_does_not_filter() {
    let app = contacts_app();
    let session = Session::new(app.driver, config().with_retry(RetryPolicy::none()));
    let search = ElementReference::named(Role::Searchbox, "Search");

    let without_apply = Workflow::new("search without apply")
        .then(Action::fill(search.clone(), "Aaron"))
        .then(WaitCondition::count_equals(rows(), 2).with_timeout(Duration::from_millis(200)));
    let result = session.run(without_apply).await;
    let cause = result.cause().unwrap();
    assert_eq!(cause.category, FailureCategory::Timeout);
    assert_eq!(cause.phase, FailurePhase::Synchronization);

    let with_apply = Workflow::new("search with apply")
        .then(Action::fill(search, "Aaron"))
        .then(Action::click(button("Apply")))
        .then(WaitCondition::count_equals(rows(), 2))
        .verify(VerificationClaim::names_exclude(rows(), "Betty Boop"));
    let result = session.run(with_apply).await;
    assert!(result.is_success(), "{}", result.summary());
}

#[tokio::test]
async fn test_timeout_retried_to_budget_then_surfaced() {
    let app = contacts_app();
    let session = Session::new(app.driver, config().with_retry(RetryPolicy::new(3, 1)));

    let workflow = Workflow::new("never appears")
        .then(WaitCondition::element_visible(row("Nobody")).with_timeout(Duration::from_millis(30)));
    let result = session.run(workflow).await;

    let cause = result.cause().unwrap();
    assert_eq!(cause.category, FailureCategory::Timeout);
    assert_eq!(cause.attempts, 3);
}

#[tokio::test]
async fn test_network_quiescent_step_waits_for_requests() {
    let app = contacts_app();
    app.driver.with_dom(|dom| {
        dom.begin_request();
        dom.defer(Duration::from_millis(60), MockDom::end_request);
    });
    let config = config().with_network_idle_ms(30);
    let quiet = config.network_quiescent();
    let session = Session::new(app.driver, config);

    let start = Instant::now();
    let result = session.run(Workflow::new("settle network").then(quiet)).await;
    assert!(result.is_success(), "{}", result.summary());
    assert!(start.elapsed() >= Duration::from_millis(90), "{:?}", start.elapsed());
}

#[tokio::test]
async fn test_network_quiescent_times_out_while_busy() {
    let app = contacts_app();
    app.driver.with_dom(MockDom::begin_request);
    let config = config().with_retry(RetryPolicy::none());
    let quiet = config.network_quiescent().with_timeout(Duration::from_millis(80));
    let session = Session::new(app.driver, config);

    let result = session.run(Workflow::new("busy network").then(quiet)).await;
    let cause = result.cause().unwrap();
    assert_eq!(cause.category, FailureCategory::Timeout);
    assert_eq!(cause.phase, FailurePhase::Synchronization);
    assert!(cause.context.contains("network idle for 500ms"), "{}", cause.context);
}

#[tokio::test]
async fn test_grace_period_follows_wait_steps() {
    let app = contacts_app();
    let mut config = config();
    config.grace_period_ms = 80;
    let session = Session::new(app.driver, config);

    let present = WaitCondition::element_visible(row("Carl Cox"));
    let start = Instant::now();
    let result = session.run(Workflow::new("grace").then(present.clone())).await;
    assert!(result.is_success(), "{}", result.summary());
    assert!(start.elapsed() >= Duration::from_millis(80), "{:?}", start.elapsed());

    // A condition's own grace wins over the configured one
    let start = Instant::now();
    let own = present.clone().with_grace(Duration::from_millis(5));
    let result = session.run(Workflow::new("own grace").then(own)).await;
    assert!(result.is_success(), "{}", result.summary());
    assert!(start.elapsed() < Duration::from_millis(80), "{:?}", start.elapsed());

    // and is capped at the engine maximum
    let start = Instant::now();
    let huge = present.with_grace(Duration::from_secs(30));
    let result = session.run(Workflow::new("capped grace").then(huge)).await;
    assert!(result.is_success(), "{}", result.summary());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(MAX_GRACE_MS), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
}

#[tokio::test]
async fn test_assertion_failure_is_never_retried() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let result: Result<(), FailureRecord> = with_retry(&RetryPolicy::new(5, 1), move |_| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(FailureRecord::assertion("rows", "expected 5, observed 4"))
    })
    .await;

    assert_eq!(result.unwrap_err().category, FailureCategory::AssertionFailure);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Claims
// =============================================================================

#[test]
fn test_type_only_claim_rejected_at_construction() {
    let result = VerificationClaim::new(
        "dialog checkbox is a bool",
        Capture::Checked(ElementReference::named(Role::Checkbox, "Subscribe")),
        Expected::TypeIs(ValueKind::Bool),
    );
    assert!(matches!(result, Err(ClaimError::TypeOnly { .. })));
}

// =============================================================================
// Evidence and concurrency
// =============================================================================

#[tokio::test]
async fn test_evidence_streams_over_channel() {
    let app = contacts_app();
    let (recorder, mut rx) = ChannelRecorder::new();
    let session = Session::new(app.driver, config()).with_recorder(Arc::new(recorder));

    let result = session.run(create_contact("QA_Test_17004", "x@test.local")).await;
    assert!(result.is_success(), "{}", result.summary());

    let mut started = 0;
    let mut succeeded = 0;
    while let Ok(message) = rx.try_recv() {
        if let EvidenceMessage::Event(event) = message {
            match event.event {
                StepEvent::StepStarted => started += 1,
                StepEvent::StepSucceeded => succeeded += 1,
                StepEvent::StepFailed => panic!("unexpected failure: {}", event.description),
            }
        }
    }
    assert_eq!(started, succeeded);
    // entity cleanup runs as its own workflow on top of the counted steps
    assert!(started > result.steps_executed);
}

#[tokio::test]
async fn test_parallel_sessions_do_not_collide() {
    let first = Session::new(contacts_app().driver, config());
    let second = Session::new(contacts_app().driver, config());
    let (a, b) = (unique_key("QA_Test"), unique_key("QA_Test"));
    assert_ne!(a, b);

    let (ra, rb) = tokio::join!(
        first.run(create_contact(&a, "a@test.local")),
        second.run(create_contact(&b, "b@test.local")),
    );
    assert!(ra.is_success(), "{}", ra.summary());
    assert!(rb.is_success(), "{}", rb.summary());
    assert_eq!(ra.cleanup_results[0].key, a);
    assert_eq!(rb.cleanup_results[0].key, b);
}
