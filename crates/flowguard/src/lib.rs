//! Flowguard: Deterministic UI Workflow Synchronization & Verification
//!
//! Flowguard drives end-to-end workflows against a live web UI without
//! fixed sleeps, brittle selectors, or unchecked side effects. Every step
//! waits on an explicit condition, every interaction targets an element by
//! its accessible role and name, and every workflow cleans up the test data
//! it created, even when a step fails.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    FLOWGUARD Architecture                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │ Workflow   │    │ Session    │    │ Automation │            │
//! │   │ (Rust or   │───►│ (orches-   │───►│ Driver     │            │
//! │   │  YAML)     │    │  trator)   │    │ (CDP/mock) │            │
//! │   └────────────┘    └─────┬──────┘    └────────────┘            │
//! │                           │                                     │
//! │        ┌──────────┬───────┼────────┬───────────┐                │
//! │        ▼          ▼       ▼        ▼           ▼                │
//! │    Locator      Wait   Action   Verifier   Lifecycle            │
//! │    Resolver    Engine  Executor            Manager              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use flowguard::mock::{MockDom, MockDriver};
//! use flowguard::{Action, ElementReference, EngineConfig, Role, Session, VerificationClaim, Workflow};
//!
//! # tokio_test_block(async {
//! let mut dom = MockDom::new("https://app.test/");
//! let root = dom.root();
//! let list = dom.add(root, Role::List, "Items");
//! dom.add(root, Role::Button, "Add");
//! let driver = MockDriver::new(dom);
//! driver.on(Role::Button, "Add", move |dom, _| {
//!     dom.add(list, Role::Listitem, "item");
//! });
//!
//! let workflow = Workflow::new("add item")
//!     .then(Action::click(ElementReference::named(Role::Button, "Add")))
//!     .verify(VerificationClaim::count_delta(ElementReference::role(Role::Listitem), 1));
//!
//! let session = Session::new(driver, EngineConfig::default());
//! let result = session.run(workflow).await;
//! assert!(result.is_success());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::large_stack_arrays, clippy::large_stack_frames))]

mod result;

/// Automation driver boundary and element roles
pub mod driver;

/// Role/name element references and their resolution
pub mod locator;

/// Read-only page snapshots
pub mod snapshot;

/// Condition-based waits
pub mod wait;

/// Failure taxonomy and bounded retry
pub mod retry;

/// Guarded UI interactions
#[allow(clippy::missing_errors_doc)]
pub mod action;

/// Claims about page state
#[allow(clippy::missing_errors_doc)]
pub mod verify;

/// Workflow composition
pub mod workflow;

/// Test data registration and cleanup
pub mod lifecycle;

/// Workflow execution
pub mod orchestrator;

/// Step evidence sinks
pub mod evidence;

/// YAML workflow definitions
#[allow(missing_docs)]
pub mod definition;

/// Engine configuration
pub mod config;

/// Tracing subscriber setup
pub mod telemetry;

/// In-memory driver for tests
pub mod mock;

/// Chromium driver (CDP)
#[cfg(feature = "browser")]
#[allow(clippy::missing_errors_doc)]
pub mod cdp;

pub use action::{Action, ActionError, ActionExecutor, ActionReport};
#[cfg(feature = "browser")]
pub use cdp::{ChromiumConfig, ChromiumDriver};
pub use config::{Credentials, EngineConfig};
pub use definition::{DefinitionError, WorkflowLibrary};
pub use driver::{ActionKind, AutomationDriver, ElementHandle, Role};
pub use evidence::{
    ChannelRecorder, EvidenceEvent, EvidenceMessage, EvidenceRecorder, MemoryRecorder,
    NullRecorder, StepEvent, TracingRecorder,
};
pub use lifecycle::{
    unique_key, CleanupOutcome, CleanupResult, CleanupRunner, LifecycleManager, TestDataHandle,
};
pub use locator::{ElementReference, LocatorResolver, Resolution, TextMatch};
pub use orchestrator::{Session, WorkflowResult, WorkflowState, WorkflowStatus};
pub use result::{FlowError, FlowResult};
pub use retry::{
    classify, with_retry, FailureCategory, FailurePhase, FailureRecord, RetryPolicy,
};
pub use snapshot::{PageSnapshot, SnapshotNode};
pub use telemetry::{init_tracing, TelemetryFormat};
pub use verify::{
    Capture, ClaimError, Comparable, Expected, Settle, ValueKind, VerificationClaim, Verified,
    Verifier,
};
pub use wait::{
    TimedOut, UrlPattern, UrlRegex, WaitCondition, WaitDefaults, WaitEngine, WaitSuccess,
};
pub use workflow::{EntityRegistration, Workflow, WorkflowStep};
