//! Action Executor
//!
//! One guarded interaction: precondition wait, fresh resolution, the
//! interaction itself, then the optional postcondition wait. The executor
//! never verifies effects; that belongs to [`crate::verify`].

use crate::driver::{ActionKind, AutomationDriver, ElementHandle, Role};
use crate::locator::{normalize_whitespace, ElementReference, LocatorResolver, Resolution};
use crate::result::FlowError;
use crate::retry::{classify, FailurePhase, FailureRecord};
use crate::wait::{WaitCondition, WaitDefaults, WaitEngine, WaitSuccess};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Rejected action construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Fill and select need a payload
    #[error("{kind} requires a payload")]
    MissingPayload {
        /// Interaction kind
        kind: ActionKind,
    },
    /// Click and check take none
    #[error("{kind} does not take a payload")]
    UnexpectedPayload {
        /// Interaction kind
        kind: ActionKind,
    },
}

/// A single interaction with its guards
#[derive(Debug, Clone)]
pub struct Action {
    kind: ActionKind,
    target: ElementReference,
    payload: Option<String>,
    precondition: WaitCondition,
    postcondition: Option<WaitCondition>,
}

impl Action {
    /// Create an action, validating the payload against the kind.
    ///
    /// The precondition defaults to the target being actionable.
    ///
    /// # Errors
    ///
    /// Returns an error if a fill/select lacks a payload or a click/check has one.
    pub fn new(
        kind: ActionKind,
        target: ElementReference,
        payload: Option<String>,
    ) -> Result<Self, ActionError> {
        match (kind.takes_payload(), payload.is_some()) {
            (true, false) => return Err(ActionError::MissingPayload { kind }),
            (false, true) => return Err(ActionError::UnexpectedPayload { kind }),
            _ => {}
        }
        Ok(Self {
            precondition: WaitCondition::actionable(target.clone()),
            kind,
            target,
            payload,
            postcondition: None,
        })
    }

    /// Click the target
    #[must_use]
    pub fn click(target: ElementReference) -> Self {
        Self::unchecked(ActionKind::Click, target, None)
    }

    /// Replace the target's value with `text`
    #[must_use]
    pub fn fill(target: ElementReference, text: impl Into<String>) -> Self {
        Self::unchecked(ActionKind::Fill, target, Some(text.into()))
    }

    /// Choose the option named `option`
    #[must_use]
    pub fn select(target: ElementReference, option: impl Into<String>) -> Self {
        Self::unchecked(ActionKind::Select, target, Some(option.into()))
    }

    /// Check a checkbox, radio or switch
    #[must_use]
    pub fn check(target: ElementReference) -> Self {
        Self::unchecked(ActionKind::Check, target, None)
    }

    fn unchecked(kind: ActionKind, target: ElementReference, payload: Option<String>) -> Self {
        Self {
            precondition: WaitCondition::actionable(target.clone()),
            kind,
            target,
            payload,
            postcondition: None,
        }
    }

    /// Replace the default precondition
    #[must_use]
    pub fn with_precondition(mut self, condition: WaitCondition) -> Self {
        self.precondition = condition;
        self
    }

    /// Wait for `condition` after the interaction
    #[must_use]
    pub fn with_postcondition(mut self, condition: WaitCondition) -> Self {
        self.postcondition = Some(condition);
        self
    }

    /// Interaction kind
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Target reference
    #[must_use]
    pub const fn target(&self) -> &ElementReference {
        &self.target
    }

    /// Payload, for fill and select
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Whether repeating the action is harmless
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        self.kind.is_idempotent()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)?;
        if let Some(payload) = &self.payload {
            write!(f, " with \"{payload}\"")?;
        }
        Ok(())
    }
}

/// What a successful execution did
#[derive(Debug, Clone)]
pub struct ActionReport {
    /// Action description
    pub description: String,
    /// Handle id the interaction went to
    pub handle_id: String,
    /// Precondition wait
    pub precondition: WaitSuccess,
    /// Postcondition wait, if any
    pub postcondition: Option<WaitSuccess>,
    /// Total time
    pub elapsed: Duration,
}

/// Runs actions against a driver
#[derive(Debug)]
pub struct ActionExecutor<'a, D: ?Sized> {
    driver: &'a D,
    waits: WaitEngine<'a, D>,
}

impl<'a, D: AutomationDriver + ?Sized> ActionExecutor<'a, D> {
    /// Create an executor
    #[must_use]
    pub const fn new(driver: &'a D, defaults: WaitDefaults) -> Self {
        Self {
            driver,
            waits: WaitEngine::new(driver, defaults),
        }
    }

    /// Execute one action: precondition, resolve, interact, postcondition.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the first phase that failed.
    pub async fn execute(&self, action: &Action) -> Result<ActionReport, FailureRecord> {
        let started = Instant::now();
        let context = action.to_string();

        let precondition = self
            .waits
            .await_condition(&action.precondition)
            .await
            .map_err(|t| FailureRecord::timed_out(&t, FailurePhase::Precondition, &context))?;

        let handle = self.resolve_target(action, &context).await?;
        self.validate_target(action, &handle, &context).await?;

        if let Err(err) = self.driver.act(&handle, action.kind, action.payload()).await {
            let failure = classify(&err, FailurePhase::Interaction, &context);
            // A driver-side timeout leaves it unknown whether the page saw the interaction
            return Err(if matches!(err, FlowError::Timeout { .. }) {
                failure.after_side_effect(action.is_idempotent())
            } else {
                failure
            });
        }
        debug!(action = %context, handle = %handle.id, "interaction performed");
        let handle_id = handle.id;

        let postcondition = match &action.postcondition {
            Some(condition) => Some(self.waits.await_condition(condition).await.map_err(|t| {
                FailureRecord::timed_out(&t, FailurePhase::Postcondition, &context)
                    .after_side_effect(action.is_idempotent())
            })?),
            None => None,
        };

        Ok(ActionReport {
            description: context,
            handle_id,
            precondition,
            postcondition,
            elapsed: started.elapsed(),
        })
    }

    async fn resolve_target(
        &self,
        action: &Action,
        context: &str,
    ) -> Result<ElementHandle, FailureRecord> {
        let resolver = LocatorResolver::new(self.driver);
        let target = &action.target;
        match resolver.resolve(target).await {
            Ok(Resolution::Found(resolved)) => Ok(resolved.handle),
            Ok(Resolution::NotFound) => Err(FailureRecord::not_found(
                FailurePhase::Resolution,
                context,
                &target.to_string(),
            )),
            Ok(Resolution::Ambiguous(count)) => Err(FailureRecord::ambiguous(
                FailurePhase::Resolution,
                context,
                &target.to_string(),
                count,
            )),
            Err(err) => Err(classify(&err, FailurePhase::Resolution, context)),
        }
    }

    async fn validate_target(
        &self,
        action: &Action,
        handle: &ElementHandle,
        context: &str,
    ) -> Result<(), FailureRecord> {
        match action.kind {
            ActionKind::Click => Ok(()),
            ActionKind::Fill if handle.role.is_fillable() => Ok(()),
            ActionKind::Fill => Err(FailureRecord::wrong_kind(
                context,
                format!("target is a {}, which cannot be filled", handle.role),
            )),
            ActionKind::Check if handle.role.is_checkable() => Ok(()),
            ActionKind::Check => Err(FailureRecord::wrong_kind(
                context,
                format!("target is a {}, not a checkbox, radio or switch", handle.role),
            )),
            ActionKind::Select if !handle.role.is_selectable() => {
                Err(FailureRecord::wrong_kind(
                    context,
                    format!("target is a {}, not a combobox or listbox", handle.role),
                ))
            }
            ActionKind::Select => {
                let wanted = normalize_whitespace(action.payload().unwrap_or_default());
                let options = self
                    .driver
                    .find_elements(Some(handle), Role::ListOption, None)
                    .await
                    .map_err(|err| classify(&err, FailurePhase::Resolution, context))?;
                if options
                    .iter()
                    .any(|o| normalize_whitespace(&o.name) == wanted)
                {
                    return Ok(());
                }
                let names: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
                // An empty list may still be loading
                Err(FailureRecord::wrong_kind(
                    context,
                    format!("no option \"{wanted}\" among {names:?}"),
                )
                .with_retryable(options.is_empty()))
            }
        }
    }
}
