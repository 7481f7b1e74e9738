//! Semantic element references and their resolution.
//!
//! # Design Philosophy
//!
//! - **Semantic**: elements are described by role, accessible name and an
//!   optional scoping container, never by CSS position
//! - **Strict**: more than one match is reported as [`Resolution::Ambiguous`];
//!   the resolver never picks index 0 on the caller's behalf
//! - **Fresh**: a reference holds no live handle and is re-resolved on every use

use crate::driver::{AutomationDriver, ElementHandle, Role};
use crate::result::FlowResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// How an accessible name is matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMatch {
    /// Whole name, whitespace-normalized
    Exact(String),
    /// Substring of the whitespace-normalized name
    Contains(String),
}

impl TextMatch {
    /// Check a raw accessible name against this matcher
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let name = normalize_whitespace(name);
        match self {
            Self::Exact(expected) => name == normalize_whitespace(expected),
            Self::Contains(needle) => name.contains(&normalize_whitespace(needle)),
        }
    }

    /// The text being matched
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Contains(s) => s,
        }
    }
}

impl fmt::Display for TextMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(s) => write!(f, "\"{s}\""),
            Self::Contains(s) => write!(f, "~\"{s}\""),
        }
    }
}

/// Collapse runs of whitespace and trim, the way accessible names are computed
#[must_use]
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Semantic descriptor of an element.
///
/// Immutable once built. Re-resolved on every use because DOM nodes are not
/// stable across re-renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementReference {
    role: Role,
    name: Option<TextMatch>,
    scope: Option<Box<ElementReference>>,
    ordinal: Option<usize>,
}

impl ElementReference {
    /// Any element with the given role
    #[must_use]
    pub const fn role(role: Role) -> Self {
        Self {
            role,
            name: None,
            scope: None,
            ordinal: None,
        }
    }

    /// Element with role and exact accessible name
    #[must_use]
    pub fn named(role: Role, name: impl Into<String>) -> Self {
        Self::role(role).with_name(TextMatch::Exact(name.into()))
    }

    /// Element with role whose accessible name contains `needle`
    #[must_use]
    pub fn name_contains(role: Role, needle: impl Into<String>) -> Self {
        Self::role(role).with_name(TextMatch::Contains(needle.into()))
    }

    /// Set the accessible-name matcher
    #[must_use]
    pub fn with_name(mut self, name: TextMatch) -> Self {
        self.name = Some(name);
        self
    }

    /// Restrict the search to descendants of `scope`
    #[must_use]
    pub fn within(mut self, scope: Self) -> Self {
        self.scope = Some(Box::new(scope));
        self
    }

    /// Pick the `index`-th (0-based) match explicitly
    #[must_use]
    pub const fn nth(mut self, index: usize) -> Self {
        self.ordinal = Some(index);
        self
    }

    /// Role being searched for
    #[must_use]
    pub const fn role_kind(&self) -> Role {
        self.role
    }

    /// Accessible-name matcher, if any
    #[must_use]
    pub const fn name(&self) -> Option<&TextMatch> {
        self.name.as_ref()
    }

    /// Scoping container, if any
    #[must_use]
    pub fn scope(&self) -> Option<&Self> {
        self.scope.as_deref()
    }

    /// Explicit ordinal, if any
    #[must_use]
    pub const fn ordinal(&self) -> Option<usize> {
        self.ordinal
    }

    /// Check role and name against a candidate (scope not considered)
    #[must_use]
    pub fn matches_own(&self, role: Role, name: &str) -> bool {
        self.role == role && self.name.as_ref().map_or(true, |m| m.matches(name))
    }
}

impl fmt::Display for ElementReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.role)?;
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        if let Some(n) = self.ordinal {
            write!(f, " #{n}")?;
        }
        if let Some(scope) = &self.scope {
            write!(f, " in [{scope}]")?;
        }
        Ok(())
    }
}

/// Outcome of resolving a reference. Absence and ambiguity are values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Exactly one element (or the explicit ordinal) matched
    Found(T),
    /// Nothing matched
    NotFound,
    /// This many elements matched and no ordinal was given
    Ambiguous(usize),
}

impl<T> Resolution<T> {
    /// Select from a candidate list honoring an explicit ordinal
    #[must_use]
    pub fn pick(mut candidates: Vec<T>, ordinal: Option<usize>) -> Self {
        match ordinal {
            Some(index) if index < candidates.len() => Self::Found(candidates.swap_remove(index)),
            Some(_) => Self::NotFound,
            None => match candidates.len() {
                0 => Self::NotFound,
                1 => candidates.pop().map_or(Self::NotFound, Self::Found),
                n => Self::Ambiguous(n),
            },
        }
    }

    /// Map the found value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Found(t) => Resolution::Found(f(t)),
            Self::NotFound => Resolution::NotFound,
            Self::Ambiguous(n) => Resolution::Ambiguous(n),
        }
    }

    /// The found value, if any
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(t) => Some(t),
            _ => None,
        }
    }

    /// Whether exactly one element was found
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Result of live resolution against a driver
pub type ResolutionResult = Resolution<ResolvedElement>;

/// A freshly resolved element.
///
/// Owned by the single action that asked for it and dropped when that action
/// completes.
#[derive(Debug)]
pub struct ResolvedElement {
    /// Live handle
    pub handle: ElementHandle,
    /// Reference it was resolved from
    pub source: ElementReference,
    /// When resolution happened
    pub resolved_at: Instant,
}

/// Resolves references against the live page through a driver
#[derive(Debug)]
pub struct LocatorResolver<'a, D: ?Sized> {
    driver: &'a D,
}

impl<'a, D: AutomationDriver + ?Sized> LocatorResolver<'a, D> {
    /// Create a resolver over a driver
    #[must_use]
    pub const fn new(driver: &'a D) -> Self {
        Self { driver }
    }

    /// Resolve a reference to zero, one or many live elements.
    ///
    /// Errors only when the driver itself fails; absence and ambiguity are
    /// returned as [`Resolution`] values.
    pub async fn resolve(&self, reference: &ElementReference) -> FlowResult<ResolutionResult> {
        let outcome = self.resolve_handle(reference).await?;
        debug!(reference = %reference, outcome = ?outcome_label(&outcome), "resolved");
        Ok(outcome.map(|handle| ResolvedElement {
            handle,
            source: reference.clone(),
            resolved_at: Instant::now(),
        }))
    }

    /// Count live matches of a reference, ignoring its ordinal.
    ///
    /// `None` when the scope itself does not resolve to exactly one element.
    pub async fn count(&self, reference: &ElementReference) -> FlowResult<Option<usize>> {
        let scope = match reference.scope() {
            Some(scope) => match self.resolve_handle(scope).await? {
                Resolution::Found(h) => Some(h),
                Resolution::NotFound => return Ok(Some(0)),
                Resolution::Ambiguous(_) => return Ok(None),
            },
            None => None,
        };
        let found = self
            .driver
            .find_elements(scope.as_ref(), reference.role_kind(), reference.name())
            .await?;
        Ok(Some(found.len()))
    }

    fn resolve_handle<'r>(
        &'r self,
        reference: &'r ElementReference,
    ) -> BoxFuture<'r, FlowResult<Resolution<ElementHandle>>> {
        Box::pin(async move {
            let scope = match reference.scope() {
                Some(scope) => match self.resolve_handle(scope).await? {
                    Resolution::Found(h) => Some(h),
                    Resolution::NotFound => return Ok(Resolution::NotFound),
                    Resolution::Ambiguous(n) => return Ok(Resolution::Ambiguous(n)),
                },
                None => None,
            };
            let candidates = self
                .driver
                .find_elements(scope.as_ref(), reference.role_kind(), reference.name())
                .await?;
            Ok(Resolution::pick(candidates, reference.ordinal()))
        })
    }
}

fn outcome_label<T>(r: &Resolution<T>) -> String {
    match r {
        Resolution::Found(_) => "found".to_string(),
        Resolution::NotFound => "not_found".to_string(),
        Resolution::Ambiguous(n) => format!("ambiguous({n})"),
    }
}
