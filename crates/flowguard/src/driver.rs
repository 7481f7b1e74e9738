//! AutomationDriver - the boundary to a browser-automation layer
//!
//! The engine needs exactly five primitives from whatever drives the page:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  AutomationDriver                                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  find_elements(scope?, role, name?) -> [ElementHandle]       │
//! │  act(handle, kind, payload?)                                 │
//! │  read_snapshot() -> PageSnapshot                             │
//! │  current_url() -> String                                     │
//! │  navigate(url)                                               │
//! └──────────────────────────────────────────────────────────────┘
//!        ▲                         ▲
//!        │                         │
//!   MockDriver (tests)      ChromiumDriver (feature "browser")
//! ```
//!
//! Handles are opaque and short-lived. A driver must report an operation on
//! a detached handle as [`FlowError::StaleElement`](crate::result::FlowError).

use crate::locator::TextMatch;
use crate::result::FlowResult;
use crate::snapshot::PageSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ARIA role of an element, as computed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// `button`
    Button,
    /// `link`
    Link,
    /// `textbox`
    Textbox,
    /// `searchbox`
    Searchbox,
    /// `combobox` (native `<select>` or ARIA combobox)
    Combobox,
    /// `listbox`
    Listbox,
    /// `option`
    #[serde(rename = "option")]
    ListOption,
    /// `checkbox`
    Checkbox,
    /// `radio`
    Radio,
    /// `radiogroup`
    Radiogroup,
    /// `switch`
    Switch,
    /// `dialog`
    Dialog,
    /// `table`
    Table,
    /// `row`
    Row,
    /// `cell`
    Cell,
    /// `columnheader`
    Columnheader,
    /// `heading`
    Heading,
    /// `list`
    List,
    /// `listitem`
    Listitem,
    /// `form`
    Form,
    /// `navigation`
    Navigation,
    /// `main`
    Main,
    /// `region`
    Region,
    /// `tab`
    Tab,
    /// `tabpanel`
    Tabpanel,
    /// `alert`
    Alert,
    /// `status`
    Status,
    /// Anything the driver could not map
    Generic,
}

impl Role {
    /// ARIA name of the role
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Link => "link",
            Self::Textbox => "textbox",
            Self::Searchbox => "searchbox",
            Self::Combobox => "combobox",
            Self::Listbox => "listbox",
            Self::ListOption => "option",
            Self::Checkbox => "checkbox",
            Self::Radio => "radio",
            Self::Radiogroup => "radiogroup",
            Self::Switch => "switch",
            Self::Dialog => "dialog",
            Self::Table => "table",
            Self::Row => "row",
            Self::Cell => "cell",
            Self::Columnheader => "columnheader",
            Self::Heading => "heading",
            Self::List => "list",
            Self::Listitem => "listitem",
            Self::Form => "form",
            Self::Navigation => "navigation",
            Self::Main => "main",
            Self::Region => "region",
            Self::Tab => "tab",
            Self::Tabpanel => "tabpanel",
            Self::Alert => "alert",
            Self::Status => "status",
            Self::Generic => "generic",
        }
    }

    /// Map an ARIA role string; unknown roles become [`Role::Generic`]
    #[must_use]
    pub fn from_aria(role: &str) -> Self {
        match role.trim().to_ascii_lowercase().as_str() {
            "button" => Self::Button,
            "link" => Self::Link,
            "textbox" => Self::Textbox,
            "searchbox" => Self::Searchbox,
            "combobox" => Self::Combobox,
            "listbox" => Self::Listbox,
            "option" => Self::ListOption,
            "checkbox" => Self::Checkbox,
            "radio" => Self::Radio,
            "radiogroup" => Self::Radiogroup,
            "switch" => Self::Switch,
            "dialog" | "alertdialog" => Self::Dialog,
            "table" | "grid" => Self::Table,
            "row" => Self::Row,
            "cell" | "gridcell" => Self::Cell,
            "columnheader" => Self::Columnheader,
            "heading" => Self::Heading,
            "list" => Self::List,
            "listitem" => Self::Listitem,
            "form" => Self::Form,
            "navigation" => Self::Navigation,
            "main" => Self::Main,
            "region" => Self::Region,
            "tab" => Self::Tab,
            "tabpanel" => Self::Tabpanel,
            "alert" => Self::Alert,
            "status" => Self::Status,
            _ => Self::Generic,
        }
    }

    /// Roles a `Check` interaction may target
    #[must_use]
    pub const fn is_checkable(self) -> bool {
        matches!(self, Self::Checkbox | Self::Radio | Self::Switch)
    }

    /// Roles a `Select` interaction may target
    #[must_use]
    pub const fn is_selectable(self) -> bool {
        matches!(self, Self::Combobox | Self::Listbox)
    }

    /// Roles a `Fill` interaction may target
    #[must_use]
    pub const fn is_fillable(self) -> bool {
        matches!(self, Self::Textbox | Self::Searchbox | Self::Combobox)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to a live element.
///
/// Valid only until the next re-render of the node; never store one across
/// actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    /// Driver-assigned identifier
    pub id: String,
    /// Computed role
    pub role: Role,
    /// Computed accessible name
    pub name: String,
}

impl ElementHandle {
    /// Create a new element handle
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            name: name.into(),
        }
    }
}

/// Kind of interaction performed by `act`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Click / activate
    Click,
    /// Replace the value of a text input
    Fill,
    /// Choose an option by its accessible name
    Select,
    /// Set a checkbox, radio or switch to checked
    Check,
}

impl ActionKind {
    /// Whether the interaction carries a payload
    #[must_use]
    pub const fn takes_payload(self) -> bool {
        matches!(self, Self::Fill | Self::Select)
    }

    /// Whether repeating the interaction leaves the page in the same state
    #[must_use]
    pub const fn is_idempotent(self) -> bool {
        !matches!(self, Self::Click)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Select => "select",
            Self::Check => "check",
        };
        f.write_str(s)
    }
}

/// Browser-automation primitives required by the engine.
///
/// Implementations:
/// - [`MockDriver`](crate::mock::MockDriver) - in-memory DOM for tests
/// - `ChromiumDriver` - CDP via chromiumoxide (feature `browser`)
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Find visible elements with `role` (and matching accessible name when
    /// given), restricted to descendants of `scope` when set.
    async fn find_elements(
        &self,
        scope: Option<&ElementHandle>,
        role: Role,
        name: Option<&TextMatch>,
    ) -> FlowResult<Vec<ElementHandle>>;

    /// Perform one interaction against a handle
    async fn act(
        &self,
        handle: &ElementHandle,
        kind: ActionKind,
        payload: Option<&str>,
    ) -> FlowResult<()>;

    /// Read the current DOM-derived state at one instant
    async fn read_snapshot(&self) -> FlowResult<PageSnapshot>;

    /// Current page URL
    async fn current_url(&self) -> FlowResult<String>;

    /// Navigate to an absolute URL
    async fn navigate(&self, url: &str) -> FlowResult<()>;
}
