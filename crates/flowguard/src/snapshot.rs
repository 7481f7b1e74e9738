//! Point-in-time, read-only view of the page.
//!
//! Both the wait engine and the verifier evaluate against a [`PageSnapshot`],
//! so a "before" capture and an "after" capture always come from the same
//! representation.

use crate::driver::Role;
use crate::locator::{ElementReference, Resolution, TextMatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One accessibility-tree node as seen by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    /// Driver-assigned identifier, same space as `ElementHandle::id`
    pub id: String,
    /// Computed role
    pub role: Role,
    /// Computed accessible name
    pub name: String,
    /// Parent node id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Effective visibility (the node and all of its ancestors are shown)
    pub visible: bool,
    /// Not disabled
    pub enabled: bool,
    /// Rendered text content
    #[serde(default)]
    pub text: String,
    /// Current value of an input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Checked state of a checkbox, radio or switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
}

impl SnapshotNode {
    /// Value for inputs, rendered text otherwise
    #[must_use]
    pub fn observed_text(&self) -> &str {
        self.value.as_deref().unwrap_or(&self.text)
    }
}

/// DOM-derived state captured at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    /// Page URL
    pub url: String,
    /// All nodes, in document order
    pub nodes: Vec<SnapshotNode>,
    /// In-flight network requests
    #[serde(default)]
    pub pending_requests: u32,
    /// Milliseconds since the last request finished (0 while busy)
    #[serde(default)]
    pub idle_for_ms: u64,
    /// Capture time
    pub taken_at: DateTime<Utc>,
}

impl PageSnapshot {
    /// Create an empty snapshot for a URL
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            nodes: Vec::new(),
            pending_requests: 0,
            idle_for_ms: 0,
            taken_at: Utc::now(),
        }
    }

    /// Add a node
    #[must_use]
    pub fn with_node(mut self, node: SnapshotNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Look up a node by id
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&SnapshotNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether `node` sits strictly below `ancestor_id`
    #[must_use]
    pub fn is_descendant(&self, node: &SnapshotNode, ancestor_id: &str) -> bool {
        let mut current = node.parent.as_deref();
        // Parent chains come from the driver; bound the walk in case of a cycle
        let mut hops = 0usize;
        while let Some(id) = current {
            if id == ancestor_id {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            current = self.node(id).and_then(|n| n.parent.as_deref());
        }
        false
    }

    /// Visible nodes with `role` and a matching name below `scope`
    #[must_use]
    pub fn find_all(
        &self,
        scope: Option<&SnapshotNode>,
        role: Role,
        name: Option<&TextMatch>,
    ) -> Vec<&SnapshotNode> {
        self.nodes
            .iter()
            .filter(|n| n.visible && n.role == role)
            .filter(|n| name.map_or(true, |m| m.matches(&n.name)))
            .filter(|n| scope.map_or(true, |s| self.is_descendant(n, &s.id)))
            .collect()
    }

    /// Resolve a reference over this snapshot with the same rules as the
    /// live resolver
    #[must_use]
    pub fn resolve(&self, reference: &ElementReference) -> Resolution<&SnapshotNode> {
        let scope = match reference.scope() {
            Some(scope) => match self.resolve(scope) {
                Resolution::Found(node) => Some(node),
                Resolution::NotFound => return Resolution::NotFound,
                Resolution::Ambiguous(n) => return Resolution::Ambiguous(n),
            },
            None => None,
        };
        let candidates = self.find_all(scope, reference.role_kind(), reference.name());
        Resolution::pick(candidates, reference.ordinal())
    }

    /// Number of matches ignoring the ordinal.
    ///
    /// `Some(0)` when the scope is absent; `None` when the scope is ambiguous.
    #[must_use]
    pub fn count(&self, reference: &ElementReference) -> Option<usize> {
        self.matching(reference).map(|nodes| nodes.len())
    }

    /// Accessible names of all matches, in document order
    #[must_use]
    pub fn names(&self, reference: &ElementReference) -> Option<Vec<String>> {
        self.matching(reference)
            .map(|nodes| nodes.into_iter().map(|n| n.name.clone()).collect())
    }

    fn matching(&self, reference: &ElementReference) -> Option<Vec<&SnapshotNode>> {
        let scope = match reference.scope() {
            Some(scope) => match self.resolve(scope) {
                Resolution::Found(node) => Some(node),
                Resolution::NotFound => return Some(Vec::new()),
                Resolution::Ambiguous(_) => return None,
            },
            None => None,
        };
        Some(self.find_all(scope, reference.role_kind(), reference.name()))
    }

    /// Whether any request is in flight
    #[must_use]
    pub const fn is_network_busy(&self) -> bool {
        self.pending_requests > 0
    }
}
