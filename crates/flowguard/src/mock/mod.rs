//! In-memory automation driver for tests.
//!
//! [`MockDriver`] serves a small accessibility tree ([`MockDom`]) and lets
//! tests script how the page reacts to interactions, including render lag
//! (deferred mutations) and re-renders that detach handles.
//!
//! ```
//! use flowguard::driver::Role;
//! use flowguard::mock::{MockDom, MockDriver};
//!
//! let mut dom = MockDom::new("https://app.test/");
//! let root = dom.root();
//! dom.add(root, Role::Button, "Save");
//! let driver = MockDriver::new(dom);
//! assert_eq!(driver.act_count(), 0);
//! ```

use crate::driver::{ActionKind, AutomationDriver, ElementHandle, Role};
use crate::locator::TextMatch;
use crate::result::{FlowError, FlowResult};
use crate::snapshot::{PageSnapshot, SnapshotNode};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Index of a node in a [`MockDom`]
pub type NodeId = usize;

/// One node of the mock tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockNode {
    /// Role
    pub role: Role,
    /// Accessible name
    pub name: String,
    /// Parent node
    pub parent: Option<NodeId>,
    /// Own visibility flag
    pub visible: bool,
    /// Not disabled
    pub enabled: bool,
    /// Text content
    pub text: String,
    /// Input value
    pub value: Option<String>,
    /// Checked state
    pub checked: Option<bool>,
    /// Detached from the document
    pub removed: bool,
}

type Mutation = Box<dyn FnOnce(&mut MockDom) + Send>;

struct Deferred {
    due: Instant,
    apply: Mutation,
}

/// Mutable in-memory page
pub struct MockDom {
    url: String,
    nodes: Vec<MockNode>,
    deferred: Vec<Deferred>,
    pending_requests: u32,
    idle_since: Instant,
}

impl fmt::Debug for MockDom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDom")
            .field("url", &self.url)
            .field("nodes", &self.nodes.len())
            .field("deferred", &self.deferred.len())
            .field("pending_requests", &self.pending_requests)
            .finish()
    }
}

impl MockDom {
    /// Page with a single visible `main` root
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            nodes: vec![MockNode {
                role: Role::Main,
                name: String::new(),
                parent: None,
                visible: true,
                enabled: true,
                text: String::new(),
                value: None,
                checked: None,
                removed: false,
            }],
            deferred: Vec::new(),
            pending_requests: 0,
            // Long idle so network-quiescent waits pass on a fresh page
            idle_since: Instant::now()
                .checked_sub(Duration::from_secs(60))
                .unwrap_or_else(Instant::now),
        }
    }

    /// Root node id
    #[must_use]
    pub const fn root(&self) -> NodeId {
        0
    }

    /// Append a visible, enabled node whose text is its name
    pub fn add(&mut self, parent: NodeId, role: Role, name: impl Into<String>) -> NodeId {
        let name = name.into();
        let value = role.is_fillable().then(String::new);
        let checked = role.is_checkable().then_some(false);
        self.nodes.push(MockNode {
            role,
            text: name.clone(),
            name,
            parent: Some(parent),
            visible: true,
            enabled: true,
            value,
            checked,
            removed: false,
        });
        self.nodes.len() - 1
    }

    /// Node by id
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&MockNode> {
        self.nodes.get(id)
    }

    /// Parent of a node
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// Live children of a node
    #[must_use]
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent == Some(id) && !n.removed)
            .map(|(i, _)| i)
            .collect()
    }

    /// First live node with role and exact name
    #[must_use]
    pub fn find(&self, role: Role, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| !n.removed && n.role == role && n.name == name)
    }

    /// Nearest live ancestor with `role`
    #[must_use]
    pub fn ancestor(&self, id: NodeId, role: Role) -> Option<NodeId> {
        let mut current = self.parent(id);
        while let Some(p) = current {
            if self.nodes[p].role == role && !self.nodes[p].removed {
                return Some(p);
            }
            current = self.parent(p);
        }
        None
    }

    /// Show or hide a node (and its subtree)
    pub fn set_visible(&mut self, id: NodeId, visible: bool) {
        if let Some(n) = self.nodes.get_mut(id) {
            n.visible = visible;
        }
    }

    /// Enable or disable a node
    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) {
        if let Some(n) = self.nodes.get_mut(id) {
            n.enabled = enabled;
        }
    }

    /// Set the input value of a node
    pub fn set_value(&mut self, id: NodeId, value: impl Into<String>) {
        if let Some(n) = self.nodes.get_mut(id) {
            n.value = Some(value.into());
        }
    }

    /// Input value of a node (empty if none)
    #[must_use]
    pub fn value(&self, id: NodeId) -> String {
        self.nodes
            .get(id)
            .and_then(|n| n.value.clone())
            .unwrap_or_default()
    }

    /// Set the text content of a node
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        if let Some(n) = self.nodes.get_mut(id) {
            n.text = text.into();
        }
    }

    /// Set checked state
    pub fn set_checked(&mut self, id: NodeId, checked: bool) {
        if let Some(n) = self.nodes.get_mut(id) {
            n.checked = Some(checked);
        }
    }

    /// Detach a node and its subtree; later handles to them are stale
    pub fn remove(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(n) = self.nodes.get_mut(current) {
                n.removed = true;
            }
            stack.extend(
                self.nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.parent == Some(current) && !n.removed)
                    .map(|(i, _)| i),
            );
        }
    }

    /// Current URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Change the URL
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    /// Mark a request as started
    pub fn begin_request(&mut self) {
        self.pending_requests += 1;
    }

    /// Mark a request as finished
    pub fn end_request(&mut self) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
        if self.pending_requests == 0 {
            self.idle_since = Instant::now();
        }
    }

    /// Apply `mutation` once `delay` has passed (checked on every driver call)
    pub fn defer<F>(&mut self, delay: Duration, mutation: F)
    where
        F: FnOnce(&mut Self) + Send + 'static,
    {
        self.deferred.push(Deferred {
            due: Instant::now() + delay,
            apply: Box::new(mutation),
        });
    }

    /// Number of mutations not yet applied
    #[must_use]
    pub fn pending_mutations(&self) -> usize {
        self.deferred.len()
    }

    fn apply_due(&mut self) {
        let now = Instant::now();
        loop {
            let next = self
                .deferred
                .iter()
                .enumerate()
                .filter(|(_, d)| d.due <= now)
                .min_by_key(|(_, d)| d.due)
                .map(|(i, _)| i);
            match next {
                Some(i) => {
                    let deferred = self.deferred.remove(i);
                    (deferred.apply)(self);
                }
                None => break,
            }
        }
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| !n.removed)
    }

    fn effectively_visible(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(i) = current {
            match self.nodes.get(i) {
                Some(n) if n.visible && !n.removed => current = n.parent,
                _ => return false,
            }
        }
        true
    }

    fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.parent(id);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent(p);
        }
        false
    }

    fn handle(&self, id: NodeId) -> ElementHandle {
        let n = &self.nodes[id];
        ElementHandle::new(node_key(id), n.role, n.name.clone())
    }

    fn snapshot(&self) -> PageSnapshot {
        let mut snapshot = PageSnapshot::new(self.url.clone());
        snapshot.pending_requests = self.pending_requests;
        snapshot.idle_for_ms = if self.pending_requests > 0 {
            0
        } else {
            u64::try_from(self.idle_since.elapsed().as_millis()).unwrap_or(u64::MAX)
        };
        snapshot.nodes = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.removed)
            .map(|(i, n)| SnapshotNode {
                id: node_key(i),
                role: n.role,
                name: n.name.clone(),
                parent: n.parent.map(node_key),
                visible: self.effectively_visible(i),
                enabled: n.enabled,
                text: n.text.clone(),
                value: n.value.clone(),
                checked: n.checked,
            })
            .collect();
        snapshot
    }
}

fn node_key(id: NodeId) -> String {
    format!("n{id}")
}

fn parse_key(key: &str) -> Option<NodeId> {
    key.strip_prefix('n').and_then(|s| s.parse().ok())
}

/// Interaction delivered to scripted handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEvent {
    /// Node acted on
    pub node: NodeId,
    /// Interaction kind
    pub kind: ActionKind,
    /// Payload, for fill and select
    pub payload: Option<String>,
}

type Handler = Arc<dyn Fn(&mut MockDom, &MockEvent) + Send + Sync>;

struct HandlerEntry {
    role: Role,
    name: TextMatch,
    handler: Handler,
}

struct MockState {
    dom: MockDom,
    handlers: Vec<HandlerEntry>,
    call_history: Vec<String>,
    fail_snapshots: bool,
    stale_acts: u32,
    acts: u32,
}

/// Scriptable driver over a [`MockDom`]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockDriver")
            .field("dom", &state.dom)
            .field("handlers", &state.handlers.len())
            .field("calls", &state.call_history.len())
            .finish()
    }
}

impl MockDriver {
    /// Create a driver serving `dom`
    #[must_use]
    pub fn new(dom: MockDom) -> Self {
        Self {
            state: Mutex::new(MockState {
                dom,
                handlers: Vec::new(),
                call_history: Vec::new(),
                fail_snapshots: false,
                stale_acts: 0,
                acts: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the page (due mutations are applied first)
    pub fn with_dom<R>(&self, f: impl FnOnce(&mut MockDom) -> R) -> R {
        let mut state = self.lock();
        state.dom.apply_due();
        f(&mut state.dom)
    }

    /// React to interactions with elements of `role` named exactly `name`
    pub fn on<F>(&self, role: Role, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut MockDom, &MockEvent) + Send + Sync + 'static,
    {
        self.lock().handlers.push(HandlerEntry {
            role,
            name: TextMatch::Exact(name.into()),
            handler: Arc::new(handler),
        });
    }

    /// Make `read_snapshot` fail until switched off
    pub fn fail_snapshots(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    /// Report the next `count` interactions as stale, as if the target
    /// re-rendered between resolution and use
    pub fn fail_next_acts_stale(&self, count: u32) {
        self.lock().stale_acts = count;
    }

    /// Interactions that reached the page
    #[must_use]
    pub fn act_count(&self) -> u32 {
        self.lock().acts
    }

    /// Get call history
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.lock().call_history.clone()
    }

    /// Check if a call starting with `prefix` was made
    #[must_use]
    pub fn was_called(&self, prefix: &str) -> bool {
        self.lock().call_history.iter().any(|c| c.starts_with(prefix))
    }

    /// Number of calls starting with `prefix`
    #[must_use]
    pub fn call_count(&self, prefix: &str) -> usize {
        self.lock()
            .call_history
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl AutomationDriver for MockDriver {
    async fn find_elements(
        &self,
        scope: Option<&ElementHandle>,
        role: Role,
        name: Option<&TextMatch>,
    ) -> FlowResult<Vec<ElementHandle>> {
        let mut state = self.lock();
        state.dom.apply_due();
        state.call_history.push(format!(
            "find_elements:{role}:{}",
            name.map(TextMatch::text).unwrap_or_default()
        ));
        let dom = &state.dom;

        let scope_id = match scope {
            Some(handle) => match parse_key(&handle.id).filter(|&id| dom.is_live(id)) {
                Some(id) => Some(id),
                None => return Err(FlowError::stale(handle.id.clone())),
            },
            None => None,
        };

        Ok((0..dom.nodes.len())
            .filter(|&i| dom.nodes[i].role == role && dom.effectively_visible(i))
            .filter(|&i| name.map_or(true, |m| m.matches(&dom.nodes[i].name)))
            .filter(|&i| scope_id.map_or(true, |s| dom.is_descendant(i, s)))
            .map(|i| dom.handle(i))
            .collect())
    }

    async fn act(
        &self,
        handle: &ElementHandle,
        kind: ActionKind,
        payload: Option<&str>,
    ) -> FlowResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.dom.apply_due();
        state.call_history.push(format!("act:{kind}:{}", handle.id));

        if state.stale_acts > 0 {
            state.stale_acts -= 1;
            return Err(FlowError::stale(handle.id.clone()));
        }

        let id = parse_key(&handle.id)
            .filter(|&id| state.dom.is_live(id))
            .ok_or_else(|| FlowError::stale(handle.id.clone()))?;
        if !state.dom.effectively_visible(id) || !state.dom.nodes[id].enabled {
            return Err(FlowError::NotInteractable {
                handle: handle.id.clone(),
                message: "element is hidden or disabled".to_string(),
            });
        }

        state.acts += 1;
        match kind {
            ActionKind::Fill | ActionKind::Select => {
                state.dom.set_value(id, payload.unwrap_or_default());
            }
            ActionKind::Check => state.dom.set_checked(id, true),
            ActionKind::Click => {}
        }

        let event = MockEvent {
            node: id,
            kind,
            payload: payload.map(str::to_string),
        };
        let node = &state.dom.nodes[id];
        let matching: Vec<Handler> = state
            .handlers
            .iter()
            .filter(|h| h.role == node.role && h.name.matches(&node.name))
            .map(|h| Arc::clone(&h.handler))
            .collect();
        for handler in matching {
            handler(&mut state.dom, &event);
        }
        Ok(())
    }

    async fn read_snapshot(&self) -> FlowResult<PageSnapshot> {
        let mut state = self.lock();
        state.dom.apply_due();
        state.call_history.push("read_snapshot".to_string());
        if state.fail_snapshots {
            return Err(FlowError::driver("snapshot unavailable"));
        }
        Ok(state.dom.snapshot())
    }

    async fn current_url(&self) -> FlowResult<String> {
        let mut state = self.lock();
        state.dom.apply_due();
        state.call_history.push("current_url".to_string());
        Ok(state.dom.url.clone())
    }

    async fn navigate(&self, url: &str) -> FlowResult<()> {
        let mut state = self.lock();
        state.dom.apply_due();
        state.call_history.push(format!("navigate:{url}"));
        state.dom.url = url.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> (MockDriver, NodeId, NodeId) {
        let mut dom = MockDom::new("https://app.test/form");
        let root = dom.root();
        let dialog = dom.add(root, Role::Dialog, "Edit");
        let name = dom.add(dialog, Role::Textbox, "Name");
        dom.add(dialog, Role::Button, "Save");
        (MockDriver::new(dom), dialog, name)
    }

    #[tokio::test]
    async fn test_find_respects_visibility() {
        let (driver, dialog, _) = form();
        let found = driver.find_elements(None, Role::Textbox, None).await.unwrap();
        assert_eq!(found.len(), 1);

        driver.with_dom(|dom| dom.set_visible(dialog, false));
        let found = driver.find_elements(None, Role::Textbox, None).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_fill_sets_value_and_fires_handler() {
        let (driver, _, name) = form();
        driver.on(Role::Button, "Save", move |dom, _| {
            let value = dom.value(name);
            dom.set_text(name, format!("saved {value}"));
        });

        let textbox = ElementHandle::new("n2", Role::Textbox, "Name");
        driver.act(&textbox, ActionKind::Fill, Some("Ada")).await.unwrap();
        let save = ElementHandle::new("n3", Role::Button, "Save");
        driver.act(&save, ActionKind::Click, None).await.unwrap();

        driver.with_dom(|dom| {
            assert_eq!(dom.value(name), "Ada");
            assert_eq!(dom.node(name).unwrap().text, "saved Ada");
        });
        assert_eq!(driver.act_count(), 2);
        assert!(driver.was_called("act:fill:n2"));
    }

    #[tokio::test]
    async fn test_removed_node_is_stale() {
        let (driver, dialog, _) = form();
        let handle = driver
            .find_elements(None, Role::Button, Some(&TextMatch::Exact("Save".into())))
            .await
            .unwrap()
            .remove(0);
        driver.with_dom(|dom| dom.remove(dialog));
        let err = driver.act(&handle, ActionKind::Click, None).await.unwrap_err();
        assert!(matches!(err, FlowError::StaleElement { .. }));
        assert_eq!(driver.act_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_is_not_interactable() {
        let (driver, _, name) = form();
        driver.with_dom(|dom| dom.set_enabled(name, false));
        let handle = ElementHandle::new("n2", Role::Textbox, "Name");
        let err = driver.act(&handle, ActionKind::Fill, Some("x")).await.unwrap_err();
        assert!(matches!(err, FlowError::NotInteractable { .. }));
    }

    #[tokio::test]
    async fn test_forced_stale_acts() {
        let (driver, _, _) = form();
        driver.fail_next_acts_stale(1);
        let save = ElementHandle::new("n3", Role::Button, "Save");
        assert!(driver.act(&save, ActionKind::Click, None).await.is_err());
        assert!(driver.act(&save, ActionKind::Click, None).await.is_ok());
        assert_eq!(driver.call_count("act:click"), 2);
    }

    #[tokio::test]
    async fn test_deferred_mutations_apply_in_due_order() {
        let (driver, _, name) = form();
        driver.with_dom(|dom| {
            dom.defer(Duration::ZERO, move |dom| dom.set_value(name, "first"));
            dom.defer(Duration::from_millis(1), move |dom| {
                let v = dom.value(name);
                dom.set_value(name, format!("{v}+second"));
            });
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let snap = driver.read_snapshot().await.unwrap();
        let node = snap.nodes.iter().find(|n| n.id == "n2").unwrap();
        assert_eq!(node.value.as_deref(), Some("first+second"));
        driver.with_dom(|dom| assert_eq!(dom.pending_mutations(), 0));
    }

    #[tokio::test]
    async fn test_network_tracking() {
        let (driver, _, _) = form();
        driver.with_dom(MockDom::begin_request);
        let snap = driver.read_snapshot().await.unwrap();
        assert!(snap.is_network_busy());
        assert_eq!(snap.idle_for_ms, 0);
        driver.with_dom(MockDom::end_request);
        let snap = driver.read_snapshot().await.unwrap();
        assert!(!snap.is_network_busy());
    }
}
