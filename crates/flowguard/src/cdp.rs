//! Chromium driver over the Chrome `DevTools` Protocol.
//!
//! Enabled with the `browser` feature. Roles and accessible names are
//! computed in-page by a small script that also tags every role-bearing
//! element with a `data-flowguard-id` attribute (the handle id) and counts
//! in-flight `fetch`/XHR requests for network quiescence.

use crate::driver::{ActionKind, AutomationDriver, ElementHandle, Role};
use crate::locator::TextMatch;
use crate::result::{FlowError, FlowResult};
use crate::snapshot::{PageSnapshot, SnapshotNode};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Launch settings
#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    /// Run without a window
    pub headless: bool,
    /// Chromium sandbox (disable in containers)
    pub sandbox: bool,
    /// Path to the chromium binary (None = auto-detect)
    pub chromium_path: Option<String>,
    /// Window width
    pub viewport_width: u32,
    /// Window height
    pub viewport_height: u32,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: true,
            chromium_path: None,
            viewport_width: 1280,
            viewport_height: 800,
        }
    }
}

impl ChromiumConfig {
    /// Disable sandbox (for containers/CI)
    #[must_use]
    pub const fn with_no_sandbox(mut self) -> Self {
        self.sandbox = false;
        self
    }

    /// Show the browser window
    #[must_use]
    pub const fn with_head(mut self) -> Self {
        self.headless = false;
        self
    }

    /// Set chromium path
    #[must_use]
    pub fn with_chromium_path(mut self, path: impl Into<String>) -> Self {
        self.chromium_path = Some(path.into());
        self
    }
}

/// One browser with one page, driven through CDP
#[derive(Debug)]
pub struct ChromiumDriver {
    browser: Arc<Mutex<Browser>>,
    page: Page,
    handler: tokio::task::JoinHandle<()>,
}

impl ChromiumDriver {
    /// Launch chromium and open a blank page
    ///
    /// # Errors
    ///
    /// Returns error if the browser cannot be launched
    pub async fn launch(config: ChromiumConfig) -> FlowResult<Self> {
        let mut builder = BrowserConfig::builder().window_size(config.viewport_width, config.viewport_height);
        if !config.headless {
            builder = builder.with_head();
        }
        if !config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(ref path) = config.chromium_path {
            builder = builder.chrome_executable(path);
        }
        let cdp_config = builder.build().map_err(FlowError::driver)?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| FlowError::driver(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FlowError::driver(e.to_string()))?;
        page.evaluate_on_new_document(PRELUDE)
            .await
            .map_err(|e| FlowError::driver(e.to_string()))?;
        info!(headless = config.headless, "chromium launched");

        Ok(Self {
            browser: Arc::new(Mutex::new(browser)),
            page,
            handler,
        })
    }

    /// Close the browser
    ///
    /// # Errors
    ///
    /// Returns error if chromium does not shut down cleanly
    pub async fn close(self) -> FlowResult<()> {
        let mut browser = self.browser.lock().await;
        browser
            .close()
            .await
            .map_err(|e| FlowError::driver(e.to_string()))?;
        self.handler.abort();
        Ok(())
    }

    async fn eval<T: DeserializeOwned>(&self, call: &str) -> FlowResult<T> {
        // The prelude is idempotent; re-running it covers pages loaded before
        // the new-document hook was installed.
        let script = format!("(() => {{ {PRELUDE}; return window.__flowguard.{call}; }})()");
        self.page
            .evaluate(script)
            .await
            .map_err(|e| FlowError::driver(e.to_string()))?
            .into_value()
            .map_err(|e| FlowError::driver(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    url: String,
    pending: u32,
    idle_for: u64,
    nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    role: String,
    name: String,
    parent: Option<String>,
    visible: bool,
    enabled: bool,
    text: String,
    value: Option<String>,
    checked: Option<bool>,
}

impl From<RawSnapshot> for PageSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let mut snapshot = Self::new(raw.url);
        snapshot.pending_requests = raw.pending;
        snapshot.idle_for_ms = raw.idle_for;
        snapshot.nodes = raw
            .nodes
            .into_iter()
            .map(|n| SnapshotNode {
                id: n.id,
                role: Role::from_aria(&n.role),
                name: n.name,
                parent: n.parent,
                visible: n.visible,
                enabled: n.enabled,
                text: n.text,
                value: n.value,
                checked: n.checked,
            })
            .collect();
        snapshot
    }
}

#[derive(Debug, Deserialize)]
struct ActOutcome {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl AutomationDriver for ChromiumDriver {
    async fn find_elements(
        &self,
        scope: Option<&ElementHandle>,
        role: Role,
        name: Option<&TextMatch>,
    ) -> FlowResult<Vec<ElementHandle>> {
        let snapshot = self.read_snapshot().await?;
        if let Some(scope) = scope {
            if snapshot.node(&scope.id).is_none() {
                return Err(FlowError::stale(scope.id.clone()));
            }
        }
        Ok(snapshot
            .nodes
            .iter()
            .filter(|n| n.role == role && n.visible)
            .filter(|n| name.map_or(true, |m| m.matches(&n.name)))
            .filter(|n| scope.map_or(true, |s| snapshot.is_descendant(n, &s.id)))
            .map(|n| ElementHandle::new(n.id.clone(), n.role, n.name.clone()))
            .collect())
    }

    async fn act(&self, handle: &ElementHandle, kind: ActionKind, payload: Option<&str>) -> FlowResult<()> {
        let args = serde_json::to_string(&(handle.id.as_str(), kind.to_string(), payload))?;
        debug!(handle = %handle.id, kind = %kind, "cdp act");
        let outcome: ActOutcome = self.eval(&format!("act(...{args})")).await?;
        if outcome.ok {
            return Ok(());
        }
        match outcome.error.as_deref() {
            Some("stale") => Err(FlowError::stale(handle.id.clone())),
            Some("not_interactable") => Err(FlowError::NotInteractable {
                handle: handle.id.clone(),
                message: "element is hidden or disabled".to_string(),
            }),
            other => Err(FlowError::driver(other.unwrap_or("action failed").to_string())),
        }
    }

    async fn read_snapshot(&self) -> FlowResult<PageSnapshot> {
        let raw: RawSnapshot = self.eval("snapshot()").await?;
        Ok(raw.into())
    }

    async fn current_url(&self) -> FlowResult<String> {
        self.page
            .url()
            .await
            .map_err(|e| FlowError::driver(e.to_string()))
            .map(Option::unwrap_or_default)
    }

    async fn navigate(&self, url: &str) -> FlowResult<()> {
        info!(url, "navigate");
        self.page
            .goto(url)
            .await
            .map_err(|e| FlowError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// In-page helper installed as `window.__flowguard`
const PRELUDE: &str = r#"
if (!window.__flowguard) {
  const state = { pending: 0, idleSince: Date.now(), seq: 0 };
  const begin = () => { state.pending += 1; };
  const end = () => { state.pending = Math.max(0, state.pending - 1); if (state.pending === 0) state.idleSince = Date.now(); };
  if (window.fetch) {
    const origFetch = window.fetch;
    window.fetch = function (...args) { begin(); return origFetch.apply(this, args).finally(end); };
  }
  const origSend = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.send = function (...args) { begin(); this.addEventListener('loadend', end, { once: true }); return origSend.apply(this, args); };

  const implicitRole = (el) => {
    const tag = el.tagName.toLowerCase();
    const type = (el.getAttribute('type') || 'text').toLowerCase();
    switch (tag) {
      case 'button': return 'button';
      case 'a': return el.hasAttribute('href') ? 'link' : null;
      case 'input':
        if (['button', 'submit', 'reset'].includes(type)) return 'button';
        if (type === 'checkbox') return 'checkbox';
        if (type === 'radio') return 'radio';
        if (type === 'search') return 'searchbox';
        if (type === 'hidden') return null;
        return 'textbox';
      case 'textarea': return 'textbox';
      case 'select': return (el.multiple || el.size > 1) ? 'listbox' : 'combobox';
      case 'option': return 'option';
      case 'table': return 'table';
      case 'tr': return 'row';
      case 'td': return 'cell';
      case 'th': return 'columnheader';
      case 'ul': case 'ol': return 'list';
      case 'li': return 'listitem';
      case 'form': return 'form';
      case 'nav': return 'navigation';
      case 'main': return 'main';
      case 'dialog': return 'dialog';
      case 'h1': case 'h2': case 'h3': case 'h4': case 'h5': case 'h6': return 'heading';
      default: return null;
    }
  };
  const roleOf = (el) => (el.getAttribute('role') || implicitRole(el));
  const clean = (s) => (s || '').replace(/\s+/g, ' ').trim();
  const nameOf = (el, role) => {
    if (el.hasAttribute('aria-label')) return clean(el.getAttribute('aria-label'));
    const by = el.getAttribute('aria-labelledby');
    if (by) return clean(by.split(/\s+/).map((id) => { const l = document.getElementById(id); return l ? l.textContent : ''; }).join(' '));
    if (el.labels && el.labels.length) return clean(Array.from(el.labels).map((l) => l.textContent).join(' '));
    if (el.tagName === 'INPUT' && ['button', 'submit', 'reset'].includes(el.type)) return clean(el.value);
    if (['button', 'link', 'option', 'cell', 'columnheader', 'heading', 'row', 'listitem', 'tab', 'checkbox', 'radio'].includes(role)) return clean(el.textContent);
    if (role === 'dialog') { const h = el.querySelector('h1,h2,h3,h4,h5,h6'); if (h) return clean(h.textContent); }
    return clean(el.getAttribute('placeholder') || el.getAttribute('title') || el.getAttribute('alt'));
  };
  const visible = (el) => {
    if (el.closest('[hidden],[aria-hidden="true"]')) return false;
    if (el.tagName === 'OPTION') { const sel = el.closest('select'); return sel ? visible(sel) : true; }
    if (el.tagName === 'DIALOG' && !el.open) return false;
    const style = getComputedStyle(el);
    if (style.visibility === 'hidden' || style.display === 'none') return false;
    return el.getClientRects().length > 0;
  };
  const idOf = (el) => {
    if (!el.dataset.flowguardId) { state.seq += 1; el.dataset.flowguardId = 'e' + state.seq; }
    return el.dataset.flowguardId;
  };
  const byId = (id) => document.querySelector('[data-flowguard-id="' + id + '"]');

  window.__flowguard = {
    snapshot() {
      const nodes = [];
      for (const el of document.querySelectorAll('*')) {
        const role = roleOf(el);
        if (!role) continue;
        let parent = null;
        for (let p = el.parentElement; p; p = p.parentElement) {
          if (roleOf(p)) { parent = idOf(p); break; }
        }
        const isInput = ['INPUT', 'TEXTAREA', 'SELECT'].includes(el.tagName);
        const checkable = ['checkbox', 'radio', 'switch'].includes(role);
        nodes.push({
          id: idOf(el),
          role,
          name: nameOf(el, role),
          parent,
          visible: visible(el),
          enabled: !(el.disabled || el.getAttribute('aria-disabled') === 'true'),
          text: clean(el.textContent),
          value: isInput && !checkable ? (el.tagName === 'SELECT' ? clean(el.selectedOptions[0] ? el.selectedOptions[0].textContent : '') : el.value) : null,
          checked: checkable ? (el.checked === true || el.getAttribute('aria-checked') === 'true') : null,
        });
      }
      return { url: location.href, pending: state.pending, idleFor: state.pending ? 0 : Date.now() - state.idleSince, nodes };
    },
    act(id, kind, payload) {
      const el = byId(id);
      if (!el || !el.isConnected) return { ok: false, error: 'stale' };
      if (!visible(el) || el.disabled) return { ok: false, error: 'not_interactable' };
      el.scrollIntoView({ block: 'center' });
      if (kind === 'click') { el.click(); return { ok: true }; }
      if (kind === 'check') { const on = el.checked === true || el.getAttribute('aria-checked') === 'true'; if (!on) el.click(); return { ok: true }; }
      if (kind === 'fill') {
        el.focus();
        const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
        const setter = Object.getOwnPropertyDescriptor(proto, 'value');
        if (setter && setter.set) setter.set.call(el, payload); else el.value = payload;
        el.dispatchEvent(new Event('input', { bubbles: true }));
        el.dispatchEvent(new Event('change', { bubbles: true }));
        return { ok: true };
      }
      if (kind === 'select') {
        const opt = Array.from(el.options || []).find((o) => clean(o.textContent) === payload || o.value === payload);
        if (!opt) return { ok: false, error: 'no option ' + payload };
        el.value = opt.value;
        el.dispatchEvent(new Event('change', { bubbles: true }));
        return { ok: true };
      }
      return { ok: false, error: 'unsupported action ' + kind };
    },
  };
}
"#;
