//! Scripted contacts application used by the integration tests.
//!
//! Layout (roles and accessible names):
//!
//! ```text
//! main
//! ├── button "Add contact"
//! ├── searchbox "Search"
//! ├── button "Apply"
//! ├── table "Contacts"
//! │   └── row "<name>" ── cell, button "Edit", button "Delete"
//! └── dialog "Add contact" (hidden until opened)
//!     ├── textbox "Name", textbox "Email"
//!     └── button "Confirm", button "Cancel"
//! ```
//!
//! Every reaction is rendered after [`RENDER_LAG`], so a test that does not
//! wait correctly fails.

#![allow(dead_code)]

use flowguard::mock::{MockDom, MockDriver, NodeId};
use flowguard::{
    Action, ElementReference, EngineConfig, EntityRegistration, RetryPolicy, Role, Workflow,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BASE_URL: &str = "https://contacts.test";
pub const RENDER_LAG: Duration = Duration::from_millis(20);
pub const SEEDED: [&str; 4] = ["Aaron Adams", "Aaron Burr", "Betty Boop", "Carl Cox"];

/// Handles to the interesting nodes
#[derive(Debug, Clone, Copy)]
pub struct Ids {
    pub table: NodeId,
    pub dialog: NodeId,
    pub name_box: NodeId,
    pub email_box: NodeId,
    pub search: NodeId,
}

/// The app plus counters for side effects
#[derive(Debug)]
pub struct ContactsApp {
    pub driver: MockDriver,
    pub ids: Ids,
    pub deletes: Arc<AtomicUsize>,
}

/// Names of the rows still in the table, hidden ones included
pub fn row_names(driver: &MockDriver, ids: &Ids) -> Vec<String> {
    driver.with_dom(|dom| {
        dom.children(ids.table)
            .into_iter()
            .filter_map(|id| dom.node(id).filter(|n| !n.removed).map(|n| n.name.clone()))
            .collect()
    })
}

fn add_row(dom: &mut MockDom, table: NodeId, name: &str) -> NodeId {
    let row = dom.add(table, Role::Row, name);
    let cell = dom.add(row, Role::Cell, name);
    dom.set_text(cell, name);
    dom.add(row, Role::Button, "Edit");
    dom.add(row, Role::Button, "Delete");
    row
}

/// Build the app with the seeded contacts
pub fn contacts_app() -> ContactsApp {
    let mut dom = MockDom::new(format!("{BASE_URL}/contacts"));
    let root = dom.root();
    dom.add(root, Role::Button, "Add contact");
    let search = dom.add(root, Role::Searchbox, "Search");
    dom.add(root, Role::Button, "Apply");
    let table = dom.add(root, Role::Table, "Contacts");
    for name in SEEDED {
        add_row(&mut dom, table, name);
    }
    let dialog = dom.add(root, Role::Dialog, "Add contact");
    let name_box = dom.add(dialog, Role::Textbox, "Name");
    let email_box = dom.add(dialog, Role::Textbox, "Email");
    dom.add(dialog, Role::Button, "Confirm");
    dom.add(dialog, Role::Button, "Cancel");
    dom.set_visible(dialog, false);

    let ids = Ids {
        table,
        dialog,
        name_box,
        email_box,
        search,
    };
    let driver = MockDriver::new(dom);

    driver.on(Role::Button, "Add contact", move |dom, _| {
        dom.defer(RENDER_LAG, move |dom| dom.set_visible(ids.dialog, true));
    });

    driver.on(Role::Button, "Confirm", move |dom, _| {
        let name = dom.value(ids.name_box);
        dom.defer(RENDER_LAG, move |dom| {
            if !name.is_empty() {
                add_row(dom, ids.table, &name);
            }
            close_dialog(dom, ids);
        });
    });

    driver.on(Role::Button, "Cancel", move |dom, _| {
        dom.defer(RENDER_LAG, move |dom| close_dialog(dom, ids));
    });

    let deletes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deletes);
    driver.on(Role::Button, "Delete", move |dom, event| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(row) = dom.ancestor(event.node, Role::Row) {
            dom.defer(RENDER_LAG, move |dom| dom.remove(row));
        }
    });

    // Filtering only happens on Apply, never while typing
    driver.on(Role::Button, "Apply", move |dom, _| {
        let query = dom.value(ids.search);
        dom.defer(RENDER_LAG, move |dom| {
            for row in dom.children(ids.table) {
                let matches = dom
                    .node(row)
                    .is_some_and(|n| n.name.contains(query.as_str()));
                dom.set_visible(row, matches);
            }
        });
    });

    ContactsApp {
        driver,
        ids,
        deletes,
    }
}

fn close_dialog(dom: &mut MockDom, ids: Ids) {
    dom.set_visible(ids.dialog, false);
    dom.set_value(ids.name_box, "");
    dom.set_value(ids.email_box, "");
}

pub fn config() -> EngineConfig {
    EngineConfig::new()
        .with_base_url(BASE_URL)
        .with_timeout_ms(1000)
        .with_poll_interval_ms(10)
        .with_retry(RetryPolicy::new(3, 5))
}

pub fn button(name: &str) -> ElementReference {
    ElementReference::named(Role::Button, name)
}

pub fn dialog() -> ElementReference {
    ElementReference::named(Role::Dialog, "Add contact")
}

pub fn in_dialog(role: Role, name: &str) -> ElementReference {
    ElementReference::named(role, name).within(dialog())
}

pub fn rows() -> ElementReference {
    ElementReference::role(Role::Row).within(ElementReference::named(Role::Table, "Contacts"))
}

pub fn row(name: &str) -> ElementReference {
    ElementReference::named(Role::Row, name)
}

/// Delete the contact named `name`
pub fn delete_contact(name: &str) -> Workflow {
    Workflow::new(format!("delete {name}"))
        .then(Action::click(button("Delete").within(row(name))))
        .verify(flowguard::VerificationClaim::element_absent(row(name)))
}

/// Registration for a contact created under `name`
pub fn contact(name: &str) -> EntityRegistration {
    EntityRegistration::new("contact", name, delete_contact(name))
}
