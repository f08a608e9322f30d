//! Process-lifetime kernel state.
//!
//! Everything here outlives execution contexts: the module resolver, the
//! persistent store, the menu, the fault indicator and the inventory of
//! children and content files. Rust closures handed to Lua may hold an
//! `Rc<Kernel>`; the kernel itself never holds per-context Lua values.

use crate::actions::{ClearPersistentAction, StatusAction};
use crate::host::HostFunctions;
use crate::modules;
use crate::persistent::PersistentStore;
use crate::session::Menu;
use lantern_runtime::{ModuleResolver, OptionsManifest, SandboxResult};
use mlua::Lua;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Target used for kernel failure logs.
pub const KERNEL: &str = "kernel";

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Booting,
    Running,
    Reloading,
    Teardown,
}

/// Children and content files the host has announced, with the time of
/// each one's last update.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    children: BTreeMap<String, f64>,
    contents: BTreeMap<String, f64>,
}

impl Inventory {
    /// Children in name order.
    pub fn children(&self) -> impl Iterator<Item = (&str, f64)> {
        self.children.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Content files in name order.
    pub fn contents(&self) -> impl Iterator<Item = (&str, f64)> {
        self.contents.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn has_content(&self, name: &str) -> bool {
        self.contents.contains_key(name)
    }

    pub(crate) fn add_child(&mut self, name: &str, now: f64) {
        self.children.insert(name.to_string(), now);
    }

    pub(crate) fn remove_child(&mut self, name: &str) {
        self.children.remove(name);
    }

    pub(crate) fn add_content(&mut self, name: &str, now: f64) {
        self.contents.insert(name.to_string(), now);
    }

    pub(crate) fn remove_content(&mut self, name: &str) {
        self.contents.remove(name);
    }

    fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    fn content_names(&self) -> Vec<String> {
        self.contents.keys().cloned().collect()
    }

    /// Names to replay into a fresh context: `(children, contents)`.
    pub(crate) fn snapshot(&self) -> (Vec<String>, Vec<String>) {
        (self.child_names(), self.content_names())
    }
}

/// Shared kernel state.
pub struct Kernel {
    name: String,
    host: Rc<dyn HostFunctions>,
    modules: ModuleResolver,
    persistent: PersistentStore,
    menu: Rc<Menu>,
    fault: RefCell<Option<String>>,
    inventory: RefCell<Inventory>,
    state: Cell<NodeState>,
}

impl Kernel {
    pub(crate) fn new(
        lua: &Lua,
        name: &str,
        host: Rc<dyn HostFunctions>,
        manifest: OptionsManifest,
    ) -> SandboxResult<Rc<Self>> {
        let menu = Rc::new(Menu::new(manifest)?);
        let persistent = PersistentStore::new(lua).map_err(crate::bridge::script_error)?;

        let kernel = Rc::new(Self {
            name: name.to_string(),
            modules: modules::resolver(Rc::clone(&host)),
            host,
            persistent,
            menu,
            fault: RefCell::new(None),
            inventory: RefCell::new(Inventory::default()),
            state: Cell::new(NodeState::Uninitialized),
        });

        kernel
            .menu
            .register_action("status", Rc::new(StatusAction::new(Rc::downgrade(&kernel))));
        kernel.menu.register_action(
            "clear_persistent",
            Rc::new(ClearPersistentAction::new(Rc::downgrade(&kernel))),
        );

        Ok(kernel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Rc<dyn HostFunctions> {
        &self.host
    }

    pub fn modules(&self) -> &ModuleResolver {
        &self.modules
    }

    pub fn persistent(&self) -> &PersistentStore {
        &self.persistent
    }

    pub fn menu(&self) -> &Rc<Menu> {
        &self.menu
    }

    /// Message of the last unhandled script error, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.borrow().clone()
    }

    pub(crate) fn set_fault(&self, message: String) {
        *self.fault.borrow_mut() = Some(message);
    }

    pub(crate) fn clear_fault(&self) {
        self.fault.borrow_mut().take();
    }

    pub fn inventory(&self) -> Ref<'_, Inventory> {
        self.inventory.borrow()
    }

    pub(crate) fn inventory_mut(&self) -> RefMut<'_, Inventory> {
        self.inventory.borrow_mut()
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.set(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_tracks_last_update() {
        let mut inventory = Inventory::default();
        inventory.add_child("b", 1.0);
        inventory.add_child("a", 2.0);
        inventory.add_child("b", 5.0);

        let children: Vec<(&str, f64)> = inventory.children().collect();
        assert_eq!(children, vec![("a", 2.0), ("b", 5.0)]);

        inventory.remove_child("a");
        assert!(!inventory.has_child("a"));
        assert!(inventory.has_child("b"));
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut inventory = Inventory::default();
        inventory.add_content("z.png", 0.0);
        inventory.add_content("a.png", 0.0);
        inventory.add_child("kid", 0.0);

        let (children, contents) = inventory.snapshot();
        assert_eq!(children, vec!["kid"]);
        assert_eq!(contents, vec!["a.png", "z.png"]);
    }
}
