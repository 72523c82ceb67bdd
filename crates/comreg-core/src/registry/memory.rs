//! In-process registry model.
//!
//! Each instance stands for one process: its own key tree, its own root
//! overrides and its own scope slot. Keys are case-insensitive, overrides are
//! resolved when applied, and `save_key` writes the subtree as JSON, refusing
//! to overwrite an existing file just like the real export call.

use super::{KeyPath, PredefinedRoot, Registry};
use crate::error::RegistryError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;

#[derive(Debug, Default, Clone)]
struct Node {
    name: String,
    default: Option<String>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn find(&self, segments: &[String]) -> Option<&Node> {
        segments
            .iter()
            .try_fold(self, |node, seg| node.children.get(&seg.to_lowercase()))
    }

    fn find_mut(&mut self, segments: &[String]) -> Option<&mut Node> {
        let mut node = self;
        for seg in segments {
            node = node.children.get_mut(&seg.to_lowercase())?;
        }
        Some(node)
    }

    fn create(&mut self, segments: &[String]) -> &mut Node {
        let mut node = self;
        for seg in segments {
            node = node
                .children
                .entry(seg.to_lowercase())
                .or_insert_with(|| Node::named(seg));
        }
        node
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "default": self.default,
            "subkeys": self.children.values().map(Node::to_json).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Default)]
struct State {
    roots: HashMap<PredefinedRoot, Node>,
    overrides: HashMap<PredefinedRoot, (PredefinedRoot, Vec<String>)>,
    override_calls: usize,
    revert_calls: usize,
    backup_privilege_calls: usize,
}

impl State {
    fn resolve(&self, key: &KeyPath) -> (PredefinedRoot, Vec<String>) {
        let segments = key.segments().map(str::to_string);
        match self.overrides.get(&key.root()) {
            Some((root, prefix)) => (*root, prefix.iter().cloned().chain(segments).collect()),
            None => (key.root(), segments.collect()),
        }
    }

    fn node(&self, key: &KeyPath) -> Option<&Node> {
        let (root, segments) = self.resolve(key);
        self.roots.get(&root)?.find(&segments)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
    scope_slot: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, key: &KeyPath) -> bool {
        self.state.lock().node(key).is_some()
    }

    pub fn set_default_value(&self, key: &KeyPath, value: &str) {
        let mut state = self.state.lock();
        let (root, segments) = state.resolve(key);
        let node = state
            .roots
            .entry(root)
            .or_insert_with(|| Node::named(root.name()))
            .create(&segments);
        node.default = Some(value.to_string());
    }

    /// Roots currently redirected, in a stable order.
    pub fn overridden_roots(&self) -> Vec<PredefinedRoot> {
        let mut roots: Vec<_> = self.state.lock().overrides.keys().copied().collect();
        roots.sort();
        roots
    }

    pub fn override_calls(&self) -> usize {
        self.state.lock().override_calls
    }

    pub fn revert_calls(&self) -> usize {
        self.state.lock().revert_calls
    }

    pub fn backup_privilege_calls(&self) -> usize {
        self.state.lock().backup_privilege_calls
    }

    /// Subtree at `key` in the same JSON shape `save_key` writes.
    pub fn snapshot(&self, key: &KeyPath) -> Option<serde_json::Value> {
        self.state.lock().node(key).map(Node::to_json)
    }
}

impl Registry for MemoryRegistry {
    fn create_key(&self, key: &KeyPath) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let (root, segments) = state.resolve(key);
        state
            .roots
            .entry(root)
            .or_insert_with(|| Node::named(root.name()))
            .create(&segments);
        Ok(())
    }

    fn delete_tree(&self, key: &KeyPath) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let (root, segments) = state.resolve(key);
        let Some(root_node) = state.roots.get_mut(&root) else {
            return Ok(());
        };
        match segments.split_last() {
            Some((last, parent)) => {
                if let Some(parent) = root_node.find_mut(parent) {
                    parent.children.remove(&last.to_lowercase());
                }
            }
            None => root_node.children.clear(),
        }
        Ok(())
    }

    fn subkey_names(&self, key: &KeyPath) -> Result<Option<Vec<String>>, RegistryError> {
        let state = self.state.lock();
        Ok(state
            .node(key)
            .map(|n| n.children.values().map(|c| c.name.clone()).collect()))
    }

    fn default_value(&self, key: &KeyPath) -> Result<Option<String>, RegistryError> {
        let state = self.state.lock();
        Ok(state.node(key).and_then(|n| n.default.clone()))
    }

    fn override_root(&self, root: PredefinedRoot, target: &KeyPath) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.node(target).is_none() {
            return Err(RegistryError::NotFound(target.to_string()));
        }
        let resolved = state.resolve(target);
        state.overrides.insert(root, resolved);
        state.override_calls += 1;
        Ok(())
    }

    fn revert_root(&self, root: PredefinedRoot) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.overrides.remove(&root);
        state.revert_calls += 1;
        Ok(())
    }

    fn enable_backup_privilege(&self) -> Result<(), RegistryError> {
        self.state.lock().backup_privilege_calls += 1;
        Ok(())
    }

    fn save_key(&self, key: &KeyPath, file: &Path) -> Result<(), RegistryError> {
        let json = self
            .snapshot(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        let mut out = OpenOptions::new().write(true).create_new(true).open(file)?;
        out.write_all(&serde_json::to_vec_pretty(&json).map_err(std::io::Error::from)?)?;
        Ok(())
    }

    fn scope_slot(&self) -> &AtomicBool {
        &self.scope_slot
    }
}
