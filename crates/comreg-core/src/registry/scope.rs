//! Registry virtualization scope.
//!
//! Opening a scope creates `HKEY_CURRENT_USER\<uuid>` with one branch per
//! predefined root and redirects every root into its branch. Root overrides
//! are process-global, so at most one scope may be open per process; the
//! registry's scope slot enforces that at runtime.

use super::{KeyPath, PredefinedRoot, Registry};
use crate::error::RegistryError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Roots in the order they are redirected. The current user goes last so
/// the private key itself stays reachable while the others are applied.
const OVERRIDE_ORDER: [PredefinedRoot; 5] = [
    PredefinedRoot::ClassesRoot,
    PredefinedRoot::LocalMachine,
    PredefinedRoot::Users,
    PredefinedRoot::CurrentConfig,
    PredefinedRoot::CurrentUser,
];

/// Container keys COM registration expects to find under each branch.
const SEEDED_KEYS: &[(PredefinedRoot, &str)] = &[
    (PredefinedRoot::ClassesRoot, r"WOW6432Node\CLSID"),
    (PredefinedRoot::ClassesRoot, "CLSID"),
    (PredefinedRoot::LocalMachine, r"SOFTWARE\Classes"),
];

/// Class registered by the scripting runtime outside the redirected roots.
const LEAKED_CLASS_IDS: &[&str] = &["{D5DE8D20-5BB8-11D1-A1E3-00A0C90F2731}"];

/// OLE Automation and scripting type libraries that registration drags in.
const LEAKED_TYPE_LIBS: &[&str] = &[
    "{000204EF-0000-0000-C000-000000000046}",
    "{EA544A21-C82D-11D1-A3E4-00A0C90AEA82}",
];

pub struct VirtualizationScope {
    registry: Arc<dyn Registry>,
    path: KeyPath,
    overridden: Vec<PredefinedRoot>,
    closed: bool,
    discarded: bool,
}

impl VirtualizationScope {
    /// Creates the private root and redirects all five predefined roots.
    /// Fails with [`RegistryError::ScopeActive`] if a scope is already open
    /// for this registry's process.
    pub fn open(registry: Arc<dyn Registry>) -> Result<Self, RegistryError> {
        if registry
            .scope_slot()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RegistryError::ScopeActive);
        }

        let path = KeyPath::new(
            PredefinedRoot::CurrentUser,
            uuid::Uuid::new_v4().hyphenated().to_string(),
        );
        let mut scope = Self {
            registry,
            path,
            overridden: Vec::with_capacity(OVERRIDE_ORDER.len()),
            closed: false,
            discarded: false,
        };
        // On error, Drop reverts whatever was applied and removes the key.
        scope.apply()?;
        debug!(root = %scope.path, "virtualization scope opened");
        Ok(scope)
    }

    fn apply(&mut self) -> Result<(), RegistryError> {
        for root in OVERRIDE_ORDER {
            self.registry.create_key(&self.branch(root))?;
        }
        for (root, subkey) in SEEDED_KEYS {
            self.registry.create_key(&self.branch(*root).join(subkey))?;
        }
        for root in OVERRIDE_ORDER {
            self.registry.override_root(root, &self.branch(root))?;
            self.overridden.push(root);
        }
        Ok(())
    }

    /// Absolute path of the private root, valid for capture once the scope
    /// is closed.
    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    /// Branch of the private root that stands in for `root`.
    pub fn branch(&self, root: PredefinedRoot) -> KeyPath {
        self.path.join(root.name())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Prunes known leaked keys and reverts every override in reverse order.
    /// Never fails; safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.overridden.is_empty() {
            prune_leaked_keys(self.registry.as_ref());
        }
        while let Some(root) = self.overridden.pop() {
            if let Err(e) = self.registry.revert_root(root) {
                warn!(root = root.name(), error = %e, "failed to revert registry override");
            }
        }
        self.registry.scope_slot().store(false, Ordering::Release);
        debug!(root = %self.path, "virtualization scope closed");
    }

    /// Deletes the private root. Closes the scope first if needed.
    pub fn discard(&mut self) {
        self.close();
        if self.discarded {
            return;
        }
        self.discarded = true;
        if let Err(e) = self.registry.delete_tree(&self.path) {
            warn!(root = %self.path, error = %e, "failed to delete sandbox key");
        }
    }
}

impl Drop for VirtualizationScope {
    fn drop(&mut self) {
        self.discard();
    }
}

fn prune_leaked_keys(registry: &dyn Registry) {
    let delete = |key: KeyPath| {
        if let Err(e) = registry.delete_tree(&key) {
            debug!(key = %key, error = %e, "leaked key cleanup failed");
        }
    };

    let clsid = KeyPath::new(PredefinedRoot::ClassesRoot, "CLSID");
    for id in LEAKED_CLASS_IDS {
        delete(clsid.join(id));
    }

    let type_libs = KeyPath::new(PredefinedRoot::LocalMachine, r"SOFTWARE\Classes\TypeLib");
    for id in LEAKED_TYPE_LIBS {
        delete(type_libs.join(id));
    }

    let interfaces = KeyPath::new(PredefinedRoot::LocalMachine, r"SOFTWARE\Classes\Interface");
    let names = match registry.subkey_names(&interfaces) {
        Ok(Some(names)) => names,
        Ok(None) => return,
        Err(e) => {
            debug!(key = %interfaces, error = %e, "cannot enumerate interfaces");
            return;
        }
    };
    for name in names {
        let interface = interfaces.join(&name);
        let type_lib = match registry.default_value(&interface.join("TypeLib")) {
            Ok(Some(value)) => value,
            _ => continue,
        };
        if LEAKED_TYPE_LIBS
            .iter()
            .any(|id| id.eq_ignore_ascii_case(type_lib.trim()))
        {
            delete(interface);
        }
    }
}
