//! Registry seam used by the virtualization scope and hive capture.
//!
//! [`Registry`] is the small set of operations the sandbox needs. The Windows
//! implementation talks to advapi32; [`memory::MemoryRegistry`] models the
//! same semantics in-process, including predefined-root overrides.

pub mod hive;
pub mod memory;
pub mod scope;
#[cfg(windows)]
pub mod windows;

use crate::error::RegistryError;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

pub use scope::VirtualizationScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PredefinedRoot {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

impl PredefinedRoot {
    pub const ALL: [PredefinedRoot; 5] = [
        PredefinedRoot::ClassesRoot,
        PredefinedRoot::CurrentUser,
        PredefinedRoot::LocalMachine,
        PredefinedRoot::Users,
        PredefinedRoot::CurrentConfig,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PredefinedRoot::ClassesRoot => "HKEY_CLASSES_ROOT",
            PredefinedRoot::CurrentUser => "HKEY_CURRENT_USER",
            PredefinedRoot::LocalMachine => "HKEY_LOCAL_MACHINE",
            PredefinedRoot::Users => "HKEY_USERS",
            PredefinedRoot::CurrentConfig => "HKEY_CURRENT_CONFIG",
        }
    }
}

impl FromStr for PredefinedRoot {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PredefinedRoot::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| RegistryError::UnknownRoot(s.to_string()))
    }
}

/// Absolute key path: a predefined root plus a backslash separated subkey.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    root: PredefinedRoot,
    subkey: String,
}

impl KeyPath {
    pub fn new(root: PredefinedRoot, subkey: impl Into<String>) -> Self {
        let subkey: String = subkey.into();
        Self {
            root,
            subkey: subkey.trim_matches('\\').to_string(),
        }
    }

    pub fn root(&self) -> PredefinedRoot {
        self.root
    }

    pub fn subkey(&self) -> &str {
        &self.subkey
    }

    pub fn join(&self, child: &str) -> Self {
        let child = child.trim_matches('\\');
        if self.subkey.is_empty() {
            Self::new(self.root, child)
        } else if child.is_empty() {
            self.clone()
        } else {
            Self::new(self.root, format!("{}\\{}", self.subkey, child))
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.subkey.split('\\').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subkey.is_empty() {
            f.write_str(self.root.name())
        } else {
            write!(f, "{}\\{}", self.root.name(), self.subkey)
        }
    }
}

impl FromStr for KeyPath {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (root, rest) = s.split_once('\\').unwrap_or((s, ""));
        Ok(KeyPath::new(root.parse()?, rest))
    }
}

/// Registry operations the sandbox relies on. Every path is resolved through
/// whatever root overrides are active in the process at call time.
pub trait Registry: Send + Sync {
    /// Creates `key` and any missing parents.
    fn create_key(&self, key: &KeyPath) -> Result<(), RegistryError>;

    /// Deletes `key` and everything below it; a missing key is not an error.
    fn delete_tree(&self, key: &KeyPath) -> Result<(), RegistryError>;

    /// Immediate subkey names, or `None` if `key` does not exist.
    fn subkey_names(&self, key: &KeyPath) -> Result<Option<Vec<String>>, RegistryError>;

    /// The unnamed string value of `key`, if both exist.
    fn default_value(&self, key: &KeyPath) -> Result<Option<String>, RegistryError>;

    /// Redirects `root` for the whole process to `target`.
    fn override_root(&self, root: PredefinedRoot, target: &KeyPath) -> Result<(), RegistryError>;

    /// Restores the real `root`.
    fn revert_root(&self, root: PredefinedRoot) -> Result<(), RegistryError>;

    /// Enables the backup privilege on the current process token.
    fn enable_backup_privilege(&self) -> Result<(), RegistryError>;

    /// Writes the subtree at `key` to a new hive file at `file`.
    fn save_key(&self, key: &KeyPath, file: &Path) -> Result<(), RegistryError>;

    /// Flag marking a live [`VirtualizationScope`] for the process this
    /// registry's overrides apply to.
    fn scope_slot(&self) -> &AtomicBool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_paths_parse_and_print() {
        let key: KeyPath = r"HKEY_CURRENT_USER\abc\CLSID".parse().unwrap();
        assert_eq!(key.root(), PredefinedRoot::CurrentUser);
        assert_eq!(key.subkey(), r"abc\CLSID");
        assert_eq!(key.to_string(), r"HKEY_CURRENT_USER\abc\CLSID");

        let root: KeyPath = "hkey_users".parse().unwrap();
        assert_eq!(root.to_string(), "HKEY_USERS");
        assert!("HKEY_NOPE\\x".parse::<KeyPath>().is_err());
    }

    #[test]
    fn join_handles_empty_sides() {
        let root = KeyPath::new(PredefinedRoot::ClassesRoot, "");
        assert_eq!(root.join("CLSID").to_string(), r"HKEY_CLASSES_ROOT\CLSID");
        assert_eq!(root.join("CLSID").join(r"\{x}\").subkey(), r"CLSID\{x}");
        assert_eq!(root.join("").to_string(), "HKEY_CLASSES_ROOT");
    }
}
