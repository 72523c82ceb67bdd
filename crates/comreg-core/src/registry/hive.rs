//! Export of a live registry subtree to a hive file.

use super::{KeyPath, Registry};
use crate::error::RegistryError;
use std::path::Path;
use tracing::debug;

/// Writes the subtree at `key` to `output`.
///
/// The export refuses to overwrite, so a stale file is removed first. The
/// backup privilege is enabled on every call rather than assumed to persist.
pub fn save(registry: &dyn Registry, key: &KeyPath, output: &Path) -> Result<(), RegistryError> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(output) {
        Ok(()) => debug!(path = %output.display(), "removed stale hive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    registry.enable_backup_privilege()?;
    registry.save_key(key, output)
}
