use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "comreg";
pub const APP_NAME: &str = "comreg";

pub const HIVE_FILE_NAME: &str = "registration.hive";
pub const SIDECAR_FILE_NAME: &str = "fileinfo.json";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow!("cannot determine data directory"))
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn settings_path() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("COMREG_SETTINGS") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("settings.json"))
}

pub fn default_output_root() -> Result<PathBuf> {
    Ok(project_dirs()?.data_local_dir().join("registrations"))
}

/// Directory of the running executable; helper binaries ship beside it.
pub fn install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe
        .parent()
        .ok_or_else(|| anyhow!("no parent for exe"))?
        .to_path_buf())
}

pub fn helper_path(stem: &str) -> Result<PathBuf> {
    let mut p = install_dir()?;
    #[cfg(windows)]
    {
        p.push(format!("{stem}.exe"));
    }
    #[cfg(not(windows))]
    {
        p.push(stem);
    }
    Ok(p)
}

/// Per-file output location, keyed by the file's content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationLayout {
    dir: PathBuf,
}

impl RegistrationLayout {
    pub fn new(output_root: &Path, sha256: &str) -> Result<Self> {
        if sha256.is_empty() || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("content hash {sha256:?} is not a hex digest"));
        }
        Ok(Self {
            dir: output_root.join(sha256.to_ascii_lowercase()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hive_path(&self) -> PathBuf {
        self.dir.join(HIVE_FILE_NAME)
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.dir.join(SIDECAR_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_keyed_by_hash() {
        let layout = RegistrationLayout::new(Path::new("/out"), "ABCDEF01").unwrap();
        assert_eq!(layout.dir(), Path::new("/out/abcdef01"));
        assert_eq!(layout.hive_path(), Path::new("/out/abcdef01/registration.hive"));
        assert_eq!(layout.sidecar_path(), Path::new("/out/abcdef01/fileinfo.json"));
    }

    #[test]
    fn layout_rejects_non_hex_hash() {
        assert!(RegistrationLayout::new(Path::new("/out"), "").is_err());
        assert!(RegistrationLayout::new(Path::new("/out"), "../etc").is_err());
    }
}
