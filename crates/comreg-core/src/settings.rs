use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `output_root`; helpers inherit it from the process that starts them.
pub const OUTPUT_ROOT_ENV: &str = "COMREG_OUTPUT_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelperSettings {
    #[serde(default)]
    pub launcher_path: Option<PathBuf>,
    #[serde(default)]
    pub registrar_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
}

fn default_connect_secs() -> u64 {
    30
}

fn default_terminate_grace_ms() -> u64 {
    100
}

fn default_kill_wait_ms() -> u64 {
    1000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            terminate_grace_ms: default_terminate_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    /// Pause after `Terminate` before checking whether the peer exited.
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComregSettings {
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub helpers: HelperSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl ComregSettings {
    /// Reads `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Settings file from the data directory plus environment overrides.
    pub fn load_default() -> Result<Self> {
        let mut settings = Self::load(&crate::paths::settings_path()?)?;
        if let Ok(root) = std::env::var(OUTPUT_ROOT_ENV) {
            if !root.is_empty() {
                settings.output_root = Some(PathBuf::from(root));
            }
        }
        Ok(settings)
    }

    pub fn output_root(&self) -> Result<PathBuf> {
        match &self.output_root {
            Some(root) => Ok(root.clone()),
            None => crate::paths::default_output_root(),
        }
    }

    pub fn launcher_path(&self) -> Result<PathBuf> {
        match &self.helpers.launcher_path {
            Some(p) => Ok(p.clone()),
            None => crate::paths::helper_path("comreg-launcher"),
        }
    }

    pub fn registrar_path(&self) -> Result<PathBuf> {
        match &self.helpers.registrar_path {
            Some(p) => Ok(p.clone()),
            None => crate::paths::helper_path("comreg-registrar"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ComregSettings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, ComregSettings::default());
        assert_eq!(settings.timeouts.terminate_grace(), Duration::from_millis(100));
        assert_eq!(settings.timeouts.connect(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"output_root":"/srv/hives","timeouts":{"kill_wait_ms":250},"extra":true}"#,
        )
        .unwrap();
        let settings = ComregSettings::load(&path).unwrap();
        assert_eq!(settings.output_root().unwrap(), PathBuf::from("/srv/hives"));
        assert_eq!(settings.timeouts.kill_wait_ms, 250);
        assert_eq!(settings.timeouts.terminate_grace_ms, 100);
        assert_eq!(settings.helpers, HelperSettings::default());
    }
}
