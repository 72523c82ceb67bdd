use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Machine type from the COFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    I386,
    Amd64,
    Arm,
    Arm64,
    Unknown,
}

impl Architecture {
    pub fn from_machine(machine: u16) -> Self {
        match machine {
            0x014c => Architecture::I386,
            0x8664 => Architecture::Amd64,
            0x01c0 | 0x01c4 => Architecture::Arm,
            0xaa64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::I386 => "x86",
            Architecture::Amd64 => "x64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
            Architecture::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// CLR header details, present only for managed assemblies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ManagedRuntime {
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    #[serde(default)]
    pub target_framework: Option<String>,
    #[serde(default)]
    pub framework_version: Option<String>,
    #[serde(default)]
    pub il_only: bool,
    #[serde(default)]
    pub requires_32bit: bool,
    #[serde(default)]
    pub prefers_32bit: bool,
    #[serde(default)]
    pub strong_name_signed: bool,
    #[serde(default)]
    pub native_entry_point: bool,
}

const NET_FRAMEWORK_VERSIONS: &[&str] = &[
    "2.0.0.0", "3.5.0.0", "4.0.0.0", "4.5.0.0", "4.5.2.0", "4.6.1.0", "4.7.0.0", "4.7.2.0",
    "4.8.0.0", "4.8.1.0",
];

impl ManagedRuntime {
    /// Classic .NET Framework target, as opposed to .NET Core or .NET Standard.
    pub fn is_net_framework(&self) -> bool {
        let classic = self
            .target_framework
            .as_deref()
            .map(|f| f.starts_with(".NETFramework"))
            .unwrap_or(true);
        classic
            && self
                .framework_version
                .as_deref()
                .map(|v| NET_FRAMEWORK_VERSIONS.contains(&v))
                .unwrap_or(false)
    }
}

/// Classification of one candidate file, produced once by the classifier and
/// carried unchanged through the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub is_portable_executable: bool,
    pub architecture: Architecture,
    #[serde(default)]
    pub is_library: bool,
    #[serde(default)]
    pub is_executable: bool,
    #[serde(default)]
    pub is_com: bool,
    #[serde(default)]
    pub is_managed_assembly: bool,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<ManagedRuntime>,
}

/// Why a file cannot go through sandboxed registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    NotPortableExecutable,
    UnsupportedArchitecture(Architecture),
    NotComServer,
    NotLibrary,
    ManagedAssembly,
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligibility::NotPortableExecutable => f.write_str("not a portable executable"),
            Ineligibility::UnsupportedArchitecture(arch) => {
                write!(f, "architecture {arch} is not supported (x86 only)")
            }
            Ineligibility::NotComServer => f.write_str("not a native COM library"),
            Ineligibility::NotLibrary => f.write_str("not a library"),
            Ineligibility::ManagedAssembly => f.write_str("is a managed assembly"),
        }
    }
}

impl FileRecord {
    /// Record for a path the classifier knows nothing about.
    pub fn unclassified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sha256: String::new(),
            is_portable_executable: false,
            architecture: Architecture::Unknown,
            is_library: false,
            is_executable: false,
            is_com: false,
            is_managed_assembly: false,
            exports: Vec::new(),
            managed: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Only 32-bit native in-process COM servers are registered.
    pub fn check_eligibility(&self) -> Result<(), Ineligibility> {
        if !self.is_portable_executable {
            return Err(Ineligibility::NotPortableExecutable);
        }
        if self.architecture != Architecture::I386 {
            return Err(Ineligibility::UnsupportedArchitecture(self.architecture));
        }
        if self.is_managed_assembly {
            return Err(Ineligibility::ManagedAssembly);
        }
        if !self.is_com {
            return Err(Ineligibility::NotComServer);
        }
        if !self.is_library {
            return Err(Ineligibility::NotLibrary);
        }
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
