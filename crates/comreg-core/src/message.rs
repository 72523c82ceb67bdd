use crate::file_record::FileRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which helper the supervisor should start for a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    Library,
}

/// Every message exchanged between the coordinator, the supervisor and the
/// registrar workers. The `type` tag is written ahead of the payload so a
/// reader can pick the variant without any outside schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    StartRegistrarRequest {
        extractor_kind: ExtractorKind,
        pipe_name: String,
    },
    StartRegistrarResult {
        process_id: Option<u32>,
        #[serde(default)]
        error: Option<String>,
    },
    RegistrationRequest {
        file: FileRecord,
        path: PathBuf,
        sha256: String,
    },
    RegistrationResult(RegistrationResult),
    /// One-way; the receiver stops reading and closes its end.
    Terminate,
}

/// Outcome of registering one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data")]
pub enum RegistrationResult {
    Success {
        file: FileRecord,
        output_path: PathBuf,
        name: String,
    },
    Failure {
        name: String,
        path: PathBuf,
        error: String,
    },
}

impl RegistrationResult {
    pub fn failure(path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        RegistrationResult::Failure {
            name,
            path,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RegistrationResult::Success { .. })
    }

    pub fn path(&self) -> &std::path::Path {
        match self {
            RegistrationResult::Success { file, .. } => &file.path,
            RegistrationResult::Failure { path, .. } => path,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RegistrationResult::Success { name, .. } | RegistrationResult::Failure { name, .. } => {
                name
            }
        }
    }
}

impl Message {
    /// Short variant name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StartRegistrarRequest { .. } => "StartRegistrarRequest",
            Message::StartRegistrarResult { .. } => "StartRegistrarResult",
            Message::RegistrationRequest { .. } => "RegistrationRequest",
            Message::RegistrationResult(_) => "RegistrationResult",
            Message::Terminate => "Terminate",
        }
    }

    pub fn registration_request(file: &FileRecord) -> Self {
        Message::RegistrationRequest {
            file: file.clone(),
            path: file.path.clone(),
            sha256: file.sha256.clone(),
        }
    }
}
