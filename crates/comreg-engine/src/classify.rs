//! Classifier boundary.
//!
//! PE inspection happens outside this crate. The coordinator only needs a
//! [`FileRecord`] per path; [`ManifestClassifier`] serves records produced
//! ahead of time and saved as a JSON array.

use anyhow::{Context, Result};
use comreg_core::file_record::sha256_file;
use comreg_core::FileRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub trait Classifier: Send + Sync {
    fn classify(&self, path: &Path) -> FileRecord;
}

#[derive(Debug, Default, Clone)]
pub struct ManifestClassifier {
    records: HashMap<PathBuf, FileRecord>,
}

impl ManifestClassifier {
    pub fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.path.clone(), record))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open manifest {}", path.display()))?;
        let records: Vec<FileRecord> = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("invalid manifest {}", path.display()))?;
        Ok(Self::from_records(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Classifier for ManifestClassifier {
    /// Unknown paths come back unclassified and so ineligible. A record
    /// without a content hash gets one computed from the file.
    fn classify(&self, path: &Path) -> FileRecord {
        let Some(record) = self.records.get(path) else {
            return FileRecord::unclassified(path);
        };
        let mut record = record.clone();
        if record.sha256.is_empty() {
            match sha256_file(path) {
                Ok(hash) => record.sha256 = hash,
                Err(e) => warn!(path = %path.display(), error = %e, "cannot hash file"),
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comreg_core::{Architecture, Ineligibility};

    #[test]
    fn fills_in_missing_hash_and_rejects_unknown_paths() {
        let dir = tempfile::tempdir().unwrap();
        let dll = dir.path().join("a.dll");
        std::fs::write(&dll, b"abc").unwrap();

        let manifest = dir.path().join("manifest.json");
        let records = serde_json::json!([{
            "path": dll,
            "is_portable_executable": true,
            "architecture": "i386",
            "is_library": true,
            "is_com": true,
        }]);
        std::fs::write(&manifest, serde_json::to_vec(&records).unwrap()).unwrap();

        let classifier = ManifestClassifier::load(&manifest).unwrap();
        assert_eq!(classifier.len(), 1);

        let record = classifier.classify(&dll);
        assert_eq!(record.architecture, Architecture::I386);
        assert_eq!(
            record.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(record.check_eligibility().is_ok());

        let unknown = classifier.classify(&dir.path().join("other.dll"));
        assert_eq!(
            unknown.check_eligibility(),
            Err(Ineligibility::NotPortableExecutable)
        );
    }

    #[test]
    fn bad_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.json");
        std::fs::write(&manifest, "{not json").unwrap();
        assert!(ManifestClassifier::load(&manifest).is_err());
        assert!(ManifestClassifier::load(&dir.path().join("missing.json")).is_err());
    }
}
