//! comreg-engine: drives sandboxed registration of many files across
//! elevated helper processes.

pub mod chunk;
pub mod classify;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod link;
pub mod merge;
pub mod session;

pub use classify::{Classifier, ManifestClassifier};
pub use coordinator::{Coordinator, RegistrationItem, RegistrationStream};
pub use error::CoordinatorError;
pub use host::{HelperHost, HelperProcess, OsHost};
