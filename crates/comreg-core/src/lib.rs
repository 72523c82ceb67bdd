//! comreg-core: shared building blocks for sandboxed COM registration.
//!
//! # Modules
//! - `message`: closed set of messages exchanged between processes
//! - `channel`: length-prefixed framing of messages over a byte stream
//! - `pipe`: pipe naming convention and the local transport
//! - `file_record`: classifier output and eligibility rules
//! - `registry`: registry seam, root virtualization and hive capture
//! - `registrar`: per-chunk worker loop
//! - `supervisor`: elevated process-launching loop
//! - `elevation`: token elevation checks and elevated relaunch
//! - `process`: handles to helper processes by id
//! - `native`: the native `DllRegisterServer` boundary
//! - `logging`: tracing setup for the binaries
//! - `paths`, `settings`: on-disk layout and configuration

pub mod channel;
pub mod elevation;
pub mod error;
pub mod file_record;
pub mod logging;
pub mod message;
pub mod native;
pub mod paths;
pub mod pipe;
pub mod process;
pub mod registrar;
pub mod registry;
pub mod settings;
pub mod supervisor;

pub use channel::MessageChannel;
pub use error::{ChannelError, RegistryError};
pub use file_record::{Architecture, FileRecord, Ineligibility};
pub use message::{ExtractorKind, Message, RegistrationResult};
pub use pipe::{PipeName, PipeRole};
